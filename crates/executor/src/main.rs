use dotenvy::dotenv;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use common::actors::{Actor, ActorType};
use common::config::Config;
use common::credentials::{CredentialStore, MinimumBalancePolicy};
use common::logger;
use exchange::{BinanceFactory, ClientPool};
use execution::{FanoutExecutor, PositionSizer, SignalIngestor};
use storage::Database;
use storage::repositories::{AttemptRepository, CredentialRepository, SignalRepository};

use crate::actors::supervisor::Supervisor;
use crate::services::dispatch_service::DispatchService;
use crate::services::ingest_service::IngestService;
use crate::services::reconcile_service::ReconcileService;
use crate::services::telegram_service::TelegramService;

mod actors;
mod services;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    logger::setup_logger();
    debug!("System starting up...");

    let config = Config::from_env()?;
    let db = Database::open(&config.database).await?;

    let credentials: Arc<dyn CredentialStore> = Arc::new(CredentialRepository::new(
        &db,
        Arc::new(MinimumBalancePolicy::new(config.min_balance)),
    ));
    let pool = Arc::new(ClientPool::new(
        credentials.clone(),
        Arc::new(BinanceFactory::new(config.binance.clone())?),
        config.pool.clone(),
        config.throttle.clone(),
    ));
    let ingestor = SignalIngestor::new(SignalRepository::new(&db));

    let mut supervisor = Supervisor::new().with_grace_period(config.shutdown_grace());

    let mut executor = FanoutExecutor::new(
        credentials,
        pool.clone(),
        AttemptRepository::new(&db),
        PositionSizer::new(config.sizing.clone()),
        &config.fanout,
        config.retry.clone(),
        supervisor.shutdown_signal(),
    );

    match config.telegram.clone() {
        Some(telegram) => {
            let (notify_tx, _) = broadcast::channel::<String>(256);
            executor = executor.with_notifier(notify_tx.clone());
            supervisor.register_actor(
                ActorType::NotifierActor,
                Box::new(move || -> Box<dyn Actor> {
                    Box::new(TelegramService::new(&telegram, notify_tx.clone()))
                }),
            );
        }
        None => info!("Telegram not configured, notifications disabled"),
    }

    let executor = Arc::new(executor);

    let ingestor_for_dispatch = ingestor.clone();
    let executor_for_dispatch = executor.clone();
    let fanout_config = config.fanout.clone();
    supervisor.register_actor(
        ActorType::DispatchActor,
        Box::new(move || -> Box<dyn Actor> {
            Box::new(DispatchService::new(
                ingestor_for_dispatch.clone(),
                executor_for_dispatch.clone(),
                fanout_config.clone(),
            ))
        }),
    );

    let ingestor_for_sweep = ingestor.clone();
    let lease = config.lease.clone();
    supervisor.register_actor(
        ActorType::ReconcileActor,
        Box::new(move || -> Box<dyn Actor> {
            Box::new(ReconcileService::new(
                ingestor_for_sweep.clone(),
                executor.clone(),
                pool.clone(),
                lease.clone(),
            ))
        }),
    );

    supervisor.register_actor(
        ActorType::IngestActor,
        Box::new(move || -> Box<dyn Actor> { Box::new(IngestService::new(ingestor.clone())) }),
    );

    info!(
        concurrency = config.fanout.concurrency,
        db = %config.database.path.display(),
        "Executor running"
    );
    supervisor.start().await;
    info!("Shutdown complete");
    Ok(())
}
