use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time;
use tracing::{error, info, warn};
use uuid::Uuid;

use common::actors::{Actor, ActorType, ControlMessage};
use common::config::FanoutConfig;
use common::models::Signal;
use execution::{FanoutExecutor, SignalIngestor};

/// Claims signals and fans each one out, up to `max_signals_in_flight` at once.
pub struct DispatchService {
    id: Uuid,
    ingestor: SignalIngestor,
    executor: Arc<FanoutExecutor>,
    config: FanoutConfig,
}

#[async_trait]
impl Actor for DispatchService {
    fn id(&self) -> Uuid {
        self.id
    }

    fn name(&self) -> ActorType {
        ActorType::DispatchActor
    }

    async fn run(
        &mut self,
        supervisor_tx: mpsc::Sender<ControlMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let heartbeat_handle = self.spawn_heartbeat(supervisor_tx.clone());

        info!(
            max_signals_in_flight = self.config.max_signals_in_flight,
            "Starting Dispatch Service"
        );

        let notify = self.ingestor.notifier();
        let mut poll = time::interval(self.config.poll_interval);
        let mut in_flight = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            if in_flight.len() < self.config.max_signals_in_flight {
                match self.ingestor.claim_next().await {
                    Ok(Some(signal)) => {
                        in_flight.spawn(settle(self.ingestor.clone(), self.executor.clone(), signal));
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        let err_msg = format!("Failed to claim signal: {}", e);
                        supervisor_tx
                            .send(ControlMessage::Error(self.id, err_msg))
                            .await?;
                    }
                }
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = notify.notified() => {}
                _ = poll.tick() => {}
                Some(joined) = in_flight.join_next() => {
                    if let Err(e) = joined {
                        error!("Signal task aborted: {}", e);
                    }
                }
            }
        }

        info!("Dispatch stopping, waiting for {} signals in flight", in_flight.len());
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!("Signal task aborted: {}", e);
            }
        }

        heartbeat_handle.abort();
        supervisor_tx.send(ControlMessage::Shutdown(self.id)).await?;
        Ok(())
    }
}

impl DispatchService {
    pub fn new(ingestor: SignalIngestor, executor: Arc<FanoutExecutor>, config: FanoutConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            ingestor,
            executor,
            config,
        }
    }
}

/// Executes a claimed signal and marks it done once every eligible user has
/// a ledger row. Anything short of that leaves it claimed for the sweep.
pub async fn settle(ingestor: SignalIngestor, executor: Arc<FanoutExecutor>, signal: Signal) {
    match executor.execute(&signal).await {
        Ok(report) if report.is_complete() => {
            if let Err(e) = ingestor.mark_done(&signal.id).await {
                error!(signal_id = %signal.id, "Failed to mark signal done: {}", e);
            }
        }
        Ok(report) => {
            warn!(
                signal_id = %signal.id,
                deferred = report.deferred,
                "Signal left claimed for the reconcile sweep"
            );
        }
        Err(e) => {
            error!(signal_id = %signal.id, "Could not load eligible users: {}", e);
        }
    }
}
