use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

use common::actors::{Actor, ActorType, ControlMessage};
use common::config::LeaseConfig;
use exchange::ClientPool;
use execution::{FanoutExecutor, SignalIngestor};

use crate::services::dispatch_service::settle;

/// Periodic housekeeping: re-dispatches signals whose claim lease expired,
/// drops idle exchange clients and archives old signals.
pub struct ReconcileService {
    id: Uuid,
    ingestor: SignalIngestor,
    executor: Arc<FanoutExecutor>,
    pool: Arc<ClientPool>,
    lease: LeaseConfig,
}

#[async_trait]
impl Actor for ReconcileService {
    fn id(&self) -> Uuid {
        self.id
    }

    fn name(&self) -> ActorType {
        ActorType::ReconcileActor
    }

    async fn run(
        &mut self,
        supervisor_tx: mpsc::Sender<ControlMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let heartbeat_handle = self.spawn_heartbeat(supervisor_tx.clone());

        info!(
            lease_secs = self.lease.lease_timeout.as_secs(),
            "Starting Reconcile Service"
        );

        let mut interval = time::interval(self.lease.sweep_interval);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = self.sweep(&shutdown).await {
                        supervisor_tx
                            .send(ControlMessage::Error(self.id, format!("Sweep failed: {}", e)))
                            .await?;
                    }
                }
            }
        }

        heartbeat_handle.abort();
        supervisor_tx.send(ControlMessage::Shutdown(self.id)).await?;
        Ok(())
    }
}

impl ReconcileService {
    pub fn new(
        ingestor: SignalIngestor,
        executor: Arc<FanoutExecutor>,
        pool: Arc<ClientPool>,
        lease: LeaseConfig,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            ingestor,
            executor,
            pool,
            lease,
        }
    }

    async fn sweep(&self, shutdown: &watch::Receiver<bool>) -> anyhow::Result<()> {
        let stale = self.ingestor.reclaim_stale(self.lease.lease_timeout).await?;
        if !stale.is_empty() {
            warn!("Re-dispatching {} signals with expired claims", stale.len());
        }

        for signal in stale {
            if *shutdown.borrow() {
                break;
            }
            settle(self.ingestor.clone(), self.executor.clone(), signal).await;
        }

        self.pool.evict_idle().await;

        let archived = self.ingestor.archive_completed(self.lease.retention).await?;
        if archived > 0 {
            info!("Archived {} completed signals", archived);
        } else {
            debug!("Nothing to archive");
        }
        Ok(())
    }
}
