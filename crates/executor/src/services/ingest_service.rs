use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use uuid::Uuid;

use common::actors::{Actor, ActorType, ControlMessage};
use common::models::SignalPayload;
use execution::{IngestError, SignalIngestor};

/// Reads one JSON signal payload per line from stdin.
pub struct IngestService {
    id: Uuid,
    ingestor: SignalIngestor,
}

#[async_trait]
impl Actor for IngestService {
    fn id(&self) -> Uuid {
        self.id
    }

    fn name(&self) -> ActorType {
        ActorType::IngestActor
    }

    async fn run(
        &mut self,
        supervisor_tx: mpsc::Sender<ControlMessage>,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let heartbeat_handle = self.spawn_heartbeat(supervisor_tx.clone());

        info!("Starting Ingest Service (stdin)");
        let result = self
            .consume(BufReader::new(tokio::io::stdin()), shutdown)
            .await;
        heartbeat_handle.abort();
        let accepted = result?;
        info!("Signal input closed after {} signals", accepted);

        supervisor_tx.send(ControlMessage::Shutdown(self.id)).await?;
        Ok(())
    }
}

impl IngestService {
    pub fn new(ingestor: SignalIngestor) -> Self {
        Self {
            id: Uuid::new_v4(),
            ingestor,
        }
    }

    /// Submits every line until EOF or shutdown. Bad lines are logged and
    /// skipped; storage failures end the loop.
    async fn consume<R>(&self, reader: R, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<usize>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let mut lines = reader.lines();
        let mut accepted = 0;

        loop {
            let line = tokio::select! {
                line = lines.next_line() => line?,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            let Some(line) = line else { break };
            let payload = match parse_line(&line) {
                Ok(Some(payload)) => payload,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Unreadable signal line: {}", e);
                    continue;
                }
            };

            match self.ingestor.submit(payload).await {
                Ok(id) => {
                    accepted += 1;
                    info!(signal_id = %id, "Signal queued");
                }
                Err(IngestError::InvalidSignal(reason)) => warn!("Rejected signal: {}", reason),
                Err(e) => return Err(e.into()),
            }
        }

        Ok(accepted)
    }
}

fn parse_line(line: &str) -> Result<Option<SignalPayload>, serde_json::Error> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    serde_json::from_str(line).map(Some)
}
