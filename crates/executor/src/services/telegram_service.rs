use async_trait::async_trait;
use secrecy::ExposeSecret;
use teloxide::prelude::*;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, info};
use uuid::Uuid;

use common::actors::{Actor, ActorType, ControlMessage};
use common::config::TelegramConfig;

/// Forwards per-signal summaries to a Telegram chat.
pub struct TelegramService {
    id: Uuid,
    bot: Bot,
    chat_id: ChatId,
    notification_tx: broadcast::Sender<String>,
}

#[async_trait]
impl Actor for TelegramService {
    fn id(&self) -> Uuid {
        self.id
    }

    fn name(&self) -> ActorType {
        ActorType::NotifierActor
    }

    async fn run(
        &mut self,
        supervisor_tx: mpsc::Sender<ControlMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let heartbeat_handle = self.spawn_heartbeat(supervisor_tx.clone());
        let mut rx = self.notification_tx.subscribe();

        info!("Starting Telegram Notification Service");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                msg = rx.recv() => match msg {
                    Ok(msg) => {
                        // Delivery failures are logged, never fatal
                        if let Err(e) = self.bot.send_message(self.chat_id, msg).await {
                            error!("Failed to send Telegram message: {}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        error!("Telegram service lagged behind. Missed {} messages.", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Telegram notification channel closed. Stopping service.");
                        break;
                    }
                },
            }
        }

        heartbeat_handle.abort();
        supervisor_tx.send(ControlMessage::Shutdown(self.id)).await?;
        Ok(())
    }
}

impl TelegramService {
    pub fn new(config: &TelegramConfig, notification_tx: broadcast::Sender<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            bot: Bot::new(config.bot_token.expose_secret()),
            chat_id: ChatId(config.chat_id),
            notification_tx,
        }
    }
}
