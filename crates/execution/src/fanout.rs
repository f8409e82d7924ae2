//! Per-user execution of one claimed signal.
//!
//! Each eligible user gets an independent unit. Units share one semaphore
//! across every signal in flight, and every unit that starts ends with
//! exactly one ledger row, even when the exchange call panics.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use common::{
    config::{FanoutConfig, RetryConfig},
    credentials::{CredentialError, CredentialStore},
    models::{ExecutionAttempt, Signal, UserTradingProfile},
};
use exchange::{ClientHandle, ClientPool, ExchangeError, OrderRequest, retry::with_retry};
use futures_util::FutureExt;
use sha2::{Digest, Sha256};
use storage::{StorageError, repositories::AttemptRepository};
use tokio::sync::{Semaphore, broadcast, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::report::{FanoutReport, UnitOutcome};
use crate::sizer::PositionSizer;

pub struct FanoutExecutor {
    credentials: Arc<dyn CredentialStore>,
    units: Arc<UnitRunner>,
    permits: Arc<Semaphore>,
    shutdown: watch::Receiver<bool>,
    notification_tx: Option<broadcast::Sender<String>>,
}

struct UnitRunner {
    pool: Arc<ClientPool>,
    ledger: AttemptRepository,
    sizer: PositionSizer,
    retry: RetryConfig,
}

impl FanoutExecutor {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        pool: Arc<ClientPool>,
        ledger: AttemptRepository,
        sizer: PositionSizer,
        config: &FanoutConfig,
        retry: RetryConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            credentials,
            units: Arc::new(UnitRunner {
                pool,
                ledger,
                sizer,
                retry,
            }),
            permits: Arc::new(Semaphore::new(config.concurrency)),
            shutdown,
            notification_tx: None,
        }
    }

    pub fn with_notifier(mut self, tx: broadcast::Sender<String>) -> Self {
        self.notification_tx = Some(tx);
        self
    }

    /// Runs one unit per eligible user and waits for all of them.
    ///
    /// Fails only when the eligible users cannot be loaded; the signal then
    /// stays claimed and the reconcile sweep picks it up again.
    pub async fn execute(&self, signal: &Signal) -> Result<FanoutReport, CredentialError> {
        let users = self.credentials.eligible_users().await?;
        let mut report = FanoutReport::new(&signal.id);

        info!(
            signal_id = %signal.id,
            symbol = %signal.symbol,
            direction = %signal.direction,
            users = users.len(),
            "Fanning out signal"
        );

        let signal = Arc::new(signal.clone());
        let mut tasks = JoinSet::new();

        for profile in users {
            let signal = signal.clone();
            let units = self.units.clone();
            let permits = self.permits.clone();
            let mut shutdown = self.shutdown.clone();

            tasks.spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    _ = stopped(&mut shutdown) => return UnitOutcome::Deferred,
                    permit = permits.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return UnitOutcome::Deferred,
                    },
                };
                if *shutdown.borrow() {
                    return UnitOutcome::Deferred;
                }

                match AssertUnwindSafe(units.run(&signal, &profile)).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(panic) => {
                        let reason = format!("Panic: {}", panic_message(panic.as_ref()));
                        error!(signal_id = %signal.id, user_id = %profile.user_id, "{}", reason);
                        units
                            .record(ExecutionAttempt::failed(
                                &signal.id,
                                &profile.user_id,
                                &profile.exchange,
                                None,
                                reason,
                            ))
                            .await
                    }
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    error!(signal_id = %signal.id, "Execution unit aborted: {}", e);
                    report.record(UnitOutcome::Deferred);
                }
            }
        }

        info!(signal_id = %signal.id, "{}", report);
        if let Some(tx) = &self.notification_tx {
            let _ = tx.send(report.to_string());
        }

        Ok(report)
    }
}

impl UnitRunner {
    async fn run(&self, signal: &Signal, profile: &UserTradingProfile) -> UnitOutcome {
        match self.ledger.exists(&signal.id, &profile.user_id).await {
            Ok(true) => {
                debug!(signal_id = %signal.id, user_id = %profile.user_id, "Already executed, skipping");
                return UnitOutcome::AlreadyHandled;
            }
            Ok(false) => {}
            Err(e) => {
                error!(signal_id = %signal.id, user_id = %profile.user_id, "Ledger lookup failed: {}", e);
                return UnitOutcome::Deferred;
            }
        }

        let attempt = self.attempt(signal, profile).await;
        self.record(attempt).await
    }

    async fn attempt(&self, signal: &Signal, profile: &UserTradingProfile) -> ExecutionAttempt {
        let failed = |quantity: Option<f64>, reason: String| {
            ExecutionAttempt::failed(&signal.id, &profile.user_id, &profile.exchange, quantity, reason)
        };

        let mut handle: Option<Arc<ClientHandle>> = None;
        let price = match signal.reference_price {
            Some(price) => price,
            None => {
                let client = match self.connect(profile).await {
                    Ok(client) => client,
                    Err(e) => return self.exchange_failure(signal, profile, None, e),
                };
                let price = with_retry(&self.retry, || {
                    self.pool.latest_price(&client, &signal.symbol)
                })
                .await;
                handle = Some(client);
                match price {
                    Ok(price) => price,
                    Err(e) => return self.exchange_failure(signal, profile, None, e),
                }
            }
        };

        let quantity = match self.sizer.compute_quantity(profile, price) {
            Ok(quantity) => quantity,
            Err(e) => return failed(None, e.to_string()),
        };

        let handle = match handle {
            Some(handle) => handle,
            None => match self.connect(profile).await {
                Ok(handle) => handle,
                Err(e) => return self.exchange_failure(signal, profile, Some(quantity), e),
            },
        };

        let order = OrderRequest {
            symbol: signal.symbol.clone(),
            direction: signal.direction,
            quantity,
            client_order_id: Some(client_order_id(&signal.id, &profile.user_id)),
        };

        match with_retry(&self.retry, || self.pool.place_market_order(&handle, &order)).await {
            Ok(result) => ExecutionAttempt::success(
                &signal.id,
                &profile.user_id,
                &profile.exchange,
                quantity,
                result.order_id,
            ),
            Err(e) => self.exchange_failure(signal, profile, Some(quantity), e),
        }
    }

    /// Failed connects are never cached, so a retry builds a fresh client.
    async fn connect(&self, profile: &UserTradingProfile) -> Result<Arc<ClientHandle>, ExchangeError> {
        with_retry(&self.retry, || {
            self.pool.get_client(&profile.user_id, &profile.exchange)
        })
        .await
    }

    fn exchange_failure(
        &self,
        signal: &Signal,
        profile: &UserTradingProfile,
        quantity: Option<f64>,
        error: ExchangeError,
    ) -> ExecutionAttempt {
        match error {
            ExchangeError::SymbolNotTradable(_) => ExecutionAttempt::skipped(
                &signal.id,
                &profile.user_id,
                &profile.exchange,
                quantity,
                error.to_string(),
            ),
            _ => ExecutionAttempt::failed(
                &signal.id,
                &profile.user_id,
                &profile.exchange,
                quantity,
                error.to_string(),
            ),
        }
    }

    async fn record(&self, attempt: ExecutionAttempt) -> UnitOutcome {
        match self.ledger.record(&attempt).await {
            Ok(()) => {
                match &attempt.error_reason {
                    None => info!(
                        signal_id = %attempt.signal_id,
                        user_id = %attempt.user_id,
                        order_id = attempt.order_id.as_deref().unwrap_or_default(),
                        "Order placed"
                    ),
                    Some(reason) => warn!(
                        signal_id = %attempt.signal_id,
                        user_id = %attempt.user_id,
                        status = attempt.status.as_str(),
                        "Attempt not executed: {}",
                        reason
                    ),
                }
                UnitOutcome::Recorded(attempt.status)
            }
            Err(StorageError::DuplicateAttempt { .. }) => {
                debug!(
                    signal_id = %attempt.signal_id,
                    user_id = %attempt.user_id,
                    "Concurrent run already recorded this user"
                );
                UnitOutcome::AlreadyHandled
            }
            Err(e) => {
                error!(
                    signal_id = %attempt.signal_id,
                    user_id = %attempt.user_id,
                    "Failed to record attempt: {}",
                    e
                );
                UnitOutcome::Deferred
            }
        }
    }
}

/// Stable per (signal, user) so a resent order is recognisable on the exchange.
pub fn client_order_id(signal_id: &str, user_id: &str) -> String {
    let digest = Sha256::digest(format!("{}|{}", signal_id, user_id));
    hex::encode(digest)[..32].to_string()
}

/// Resolves once shutdown is requested. Never resolves if the sender is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_order_ids_are_stable_and_distinct() {
        let a = client_order_id("sig-1", "u1");
        assert_eq!(a, client_order_id("sig-1", "u1"));
        assert_ne!(a, client_order_id("sig-1", "u2"));
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn panic_payloads_are_readable() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("kaboom"));
        assert_eq!(panic_message(boxed.as_ref()), "kaboom");
    }
}
