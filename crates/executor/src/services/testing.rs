//! In-memory wiring shared by the service tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use tokio::sync::watch;

use common::config::{FanoutConfig, PoolConfig, RetryConfig, SizingRules, ThrottleConfig};
use common::credentials::{CredentialError, CredentialStore, MinimumBalancePolicy};
use common::models::{AccountMode, OrderResult, SignalPayload, UserTradingProfile};
use exchange::{ClientFactory, ClientPool, ExchangeClient, ExchangeError, OrderRequest};
use execution::{FanoutExecutor, PositionSizer, SignalIngestor};
use storage::Database;
use storage::repositories::{AttemptRepository, CredentialRepository, SignalRepository};

struct FillingClient {
    orders: Arc<AtomicUsize>,
}

#[async_trait]
impl ExchangeClient for FillingClient {
    async fn verify(&self) -> Result<(), ExchangeError> {
        Ok(())
    }

    async fn latest_price(&self, _symbol: &str) -> Result<f64, ExchangeError> {
        Ok(50_000.0)
    }

    async fn place_market_order(&self, order: &OrderRequest) -> Result<OrderResult, ExchangeError> {
        let n = self.orders.fetch_add(1, Ordering::SeqCst);
        Ok(OrderResult {
            order_id: format!("ord-{}", n),
            symbol: order.symbol.clone(),
            status: "FILLED".to_string(),
            executed_quantity: order.quantity,
        })
    }
}

struct FillingFactory(Arc<AtomicUsize>);

impl ClientFactory for FillingFactory {
    fn build(&self, _profile: &UserTradingProfile) -> Result<Arc<dyn ExchangeClient>, ExchangeError> {
        Ok(Arc::new(FillingClient {
            orders: self.0.clone(),
        }))
    }
}

/// Credential store that is always down.
pub struct UnavailableStore;

#[async_trait]
impl CredentialStore for UnavailableStore {
    async fn eligible_users(&self) -> Result<Vec<UserTradingProfile>, CredentialError> {
        Err(CredentialError::Unavailable("connection refused".to_string()))
    }

    async fn profile(
        &self,
        _user_id: &str,
        _exchange: &str,
    ) -> Result<UserTradingProfile, CredentialError> {
        Err(CredentialError::Unavailable("connection refused".to_string()))
    }
}

pub struct Rig {
    pub ingestor: SignalIngestor,
    pub ledger: AttemptRepository,
    pub pool: Arc<ClientPool>,
    pub executor: Arc<FanoutExecutor>,
    pub orders: Arc<AtomicUsize>,
    pub shutdown_tx: watch::Sender<bool>,
}

fn profile(user_id: &str) -> UserTradingProfile {
    UserTradingProfile {
        user_id: user_id.to_string(),
        exchange: "binance".to_string(),
        api_key: SecretString::from(format!("{}-key", user_id)),
        api_secret: SecretString::from(format!("{}-secret", user_id)),
        account_mode: AccountMode::Paper,
        risk_percentage: 0.02,
        available_balance: 1000.0,
        disabled: false,
    }
}

pub fn payload(id: &str) -> SignalPayload {
    SignalPayload {
        symbol: "BTCUSDT".to_string(),
        direction: "long".to_string(),
        price: Some(50_000.0),
        signal_id: Some(id.to_string()),
    }
}

/// Users funded with 1000 each, all on an exchange that fills every order.
pub async fn rig(users: &[&str]) -> Rig {
    let db = Database::in_memory().await.unwrap();
    let credentials = CredentialRepository::new(&db, Arc::new(MinimumBalancePolicy::new(0.0)));
    for user_id in users {
        credentials.upsert_profile(&profile(user_id)).await.unwrap();
    }
    rig_with_store(&db, Arc::new(credentials))
}

pub fn rig_with_store(db: &Database, store: Arc<dyn CredentialStore>) -> Rig {
    let orders = Arc::new(AtomicUsize::new(0));
    let pool = Arc::new(ClientPool::new(
        store.clone(),
        Arc::new(FillingFactory(orders.clone())),
        PoolConfig::default(),
        ThrottleConfig {
            max_in_flight: 8,
            min_interval: Duration::ZERO,
        },
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ledger = AttemptRepository::new(db);
    let executor = FanoutExecutor::new(
        store,
        pool.clone(),
        ledger.clone(),
        PositionSizer::new(SizingRules::default()),
        &FanoutConfig::default(),
        RetryConfig {
            max_retries: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            backoff_multiplier: 1.0,
            add_jitter: false,
        },
        shutdown_rx,
    );

    Rig {
        ingestor: SignalIngestor::new(SignalRepository::new(db)),
        ledger,
        pool,
        executor: Arc::new(executor),
        orders,
        shutdown_tx,
    }
}
