use std::collections::HashMap;
use std::sync::Arc;

use common::{
    config::{PoolConfig, ThrottleConfig},
    credentials::{CredentialError, CredentialStore},
    models::OrderResult,
};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    error::ExchangeError,
    throttle::ExchangeThrottle,
    traits::{ClientFactory, ExchangeClient, OrderRequest},
};

/// A verified client bound to exactly one (user, exchange) pair.
pub struct ClientHandle {
    user_id: String,
    exchange: String,
    client: Arc<dyn ExchangeClient>,
    throttle: Arc<ExchangeThrottle>,
}

impl ClientHandle {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }
}

struct CachedClient {
    handle: Arc<ClientHandle>,
    last_used: Instant,
}

/// Lazily built, verified, per-user exchange sessions.
///
/// Failed verifications are never cached, so fixing a user's keys takes
/// effect on the next signal. Idle sessions are dropped after
/// `PoolConfig::idle_timeout`.
pub struct ClientPool {
    credentials: Arc<dyn CredentialStore>,
    factory: Arc<dyn ClientFactory>,
    config: PoolConfig,
    throttle_config: ThrottleConfig,
    clients: Mutex<HashMap<(String, String), CachedClient>>,
    throttles: Mutex<HashMap<String, Arc<ExchangeThrottle>>>,
}

impl ClientPool {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        factory: Arc<dyn ClientFactory>,
        config: PoolConfig,
        throttle_config: ThrottleConfig,
    ) -> Self {
        Self {
            credentials,
            factory,
            config,
            throttle_config,
            clients: Mutex::new(HashMap::new()),
            throttles: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_client(
        &self,
        user_id: &str,
        exchange: &str,
    ) -> Result<Arc<ClientHandle>, ExchangeError> {
        let key = (user_id.to_string(), exchange.to_string());

        {
            let mut clients = self.clients.lock().await;
            if let Some(cached) = clients.get_mut(&key) {
                if cached.last_used.elapsed() < self.config.idle_timeout {
                    cached.last_used = Instant::now();
                    return Self::owned_by(cached.handle.clone(), user_id);
                }
                debug!(user_id, exchange, "Cached client expired");
                clients.remove(&key);
            }
        }

        // Built outside the lock; a concurrent caller may be doing the same.
        let fresh = self.connect(user_id, exchange).await?;

        let mut clients = self.clients.lock().await;
        let entry = clients.entry(key).or_insert_with(|| CachedClient {
            handle: fresh.clone(),
            last_used: Instant::now(),
        });
        if !Arc::ptr_eq(&entry.handle, &fresh) {
            debug!(user_id, exchange, "Lost client creation race, discarding duplicate");
        }
        entry.last_used = Instant::now();
        Self::owned_by(entry.handle.clone(), user_id)
    }

    pub async fn latest_price(
        &self,
        handle: &ClientHandle,
        symbol: &str,
    ) -> Result<f64, ExchangeError> {
        let _permit = handle.throttle.acquire().await?;
        handle.client.latest_price(symbol).await
    }

    /// Sends the order. No deduplication happens here; callers check the
    /// execution ledger first.
    pub async fn place_market_order(
        &self,
        handle: &ClientHandle,
        order: &OrderRequest,
    ) -> Result<OrderResult, ExchangeError> {
        let _permit = handle.throttle.acquire().await?;
        handle.client.place_market_order(order).await
    }

    /// Drops sessions idle for longer than the configured timeout.
    pub async fn evict_idle(&self) -> usize {
        let mut clients = self.clients.lock().await;
        let before = clients.len();
        clients.retain(|_, cached| cached.last_used.elapsed() < self.config.idle_timeout);
        let evicted = before - clients.len();
        if evicted > 0 {
            info!("Evicted {} idle exchange clients", evicted);
        }
        evicted
    }

    pub async fn cached_clients(&self) -> usize {
        self.clients.lock().await.len()
    }

    async fn connect(&self, user_id: &str, exchange: &str) -> Result<Arc<ClientHandle>, ExchangeError> {
        let profile = self
            .credentials
            .profile(user_id, exchange)
            .await
            .map_err(|e| match e {
                CredentialError::NotFound { user_id, exchange } => {
                    ExchangeError::CredentialsNotFound { user_id, exchange }
                }
                CredentialError::Unavailable(msg) => ExchangeError::Network(msg),
            })?;

        let client = self.factory.build(&profile)?;
        let throttle = self.throttle_for(exchange).await;

        {
            let _permit = throttle.acquire().await?;
            if let Err(e) = client.verify().await {
                warn!(user_id, exchange, "Client verification failed: {}", e);
                return Err(match e {
                    ExchangeError::Authentication(_)
                    | ExchangeError::Network(_)
                    | ExchangeError::RateLimited { .. } => e,
                    other => ExchangeError::Authentication(format!("verification failed: {}", other)),
                });
            }
        }

        info!(user_id, exchange, mode = %profile.account_mode, "Exchange client ready");
        Ok(Arc::new(ClientHandle {
            user_id: user_id.to_string(),
            exchange: exchange.to_string(),
            client,
            throttle,
        }))
    }

    async fn throttle_for(&self, exchange: &str) -> Arc<ExchangeThrottle> {
        let mut throttles = self.throttles.lock().await;
        throttles
            .entry(exchange.to_lowercase())
            .or_insert_with(|| Arc::new(ExchangeThrottle::new(&self.throttle_config)))
            .clone()
    }

    fn owned_by(handle: Arc<ClientHandle>, user_id: &str) -> Result<Arc<ClientHandle>, ExchangeError> {
        if handle.user_id != user_id {
            return Err(ExchangeError::Authentication(format!(
                "client for {} requested by {}",
                handle.user_id, user_id
            )));
        }
        Ok(handle)
    }
}
