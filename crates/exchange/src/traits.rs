use std::sync::Arc;

use async_trait::async_trait;
use common::models::{Direction, OrderResult, UserTradingProfile};

use crate::error::ExchangeError;

#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub direction: Direction,
    pub quantity: f64,
    /// Forwarded to the exchange so a resent order can be recognised.
    pub client_order_id: Option<String>,
}

/// One authenticated session with an exchange, bound to a single user's keys.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Cheap authenticated call proving the keys work.
    async fn verify(&self) -> Result<(), ExchangeError>;

    async fn latest_price(&self, symbol: &str) -> Result<f64, ExchangeError>;

    async fn place_market_order(&self, order: &OrderRequest) -> Result<OrderResult, ExchangeError>;
}

/// Builds an unverified client for a profile. Account mode is resolved here
/// and nowhere else.
pub trait ClientFactory: Send + Sync {
    fn build(&self, profile: &UserTradingProfile) -> Result<Arc<dyn ExchangeClient>, ExchangeError>;
}
