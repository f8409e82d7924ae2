use std::time::Duration;

use thiserror::Error;

/// Failures surfaced by exchange adapters. The `Display` form starts with the
/// failure kind so ledger reasons can be filtered by prefix.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExchangeError {
    #[error("InsufficientBalance: {0}")]
    InsufficientBalance(String),
    #[error("SymbolNotTradable: {0}")]
    SymbolNotTradable(String),
    #[error("RateLimited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("NetworkError: {0}")]
    Network(String),
    #[error("AuthenticationError: {0}")]
    Authentication(String),
    #[error("NotFound: no credentials for user {user_id} on {exchange}")]
    CredentialsNotFound { user_id: String, exchange: String },
    #[error("UnsupportedExchange: {0}")]
    UnsupportedExchange(String),
    #[error("Rejected: {0}")]
    Rejected(String),
}

impl ExchangeError {
    /// Only transport failures are retried within one attempt. Rate limits
    /// wait for a later cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::InsufficientBalance(_) => "InsufficientBalance",
            Self::SymbolNotTradable(_) => "SymbolNotTradable",
            Self::RateLimited { .. } => "RateLimited",
            Self::Network(_) => "NetworkError",
            Self::Authentication(_) => "AuthenticationError",
            Self::CredentialsNotFound { .. } => "NotFound",
            Self::UnsupportedExchange(_) => "UnsupportedExchange",
            Self::Rejected(_) => "Rejected",
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Rejected(format!("unreadable response: {}", err))
        } else {
            Self::Network(err.to_string())
        }
    }
}
