use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Success,
    Failed,
    Skipped,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl FromStr for AttemptStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown attempt status '{}'", other)),
        }
    }
}

/// One ledger row: the outcome of executing a signal for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionAttempt {
    pub signal_id: String,
    pub user_id: String,
    pub exchange: String,
    pub requested_quantity: Option<f64>,
    pub order_id: Option<String>,
    pub status: AttemptStatus,
    pub error_reason: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

impl ExecutionAttempt {
    pub fn success(
        signal_id: &str,
        user_id: &str,
        exchange: &str,
        quantity: f64,
        order_id: String,
    ) -> Self {
        Self {
            signal_id: signal_id.to_string(),
            user_id: user_id.to_string(),
            exchange: exchange.to_string(),
            requested_quantity: Some(quantity),
            order_id: Some(order_id),
            status: AttemptStatus::Success,
            error_reason: None,
            attempted_at: Utc::now(),
        }
    }

    pub fn failed(
        signal_id: &str,
        user_id: &str,
        exchange: &str,
        quantity: Option<f64>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            signal_id: signal_id.to_string(),
            user_id: user_id.to_string(),
            exchange: exchange.to_string(),
            requested_quantity: quantity,
            order_id: None,
            status: AttemptStatus::Failed,
            error_reason: Some(reason.into()),
            attempted_at: Utc::now(),
        }
    }

    pub fn skipped(
        signal_id: &str,
        user_id: &str,
        exchange: &str,
        quantity: Option<f64>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            status: AttemptStatus::Skipped,
            ..Self::failed(signal_id, user_id, exchange, quantity, reason)
        }
    }
}
