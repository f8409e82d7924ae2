use serde::{Deserialize, Serialize};

/// Exchange acknowledgement of a market order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub symbol: String,
    pub status: String,
    pub executed_quantity: f64,
}
