pub mod attempt;
pub mod order;
pub mod profile;
pub mod signal;

pub use attempt::{AttemptStatus, ExecutionAttempt};
pub use order::OrderResult;
pub use profile::{AccountMode, UserTradingProfile};
pub use signal::{ClaimStatus, Direction, Signal, SignalPayload};
