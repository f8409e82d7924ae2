pub mod client_pool;
pub mod error;
pub mod remote;
pub mod retry;
pub mod throttle;
pub mod traits;

pub use client_pool::{ClientHandle, ClientPool};
pub use error::ExchangeError;
pub use remote::{BinanceClient, BinanceFactory};
pub use traits::{ClientFactory, ExchangeClient, OrderRequest};
