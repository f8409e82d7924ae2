pub mod binance_client;

pub use binance_client::{BinanceClient, BinanceFactory};
