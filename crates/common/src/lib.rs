pub mod actors;
pub mod config;
pub mod credentials;
pub mod logger;
pub mod models;
