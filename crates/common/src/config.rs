//! Runtime configuration.
//!
//! Everything is read once at startup and handed to components through their
//! constructors. `Config::from_lookup` takes the variable source as a closure
//! so the parsing can be exercised without touching the process environment.

use secrecy::SecretString;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Upper bound for `NETWORK_RETRIES`.
pub const MAX_NETWORK_RETRIES: u32 = 10;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{key} has an invalid value '{value}'")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub fanout: FanoutConfig,
    pub pool: PoolConfig,
    pub throttle: ThrottleConfig,
    pub sizing: SizingRules,
    pub retry: RetryConfig,
    pub lease: LeaseConfig,
    pub binance: BinanceEndpoints,
    pub telegram: Option<TelegramConfig>,
    /// Balance a profile needs before it receives signals.
    pub min_balance: f64,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct FanoutConfig {
    /// Per-user units in flight across all signals.
    pub concurrency: usize,
    pub max_signals_in_flight: usize,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub idle_timeout: Duration,
}

/// Per-exchange request limits.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    pub max_in_flight: usize,
    pub min_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct SizingRules {
    pub lot_step: f64,
    pub min_quantity: f64,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub add_jitter: bool,
}

#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// Claimed signals older than this are re-dispatched by the sweep.
    pub lease_timeout: Duration,
    pub sweep_interval: Duration,
    /// Done signals older than this are moved to the archive table.
    pub retention: Duration,
}

#[derive(Debug, Clone)]
pub struct BinanceEndpoints {
    pub live_url: String,
    pub testnet_url: String,
    pub recv_window_ms: u64,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: SecretString,
    pub chat_id: i64,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            concurrency: 20,
            max_signals_in_flight: 4,
            poll_interval: Duration::from_millis(1000),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 10,
            min_interval: Duration::from_millis(50),
        }
    }
}

impl Default for SizingRules {
    fn default() -> Self {
        Self {
            lot_step: 0.00001,
            min_quantity: 0.00001,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_timeout: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
            retention: Duration::from_secs(30 * 24 * 3600),
        }
    }
}

impl Default for BinanceEndpoints {
    fn default() -> Self {
        Self {
            live_url: "https://api.binance.com".to_string(),
            testnet_url: "https://testnet.binance.vision".to_string(),
            recv_window_ms: 5000,
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let workdir = lookup("WORKDIR")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("WORKDIR"))?;

        let fanout = FanoutConfig {
            concurrency: positive(&lookup, "FANOUT_CONCURRENCY", 20)?,
            max_signals_in_flight: positive(&lookup, "MAX_SIGNALS_IN_FLIGHT", 4)?,
            poll_interval: Duration::from_millis(parse_or(&lookup, "DISPATCH_POLL_MS", 1000)?),
        };

        let lease = LeaseConfig {
            lease_timeout: Duration::from_secs(positive(&lookup, "CLAIM_LEASE_SECS", 600)?),
            sweep_interval: Duration::from_secs(positive(&lookup, "SWEEP_INTERVAL_SECS", 60)?),
            retention: Duration::from_secs(
                parse_or::<u64, _>(&lookup, "SIGNAL_RETENTION_DAYS", 30)? * 24 * 3600,
            ),
        };

        let sizing = SizingRules {
            lot_step: positive_f64(&lookup, "LOT_STEP", 0.00001)?,
            min_quantity: positive_f64(&lookup, "MIN_QUANTITY", 0.00001)?,
        };

        let min_balance: f64 = parse_or(&lookup, "MIN_BALANCE", 0.0)?;
        if !min_balance.is_finite() || min_balance < 0.0 {
            return Err(ConfigError::Invalid {
                key: "MIN_BALANCE",
                value: min_balance.to_string(),
            });
        }

        let telegram = match (lookup("TELEGRAM_BOT_TOKEN"), lookup("TELEGRAM_CHAT_ID")) {
            (Some(token), Some(chat)) if !token.trim().is_empty() => {
                let chat_id = chat.trim().parse::<i64>().map_err(|_| ConfigError::Invalid {
                    key: "TELEGRAM_CHAT_ID",
                    value: chat.clone(),
                })?;
                Some(TelegramConfig {
                    bot_token: SecretString::from(token),
                    chat_id,
                })
            }
            _ => None,
        };

        let defaults = BinanceEndpoints::default();

        Ok(Self {
            database: DatabaseConfig {
                path: PathBuf::from(workdir).join("sqlitedata").join("executor.db"),
            },
            fanout,
            pool: PoolConfig {
                idle_timeout: Duration::from_secs(parse_or(
                    &lookup,
                    "CLIENT_IDLE_TIMEOUT_SECS",
                    1800,
                )?),
            },
            throttle: ThrottleConfig {
                max_in_flight: positive(&lookup, "EXCHANGE_MAX_IN_FLIGHT", 10)?,
                min_interval: Duration::from_millis(parse_or(
                    &lookup,
                    "EXCHANGE_MIN_INTERVAL_MS",
                    50,
                )?),
            },
            sizing,
            retry: RetryConfig {
                max_retries: at_most(&lookup, "NETWORK_RETRIES", 3, MAX_NETWORK_RETRIES)?,
                base_delay: Duration::from_millis(parse_or(&lookup, "RETRY_BASE_DELAY_MS", 200)?),
                ..RetryConfig::default()
            },
            lease,
            binance: BinanceEndpoints {
                live_url: lookup("BINANCE_BASE_URL").unwrap_or(defaults.live_url),
                testnet_url: lookup("BINANCE_TESTNET_URL").unwrap_or(defaults.testnet_url),
                ..defaults
            },
            telegram,
            min_balance,
        })
    }
}

impl Config {
    /// Longest a started fan-out unit can run: three retried exchange calls
    /// (connect, price, order) at full timeout and jittered backoff, plus a
    /// margin for the ledger write. Shutdown waits this long before aborting.
    pub fn shutdown_grace(&self) -> Duration {
        let per_call = self.binance.request_timeout * (self.retry.max_retries + 1)
            + self.retry.max_delay.mul_f64(1.25) * self.retry.max_retries;
        per_call * 3 + Duration::from_secs(5)
    }
}

fn parse_or<T, F>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid { key, value: raw }),
        None => Ok(default),
    }
}

fn positive<T, F>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default + ToString,
    F: Fn(&str) -> Option<String>,
{
    let value = parse_or(lookup, key, default)?;
    if value <= T::default() {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        });
    }
    Ok(value)
}

fn at_most<F>(lookup: &F, key: &'static str, default: u32, max: u32) -> Result<u32, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = parse_or(lookup, key, default)?;
    if value > max {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        });
    }
    Ok(value)
}

fn positive_f64<F>(lookup: &F, key: &'static str, default: f64) -> Result<f64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value: f64 = parse_or(lookup, key, default)?;
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        });
    }
    Ok(value)
}
