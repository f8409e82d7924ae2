//! Backoff for transient exchange failures.
//!
//! Only `NetworkError` is retried here. Rate limits and every other failure
//! return immediately so the caller can record them.

use std::{future::Future, time::Duration};

use common::config::RetryConfig;
use rand::Rng;
use tracing::{debug, warn};

use crate::ExchangeError;

fn calculate_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let cap = config.max_delay.as_secs_f64();
    let raw = config.base_delay.as_secs_f64() * config.backoff_multiplier.powi(attempt as i32);
    // Clamped as f64; large attempts overflow what `Duration` can hold.
    let delay = Duration::from_secs_f64(if raw.is_finite() { raw.min(cap) } else { cap });

    if config.add_jitter {
        // ±25%
        let jitter = rand::thread_rng().gen_range(-0.25..=0.25);
        Duration::from_secs_f64((delay.as_secs_f64() * (1.0 + jitter)).max(0.0))
    } else {
        delay
    }
}

pub async fn with_retry<T, F, Fut>(config: &RetryConfig, operation: F) -> Result<T, ExchangeError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ExchangeError>>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(attempts = attempt + 1, "Succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                if attempt >= config.max_retries {
                    warn!(error = %e, attempts = attempt + 1, "Retries exhausted");
                    return Err(e);
                }

                let delay = calculate_delay(config, attempt);
                warn!(
                    error = %e,
                    attempt = attempt + 1,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "Transient exchange error, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
