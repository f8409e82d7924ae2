use std::sync::Arc;

use common::config::ThrottleConfig;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{Duration, Instant};

use crate::ExchangeError;

/// Request gate for one exchange: bounds in-flight calls and spaces their
/// start times by `min_interval`.
pub struct ExchangeThrottle {
    semaphore: Arc<Semaphore>,
    min_interval: Duration,
    next_slot: Mutex<Instant>,
}

impl ExchangeThrottle {
    pub fn new(config: &ThrottleConfig) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_in_flight)),
            min_interval: config.min_interval,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    /// Waits for a free slot. The permit must be held for the whole request.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, ExchangeError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ExchangeError::Network("exchange throttle closed".to_string()))?;

        let start_at = {
            let mut next = self.next_slot.lock().await;
            let slot = (*next).max(Instant::now());
            *next = slot + self.min_interval;
            slot
        };
        tokio::time::sleep_until(start_at).await;

        Ok(permit)
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}
