use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use common::models::{ClaimStatus, Direction, Signal, SignalPayload};
use sha2::{Digest, Sha256};
use storage::{StorageError, repositories::SignalRepository};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("InvalidSignal: {0}")]
    InvalidSignal(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Front door for signals: validation, deduplication and the claim lifecycle.
#[derive(Clone)]
pub struct SignalIngestor {
    repo: SignalRepository,
    notify: Arc<Notify>,
}

impl SignalIngestor {
    pub fn new(repo: SignalRepository) -> Self {
        Self {
            repo,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Woken once per newly stored signal.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    pub async fn submit(&self, payload: SignalPayload) -> Result<String, IngestError> {
        self.submit_at(payload, Utc::now()).await
    }

    /// Stores the signal as `unclaimed`. Submitting an id that already exists
    /// returns that id and writes nothing.
    pub async fn submit_at(
        &self,
        payload: SignalPayload,
        now: DateTime<Utc>,
    ) -> Result<String, IngestError> {
        let signal = validate(payload, now)?;

        if self.repo.insert_if_absent(&signal).await? {
            info!(signal_id = %signal.id, symbol = %signal.symbol, direction = %signal.direction, "Signal accepted");
            self.notify.notify_one();
        } else {
            debug!(signal_id = %signal.id, "Duplicate signal ignored");
        }
        Ok(signal.id)
    }

    pub async fn claim_next(&self) -> Result<Option<Signal>, IngestError> {
        Ok(self.repo.claim_next(Utc::now()).await?)
    }

    pub async fn mark_done(&self, id: &str) -> Result<(), IngestError> {
        Ok(self.repo.mark_done(id, Utc::now()).await?)
    }

    /// Claimed signals whose lease is older than `lease`. Their lease is
    /// restarted so a second sweep does not pick them up immediately.
    pub async fn reclaim_stale(&self, lease: Duration) -> Result<Vec<Signal>, IngestError> {
        let now = Utc::now();
        Ok(self.repo.reclaim_stale(cutoff(now, lease), now).await?)
    }

    pub async fn archive_completed(&self, retention: Duration) -> Result<u64, IngestError> {
        let now = Utc::now();
        Ok(self.repo.archive_completed(cutoff(now, retention), now).await?)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Signal>, IngestError> {
        Ok(self.repo.get(id).await?)
    }
}

/// `sig-` followed by 32 hex chars of SHA-256 over `SYMBOL|direction|minute`.
/// The same call repeated within one minute maps to the same id.
pub fn derive_signal_id(symbol: &str, direction: Direction, at: DateTime<Utc>) -> String {
    let bucket = at
        .duration_trunc(TimeDelta::minutes(1))
        .unwrap_or(at)
        .timestamp();
    let digest = Sha256::digest(format!("{}|{}|{}", symbol, direction.as_str(), bucket));
    format!("sig-{}", &hex::encode(digest)[..32])
}

fn validate(payload: SignalPayload, now: DateTime<Utc>) -> Result<Signal, IngestError> {
    let symbol = payload.symbol.trim().to_uppercase();
    if symbol.is_empty() {
        return Err(IngestError::InvalidSignal("symbol is empty".to_string()));
    }
    if !symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(IngestError::InvalidSignal(format!(
            "symbol '{}' contains invalid characters",
            payload.symbol
        )));
    }

    let direction: Direction = payload
        .direction
        .parse()
        .map_err(IngestError::InvalidSignal)?;

    if let Some(price) = payload.price {
        if !price.is_finite() || price <= 0.0 {
            return Err(IngestError::InvalidSignal(format!(
                "price must be positive, got {}",
                price
            )));
        }
    }

    let id = match payload.signal_id.map(|s| s.trim().to_string()) {
        Some(id) if !id.is_empty() => id,
        Some(_) => return Err(IngestError::InvalidSignal("signal_id is blank".to_string())),
        None => derive_signal_id(&symbol, direction, now),
    };

    Ok(Signal {
        id,
        symbol,
        direction,
        reference_price: payload.price,
        received_at: now,
        claim_status: ClaimStatus::Unclaimed,
        claimed_at: None,
        completed_at: None,
    })
}

fn cutoff(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(window)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use storage::Database;

    async fn ingestor() -> SignalIngestor {
        let db = Database::in_memory().await.unwrap();
        SignalIngestor::new(SignalRepository::new(&db))
    }

    fn payload(symbol: &str, direction: &str, price: Option<f64>) -> SignalPayload {
        SignalPayload {
            symbol: symbol.to_string(),
            direction: direction.to_string(),
            price,
            signal_id: None,
        }
    }

    #[test]
    fn derived_ids_share_a_minute_bucket() {
        let a = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 5).unwrap();
        let b = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 59).unwrap();
        let c = Utc.with_ymd_and_hms(2024, 5, 1, 12, 31, 0).unwrap();

        let id_a = derive_signal_id("BTCUSDT", Direction::Long, a);
        assert_eq!(id_a, derive_signal_id("BTCUSDT", Direction::Long, b));
        assert_ne!(id_a, derive_signal_id("BTCUSDT", Direction::Long, c));
        assert_ne!(id_a, derive_signal_id("BTCUSDT", Direction::Short, a));
        assert!(id_a.starts_with("sig-"));
        assert_eq!(id_a.len(), 4 + 32);
    }

    #[tokio::test]
    async fn resubmitting_a_derived_id_is_a_noop() {
        let ingestor = ingestor().await;
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 5).unwrap();

        let first = ingestor
            .submit_at(payload("btcusdt", "long", Some(50_000.0)), at)
            .await
            .unwrap();
        let second = ingestor
            .submit_at(payload("BTCUSDT", "LONG", Some(50_100.0)), at + TimeDelta::seconds(20))
            .await
            .unwrap();

        assert_eq!(first, second);
        let stored = ingestor.get(&first).await.unwrap().unwrap();
        assert_eq!(stored.reference_price, Some(50_000.0));
        assert_eq!(stored.claim_status, ClaimStatus::Unclaimed);
    }

    #[tokio::test]
    async fn explicit_id_is_kept() {
        let ingestor = ingestor().await;
        let mut p = payload("ETHUSDT", "short", None);
        p.signal_id = Some(" sig-1 ".to_string());

        assert_eq!(ingestor.submit(p).await.unwrap(), "sig-1");
    }

    #[tokio::test]
    async fn malformed_payloads_write_nothing() {
        let ingestor = ingestor().await;

        for bad in [
            payload("", "long", None),
            payload("BTC/USDT", "long", None),
            payload("BTCUSDT", "sideways", None),
            payload("BTCUSDT", "long", Some(-1.0)),
            payload("BTCUSDT", "long", Some(f64::INFINITY)),
        ] {
            let err = ingestor.submit(bad).await.unwrap_err();
            assert!(matches!(err, IngestError::InvalidSignal(_)), "{}", err);
        }

        assert!(ingestor.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_then_mark_done() {
        let ingestor = ingestor().await;
        let id = ingestor.submit(payload("BTCUSDT", "long", None)).await.unwrap();

        let claimed = ingestor.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert!(ingestor.claim_next().await.unwrap().is_none());

        ingestor.mark_done(&id).await.unwrap();
        ingestor.mark_done(&id).await.unwrap();
        let done = ingestor.get(&id).await.unwrap().unwrap();
        assert_eq!(done.claim_status, ClaimStatus::Done);
    }

    #[tokio::test]
    async fn fresh_claims_are_not_stale() {
        let ingestor = ingestor().await;
        ingestor.submit(payload("BTCUSDT", "long", None)).await.unwrap();
        ingestor.claim_next().await.unwrap().unwrap();

        assert!(ingestor.reclaim_stale(Duration::from_secs(600)).await.unwrap().is_empty());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(ingestor.reclaim_stale(Duration::ZERO).await.unwrap().len(), 1);
    }
}
