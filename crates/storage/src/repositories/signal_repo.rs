use chrono::{DateTime, Utc};
use common::models::{ClaimStatus, Signal};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::{
    db::{Database, from_millis, to_millis},
    error::StorageError,
};

const SIGNAL_COLUMNS: &str =
    "id, symbol, direction, reference_price, received_at, claim_status, claimed_at, completed_at";

#[derive(sqlx::FromRow)]
struct SignalRow {
    id: String,
    symbol: String,
    direction: String,
    reference_price: Option<f64>,
    received_at: i64,
    claim_status: String,
    claimed_at: Option<i64>,
    completed_at: Option<i64>,
}

impl TryFrom<SignalRow> for Signal {
    type Error = StorageError;

    fn try_from(row: SignalRow) -> Result<Self, Self::Error> {
        Ok(Signal {
            direction: row.direction.parse().map_err(StorageError::Corrupt)?,
            claim_status: row.claim_status.parse().map_err(StorageError::Corrupt)?,
            received_at: from_millis(row.received_at)?,
            claimed_at: row.claimed_at.map(from_millis).transpose()?,
            completed_at: row.completed_at.map(from_millis).transpose()?,
            id: row.id,
            symbol: row.symbol,
            reference_price: row.reference_price,
        })
    }
}

/// Persistence and claim state machine for signals.
#[derive(Clone)]
pub struct SignalRepository {
    pool: SqlitePool,
}

impl SignalRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Inserts an `unclaimed` signal unless the id is already known, live or
    /// archived. Returns whether a row was written.
    pub async fn insert_if_absent(&self, signal: &Signal) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
                INSERT INTO signals (
                    id, symbol, direction, reference_price, received_at, claim_status
                )
                SELECT ?, ?, ?, ?, ?, 'unclaimed'
                WHERE NOT EXISTS (SELECT 1 FROM signals_archive WHERE id = ?)
                ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&signal.id)
        .bind(&signal.symbol)
        .bind(signal.direction.as_str())
        .bind(signal.reference_price)
        .bind(to_millis(signal.received_at))
        .bind(&signal.id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Signal>, StorageError> {
        let row = sqlx::query_as::<_, SignalRow>(&format!(
            "SELECT {} FROM signals WHERE id = ?",
            SIGNAL_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Signal::try_from).transpose()
    }

    /// Moves the oldest `unclaimed` signal to `claimed` in one statement.
    /// The status guard on the outer UPDATE means two callers racing for the
    /// same row cannot both win it.
    pub async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Signal>, StorageError> {
        let row = sqlx::query_as::<_, SignalRow>(&format!(
            r#"
                UPDATE signals
                SET claim_status = 'claimed', claimed_at = ?
                WHERE id = (
                    SELECT id FROM signals
                    WHERE claim_status = 'unclaimed'
                    ORDER BY received_at, rowid
                    LIMIT 1
                )
                AND claim_status = 'unclaimed'
                RETURNING {}
            "#,
            SIGNAL_COLUMNS
        ))
        .bind(to_millis(now))
        .fetch_optional(&self.pool)
        .await?;

        let signal = row.map(Signal::try_from).transpose()?;
        if let Some(ref s) = signal {
            debug!(signal_id = %s.id, "Claimed signal");
        }
        Ok(signal)
    }

    /// `claimed -> done`. Marking an already done signal is a no-op.
    pub async fn mark_done(&self, id: &str, now: DateTime<Utc>) -> Result<(), StorageError> {
        let result = sqlx::query(
            "UPDATE signals SET claim_status = 'done', completed_at = ? WHERE id = ? AND claim_status = 'claimed'",
        )
        .bind(to_millis(now))
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        match self.get(id).await? {
            Some(signal) if signal.claim_status == ClaimStatus::Done => Ok(()),
            Some(signal) => Err(StorageError::InvalidTransition {
                id: id.to_string(),
                status: signal.claim_status.as_str().to_string(),
            }),
            None => Err(StorageError::SignalNotFound(id.to_string())),
        }
    }

    /// Returns `claimed` signals whose lease started before `cutoff` and
    /// restarts their lease at `now`, oldest first.
    pub async fn reclaim_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Signal>, StorageError> {
        let rows = sqlx::query_as::<_, SignalRow>(&format!(
            r#"
                UPDATE signals
                SET claimed_at = ?
                WHERE claim_status = 'claimed' AND claimed_at < ?
                RETURNING {}
            "#,
            SIGNAL_COLUMNS
        ))
        .bind(to_millis(now))
        .bind(to_millis(cutoff))
        .fetch_all(&self.pool)
        .await?;

        let mut signals = rows
            .into_iter()
            .map(Signal::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        signals.sort_by_key(|s| s.received_at);
        Ok(signals)
    }

    /// Moves `done` signals completed before `cutoff` into `signals_archive`.
    pub async fn archive_completed(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            r#"
                INSERT OR IGNORE INTO signals_archive ({cols}, archived_at)
                SELECT {cols}, ? FROM signals
                WHERE claim_status = 'done' AND completed_at < ?
            "#,
            cols = SIGNAL_COLUMNS
        ))
        .bind(to_millis(now))
        .bind(to_millis(cutoff))
        .execute(&mut *tx)
        .await?;

        let moved = sqlx::query("DELETE FROM signals WHERE claim_status = 'done' AND completed_at < ?")
            .bind(to_millis(cutoff))
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        if moved > 0 {
            info!("Archived {} completed signals", moved);
        }
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use common::models::Direction;
    use std::collections::HashSet;

    fn signal(id: &str, received_at: DateTime<Utc>) -> Signal {
        Signal {
            id: id.to_string(),
            symbol: "BTCUSDT".to_string(),
            direction: Direction::Long,
            reference_price: Some(50_000.0),
            received_at,
            claim_status: ClaimStatus::Unclaimed,
            claimed_at: None,
            completed_at: None,
        }
    }

    async fn repo() -> SignalRepository {
        SignalRepository::new(&Database::in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn duplicate_insert_is_a_no_op() {
        let repo = repo().await;
        let now = Utc::now();

        assert!(repo.insert_if_absent(&signal("sig-1", now)).await.unwrap());
        assert!(!repo.insert_if_absent(&signal("sig-1", now)).await.unwrap());

        let stored = repo.get("sig-1").await.unwrap().unwrap();
        assert_eq!(stored.claim_status, ClaimStatus::Unclaimed);
        assert_eq!(stored.reference_price, Some(50_000.0));
    }

    #[tokio::test]
    async fn claims_oldest_first_and_only_once() {
        let repo = repo().await;
        let now = Utc::now();
        repo.insert_if_absent(&signal("later", now)).await.unwrap();
        repo.insert_if_absent(&signal("earlier", now - Duration::seconds(5)))
            .await
            .unwrap();

        let first = repo.claim_next(now).await.unwrap().unwrap();
        let second = repo.claim_next(now).await.unwrap().unwrap();

        assert_eq!(first.id, "earlier");
        assert_eq!(first.claim_status, ClaimStatus::Claimed);
        assert_eq!(second.id, "later");
        assert!(repo.claim_next(now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_claims_never_share_a_signal() {
        let repo = repo().await;
        let now = Utc::now();
        for i in 0..20 {
            repo.insert_if_absent(&signal(&format!("sig-{}", i), now + Duration::milliseconds(i)))
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                while let Some(signal) = repo.claim_next(Utc::now()).await.unwrap() {
                    mine.push(signal.id);
                }
                mine
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            for id in handle.await.unwrap() {
                total += 1;
                assert!(seen.insert(id), "signal handed out twice");
            }
        }
        assert_eq!(total, 20);
    }

    #[tokio::test]
    async fn mark_done_is_idempotent_but_requires_a_claim() {
        let repo = repo().await;
        let now = Utc::now();
        repo.insert_if_absent(&signal("sig-1", now)).await.unwrap();

        let err = repo.mark_done("sig-1", now).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidTransition { .. }));

        repo.claim_next(now).await.unwrap();
        repo.mark_done("sig-1", now).await.unwrap();
        repo.mark_done("sig-1", now).await.unwrap();

        let stored = repo.get("sig-1").await.unwrap().unwrap();
        assert_eq!(stored.claim_status, ClaimStatus::Done);
        assert!(stored.completed_at.is_some());

        let err = repo.mark_done("missing", now).await.unwrap_err();
        assert!(matches!(err, StorageError::SignalNotFound(_)));
    }

    #[tokio::test]
    async fn reclaim_only_returns_expired_leases() {
        let repo = repo().await;
        let now = Utc::now();
        repo.insert_if_absent(&signal("old", now)).await.unwrap();
        repo.insert_if_absent(&signal("fresh", now + Duration::seconds(1)))
            .await
            .unwrap();

        repo.claim_next(now - Duration::minutes(30)).await.unwrap();
        repo.claim_next(now).await.unwrap();

        let stale = repo
            .reclaim_stale(now - Duration::minutes(10), now)
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, "old");
        assert_eq!(stale[0].claimed_at, Some(from_millis(to_millis(now)).unwrap()));

        // The lease was renewed, so an immediate second sweep finds nothing.
        assert!(
            repo.reclaim_stale(now - Duration::minutes(10), now)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn archived_ids_stay_deduplicated() {
        let repo = repo().await;
        let now = Utc::now();
        repo.insert_if_absent(&signal("sig-1", now)).await.unwrap();
        repo.claim_next(now).await.unwrap();
        repo.mark_done("sig-1", now - Duration::days(40)).await.unwrap();

        let moved = repo
            .archive_completed(now - Duration::days(30), now)
            .await
            .unwrap();
        assert_eq!(moved, 1);
        assert!(repo.get("sig-1").await.unwrap().is_none());

        assert!(!repo.insert_if_absent(&signal("sig-1", now)).await.unwrap());
    }
}
