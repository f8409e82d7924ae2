use chrono::{DateTime, Utc};
use common::models::ExecutionAttempt;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::{
    db::{Database, from_millis, to_millis},
    error::StorageError,
};

#[derive(sqlx::FromRow)]
struct AttemptRow {
    signal_id: String,
    user_id: String,
    exchange: String,
    requested_quantity: Option<f64>,
    order_id: Option<String>,
    status: String,
    error_reason: Option<String>,
    attempted_at: i64,
}

impl TryFrom<AttemptRow> for ExecutionAttempt {
    type Error = StorageError;

    fn try_from(row: AttemptRow) -> Result<Self, Self::Error> {
        Ok(ExecutionAttempt {
            status: row.status.parse().map_err(StorageError::Corrupt)?,
            attempted_at: from_millis(row.attempted_at)?,
            signal_id: row.signal_id,
            user_id: row.user_id,
            exchange: row.exchange,
            requested_quantity: row.requested_quantity,
            order_id: row.order_id,
            error_reason: row.error_reason,
        })
    }
}

/// Reporting filter over the ledger. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AttemptFilter {
    pub signal_id: Option<String>,
    pub user_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

impl AttemptFilter {
    pub fn signal(mut self, signal_id: impl Into<String>) -> Self {
        self.signal_id = Some(signal_id.into());
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Half-open range `[from, until)` on `attempted_at`.
    pub fn between(mut self, from: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Append-only execution ledger. No update or delete here;
/// the schema triggers reject both.
#[derive(Clone)]
pub struct AttemptRepository {
    pool: SqlitePool,
}

impl AttemptRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    pub async fn record(&self, attempt: &ExecutionAttempt) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
                INSERT INTO execution_attempts (
                    signal_id, user_id, exchange, requested_quantity,
                    order_id, status, error_reason, attempted_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&attempt.signal_id)
        .bind(&attempt.user_id)
        .bind(&attempt.exchange)
        .bind(attempt.requested_quantity)
        .bind(&attempt.order_id)
        .bind(attempt.status.as_str())
        .bind(&attempt.error_reason)
        .bind(to_millis(attempt.attempted_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(StorageError::DuplicateAttempt {
                    signal_id: attempt.signal_id.clone(),
                    user_id: attempt.user_id.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, signal_id: &str, user_id: &str) -> Result<bool, StorageError> {
        let found = sqlx::query_scalar::<_, i64>(
            "SELECT 1 FROM execution_attempts WHERE signal_id = ? AND user_id = ?",
        )
        .bind(signal_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    pub async fn list_for_signal(
        &self,
        signal_id: &str,
    ) -> Result<Vec<ExecutionAttempt>, StorageError> {
        self.query(&AttemptFilter::default().signal(signal_id)).await
    }

    pub async fn query(&self, filter: &AttemptFilter) -> Result<Vec<ExecutionAttempt>, StorageError> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            r#"
                SELECT signal_id, user_id, exchange, requested_quantity,
                       order_id, status, error_reason, attempted_at
                FROM execution_attempts
                WHERE 1 = 1
            "#,
        );

        if let Some(ref signal_id) = filter.signal_id {
            builder.push(" AND signal_id = ").push_bind(signal_id.clone());
        }
        if let Some(ref user_id) = filter.user_id {
            builder.push(" AND user_id = ").push_bind(user_id.clone());
        }
        if let Some(from) = filter.from {
            builder.push(" AND attempted_at >= ").push_bind(to_millis(from));
        }
        if let Some(until) = filter.until {
            builder.push(" AND attempted_at < ").push_bind(to_millis(until));
        }
        builder.push(" ORDER BY attempted_at, id");
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ").push_bind(limit);
        }

        let rows = builder
            .build_query_as::<AttemptRow>()
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(ExecutionAttempt::try_from).collect()
    }
}
