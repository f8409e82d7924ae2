use std::sync::Arc;

use async_trait::async_trait;
use common::{
    credentials::{CredentialError, CredentialStore, EligibilityPolicy},
    models::UserTradingProfile,
};
use secrecy::{ExposeSecret, SecretString};
use sqlx::SqlitePool;
use tracing::{debug, warn};

use crate::{db::Database, error::StorageError};

#[derive(sqlx::FromRow)]
struct ProfileRow {
    user_id: String,
    exchange: String,
    api_key: String,
    api_secret: String,
    account_mode: String,
    risk_percentage: f64,
    available_balance: f64,
    disabled: bool,
}

impl TryFrom<ProfileRow> for UserTradingProfile {
    type Error = StorageError;

    fn try_from(row: ProfileRow) -> Result<Self, Self::Error> {
        Ok(UserTradingProfile {
            account_mode: row.account_mode.parse().map_err(StorageError::Corrupt)?,
            user_id: row.user_id,
            exchange: row.exchange,
            api_key: SecretString::from(row.api_key),
            api_secret: SecretString::from(row.api_secret),
            risk_percentage: row.risk_percentage,
            available_balance: row.available_balance,
            disabled: row.disabled,
        })
    }
}

impl From<StorageError> for CredentialError {
    fn from(err: StorageError) -> Self {
        CredentialError::Unavailable(err.to_string())
    }
}

/// SQLite-backed credential store. Profiles are written by the external
/// account-management flow; `upsert_profile` exists for seeding.
pub struct CredentialRepository {
    pool: SqlitePool,
    policy: Arc<dyn EligibilityPolicy>,
}

impl CredentialRepository {
    pub fn new(db: &Database, policy: Arc<dyn EligibilityPolicy>) -> Self {
        Self {
            pool: db.pool().clone(),
            policy,
        }
    }

    pub async fn upsert_profile(&self, profile: &UserTradingProfile) -> Result<(), StorageError> {
        sqlx::query(
            r#"
                INSERT INTO user_profiles (
                    user_id, exchange, api_key, api_secret, account_mode,
                    risk_percentage, available_balance, disabled
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(user_id, exchange) DO UPDATE SET
                    api_key = excluded.api_key,
                    api_secret = excluded.api_secret,
                    account_mode = excluded.account_mode,
                    risk_percentage = excluded.risk_percentage,
                    available_balance = excluded.available_balance,
                    disabled = excluded.disabled
            "#,
        )
        .bind(&profile.user_id)
        .bind(&profile.exchange)
        .bind(profile.api_key.expose_secret())
        .bind(profile.api_secret.expose_secret())
        .bind(profile.account_mode.as_str())
        .bind(profile.risk_percentage)
        .bind(profile.available_balance)
        .bind(profile.disabled)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<UserTradingProfile>, StorageError> {
        let rows = sqlx::query_as::<_, ProfileRow>(
            r#"
                SELECT user_id, exchange, api_key, api_secret, account_mode,
                       risk_percentage, available_balance, disabled
                FROM user_profiles
                WHERE disabled = 0
                ORDER BY user_id, exchange
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut profiles = Vec::with_capacity(rows.len());
        for row in rows {
            let key = format!("{}/{}", row.user_id, row.exchange);
            match UserTradingProfile::try_from(row) {
                Ok(profile) => profiles.push(profile),
                Err(e) => warn!("Ignoring unreadable profile {}: {}", key, e),
            }
        }
        Ok(profiles)
    }
}

#[async_trait]
impl CredentialStore for CredentialRepository {
    async fn eligible_users(&self) -> Result<Vec<UserTradingProfile>, CredentialError> {
        let all = self.load_all().await?;
        let total = all.len();
        let eligible: Vec<_> = all
            .into_iter()
            .filter(|p| self.policy.is_eligible(p))
            .collect();
        debug!("{} of {} enabled profiles are eligible", eligible.len(), total);
        Ok(eligible)
    }

    async fn profile(
        &self,
        user_id: &str,
        exchange: &str,
    ) -> Result<UserTradingProfile, CredentialError> {
        let row = sqlx::query_as::<_, ProfileRow>(
            r#"
                SELECT user_id, exchange, api_key, api_secret, account_mode,
                       risk_percentage, available_balance, disabled
                FROM user_profiles
                WHERE user_id = ? AND exchange = ?
            "#,
        )
        .bind(user_id)
        .bind(exchange)
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::from)?;

        match row {
            Some(row) => Ok(UserTradingProfile::try_from(row)?),
            None => Err(CredentialError::NotFound {
                user_id: user_id.to_string(),
                exchange: exchange.to_string(),
            }),
        }
    }
}
