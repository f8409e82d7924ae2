use async_trait::async_trait;
use thiserror::Error;

use crate::models::UserTradingProfile;

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("NotFound: no profile for user {user_id} on {exchange}")]
    NotFound { user_id: String, exchange: String },
    #[error("credential store unavailable: {0}")]
    Unavailable(String),
}

/// Read side of the per-user credential and risk settings.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Profiles that pass the store's eligibility policy.
    async fn eligible_users(&self) -> Result<Vec<UserTradingProfile>, CredentialError>;

    async fn profile(
        &self,
        user_id: &str,
        exchange: &str,
    ) -> Result<UserTradingProfile, CredentialError>;
}

/// Decides whether a profile should receive signals.
pub trait EligibilityPolicy: Send + Sync {
    fn is_eligible(&self, profile: &UserTradingProfile) -> bool;
}

/// Credentials present, not disabled, balance at or above `min_balance`.
#[derive(Debug, Clone)]
pub struct MinimumBalancePolicy {
    pub min_balance: f64,
}

impl MinimumBalancePolicy {
    pub fn new(min_balance: f64) -> Self {
        Self { min_balance }
    }
}

impl EligibilityPolicy for MinimumBalancePolicy {
    fn is_eligible(&self, profile: &UserTradingProfile) -> bool {
        !profile.disabled
            && profile.has_credentials()
            && profile.available_balance.is_finite()
            && profile.available_balance >= self.min_balance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AccountMode;
    use secrecy::SecretString;

    fn profile(balance: f64, key: &str, disabled: bool) -> UserTradingProfile {
        UserTradingProfile {
            user_id: "u1".to_string(),
            exchange: "binance".to_string(),
            api_key: SecretString::from(key),
            api_secret: SecretString::from("secret"),
            account_mode: AccountMode::Paper,
            risk_percentage: 0.02,
            available_balance: balance,
            disabled,
        }
    }

    #[test]
    fn minimum_balance_policy() {
        let policy = MinimumBalancePolicy::new(10.0);

        assert!(policy.is_eligible(&profile(10.0, "key", false)));
        assert!(!policy.is_eligible(&profile(9.99, "key", false)));
        assert!(!policy.is_eligible(&profile(100.0, "  ", false)));
        assert!(!policy.is_eligible(&profile(100.0, "key", true)));
        assert!(!policy.is_eligible(&profile(f64::NAN, "key", false)));
    }

    #[test]
    fn zero_minimum_admits_empty_accounts() {
        let policy = MinimumBalancePolicy::new(0.0);
        assert!(policy.is_eligible(&profile(0.0, "key", false)));
    }
}
