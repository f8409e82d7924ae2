use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which endpoint family a user's keys belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountMode {
    Paper,
    Real,
}

impl AccountMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paper => "paper",
            Self::Real => "real",
        }
    }
}

impl FromStr for AccountMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "paper" | "testnet" => Ok(Self::Paper),
            "real" | "live" => Ok(Self::Real),
            other => Err(format!("unknown account mode '{}'", other)),
        }
    }
}

impl fmt::Display for AccountMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct UserTradingProfile {
    pub user_id: String,
    pub exchange: String,
    pub api_key: SecretString,
    pub api_secret: SecretString,
    pub account_mode: AccountMode,
    /// Fraction of the available balance committed per signal, e.g. 0.02.
    pub risk_percentage: f64,
    pub available_balance: f64,
    pub disabled: bool,
}

impl UserTradingProfile {
    pub fn has_credentials(&self) -> bool {
        !self.api_key.expose_secret().trim().is_empty()
            && !self.api_secret.expose_secret().trim().is_empty()
    }
}
