use common::{config::SizingRules, models::UserTradingProfile};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SizingError {
    #[error("InsufficientBalance: balance {balance} at risk {risk} buys less than one lot at {price}")]
    InsufficientBalance { balance: f64, risk: f64, price: f64 },
    #[error("InvalidPrice: {0}")]
    InvalidPrice(f64),
    #[error("InvalidRisk: {0}")]
    InvalidRisk(f64),
}

/// Turns a user's balance and risk setting into an order quantity.
/// Pure arithmetic; prices are resolved by the caller.
#[derive(Debug, Clone)]
pub struct PositionSizer {
    rules: SizingRules,
}

impl PositionSizer {
    pub fn new(rules: SizingRules) -> Self {
        Self { rules }
    }

    pub fn compute_quantity(
        &self,
        profile: &UserTradingProfile,
        price: f64,
    ) -> Result<f64, SizingError> {
        if !price.is_finite() || price <= 0.0 {
            return Err(SizingError::InvalidPrice(price));
        }

        let risk = profile.risk_percentage;
        if !risk.is_finite() || risk <= 0.0 || risk > 1.0 {
            return Err(SizingError::InvalidRisk(risk));
        }

        let balance = profile.available_balance.max(0.0);
        let raw = balance * risk / price;
        let floored = self.floor_to_step(raw);

        if floored <= 0.0 {
            return Err(SizingError::InsufficientBalance {
                balance: profile.available_balance,
                risk,
                price,
            });
        }

        Ok(floored.max(self.rules.min_quantity))
    }

    fn floor_to_step(&self, raw: f64) -> f64 {
        let step = self.rules.lot_step;
        // 0.0004 / 0.00001 lands on 39.999999... without the nudge.
        let lots = (raw / step + 1e-9).floor();
        lots * step
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::models::AccountMode;
    use secrecy::SecretString;

    fn profile(balance: f64, risk: f64) -> UserTradingProfile {
        UserTradingProfile {
            user_id: "u1".to_string(),
            exchange: "binance".to_string(),
            api_key: SecretString::from("key"),
            api_secret: SecretString::from("secret"),
            account_mode: AccountMode::Paper,
            risk_percentage: risk,
            available_balance: balance,
            disabled: false,
        }
    }

    fn sizer() -> PositionSizer {
        PositionSizer::new(SizingRules {
            lot_step: 0.00001,
            min_quantity: 0.00001,
        })
    }

    #[test]
    fn sizes_by_balance_and_risk() {
        let qty = sizer().compute_quantity(&profile(1000.0, 0.02), 50_000.0).unwrap();
        assert!((qty - 0.0004).abs() < 1e-12, "got {}", qty);
    }

    #[test]
    fn floors_to_lot_step() {
        // 1000 * 0.02 / 30000 = 0.000666..
        let qty = sizer().compute_quantity(&profile(1000.0, 0.02), 30_000.0).unwrap();
        assert!((qty - 0.00066).abs() < 1e-12, "got {}", qty);
    }

    #[test]
    fn empty_balance_is_insufficient() {
        let err = sizer().compute_quantity(&profile(0.0, 0.02), 50_000.0).unwrap_err();
        assert!(matches!(err, SizingError::InsufficientBalance { .. }));
        assert!(err.to_string().starts_with("InsufficientBalance"));
    }

    #[test]
    fn dust_below_one_lot_is_insufficient() {
        let err = sizer().compute_quantity(&profile(0.1, 0.01), 50_000.0).unwrap_err();
        assert!(matches!(err, SizingError::InsufficientBalance { .. }));
    }

    #[test]
    fn minimum_quantity_applies_above_zero() {
        let sizer = PositionSizer::new(SizingRules {
            lot_step: 0.001,
            min_quantity: 0.01,
        });
        // 100 * 0.1 / 2000 = 0.005
        let qty = sizer.compute_quantity(&profile(100.0, 0.1), 2000.0).unwrap();
        assert_eq!(qty, 0.01);
    }

    #[test]
    fn rejects_bad_price_and_risk() {
        let s = sizer();
        assert_eq!(
            s.compute_quantity(&profile(1000.0, 0.02), 0.0),
            Err(SizingError::InvalidPrice(0.0))
        );
        assert!(matches!(
            s.compute_quantity(&profile(1000.0, 0.02), f64::NAN),
            Err(SizingError::InvalidPrice(_))
        ));
        assert_eq!(
            s.compute_quantity(&profile(1000.0, 1.5), 100.0),
            Err(SizingError::InvalidRisk(1.5))
        );
        assert_eq!(
            s.compute_quantity(&profile(1000.0, 0.0), 100.0),
            Err(SizingError::InvalidRisk(0.0))
        );
    }
}
