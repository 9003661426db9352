use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Open position as reported by the broker or cached locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub position_id: String,
    pub symbol: String,
    /// Signed size: positive long, negative short.
    pub size: Decimal,
    pub avg_entry_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    pub fn notional(&self) -> Decimal {
        self.avg_entry_price * self.size.abs()
    }

    pub fn is_flat(&self) -> bool {
        self.size.is_zero()
    }
}

/// Account-level status snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountStatus {
    pub account_id: String,
    pub balance: Decimal,
    pub equity: Decimal,
    pub day_pnl: Decimal,
    /// True when the account has been locked out by an enforcement action.
    pub locked: bool,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_position_notional_uses_abs_size() {
        let position = Position {
            position_id: "pos-1".to_string(),
            symbol: "CL".to_string(),
            size: dec!(-3),
            avg_entry_price: dec!(75.50),
            unrealized_pnl: dec!(0),
            opened_at: Utc::now(),
        };

        assert_eq!(position.notional(), dec!(226.50));
        assert!(!position.is_flat());
    }
}
