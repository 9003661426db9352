use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::order::{OrderSide, OrderStatus};

/// Position change pushed over the realtime stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub account_id: String,
    pub position_id: String,
    pub symbol: String,
    pub size: Decimal,
    pub avg_entry_price: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Order lifecycle change pushed over the realtime stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub account_id: String,
    pub order_id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub status: OrderStatus,
    pub filled_size: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Individual execution (fill) pushed over the realtime stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeUpdate {
    pub account_id: String,
    pub trade_id: String,
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub size: Decimal,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Account-level change pushed over the realtime stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountUpdate {
    pub account_id: String,
    pub balance: Decimal,
    pub equity: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Typed event delivered to subscribers in arrival order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RealtimeEvent {
    Position(PositionUpdate),
    Order(OrderUpdate),
    Trade(TradeUpdate),
    Account(AccountUpdate),
}

impl RealtimeEvent {
    /// The subscription topic this event belongs to.
    pub fn topic(&self) -> &'static str {
        match self {
            RealtimeEvent::Position(_) => "positions",
            RealtimeEvent::Order(_) => "orders",
            RealtimeEvent::Trade(_) => "trades",
            RealtimeEvent::Account(_) => "account",
        }
    }

    pub fn account_id(&self) -> &str {
        match self {
            RealtimeEvent::Position(e) => &e.account_id,
            RealtimeEvent::Order(e) => &e.account_id,
            RealtimeEvent::Trade(e) => &e.account_id,
            RealtimeEvent::Account(e) => &e.account_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_event_topic_mapping() {
        let event = RealtimeEvent::Trade(TradeUpdate {
            account_id: "acct-1".to_string(),
            trade_id: "t-1".to_string(),
            order_id: "o-1".to_string(),
            symbol: "ES".to_string(),
            side: OrderSide::Buy,
            size: dec!(1),
            price: dec!(4500),
            timestamp: Utc::now(),
        });

        assert_eq!(event.topic(), "trades");
        assert_eq!(event.account_id(), "acct-1");
    }

    #[test]
    fn test_event_serde_tagging() {
        let event = RealtimeEvent::Account(AccountUpdate {
            account_id: "acct-1".to_string(),
            balance: dec!(10000),
            equity: dec!(10250),
            timestamp: Utc::now(),
        });

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "account");
    }
}
