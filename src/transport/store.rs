//! Local state cache.
//!
//! Holds the daemon's view of positions, open orders, and account status.
//! Realtime events update it incrementally; the reconciler overwrites it
//! wholesale with broker-fetched snapshots.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::RwLock;

use crate::domain::{AccountStatus, OrderSnapshot, Position};

pub trait StateStore: Send + Sync {
    fn positions(&self) -> Vec<Position>;
    fn position(&self, symbol: &str) -> Option<Position>;
    fn upsert_position(&self, position: Position);
    fn remove_position(&self, symbol: &str);
    fn replace_positions(&self, positions: Vec<Position>);

    fn open_orders(&self) -> Vec<OrderSnapshot>;
    fn order(&self, order_id: &str) -> Option<OrderSnapshot>;
    fn upsert_order(&self, order: OrderSnapshot);
    fn remove_order(&self, order_id: &str);
    fn replace_orders(&self, orders: Vec<OrderSnapshot>);

    fn account(&self) -> Option<AccountStatus>;
    fn set_account(&self, account: AccountStatus);

    fn last_refreshed(&self) -> Option<DateTime<Utc>>;
}

#[derive(Default)]
pub struct MemoryStateStore {
    positions: DashMap<String, Position>,
    orders: DashMap<String, OrderSnapshot>,
    account: RwLock<Option<AccountStatus>>,
    refreshed: RwLock<Option<DateTime<Utc>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn positions(&self) -> Vec<Position> {
        self.positions.iter().map(|e| e.value().clone()).collect()
    }

    fn position(&self, symbol: &str) -> Option<Position> {
        self.positions.get(symbol).map(|e| e.value().clone())
    }

    fn upsert_position(&self, position: Position) {
        if position.is_flat() {
            self.positions.remove(&position.symbol);
        } else {
            self.positions.insert(position.symbol.clone(), position);
        }
    }

    fn remove_position(&self, symbol: &str) {
        self.positions.remove(symbol);
    }

    fn replace_positions(&self, positions: Vec<Position>) {
        self.positions.clear();
        for position in positions {
            if !position.is_flat() {
                self.positions.insert(position.symbol.clone(), position);
            }
        }
        *self.refreshed.write().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
    }

    fn open_orders(&self) -> Vec<OrderSnapshot> {
        self.orders.iter().map(|e| e.value().clone()).collect()
    }

    fn order(&self, order_id: &str) -> Option<OrderSnapshot> {
        self.orders.get(order_id).map(|e| e.value().clone())
    }

    fn upsert_order(&self, order: OrderSnapshot) {
        if order.status.is_terminal() {
            self.orders.remove(&order.order_id);
        } else {
            self.orders.insert(order.order_id.clone(), order);
        }
    }

    fn remove_order(&self, order_id: &str) {
        self.orders.remove(order_id);
    }

    fn replace_orders(&self, orders: Vec<OrderSnapshot>) {
        self.orders.clear();
        for order in orders {
            if !order.status.is_terminal() {
                self.orders.insert(order.order_id.clone(), order);
            }
        }
    }

    fn account(&self) -> Option<AccountStatus> {
        self.account
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_account(&self, account: AccountStatus) {
        *self.account.write().unwrap_or_else(|e| e.into_inner()) = Some(account);
    }

    fn last_refreshed(&self) -> Option<DateTime<Utc>> {
        *self.refreshed.read().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OrderSide, OrderStatus};
    use rust_decimal_macros::dec;

    fn position(symbol: &str, size: rust_decimal::Decimal) -> Position {
        Position {
            position_id: format!("pos-{}", symbol),
            symbol: symbol.to_string(),
            size,
            avg_entry_price: dec!(100),
            unrealized_pnl: dec!(0),
            opened_at: Utc::now(),
        }
    }

    fn order(order_id: &str, status: OrderStatus) -> OrderSnapshot {
        OrderSnapshot {
            order_id: order_id.to_string(),
            client_order_id: Some(format!("c-{}", order_id)),
            symbol: "ES-DEC26".to_string(),
            side: OrderSide::Buy,
            size: dec!(1),
            filled_size: dec!(0),
            limit_price: Some(dec!(100)),
            status,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_flat_position_is_dropped() {
        let store = MemoryStateStore::new();
        store.upsert_position(position("ES-DEC26", dec!(2)));
        assert!(store.position("ES-DEC26").is_some());

        store.upsert_position(position("ES-DEC26", dec!(0)));
        assert!(store.position("ES-DEC26").is_none());
    }

    #[test]
    fn test_terminal_order_is_dropped() {
        let store = MemoryStateStore::new();
        store.upsert_order(order("o-1", OrderStatus::Open));
        assert_eq!(store.open_orders().len(), 1);

        store.upsert_order(order("o-1", OrderStatus::Filled));
        assert!(store.open_orders().is_empty());
    }

    #[test]
    fn test_replace_overwrites_stale_entries() {
        let store = MemoryStateStore::new();
        store.upsert_position(position("ES-DEC26", dec!(2)));
        store.upsert_position(position("NQ-DEC26", dec!(1)));

        store.replace_positions(vec![position("NQ-DEC26", dec!(3))]);

        assert!(store.position("ES-DEC26").is_none());
        assert_eq!(store.position("NQ-DEC26").unwrap().size, dec!(3));
        assert!(store.last_refreshed().is_some());
    }
}
