//! Fill progress tracking.
//!
//! Follows every submitted order from acknowledgement to completion by
//! consuming the realtime order and trade events. Orders that fail to
//! fill inside the configured window are reported as incomplete by the
//! periodic sweep.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::domain::{OrderAck, OrderRequest, OrderStatus, RealtimeEvent};

#[derive(Debug, Clone)]
pub struct FillProgress {
    pub order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub requested: Decimal,
    pub filled: Decimal,
    pub status: OrderStatus,
    pub submitted_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl FillProgress {
    pub fn fill_pct(&self) -> Decimal {
        if self.requested.is_zero() {
            return Decimal::ZERO;
        }
        self.filled / self.requested * Decimal::ONE_HUNDRED
    }

    pub fn is_complete(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Default)]
pub struct FillTracker {
    orders: DashMap<String, FillProgress>,
}

impl FillTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a freshly acknowledged order.
    pub fn track(&self, ack: &OrderAck, request: &OrderRequest) {
        let now = Utc::now();
        self.orders.insert(
            ack.order_id.clone(),
            FillProgress {
                order_id: ack.order_id.clone(),
                client_order_id: ack.client_order_id.clone(),
                symbol: request.symbol.clone(),
                requested: request.size,
                filled: Decimal::ZERO,
                status: ack.status,
                submitted_at: ack.accepted_at,
                last_update: now,
            },
        );
        debug!(order_id = %ack.order_id, symbol = %request.symbol, "Tracking fills");
    }

    /// Feed a realtime event through the tracker. Untracked orders are
    /// ignored; the tracker only follows orders this process submitted.
    pub fn on_event(&self, event: &RealtimeEvent) {
        match event {
            RealtimeEvent::Order(update) => {
                if let Some(mut entry) = self.orders.get_mut(&update.order_id) {
                    entry.filled = update.filled_size;
                    entry.status = update.status;
                    entry.last_update = update.timestamp;

                    if update.status == OrderStatus::Filled {
                        info!(
                            order_id = %update.order_id,
                            symbol = %entry.symbol,
                            size = %entry.requested,
                            "Order fully filled"
                        );
                    } else if update.status.is_terminal() {
                        info!(
                            order_id = %update.order_id,
                            status = ?update.status,
                            filled = %entry.filled,
                            requested = %entry.requested,
                            "Order reached terminal state"
                        );
                    }
                }
            }
            RealtimeEvent::Trade(trade) => {
                if let Some(entry) = self.orders.get(&trade.order_id) {
                    debug!(
                        order_id = %trade.order_id,
                        trade_id = %trade.trade_id,
                        size = %trade.size,
                        price = %trade.price,
                        fill_pct = %entry.fill_pct(),
                        "Fill received"
                    );
                }
            }
            _ => {}
        }
    }

    pub fn progress(&self, order_id: &str) -> Option<FillProgress> {
        self.orders.get(order_id).map(|e| e.value().clone())
    }

    pub fn active(&self) -> Vec<FillProgress> {
        self.orders
            .iter()
            .filter(|e| !e.value().is_complete())
            .map(|e| e.value().clone())
            .collect()
    }

    /// Drop completed orders and report ones that outlived the fill
    /// window without completing. Returns the incomplete entries.
    pub fn sweep(&self, fill_timeout: chrono::Duration) -> Vec<FillProgress> {
        let now = Utc::now();
        let mut incomplete = Vec::new();

        self.orders.retain(|_, progress| {
            if progress.is_complete() {
                return false;
            }
            if now.signed_duration_since(progress.submitted_at) > fill_timeout {
                warn!(
                    order_id = %progress.order_id,
                    symbol = %progress.symbol,
                    filled = %progress.filled,
                    requested = %progress.requested,
                    "Order incomplete past fill window"
                );
                incomplete.push(progress.clone());
                return false;
            }
            true
        });

        incomplete
    }

    pub fn stop_tracking(&self, order_id: &str) {
        self.orders.remove(order_id);
    }
}
