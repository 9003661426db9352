//! State reconciliation against the broker.
//!
//! Runs after every realtime gap (and optionally on a timer). Fetches
//! authoritative positions, open orders, and account status, diffs them
//! against the local cache over the union of keys, logs every
//! divergence, then overwrites the cache with the broker's view.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

use crate::domain::{OrderSnapshot, Position};
use crate::error::Result;
use crate::gateway::BrokerGateway;
use crate::transport::store::StateStore;

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct ReconciliationReport {
    pub started_at: Option<DateTime<Utc>>,
    pub positions_checked: usize,
    pub orders_checked: usize,
    /// Positions the broker holds that the cache did not know about
    pub missed_opens: Vec<String>,
    /// Cached positions the broker no longer holds
    pub missed_closes: Vec<String>,
    /// Positions present on both sides with diverging size
    pub size_mismatches: Vec<String>,
    /// Open orders the broker holds that the cache did not know about
    pub unknown_orders: Vec<String>,
    /// Cached orders the broker no longer reports as open
    pub vanished_orders: Vec<String>,
}

impl ReconciliationReport {
    pub fn divergence_count(&self) -> usize {
        self.missed_opens.len()
            + self.missed_closes.len()
            + self.size_mismatches.len()
            + self.unknown_orders.len()
            + self.vanished_orders.len()
    }

    pub fn is_clean(&self) -> bool {
        self.divergence_count() == 0
    }
}

pub struct StateReconciler {
    gateway: Arc<BrokerGateway>,
    store: Arc<dyn StateStore>,
}

impl StateReconciler {
    pub fn new(gateway: Arc<BrokerGateway>, store: Arc<dyn StateStore>) -> Self {
        Self { gateway, store }
    }

    /// One full reconciliation pass. Fails if any broker fetch fails;
    /// the cache is only overwritten once all three fetches succeed.
    pub async fn reconcile(&self) -> Result<ReconciliationReport> {
        let started_at = Utc::now();
        info!("Starting state reconciliation");

        let broker_positions = self.gateway.get_positions().await?;
        let broker_orders = self.gateway.get_open_orders().await?;
        let account = self.gateway.get_account().await?;

        let mut report = ReconciliationReport {
            started_at: Some(started_at),
            ..Default::default()
        };

        self.diff_positions(&broker_positions, &mut report);
        self.diff_orders(&broker_orders, &mut report);

        self.store.replace_positions(broker_positions);
        self.store.replace_orders(broker_orders);
        self.store.set_account(account);

        if report.is_clean() {
            info!(
                positions = report.positions_checked,
                orders = report.orders_checked,
                "Reconciliation complete, cache was consistent"
            );
        } else {
            warn!(
                divergences = report.divergence_count(),
                missed_opens = report.missed_opens.len(),
                missed_closes = report.missed_closes.len(),
                "Reconciliation complete, cache diverged from broker"
            );
        }

        Ok(report)
    }

    fn diff_positions(&self, broker: &[Position], report: &mut ReconciliationReport) {
        let local: HashMap<String, Position> = self
            .store
            .positions()
            .into_iter()
            .map(|p| (p.symbol.clone(), p))
            .collect();
        let remote: HashMap<&str, &Position> =
            broker.iter().map(|p| (p.symbol.as_str(), p)).collect();

        let mut symbols: HashSet<&str> = local.keys().map(String::as_str).collect();
        symbols.extend(remote.keys().copied());
        report.positions_checked = symbols.len();

        for symbol in symbols {
            match (local.get(symbol), remote.get(symbol)) {
                (None, Some(position)) => {
                    warn!(
                        symbol,
                        size = %position.size,
                        "Missed position open, broker holds a position the cache lacked"
                    );
                    report.missed_opens.push(symbol.to_string());
                }
                (Some(position), None) => {
                    warn!(
                        symbol,
                        cached_size = %position.size,
                        "Missed position close, cache held a position the broker lacks"
                    );
                    report.missed_closes.push(symbol.to_string());
                }
                (Some(cached), Some(actual)) if cached.size != actual.size => {
                    warn!(
                        symbol,
                        cached_size = %cached.size,
                        broker_size = %actual.size,
                        "Position size mismatch"
                    );
                    report.size_mismatches.push(symbol.to_string());
                }
                _ => {}
            }
        }
    }

    fn diff_orders(&self, broker: &[OrderSnapshot], report: &mut ReconciliationReport) {
        let local: HashMap<String, OrderSnapshot> = self
            .store
            .open_orders()
            .into_iter()
            .map(|o| (o.order_id.clone(), o))
            .collect();
        let remote: HashMap<&str, &OrderSnapshot> =
            broker.iter().map(|o| (o.order_id.as_str(), o)).collect();

        let mut ids: HashSet<&str> = local.keys().map(String::as_str).collect();
        ids.extend(remote.keys().copied());
        report.orders_checked = ids.len();

        for order_id in ids {
            match (local.get(order_id), remote.get(order_id)) {
                (None, Some(order)) => {
                    warn!(
                        order_id,
                        symbol = %order.symbol,
                        "Unknown open order on broker"
                    );
                    report.unknown_orders.push(order_id.to_string());
                }
                (Some(order), None) => {
                    warn!(
                        order_id,
                        symbol = %order.symbol,
                        "Cached order no longer open on broker"
                    );
                    report.vanished_orders.push(order_id.to_string());
                }
                _ => {}
            }
        }
    }
}
