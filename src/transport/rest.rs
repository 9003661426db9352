//! Broker REST transport seams.
//!
//! Every upstream REST capability the core needs is expressed here as a
//! trait so the resilience pipeline can be exercised against mock brokers.
//! The concrete `reqwest` implementation lives in [`super::http`].

use async_trait::async_trait;

use crate::domain::{AccountStatus, OrderAck, OrderRequest, OrderSnapshot, Position};
use crate::error::Result;
use crate::session::Credential;

/// Authentication endpoints consumed by the session manager.
///
/// `renew` exchanges a still-valid credential for a fresh one; `authenticate`
/// performs a full login from configured key material. The session manager
/// serializes calls to both.
#[async_trait]
pub trait AuthApi: Send + Sync {
    async fn authenticate(&self) -> Result<Credential>;

    async fn renew(&self, current: &Credential) -> Result<Credential>;
}

/// Account and order endpoints. All calls take the current credential; no
/// implementation may cache one independently.
#[async_trait]
pub trait BrokerApi: Send + Sync {
    async fn fetch_positions(
        &self,
        credential: &Credential,
        account_id: &str,
    ) -> Result<Vec<Position>>;

    async fn fetch_open_orders(
        &self,
        credential: &Credential,
        account_id: &str,
    ) -> Result<Vec<OrderSnapshot>>;

    async fn fetch_account(
        &self,
        credential: &Credential,
        account_id: &str,
    ) -> Result<AccountStatus>;

    async fn submit_order(
        &self,
        credential: &Credential,
        account_id: &str,
        request: &OrderRequest,
    ) -> Result<OrderAck>;

    async fn cancel_order(
        &self,
        credential: &Credential,
        account_id: &str,
        order_id: &str,
    ) -> Result<bool>;

    async fn fetch_order(
        &self,
        credential: &Credential,
        account_id: &str,
        order_id: &str,
    ) -> Result<OrderSnapshot>;

    /// Closed-order history, newest first. Served from the broker's
    /// slow-path archive, so callers go through the history rate budget.
    async fn fetch_order_history(
        &self,
        credential: &Credential,
        account_id: &str,
        limit: u32,
    ) -> Result<Vec<OrderSnapshot>>;
}
