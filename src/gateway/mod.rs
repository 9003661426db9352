//! Outbound request gateway.
//!
//! Single choke point for broker REST traffic. Pairs the execution
//! pipeline with the typed broker API so the rest of the daemon never
//! touches a raw HTTP client.

pub mod circuit_breaker;
pub mod executor;
pub mod rate_limiter;

pub use circuit_breaker::{BreakerConfig, BreakerStats, CircuitBreaker, CircuitState};
pub use executor::RequestExecutor;
pub use rate_limiter::{EndpointClass, RateLimiter};

use std::sync::Arc;

use crate::domain::{AccountStatus, OrderAck, OrderRequest, OrderSnapshot, Position};
use crate::error::Result;
use crate::transport::rest::BrokerApi;

pub struct BrokerGateway {
    executor: RequestExecutor,
    api: Arc<dyn BrokerApi>,
    account_id: String,
}

impl BrokerGateway {
    pub fn new(executor: RequestExecutor, api: Arc<dyn BrokerApi>, account_id: String) -> Self {
        Self {
            executor,
            api,
            account_id,
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub async fn get_positions(&self) -> Result<Vec<Position>> {
        self.executor
            .execute(EndpointClass::General, "get_positions", |credential| {
                let api = Arc::clone(&self.api);
                let account_id = self.account_id.clone();
                async move { api.fetch_positions(&credential, &account_id).await }
            })
            .await
    }

    pub async fn get_open_orders(&self) -> Result<Vec<OrderSnapshot>> {
        self.executor
            .execute(EndpointClass::General, "get_open_orders", |credential| {
                let api = Arc::clone(&self.api);
                let account_id = self.account_id.clone();
                async move { api.fetch_open_orders(&credential, &account_id).await }
            })
            .await
    }

    pub async fn get_account(&self) -> Result<AccountStatus> {
        self.executor
            .execute(EndpointClass::General, "get_account", |credential| {
                let api = Arc::clone(&self.api);
                let account_id = self.account_id.clone();
                async move { api.fetch_account(&credential, &account_id).await }
            })
            .await
    }

    /// Submit an order. Retries are safe because the request carries a
    /// client order id the broker deduplicates on.
    pub async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        self.executor
            .execute(EndpointClass::General, "place_order", |credential| {
                let api = Arc::clone(&self.api);
                let account_id = self.account_id.clone();
                let request = request.clone();
                async move { api.submit_order(&credential, &account_id, &request).await }
            })
            .await
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<bool> {
        self.executor
            .execute(EndpointClass::General, "cancel_order", |credential| {
                let api = Arc::clone(&self.api);
                let account_id = self.account_id.clone();
                let order_id = order_id.to_string();
                async move { api.cancel_order(&credential, &account_id, &order_id).await }
            })
            .await
    }

    pub async fn get_order(&self, order_id: &str) -> Result<OrderSnapshot> {
        self.executor
            .execute(EndpointClass::General, "get_order", |credential| {
                let api = Arc::clone(&self.api);
                let account_id = self.account_id.clone();
                let order_id = order_id.to_string();
                async move { api.fetch_order(&credential, &account_id, &order_id).await }
            })
            .await
    }

    /// Closed-order history goes through the slower history rate budget.
    pub async fn get_order_history(&self, limit: u32) -> Result<Vec<OrderSnapshot>> {
        self.executor
            .execute(EndpointClass::History, "get_order_history", |credential| {
                let api = Arc::clone(&self.api);
                let account_id = self.account_id.clone();
                async move {
                    api.fetch_order_history(&credential, &account_id, limit)
                        .await
                }
            })
            .await
    }

    pub async fn breaker_stats(&self) -> Vec<BreakerStats> {
        self.executor.breaker_stats().await
    }

    pub async fn force_close_breakers(&self) {
        self.executor.force_close_breakers().await
    }
}
