//! Broker REST adapter (native Rust, no external SDK dependency).
//!
//! Signs every request with HMAC-SHA256 over timestamp + method + path +
//! body, alongside the current session bearer token. Responses are
//! normalized into the domain structs the rest of the core consumes.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::{
    AccountStatus, OrderAck, OrderRequest, OrderSnapshot, OrderStatus, Position,
};
use crate::error::{Result, SentraError};
use crate::session::Credential;
use crate::transport::rest::{AuthApi, BrokerApi};

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct BrokerRestClient {
    http: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    dry_run: bool,
}

impl BrokerRestClient {
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
        dry_run: bool,
    ) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("sentra/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| SentraError::Internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            dry_run,
        })
    }

    pub fn from_env(base_url: &str, dry_run: bool) -> Result<Self> {
        let api_key = std::env::var("SENTRA_API_KEY")
            .map_err(|_| SentraError::Auth("SENTRA_API_KEY is required".to_string()))?;
        let api_secret = std::env::var("SENTRA_API_SECRET")
            .map_err(|_| SentraError::Auth("SENTRA_API_SECRET is required".to_string()))?;

        Self::new(base_url, api_key, api_secret, dry_run)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    fn signed_headers(
        &self,
        method: &Method,
        path: &str,
        body: &str,
        credential: Option<&Credential>,
    ) -> Result<HeaderMap> {
        let timestamp = Utc::now().timestamp_millis().to_string();
        let sign_payload = format!(
            "{}{}{}{}",
            timestamp,
            method.as_str().to_uppercase(),
            path,
            body
        );

        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| SentraError::Auth(format!("invalid API secret: {}", e)))?;
        mac.update(sign_payload.as_bytes());
        let signature = BASE64_STANDARD.encode(mac.finalize().into_bytes());

        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-access-key"),
            HeaderValue::from_str(&self.api_key)
                .map_err(|e| SentraError::Auth(format!("invalid API key header: {}", e)))?,
        );
        headers.insert(
            HeaderName::from_static("x-access-signature"),
            HeaderValue::from_str(&signature)
                .map_err(|e| SentraError::Auth(format!("invalid signature header: {}", e)))?,
        );
        headers.insert(
            HeaderName::from_static("x-access-timestamp"),
            HeaderValue::from_str(&timestamp)
                .map_err(|e| SentraError::Auth(format!("invalid timestamp header: {}", e)))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(credential) = credential {
            let bearer = format!("Bearer {}", credential.token());
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&bearer)
                    .map_err(|e| SentraError::Auth(format!("invalid bearer header: {}", e)))?,
            );
        }

        Ok(headers)
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        credential: Option<&Credential>,
    ) -> Result<T> {
        let body_text = match &body {
            Some(value) => serde_json::to_string(value)?,
            None => String::new(),
        };

        let headers = self.signed_headers(&method, path, &body_text, credential)?;
        let url = format!("{}{}", self.base_url, path);

        debug!("{} {}", method, path);

        let mut builder = self.http.request(method, &url).headers(headers);
        if !body_text.is_empty() {
            builder = builder.body(body_text);
        }

        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(upstream_error(status, &text));
        }

        serde_json::from_str(&text).map_err(SentraError::Json)
    }
}

fn upstream_error(status: StatusCode, body: &str) -> SentraError {
    let snippet = body.chars().take(300).collect::<String>();
    SentraError::UpstreamStatus {
        status: status.as_u16(),
        body: snippet,
    }
}

// === Wire payloads ===

#[derive(Debug, Deserialize)]
struct SessionPayload {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct PositionsPayload {
    positions: Vec<Position>,
}

#[derive(Debug, Deserialize)]
struct OrdersPayload {
    orders: Vec<OrderSnapshot>,
}

#[derive(Debug, Deserialize)]
struct CancelPayload {
    cancelled: bool,
}

#[async_trait]
impl AuthApi for BrokerRestClient {
    async fn authenticate(&self) -> Result<Credential> {
        let payload: SessionPayload = self
            .request(Method::POST, "/auth/token", Some(json!({})), None)
            .await?;

        info!(expires_at = %payload.expires_at, "Authenticated with broker");
        Ok(Credential::new(payload.token, payload.expires_at))
    }

    async fn renew(&self, current: &Credential) -> Result<Credential> {
        let payload: SessionPayload = self
            .request(Method::POST, "/auth/renew", Some(json!({})), Some(current))
            .await?;

        Ok(Credential::new(payload.token, payload.expires_at))
    }
}

#[async_trait]
impl BrokerApi for BrokerRestClient {
    async fn fetch_positions(
        &self,
        credential: &Credential,
        account_id: &str,
    ) -> Result<Vec<Position>> {
        let path = format!("/accounts/{}/positions", account_id);
        let payload: PositionsPayload = self
            .request(Method::GET, &path, None, Some(credential))
            .await?;
        Ok(payload.positions)
    }

    async fn fetch_open_orders(
        &self,
        credential: &Credential,
        account_id: &str,
    ) -> Result<Vec<OrderSnapshot>> {
        let path = format!("/accounts/{}/orders?status=open", account_id);
        let payload: OrdersPayload = self
            .request(Method::GET, &path, None, Some(credential))
            .await?;
        Ok(payload.orders)
    }

    async fn fetch_account(
        &self,
        credential: &Credential,
        account_id: &str,
    ) -> Result<AccountStatus> {
        let path = format!("/accounts/{}", account_id);
        self.request(Method::GET, &path, None, Some(credential))
            .await
    }

    async fn submit_order(
        &self,
        credential: &Credential,
        account_id: &str,
        request: &OrderRequest,
    ) -> Result<OrderAck> {
        if self.dry_run {
            info!(
                symbol = %request.symbol,
                side = %request.side,
                size = %request.size,
                "DRY RUN: order not submitted"
            );
            return Ok(OrderAck {
                order_id: format!("dry-{}", Uuid::new_v4()),
                client_order_id: request.client_order_id.clone(),
                status: OrderStatus::Submitted,
                accepted_at: Utc::now(),
            });
        }

        let path = format!("/accounts/{}/orders", account_id);
        let body = json!({
            "client_order_id": request.client_order_id,
            "symbol": request.symbol,
            "side": request.side,
            "size": request.size,
            "limit_price": request.limit_price,
            "order_type": request.order_type,
            "time_in_force": request.time_in_force,
        });

        self.request(Method::POST, &path, Some(body), Some(credential))
            .await
    }

    async fn cancel_order(
        &self,
        credential: &Credential,
        account_id: &str,
        order_id: &str,
    ) -> Result<bool> {
        if self.dry_run {
            info!(order_id, "DRY RUN: cancel not submitted");
            return Ok(true);
        }

        let path = format!("/accounts/{}/orders/{}", account_id, order_id);
        let payload: CancelPayload = self
            .request(Method::DELETE, &path, None, Some(credential))
            .await?;
        Ok(payload.cancelled)
    }

    async fn fetch_order(
        &self,
        credential: &Credential,
        account_id: &str,
        order_id: &str,
    ) -> Result<OrderSnapshot> {
        let path = format!("/accounts/{}/orders/{}", account_id, order_id);
        self.request(Method::GET, &path, None, Some(credential))
            .await
    }

    async fn fetch_order_history(
        &self,
        credential: &Credential,
        account_id: &str,
        limit: u32,
    ) -> Result<Vec<OrderSnapshot>> {
        let path = format!("/accounts/{}/orders?status=closed&limit={}", account_id, limit);
        let payload: OrdersPayload = self
            .request(Method::GET, &path, None, Some(credential))
            .await?;
        Ok(payload.orders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_normalizes_base_url() {
        let client = BrokerRestClient::new("https://api.broker.test/", "k", "s", true).unwrap();
        assert_eq!(client.base_url(), "https://api.broker.test");
    }

    #[test]
    fn test_upstream_error_truncates_body() {
        let body = "x".repeat(1000);
        let err = upstream_error(StatusCode::BAD_GATEWAY, &body);
        match err {
            SentraError::UpstreamStatus { status, body } => {
                assert_eq!(status, 502);
                assert_eq!(body.len(), 300);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_signed_headers_include_auth_material() {
        let client = BrokerRestClient::new("https://api.broker.test", "key", "secret", true).unwrap();
        let credential = Credential::new("tok", Utc::now() + chrono::Duration::hours(24));
        let headers = client
            .signed_headers(&Method::POST, "/orders", "{}", Some(&credential))
            .unwrap();

        assert!(headers.contains_key("x-access-key"));
        assert!(headers.contains_key("x-access-signature"));
        assert!(headers.contains_key("x-access-timestamp"));
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer tok");
    }
}
