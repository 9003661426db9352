use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Limit,
    Market,
}

/// Time in force
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    /// Good Till Cancelled
    GTC,
    /// Fill Or Kill
    FOK,
    /// Immediate Or Cancel
    IOC,
}

/// Order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    /// Order created but not yet submitted
    Pending,
    /// Order submitted to the broker
    Submitted,
    /// Order acknowledged and resting
    Open,
    /// Order partially filled
    PartiallyFilled,
    /// Order fully filled
    Filled,
    /// Order cancelled
    Cancelled,
    /// Order rejected by the broker
    Rejected,
    /// Order expired
    Expired,
    /// Order failed (internal error)
    Failed,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Rejected
                | OrderStatus::Expired
                | OrderStatus::Failed
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            OrderStatus::Pending
                | OrderStatus::Submitted
                | OrderStatus::Open
                | OrderStatus::PartiallyFilled
        )
    }
}

/// Order request (what we want to do)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub size: Decimal,
    pub limit_price: Option<Decimal>,
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
}

impl OrderRequest {
    pub fn limit(symbol: impl Into<String>, side: OrderSide, size: Decimal, price: Decimal) -> Self {
        Self {
            client_order_id: Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            side,
            size,
            limit_price: Some(price),
            order_type: OrderType::Limit,
            time_in_force: TimeInForce::GTC,
        }
    }

    pub fn market(symbol: impl Into<String>, side: OrderSide, size: Decimal) -> Self {
        Self {
            client_order_id: Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            side,
            size,
            limit_price: None,
            order_type: OrderType::Market,
            time_in_force: TimeInForce::IOC,
        }
    }

    /// Notional value of the order, when priced.
    pub fn value(&self) -> Option<Decimal> {
        self.limit_price.map(|p| p * self.size)
    }
}

/// Caller-supplied idempotency key + order parameters.
///
/// Two intents with the same key submitted within the idempotency TTL never
/// produce two broker-side orders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub key: String,
    pub request: OrderRequest,
}

impl OrderIntent {
    pub fn new(key: impl Into<String>, request: OrderRequest) -> Self {
        Self {
            key: key.into(),
            request,
        }
    }

    /// Derive the key from the order parameters and a time bucket, so
    /// retried submissions of the same logical order within the bucket
    /// share one key without the caller inventing identifiers.
    pub fn derived(request: OrderRequest, bucket_secs: u64) -> Self {
        let bucket = if bucket_secs == 0 {
            0
        } else {
            Utc::now().timestamp() as u64 / bucket_secs
        };
        let mut hasher = Sha256::new();
        hasher.update(request.symbol.as_bytes());
        hasher.update([b'|']);
        hasher.update(request.side.to_string().as_bytes());
        hasher.update([b'|']);
        hasher.update(request.size.to_string().as_bytes());
        hasher.update([b'|']);
        if let Some(price) = request.limit_price {
            hasher.update(price.to_string().as_bytes());
        }
        hasher.update([b'|']);
        hasher.update(bucket.to_be_bytes());

        let digest = hasher.finalize();
        let key = digest
            .iter()
            .take(16)
            .map(|b| format!("{:02x}", b))
            .collect::<String>();

        Self { key, request }
    }
}

/// Broker acknowledgement of an order submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub client_order_id: String,
    pub status: OrderStatus,
    pub accepted_at: DateTime<Utc>,
}

/// Order as reported by the broker (authoritative fetch).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub order_id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub size: Decimal,
    pub filled_size: Decimal,
    pub limit_price: Option<Decimal>,
    pub status: OrderStatus,
    pub updated_at: DateTime<Utc>,
}

impl OrderSnapshot {
    /// Fill percentage in [0, 100].
    pub fn fill_pct(&self) -> Decimal {
        if self.size.is_zero() {
            return Decimal::ZERO;
        }
        self.filled_size / self.size * Decimal::from(100)
    }

    pub fn is_fully_filled(&self) -> bool {
        self.status == OrderStatus::Filled && self.filled_size >= self.size
    }
}
