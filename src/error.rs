use thiserror::Error;

/// Main error type for the resilience core
#[derive(Error, Debug)]
pub enum SentraError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Upstream returned status {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Max retries exceeded after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded { attempts: u32, last_error: String },

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Session errors
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Credential expired at {0}")]
    CredentialExpired(chrono::DateTime<chrono::Utc>),

    // Realtime connection errors
    #[error("Reconnect attempts exhausted after {attempts} cycles")]
    ReconnectExhausted { attempts: u32 },

    #[error("Required subscription failed: {topic}")]
    RequiredSubscriptionFailed { topic: String },

    #[error("Connection stale: {0}")]
    ConnectionStale(String),

    // Order execution errors
    #[error("Order submission failed: {0}")]
    OrderSubmission(String),

    #[error("Order rejected: {0}")]
    OrderRejected(String),

    #[error("Order verification failed: {order_id}")]
    OrderVerificationFailed { order_id: String },

    #[error("Order timeout: {0}")]
    OrderTimeout(String),

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Reconciliation failed: {0}")]
    Reconciliation(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for SentraError
pub type Result<T> = std::result::Result<T, SentraError>;

/// Error classification driving retry and propagation policy.
///
/// Transient errors are absorbed by the request executor's retry loop;
/// permanent errors propagate immediately to the caller; fatal errors halt
/// the affected subsystem; degraded means the circuit is open and no call
/// was attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
    Fatal,
    Degraded,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Permanent => write!(f, "permanent"),
            ErrorClass::Fatal => write!(f, "fatal"),
            ErrorClass::Degraded => write!(f, "degraded"),
        }
    }
}

/// HTTP status codes treated as retryable.
const TRANSIENT_STATUSES: &[u16] = &[408, 429, 500, 502, 503, 504];

impl SentraError {
    /// Classify this error per the retry taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            SentraError::Http(e) => {
                if e.is_timeout() || e.is_connect() || e.is_request() {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Permanent
                }
            }
            SentraError::UpstreamStatus { status, .. } => {
                if TRANSIENT_STATUSES.contains(status) {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Permanent
                }
            }
            SentraError::WebSocket(_)
            | SentraError::ConnectionStale(_)
            | SentraError::Io(_)
            | SentraError::OrderTimeout(_) => ErrorClass::Transient,

            SentraError::ServiceUnavailable(_) => ErrorClass::Degraded,

            SentraError::MaxRetriesExceeded { .. }
            | SentraError::ReconnectExhausted { .. }
            | SentraError::RequiredSubscriptionFailed { .. } => ErrorClass::Fatal,

            _ => ErrorClass::Permanent,
        }
    }

    /// True when the request executor should retry this error.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}
