use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub realtime: RealtimeConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub dry_run: DryRunConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// REST API endpoint for account/order operations
    pub rest_url: String,
    /// WebSocket endpoint for the realtime event stream
    pub ws_url: String,
    /// Account to manage
    pub account_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Minimum remaining validity before a proactive renewal (seconds)
    #[serde(default = "default_renewal_margin")]
    pub renewal_margin_secs: u64,
    /// Retry attempts for token renewal before falling back to re-auth
    #[serde(default = "default_auth_retries")]
    pub renew_retry_attempts: u32,
    /// Retry attempts for full re-authentication
    #[serde(default = "default_auth_retries")]
    pub reauth_retry_attempts: u32,
    /// Background expiry check interval (seconds)
    #[serde(default = "default_renewal_check_interval")]
    pub renewal_check_interval_secs: u64,
}

fn default_renewal_margin() -> u64 {
    7200 // 2 hours
}

fn default_auth_retries() -> u32 {
    3
}

fn default_renewal_check_interval() -> u64 {
    60
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            renewal_margin_secs: default_renewal_margin(),
            renew_retry_attempts: default_auth_retries(),
            reauth_retry_attempts: default_auth_retries(),
            renewal_check_interval_secs: default_renewal_check_interval(),
        }
    }
}

/// One sliding-window budget: at most `max_requests` per `window_secs`.
#[derive(Debug, Clone, Deserialize)]
pub struct WindowConfig {
    pub max_requests: u32,
    pub window_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_general_window")]
    pub general: WindowConfig,
    #[serde(default = "default_history_window")]
    pub history: WindowConfig,
    /// Maximum time a caller queues for a slot before timing out (ms)
    #[serde(default = "default_max_queue_wait")]
    pub max_queue_wait_ms: u64,
}

fn default_general_window() -> WindowConfig {
    WindowConfig {
        max_requests: 60,
        window_secs: 10,
    }
}

fn default_history_window() -> WindowConfig {
    WindowConfig {
        max_requests: 10,
        window_secs: 60,
    }
}

fn default_max_queue_wait() -> u64 {
    30_000
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            general: default_general_window(),
            history: default_history_window(),
            max_queue_wait_ms: default_max_queue_wait(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Time to wait before trying half-open (seconds)
    #[serde(default = "default_open_timeout")]
    pub open_timeout_secs: u64,
    /// Maximum concurrent trial calls while half-open
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
    /// Consecutive successes in half-open to close the circuit
    #[serde(default = "default_half_open_successes")]
    pub half_open_success_threshold: u32,
    /// Per endpoint-class overrides ("general", "history")
    #[serde(default)]
    pub overrides: HashMap<String, CircuitBreakerOverride>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CircuitBreakerOverride {
    pub failure_threshold: Option<u32>,
    pub open_timeout_secs: Option<u64>,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_open_timeout() -> u64 {
    60
}

fn default_half_open_max_calls() -> u32 {
    1
}

fn default_half_open_successes() -> u32 {
    2
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_timeout_secs: default_open_timeout(),
            half_open_max_calls: default_half_open_max_calls(),
            half_open_success_threshold: default_half_open_successes(),
            overrides: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts per request (initial call included)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base backoff delay, doubled each attempt (ms)
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    /// Backoff delay cap (ms)
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    4
}

fn default_base_delay() -> u64 {
    250
}

fn default_max_delay() -> u64 {
    10_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RealtimeConfig {
    /// Explicit reconnect backoff schedule (ms). The final entry repeats.
    #[serde(default = "default_backoff_schedule")]
    pub backoff_schedule_ms: Vec<u64>,
    /// Reconnect cycles before the connection is declared fatal (0 = unlimited)
    #[serde(default = "default_max_reconnect_cycles")]
    pub max_reconnect_cycles: u32,
    /// Heartbeat send interval (seconds)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Time allowed for a heartbeat response (seconds)
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    /// Bounded event buffer used between reconnect and reconciliation completion
    #[serde(default = "default_resume_buffer")]
    pub resume_buffer_size: usize,
}

fn default_backoff_schedule() -> Vec<u64> {
    vec![0, 1_000, 2_000, 5_000, 10_000, 30_000, 60_000]
}

fn default_max_reconnect_cycles() -> u32 {
    0
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_heartbeat_timeout() -> u64 {
    10
}

fn default_resume_buffer() -> usize {
    256
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            backoff_schedule_ms: default_backoff_schedule(),
            max_reconnect_cycles: default_max_reconnect_cycles(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            resume_buffer_size: default_resume_buffer(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// Idempotency cache TTL (seconds)
    #[serde(default = "default_idempotency_ttl")]
    pub idempotency_ttl_secs: u64,
    /// Verify order existence after placement
    #[serde(default = "default_true")]
    pub verify_orders: bool,
    /// Verification poll deadline (ms)
    #[serde(default = "default_verification_timeout")]
    pub verification_timeout_ms: u64,
    /// Verification poll interval (ms)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Time allowed for an order to fill completely before it is reported incomplete (seconds)
    #[serde(default = "default_fill_timeout")]
    pub fill_timeout_secs: u64,
}

fn default_idempotency_ttl() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

fn default_verification_timeout() -> u64 {
    10_000
}

fn default_poll_interval() -> u64 {
    500
}

fn default_fill_timeout() -> u64 {
    300
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            idempotency_ttl_secs: default_idempotency_ttl(),
            verify_orders: true,
            verification_timeout_ms: default_verification_timeout(),
            poll_interval_ms: default_poll_interval(),
            fill_timeout_secs: default_fill_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ReconciliationConfig {
    /// Run reconciliation on a timer in addition to post-reconnect
    #[serde(default)]
    pub periodic_enabled: bool,
    /// Periodic interval (seconds), only used when enabled
    #[serde(default = "default_reconcile_interval")]
    pub periodic_interval_secs: u64,
}

fn default_reconcile_interval() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DryRunConfig {
    /// Enable dry run mode (no real orders)
    #[serde(default)]
    pub enabled: bool,
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("dry_run.enabled", false)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("SENTRA_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (SENTRA_BROKER__REST_URL, etc.)
            .add_source(
                Environment::with_prefix("SENTRA")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.broker.rest_url.trim().is_empty() {
            errors.push("broker.rest_url must be set".to_string());
        }
        if self.broker.ws_url.trim().is_empty() {
            errors.push("broker.ws_url must be set".to_string());
        }
        if self.broker.account_id.trim().is_empty() {
            errors.push("broker.account_id must be set".to_string());
        }

        if self.auth.renewal_margin_secs == 0 {
            errors.push("auth.renewal_margin_secs must be positive".to_string());
        }

        for (name, window) in [
            ("general", &self.rate_limit.general),
            ("history", &self.rate_limit.history),
        ] {
            if window.max_requests == 0 {
                errors.push(format!("rate_limit.{}.max_requests must be positive", name));
            }
            if window.window_secs == 0 {
                errors.push(format!("rate_limit.{}.window_secs must be positive", name));
            }
        }

        if self.circuit_breaker.failure_threshold == 0 {
            errors.push("circuit_breaker.failure_threshold must be positive".to_string());
        }
        if self.circuit_breaker.half_open_success_threshold == 0 {
            errors.push("circuit_breaker.half_open_success_threshold must be positive".to_string());
        }

        if self.retry.max_attempts == 0 {
            errors.push("retry.max_attempts must be positive".to_string());
        }

        if self.realtime.backoff_schedule_ms.is_empty() {
            errors.push("realtime.backoff_schedule_ms must not be empty".to_string());
        }
        if self.realtime.heartbeat_timeout_secs >= self.realtime.heartbeat_interval_secs {
            errors.push(
                "realtime.heartbeat_timeout_secs must be shorter than heartbeat_interval_secs"
                    .to_string(),
            );
        }
        if self.realtime.resume_buffer_size == 0 {
            errors.push("realtime.resume_buffer_size must be positive".to_string());
        }

        if self.execution.poll_interval_ms == 0 {
            errors.push("execution.poll_interval_ms must be positive".to_string());
        }
        if self.execution.verification_timeout_ms < self.execution.poll_interval_ms {
            errors.push(
                "execution.verification_timeout_ms must be at least one poll interval".to_string(),
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn renewal_margin(&self) -> Duration {
        Duration::from_secs(self.auth.renewal_margin_secs)
    }

    /// Reconnect backoff schedule as durations.
    pub fn backoff_schedule(&self) -> Vec<Duration> {
        self.realtime
            .backoff_schedule_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }
}
