//! Request execution pipeline.
//!
//! Every outbound REST call flows through here: circuit breaker
//! admission, rate-limit throttling, credential attachment, then the
//! call itself with classified retries. Transient failures back off
//! exponentially with jitter; permanent failures surface immediately.

use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{CircuitBreakerConfig, RetryConfig};
use crate::error::{ErrorClass, Result, SentraError};
use crate::gateway::circuit_breaker::{BreakerConfig, BreakerStats, CircuitBreaker};
use crate::gateway::rate_limiter::{EndpointClass, RateLimiter};
use crate::session::{Credential, SessionManager};

pub struct RequestExecutor {
    session: Arc<SessionManager>,
    limiter: Arc<RateLimiter>,
    general_breaker: CircuitBreaker,
    history_breaker: CircuitBreaker,
    retry: RetryConfig,
}

impl RequestExecutor {
    pub fn new(
        session: Arc<SessionManager>,
        limiter: Arc<RateLimiter>,
        breaker_config: &CircuitBreakerConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            session,
            limiter,
            general_breaker: CircuitBreaker::new("general", breaker_for(breaker_config, "general")),
            history_breaker: CircuitBreaker::new("history", breaker_for(breaker_config, "history")),
            retry,
        }
    }

    fn breaker(&self, class: EndpointClass) -> &CircuitBreaker {
        match class {
            EndpointClass::General => &self.general_breaker,
            EndpointClass::History => &self.history_breaker,
        }
    }

    /// Run one logical request through the full pipeline. The operation
    /// is handed a valid credential and may be invoked multiple times
    /// under the retry policy, so it must be idempotent or carry its own
    /// idempotency key.
    pub async fn execute<T, F, Fut>(
        &self,
        class: EndpointClass,
        label: &str,
        op: F,
    ) -> Result<T>
    where
        F: Fn(Credential) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = self.breaker(class);
        let mut last_error: Option<SentraError> = None;

        for attempt in 1..=self.retry.max_attempts {
            if !breaker.try_acquire().await {
                let retry_in = breaker.time_until_retry_secs().await;
                return Err(SentraError::ServiceUnavailable(format!(
                    "{} circuit open, retry in {}s",
                    class, retry_in
                )));
            }

            if let Err(e) = self.limiter.throttle(class).await {
                // A queue-wait rejection is local backpressure, not an
                // endpoint outcome.
                breaker.release().await;
                return Err(e);
            }

            let credential = match self.session.get_valid_credential().await {
                Ok(credential) => credential,
                Err(e) => {
                    breaker.release().await;
                    return Err(e);
                }
            };

            match op(credential).await {
                Ok(value) => {
                    breaker.record_success().await;
                    if attempt > 1 {
                        debug!(label, attempt, "Request succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if is_auth_rejection(&e) => {
                    // Broker rejected the token despite local validity.
                    // Discard it and let the next attempt re-authenticate.
                    warn!(label, attempt, "Credential rejected upstream, invalidating");
                    breaker.release().await;
                    self.session.invalidate().await;
                    last_error = Some(e);
                }
                Err(e) => match e.class() {
                    ErrorClass::Transient => {
                        breaker.record_failure(&e.to_string()).await;
                        warn!(label, attempt, error = %e, "Transient request failure");
                        last_error = Some(e);

                        if attempt < self.retry.max_attempts {
                            tokio::time::sleep(self.backoff_delay(attempt)).await;
                        }
                    }
                    _ => {
                        // The endpoint answered, so this is not an outage
                        // signal, but it must not clear a failure streak
                        // from interleaved outages either.
                        breaker.release().await;
                        return Err(e);
                    }
                },
            }
        }

        Err(SentraError::MaxRetriesExceeded {
            attempts: self.retry.max_attempts,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }

    /// Doubling backoff from the base delay, capped, with +/-20% jitter.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let raw = self
            .retry
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.retry.max_delay_ms);
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        Duration::from_millis((raw as f64 * jitter) as u64)
    }

    pub async fn breaker_stats(&self) -> Vec<BreakerStats> {
        vec![
            self.general_breaker.stats().await,
            self.history_breaker.stats().await,
        ]
    }

    pub async fn force_close_breakers(&self) {
        self.general_breaker.force_close().await;
        self.history_breaker.force_close().await;
    }
}

fn breaker_for(config: &CircuitBreakerConfig, name: &str) -> BreakerConfig {
    let mut breaker = BreakerConfig {
        failure_threshold: config.failure_threshold,
        open_timeout_secs: config.open_timeout_secs,
        half_open_max_calls: config.half_open_max_calls,
        half_open_success_threshold: config.half_open_success_threshold,
    };
    if let Some(over) = config.overrides.get(name) {
        if let Some(threshold) = over.failure_threshold {
            breaker.failure_threshold = threshold;
        }
        if let Some(timeout) = over.open_timeout_secs {
            breaker.open_timeout_secs = timeout;
        }
    }
    breaker
}

fn is_auth_rejection(error: &SentraError) -> bool {
    matches!(
        error,
        SentraError::UpstreamStatus { status: 401, .. } | SentraError::CredentialExpired(_)
    )
}
