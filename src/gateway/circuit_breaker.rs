//! Per-endpoint circuit breaker.
//!
//! Guards a class of broker endpoints against cascading failures. Trips
//! open after a run of consecutive failures, waits out a recovery
//! timeout, then admits a limited number of trial calls in half-open
//! before closing again.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, all requests allowed
    Closed,
    /// Failure threshold exceeded, requests blocked
    Open,
    /// Recovery period, limited trial requests allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the circuit
    pub failure_threshold: u32,
    /// Time to wait before transitioning from Open to HalfOpen (seconds)
    pub open_timeout_secs: u64,
    /// Maximum in-flight trial calls while HalfOpen
    pub half_open_max_calls: u32,
    /// Successful trial calls needed in HalfOpen to close the circuit
    pub half_open_success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout_secs: 60,
            half_open_max_calls: 1,
            half_open_success_threshold: 2,
        }
    }
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    state: RwLock<CircuitState>,
    consecutive_failures: AtomicU32,
    half_open_successes: AtomicU32,
    half_open_in_flight: AtomicU32,
    opened_at: RwLock<Option<DateTime<Utc>>>,
    last_failure: RwLock<Option<String>>,
    total_trips: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: RwLock::new(CircuitState::Closed),
            consecutive_failures: AtomicU32::new(0),
            half_open_successes: AtomicU32::new(0),
            half_open_in_flight: AtomicU32::new(0),
            opened_at: RwLock::new(None),
            last_failure: RwLock::new(None),
            total_trips: AtomicU64::new(0),
        }
    }

    pub async fn state(&self) -> CircuitState {
        *self.state.read().await
    }

    /// Decide whether a request may proceed. Must be paired with exactly
    /// one `record_success` or `record_failure` when this returns `true`,
    /// because half-open admission reserves a trial slot.
    pub async fn try_acquire(&self) -> bool {
        let state = self.state().await;

        match state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if self.open_timeout_elapsed().await {
                    self.transition_to_half_open().await;
                    self.acquire_half_open_slot()
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => self.acquire_half_open_slot(),
        }
    }

    fn acquire_half_open_slot(&self) -> bool {
        let mut in_flight = self.half_open_in_flight.load(Ordering::SeqCst);
        loop {
            if in_flight >= self.config.half_open_max_calls {
                return false;
            }
            match self.half_open_in_flight.compare_exchange(
                in_flight,
                in_flight + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => in_flight = actual,
            }
        }
    }

    /// Give back an admission without recording an outcome, for requests
    /// that never reached the endpoint.
    pub async fn release(&self) {
        if self.state().await == CircuitState::HalfOpen {
            self.release_half_open_slot();
        }
    }

    /// The slot may already be gone if the breaker tripped or closed
    /// while this request was in flight.
    fn release_half_open_slot(&self) {
        let _ = self.half_open_in_flight.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |v| v.checked_sub(1),
        );
    }

    pub async fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);

        let state = self.state().await;
        if state == CircuitState::HalfOpen {
            self.release_half_open_slot();
            let successes = self.half_open_successes.fetch_add(1, Ordering::SeqCst) + 1;
            if successes >= self.config.half_open_success_threshold {
                self.close().await;
            }
        }
    }

    pub async fn record_failure(&self, reason: &str) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_failure.write().await = Some(reason.to_string());

        warn!(
            breaker = %self.name,
            failures,
            reason,
            "Request failure recorded"
        );

        let state = self.state().await;
        if state == CircuitState::HalfOpen {
            // A failed trial call reopens immediately.
            self.release_half_open_slot();
            self.trip(reason).await;
        } else if failures >= self.config.failure_threshold {
            self.trip(reason).await;
        }
    }

    async fn trip(&self, reason: &str) {
        let mut state = self.state.write().await;
        if *state != CircuitState::Open {
            *state = CircuitState::Open;
            *self.opened_at.write().await = Some(Utc::now());
            self.half_open_successes.store(0, Ordering::SeqCst);
            self.half_open_in_flight.store(0, Ordering::SeqCst);
            self.total_trips.fetch_add(1, Ordering::SeqCst);

            warn!(breaker = %self.name, reason, "Circuit breaker TRIPPED");
        }
    }

    async fn transition_to_half_open(&self) {
        let mut state = self.state.write().await;
        if *state == CircuitState::Open {
            *state = CircuitState::HalfOpen;
            self.half_open_successes.store(0, Ordering::SeqCst);
            self.half_open_in_flight.store(0, Ordering::SeqCst);
            info!(breaker = %self.name, "Circuit breaker transitioning to HALF-OPEN");
        }
    }

    async fn close(&self) {
        let mut state = self.state.write().await;
        *state = CircuitState::Closed;
        self.consecutive_failures.store(0, Ordering::SeqCst);
        *self.opened_at.write().await = None;
        self.half_open_successes.store(0, Ordering::SeqCst);
        self.half_open_in_flight.store(0, Ordering::SeqCst);

        info!(breaker = %self.name, "Circuit breaker CLOSED");
    }

    /// Manual reset, for operator intervention.
    pub async fn force_close(&self) {
        self.close().await;
        *self.last_failure.write().await = None;
        warn!(breaker = %self.name, "Circuit breaker force-closed");
    }

    async fn open_timeout_elapsed(&self) -> bool {
        if let Some(opened_at) = *self.opened_at.read().await {
            let elapsed = Utc::now().signed_duration_since(opened_at).num_seconds();
            elapsed >= 0 && elapsed as u64 >= self.config.open_timeout_secs
        } else {
            false
        }
    }

    pub async fn time_until_retry_secs(&self) -> u64 {
        if let Some(opened_at) = *self.opened_at.read().await {
            let elapsed = Utc::now().signed_duration_since(opened_at).num_seconds();
            self.config
                .open_timeout_secs
                .saturating_sub(elapsed.max(0) as u64)
        } else {
            0
        }
    }

    pub async fn stats(&self) -> BreakerStats {
        BreakerStats {
            name: self.name.clone(),
            state: self.state().await,
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
            last_failure: self.last_failure.read().await.clone(),
            total_trips: self.total_trips.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure: Option<String>,
    pub total_trips: u64,
}
