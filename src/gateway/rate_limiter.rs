//! Client-side sliding-window rate limiter.
//!
//! Enforces the broker's published request budgets before a request ever
//! leaves the process. Callers block (bounded by a queue-wait cap) until
//! a slot opens in the window rather than getting rejected upstream.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;
use crate::error::{Result, SentraError};

/// Endpoint classes with independent request budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    /// Trading, account, and session endpoints
    General,
    /// Historical data endpoints with a much tighter budget
    History,
}

impl std::fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointClass::General => write!(f, "general"),
            EndpointClass::History => write!(f, "history"),
        }
    }
}

struct SlidingWindow {
    max_requests: usize,
    window: Duration,
    sent: VecDeque<Instant>,
}

impl SlidingWindow {
    fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            sent: VecDeque::with_capacity(max_requests),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&front) = self.sent.front() {
            if now.duration_since(front) >= self.window {
                self.sent.pop_front();
            } else {
                break;
            }
        }
    }

    /// Delay until a slot is free, or zero if one is free now.
    fn required_delay(&mut self, now: Instant) -> Duration {
        self.prune(now);
        if self.sent.len() < self.max_requests {
            return Duration::ZERO;
        }
        // Oldest timestamp ages out of the window first.
        match self.sent.front() {
            Some(&oldest) => self.window.saturating_sub(now.duration_since(oldest)),
            None => Duration::ZERO,
        }
    }

    fn record(&mut self, now: Instant) {
        self.sent.push_back(now);
    }

    fn in_window(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.sent.len()
    }
}

pub struct RateLimiter {
    general: Mutex<SlidingWindow>,
    history: Mutex<SlidingWindow>,
    max_queue_wait: Duration,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            general: Mutex::new(SlidingWindow::new(
                config.general.max_requests as usize,
                Duration::from_secs(config.general.window_secs),
            )),
            history: Mutex::new(SlidingWindow::new(
                config.history.max_requests as usize,
                Duration::from_secs(config.history.window_secs),
            )),
            max_queue_wait: Duration::from_millis(config.max_queue_wait_ms),
        }
    }

    fn window(&self, class: EndpointClass) -> &Mutex<SlidingWindow> {
        match class {
            EndpointClass::General => &self.general,
            EndpointClass::History => &self.history,
        }
    }

    /// Wait until the window has room, then consume a slot. Fails with
    /// `RateLimited` if the wait would exceed the queue-wait cap.
    pub async fn throttle(&self, class: EndpointClass) -> Result<()> {
        let deadline = Instant::now() + self.max_queue_wait;

        loop {
            let delay = {
                let mut window = self.window(class).lock().await;
                let now = Instant::now();
                let delay = window.required_delay(now);
                if delay.is_zero() {
                    window.record(now);
                    return Ok(());
                }
                delay
            };

            if Instant::now() + delay > deadline {
                warn!(
                    class = %class,
                    delay_ms = delay.as_millis() as u64,
                    "Rate limit queue wait would exceed cap"
                );
                return Err(SentraError::RateLimited(format!(
                    "{} window full, wait of {}ms exceeds cap",
                    class,
                    delay.as_millis()
                )));
            }

            debug!(class = %class, delay_ms = delay.as_millis() as u64, "Throttling request");
            tokio::time::sleep(delay).await;
            // Loop back and re-check under the lock; another caller may
            // have taken the freed slot while we slept.
        }
    }

    /// Requests currently counted in the window for a class.
    pub async fn in_flight(&self, class: EndpointClass) -> usize {
        let mut window = self.window(class).lock().await;
        window.in_window(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WindowConfig;

    fn config(max: u32, window_secs: u64, wait_ms: u64) -> RateLimitConfig {
        RateLimitConfig {
            general: WindowConfig {
                max_requests: max,
                window_secs,
            },
            history: WindowConfig {
                max_requests: 2,
                window_secs: 60,
            },
            max_queue_wait_ms: wait_ms,
        }
    }

    #[tokio::test]
    async fn test_allows_up_to_budget() {
        let limiter = RateLimiter::new(&config(3, 10, 1000));
        for _ in 0..3 {
            limiter.throttle(EndpointClass::General).await.unwrap();
        }
        assert_eq!(limiter.in_flight(EndpointClass::General).await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocks_until_window_slides() {
        let limiter = RateLimiter::new(&config(2, 10, 60_000));
        limiter.throttle(EndpointClass::General).await.unwrap();
        limiter.throttle(EndpointClass::General).await.unwrap();

        let start = Instant::now();
        limiter.throttle(EndpointClass::General).await.unwrap();
        let waited = start.elapsed();

        assert!(waited >= Duration::from_secs(10), "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_when_wait_exceeds_cap() {
        let limiter = RateLimiter::new(&config(1, 30, 100));
        limiter.throttle(EndpointClass::General).await.unwrap();

        let err = limiter.throttle(EndpointClass::General).await.unwrap_err();
        assert!(matches!(err, SentraError::RateLimited(_)));
    }

    #[tokio::test]
    async fn test_classes_are_independent() {
        let limiter = RateLimiter::new(&config(1, 10, 100));
        limiter.throttle(EndpointClass::General).await.unwrap();
        // History budget untouched by general traffic.
        limiter.throttle(EndpointClass::History).await.unwrap();
        limiter.throttle(EndpointClass::History).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_budget_under_contention() {
        use std::sync::Arc;

        let limiter = Arc::new(RateLimiter::new(&config(5, 10, 120_000)));
        let mut handles = Vec::new();
        for _ in 0..20 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                limiter.throttle(EndpointClass::General).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        // After all 20 complete, the last window holds at most the budget.
        assert!(limiter.in_flight(EndpointClass::General).await <= 5);
    }
}
