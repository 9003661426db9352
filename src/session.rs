//! Session Manager
//!
//! Owns the bearer credential for the upstream broker. Renewal is proactive
//! (triggered once remaining validity drops below a safety margin) and
//! single-flight: concurrent callers block behind one in-flight renewal and
//! all receive its result. Renewal failure falls back to a full
//! re-authentication with its own retry budget.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::AuthConfig;
use crate::error::{Result, SentraError};
use crate::transport::AuthApi;

/// Bearer token material, wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretToken(String);

impl SecretToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretToken(***)")
    }
}

/// The current session credential: opaque bearer value plus lifetimes.
#[derive(Debug, Clone)]
pub struct Credential {
    token: SecretToken,
    expires_at: DateTime<Utc>,
    renewed_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: SecretToken::new(token),
            expires_at,
            renewed_at: Utc::now(),
        }
    }

    pub fn token(&self) -> &str {
        self.token.expose()
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn renewed_at(&self) -> DateTime<Utc> {
        self.renewed_at
    }

    /// Remaining validity from now. Zero when already expired.
    pub fn remaining_validity(&self) -> Duration {
        let remaining = self.expires_at.signed_duration_since(Utc::now());
        remaining.to_std().unwrap_or(Duration::ZERO)
    }

    /// True when the credential stays valid for at least `margin` more.
    pub fn valid_for(&self, margin: Duration) -> bool {
        self.remaining_validity() >= margin
    }
}

/// Credential lifecycle owner.
pub struct SessionManager {
    auth: Arc<dyn AuthApi>,
    config: AuthConfig,
    current: RwLock<Option<Credential>>,
    /// Serializes renewal/re-authentication. Holders of this lock are the
    /// only writers of `current`.
    renewal_lock: Mutex<()>,
    renewed_tx: broadcast::Sender<Credential>,
}

impl SessionManager {
    pub fn new(auth: Arc<dyn AuthApi>, config: AuthConfig) -> Self {
        let (renewed_tx, _) = broadcast::channel(16);
        Self {
            auth,
            config,
            current: RwLock::new(None),
            renewal_lock: Mutex::new(()),
            renewed_tx,
        }
    }

    /// Listen for successful renewals (e.g., the realtime connection manager
    /// refreshing its own credential usage without waiting for a failure).
    pub fn subscribe_renewals(&self) -> broadcast::Receiver<Credential> {
        self.renewed_tx.subscribe()
    }

    fn margin(&self) -> Duration {
        Duration::from_secs(self.config.renewal_margin_secs)
    }

    /// Return a credential guaranteed valid for at least the configured
    /// safety margin.
    ///
    /// Fails with an `Auth` error only when both renewal and full
    /// re-authentication exhaust their retry budgets.
    pub async fn get_valid_credential(&self) -> Result<Credential> {
        let margin = self.margin();

        // Fast path: the cached credential is still comfortably valid.
        {
            let current = self.current.read().await;
            if let Some(credential) = current.as_ref() {
                if credential.valid_for(margin) {
                    return Ok(credential.clone());
                }
            }
        }

        // Slow path: exactly one caller renews; the rest queue on the lock
        // and pick up the refreshed credential on re-check.
        let _guard = self.renewal_lock.lock().await;

        {
            let current = self.current.read().await;
            if let Some(credential) = current.as_ref() {
                if credential.valid_for(margin) {
                    return Ok(credential.clone());
                }
            }
        }

        let refreshed = self.refresh_locked().await?;

        *self.current.write().await = Some(refreshed.clone());

        // Best-effort: nobody listening is fine.
        let _ = self.renewed_tx.send(refreshed.clone());

        Ok(refreshed)
    }

    /// Renew, falling back to full re-authentication. Caller must hold
    /// `renewal_lock`.
    async fn refresh_locked(&self) -> Result<Credential> {
        let existing = self.current.read().await.clone();

        if let Some(credential) = existing {
            match self
                .attempt_with_budget("renewal", self.config.renew_retry_attempts, || {
                    self.auth.renew(&credential)
                })
                .await
            {
                Ok(renewed) => {
                    info!(
                        expires_at = %renewed.expires_at(),
                        "Credential renewed"
                    );
                    return Ok(renewed);
                }
                Err(e) => {
                    warn!("Credential renewal failed, falling back to re-authentication: {}", e);
                }
            }
        }

        match self
            .attempt_with_budget("re-authentication", self.config.reauth_retry_attempts, || {
                self.auth.authenticate()
            })
            .await
        {
            Ok(credential) => {
                info!(
                    expires_at = %credential.expires_at(),
                    "Full re-authentication succeeded"
                );
                Ok(credential)
            }
            Err(e) => {
                error!("Re-authentication failed after retry budget: {}", e);
                Err(SentraError::Auth(format!(
                    "renewal and re-authentication both failed: {}",
                    e
                )))
            }
        }
    }

    async fn attempt_with_budget<F, Fut>(
        &self,
        what: &str,
        attempts: u32,
        op: F,
    ) -> Result<Credential>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<Credential>>,
    {
        let attempts = attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match op().await {
                Ok(credential) => return Ok(credential),
                Err(e) => {
                    debug!("{} attempt {}/{} failed: {}", what, attempt, attempts, e);
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| SentraError::Auth(format!("{} failed", what))))
    }

    /// Drop the cached credential so the next caller performs a full
    /// re-authentication. Used when the upstream rejects a token that should
    /// still have been valid.
    pub async fn invalidate(&self) {
        let _guard = self.renewal_lock.lock().await;
        if self.current.write().await.take().is_some() {
            warn!("Cached credential invalidated");
        }
    }

    /// Destroy the credential on shutdown. Token material is zeroized on drop.
    pub async fn clear(&self) {
        let _guard = self.renewal_lock.lock().await;
        *self.current.write().await = None;
        debug!("Session credential cleared");
    }

    /// Background task checking expiry on an interval so renewal happens
    /// proactively rather than on-demand-only.
    pub async fn run_renewal_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.renewal_check_interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            interval_secs = self.config.renewal_check_interval_secs,
            margin_secs = self.config.renewal_margin_secs,
            "Session renewal loop started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.get_valid_credential().await {
                        error!("Proactive credential renewal failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("Session renewal loop stopping");
                        break;
                    }
                }
            }
        }
    }
}
