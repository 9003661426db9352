//! Graceful shutdown coordination.
//!
//! Sequences teardown so in-flight orders drain before the realtime
//! connection and session are torn down, with per-phase timeouts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Normal graceful shutdown (SIGTERM, SIGINT)
    Graceful,
    /// Urgent shutdown, reduced timeouts
    Urgent,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Graceful => write!(f, "graceful"),
            ShutdownSignal::Urgent => write!(f, "urgent"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Total timeout for graceful shutdown
    pub total_timeout_secs: u64,
    /// Time to wait for in-flight orders to reach terminal states
    pub order_drain_timeout_secs: u64,
    /// Time to wait for the realtime connection to close
    pub realtime_close_timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            total_timeout_secs: 120,
            order_drain_timeout_secs: 60,
            realtime_close_timeout_secs: 10,
        }
    }
}

/// Shutdown phase tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    StoppingNewOrders,
    DrainingOrders,
    ClosingRealtime,
    ClearingSession,
    Complete,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownPhase::Running => write!(f, "running"),
            ShutdownPhase::StoppingNewOrders => write!(f, "stopping_new_orders"),
            ShutdownPhase::DrainingOrders => write!(f, "draining_orders"),
            ShutdownPhase::ClosingRealtime => write!(f, "closing_realtime"),
            ShutdownPhase::ClearingSession => write!(f, "clearing_session"),
            ShutdownPhase::Complete => write!(f, "complete"),
        }
    }
}

/// Graceful shutdown coordinator
pub struct GracefulShutdown {
    config: ShutdownConfig,
    shutdown_requested: AtomicBool,
    phase_tx: watch::Sender<ShutdownPhase>,
    phase_rx: watch::Receiver<ShutdownPhase>,
    signal_tx: broadcast::Sender<ShutdownSignal>,
    stop_tx: watch::Sender<bool>,
}

impl GracefulShutdown {
    pub fn new(config: ShutdownConfig) -> Self {
        let (phase_tx, phase_rx) = watch::channel(ShutdownPhase::Running);
        let (signal_tx, _) = broadcast::channel(8);
        let (stop_tx, _) = watch::channel(false);

        Self {
            config,
            shutdown_requested: AtomicBool::new(false),
            phase_tx,
            phase_rx,
            signal_tx,
            stop_tx,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ShutdownConfig::default())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.signal_tx.subscribe()
    }

    /// Stop flag handed to background tasks; flips to true once
    /// shutdown starts.
    pub fn stop_flag(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    pub fn phase_receiver(&self) -> watch::Receiver<ShutdownPhase> {
        self.phase_rx.clone()
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    pub fn current_phase(&self) -> ShutdownPhase {
        *self.phase_rx.borrow()
    }

    pub fn request_shutdown(&self, signal: ShutdownSignal) {
        if self.shutdown_requested.swap(true, Ordering::SeqCst) {
            warn!(signal = %signal, "Shutdown already requested, ignoring duplicate");
            return;
        }

        info!(signal = %signal, "Shutdown requested");
        let _ = self.signal_tx.send(signal);
    }

    fn set_phase(&self, phase: ShutdownPhase) {
        let _ = self.phase_tx.send(phase);
        info!(phase = %phase, "Shutdown phase");
    }

    /// Execute the shutdown sequence:
    /// 1. Stop accepting new orders
    /// 2. Drain in-flight orders
    /// 3. Close the realtime connection
    /// 4. Clear the session credential
    pub async fn execute<F1, F2, F3, F4>(
        &self,
        stop_new_orders: F1,
        drain_orders: F2,
        close_realtime: F3,
        clear_session: F4,
    ) -> Result<(), ShutdownError>
    where
        F1: FnOnce() -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>,
        F2: FnOnce() -> std::pin::Pin<Box<dyn std::future::Future<Output = bool> + Send>>,
        F3: FnOnce() -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>,
        F4: FnOnce() -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>,
    {
        let start = std::time::Instant::now();
        let total_timeout = Duration::from_secs(self.config.total_timeout_secs);

        info!(
            timeout_secs = self.config.total_timeout_secs,
            "Starting graceful shutdown"
        );
        let _ = self.stop_tx.send(true);

        self.set_phase(ShutdownPhase::StoppingNewOrders);
        stop_new_orders().await;
        debug!("New order acceptance stopped");

        self.set_phase(ShutdownPhase::DrainingOrders);
        let drain_timeout = Duration::from_secs(self.config.order_drain_timeout_secs);
        match tokio::time::timeout(drain_timeout, drain_orders()).await {
            Ok(true) => info!("All in-flight orders drained"),
            Ok(false) => warn!("Some orders did not complete during drain"),
            Err(_) => warn!(
                timeout_secs = self.config.order_drain_timeout_secs,
                "Order drain timed out, proceeding"
            ),
        }

        if start.elapsed() > total_timeout {
            error!("Total shutdown timeout exceeded");
            self.set_phase(ShutdownPhase::Complete);
            return Err(ShutdownError::Timeout);
        }

        self.set_phase(ShutdownPhase::ClosingRealtime);
        let close_timeout = Duration::from_secs(self.config.realtime_close_timeout_secs);
        match tokio::time::timeout(close_timeout, close_realtime()).await {
            Ok(()) => debug!("Realtime connection closed"),
            Err(_) => warn!(
                timeout_secs = self.config.realtime_close_timeout_secs,
                "Realtime close timed out"
            ),
        }

        self.set_phase(ShutdownPhase::ClearingSession);
        clear_session().await;

        self.set_phase(ShutdownPhase::Complete);
        info!(elapsed = ?start.elapsed(), "Graceful shutdown completed");

        Ok(())
    }
}

/// Shutdown errors
#[derive(Debug, Clone)]
pub enum ShutdownError {
    Timeout,
    Interrupted,
}

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownError::Timeout => write!(f, "shutdown timed out"),
            ShutdownError::Interrupted => write!(f, "shutdown interrupted"),
        }
    }
}

impl std::error::Error for ShutdownError {}

/// Install OS signal handlers that trigger shutdown.
pub async fn install_signal_handlers(shutdown: Arc<GracefulShutdown>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let shutdown_sigterm = shutdown.clone();
        let shutdown_sigint = shutdown.clone();

        tokio::spawn(async move {
            let mut stream =
                signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
            stream.recv().await;
            info!("Received SIGTERM");
            shutdown_sigterm.request_shutdown(ShutdownSignal::Graceful);
        });

        tokio::spawn(async move {
            let mut stream =
                signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");
            stream.recv().await;
            info!("Received SIGINT");
            shutdown_sigint.request_shutdown(ShutdownSignal::Graceful);
        });
    }

    #[cfg(windows)]
    {
        let shutdown_ctrl_c = shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
            info!("Received Ctrl+C");
            shutdown_ctrl_c.request_shutdown(ShutdownSignal::Graceful);
        });
    }
}
