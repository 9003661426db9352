//! Daemon coordinator.
//!
//! Builds the component graph from configuration, spawns the background
//! tasks, and drives the graceful shutdown sequence.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::domain::{
    AccountStatus, OrderAck, OrderIntent, OrderSnapshot, Position, RealtimeEvent,
};
use crate::error::{Result, SentraError};
use crate::execution::{ExecutionManager, FillTracker};
use crate::gateway::{BrokerGateway, BreakerStats, RateLimiter, RequestExecutor};
use crate::realtime::{ConnectionManager, ConnectionState, Subscription};
use crate::reconcile::{ReconciliationReport, StateReconciler};
use crate::session::SessionManager;
use crate::shutdown::{install_signal_handlers, GracefulShutdown, ShutdownConfig};
use crate::transport::http::BrokerRestClient;
use crate::transport::realtime::RealtimeTransport;
use crate::transport::rest::{AuthApi, BrokerApi};
use crate::transport::store::{MemoryStateStore, StateStore};
use crate::transport::ws::WsTransport;

/// Point-in-time view of the daemon's cached trading state, for
/// consumers that want one coherent read instead of store access.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub connection: ConnectionState,
    pub positions: Vec<Position>,
    pub open_orders: Vec<OrderSnapshot>,
    pub account: Option<AccountStatus>,
    pub last_refreshed: Option<DateTime<Utc>>,
}

pub struct Coordinator {
    config: AppConfig,
    session: Arc<SessionManager>,
    gateway: Arc<BrokerGateway>,
    execution: Arc<ExecutionManager>,
    connection: Arc<ConnectionManager>,
    reconciler: Arc<StateReconciler>,
    store: Arc<dyn StateStore>,
    fills: Arc<FillTracker>,
    shutdown: Arc<GracefulShutdown>,
    accepting_orders: Arc<AtomicBool>,
}

impl Coordinator {
    /// Build the full component graph against the live broker.
    pub fn new(config: AppConfig) -> Result<Self> {
        let rest = Arc::new(BrokerRestClient::from_env(
            &config.broker.rest_url,
            config.dry_run.enabled,
        )?);
        let transport = Arc::new(WsTransport::new(config.broker.ws_url.clone()));
        Self::with_transports(config, rest.clone(), rest, transport)
    }

    /// Build with explicit transports. Tests drive this with mocks.
    pub fn with_transports(
        config: AppConfig,
        auth: Arc<dyn AuthApi>,
        api: Arc<dyn BrokerApi>,
        transport: Arc<dyn RealtimeTransport>,
    ) -> Result<Self> {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let session = Arc::new(SessionManager::new(auth, config.auth.clone()));
        let limiter = Arc::new(RateLimiter::new(&config.rate_limit));
        let executor = RequestExecutor::new(
            Arc::clone(&session),
            limiter,
            &config.circuit_breaker,
            config.retry.clone(),
        );
        let gateway = Arc::new(BrokerGateway::new(
            executor,
            api,
            config.broker.account_id.clone(),
        ));
        let reconciler = Arc::new(StateReconciler::new(
            Arc::clone(&gateway),
            Arc::clone(&store),
        ));

        let subscriptions = vec![
            Subscription::required("positions"),
            Subscription::required("orders"),
            Subscription::required("account"),
            Subscription::optional("trades"),
        ];
        let connection = Arc::new(ConnectionManager::new(
            transport,
            Arc::clone(&session),
            Arc::clone(&reconciler),
            Arc::clone(&store),
            config.realtime.clone(),
            subscriptions,
        ));

        let fills = Arc::new(FillTracker::new());
        let execution = Arc::new(ExecutionManager::new(
            Arc::clone(&gateway),
            Arc::clone(&fills),
            config.execution.clone(),
        ));

        Ok(Self {
            config,
            session,
            gateway,
            execution,
            connection,
            reconciler,
            store,
            fills,
            shutdown: Arc::new(GracefulShutdown::new(ShutdownConfig::default())),
            accepting_orders: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Snapshot of positions, open orders, and account status as the
    /// cache currently sees them.
    pub fn current_state(&self) -> StateSnapshot {
        StateSnapshot {
            connection: self.connection.state(),
            positions: self.store.positions(),
            open_orders: self.store.open_orders(),
            account: self.store.account(),
            last_refreshed: self.store.last_refreshed(),
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.connection.subscribe_events()
    }

    pub async fn breaker_stats(&self) -> Vec<BreakerStats> {
        self.gateway.breaker_stats().await
    }

    /// Place an order through the idempotent execution path.
    pub async fn execute_order(&self, intent: &OrderIntent) -> Result<OrderAck> {
        if !self.accepting_orders.load(Ordering::SeqCst) {
            return Err(SentraError::Cancelled(
                "daemon is shutting down, order rejected".to_string(),
            ));
        }
        self.execution.place_order(intent).await
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<bool> {
        self.execution.cancel_order(order_id).await
    }

    pub async fn modify_order(&self, order_id: &str, replacement: &OrderIntent) -> Result<OrderAck> {
        if !self.accepting_orders.load(Ordering::SeqCst) {
            return Err(SentraError::Cancelled(
                "daemon is shutting down, modify rejected".to_string(),
            ));
        }
        self.execution.modify_order(order_id, replacement).await
    }

    pub async fn order_history(&self, limit: u32) -> Result<Vec<OrderSnapshot>> {
        self.gateway.get_order_history(limit).await
    }

    pub async fn reconcile_now(&self) -> Result<ReconciliationReport> {
        self.reconciler.reconcile().await
    }

    /// Run until an OS signal (or programmatic request) triggers
    /// shutdown.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        install_signal_handlers(Arc::clone(&self.shutdown)).await;

        let stop = self.shutdown.stop_flag();
        let mut tasks = Vec::new();

        // Realtime connection loop.
        {
            let connection = Arc::clone(&self.connection);
            let stop = stop.clone();
            let shutdown = Arc::clone(&self.shutdown);
            tasks.push(tokio::spawn(async move {
                if let Err(e) = connection.run(stop).await {
                    error!(error = %e, "Realtime connection failed permanently");
                    shutdown.request_shutdown(crate::shutdown::ShutdownSignal::Urgent);
                }
            }));
        }

        // Proactive credential renewal.
        {
            let session = Arc::clone(&self.session);
            let stop = stop.clone();
            tasks.push(tokio::spawn(async move {
                session.run_renewal_loop(stop).await;
            }));
        }

        // Feed realtime events into the fill tracker.
        {
            let fills = Arc::clone(&self.fills);
            let mut events = self.connection.subscribe_events();
            let mut stop = stop.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        event = events.recv() => match event {
                            Ok(event) => fills.on_event(&event),
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!(missed = n, "Fill tracker lagged behind event stream");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                        _ = stop.changed() => {
                            if *stop.borrow() {
                                break;
                            }
                        }
                    }
                }
            }));
        }

        // Periodic sweep for orders stuck past the fill window.
        {
            let fills = Arc::clone(&self.fills);
            let fill_timeout = chrono::Duration::seconds(self.config.execution.fill_timeout_secs as i64);
            let mut stop = stop.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(30));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            fills.sweep(fill_timeout);
                        }
                        _ = stop.changed() => {
                            if *stop.borrow() {
                                break;
                            }
                        }
                    }
                }
            }));
        }

        // Optional timer-driven reconciliation.
        if self.config.reconciliation.periodic_enabled {
            let reconciler = Arc::clone(&self.reconciler);
            let interval =
                Duration::from_secs(self.config.reconciliation.periodic_interval_secs);
            let mut stop = stop.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = reconciler.reconcile().await {
                                warn!(error = %e, "Periodic reconciliation failed");
                            }
                        }
                        _ = stop.changed() => {
                            if *stop.borrow() {
                                break;
                            }
                        }
                    }
                }
            }));
        }

        info!("Daemon running");

        // Block until a shutdown signal arrives.
        let mut signals = self.shutdown.subscribe();
        let _ = signals.recv().await;

        self.graceful_shutdown().await;

        for task in tasks {
            task.abort();
        }
        Ok(())
    }

    async fn graceful_shutdown(&self) {
        let accepting = Arc::clone(&self.accepting_orders);
        let fills = Arc::clone(&self.fills);
        let mut state = self.connection.watch_state();
        let session = Arc::clone(&self.session);

        let result = self
            .shutdown
            .execute(
                || {
                    Box::pin(async move {
                        accepting.store(false, Ordering::SeqCst);
                    })
                },
                || {
                    Box::pin(async move {
                        // Drain: wait for tracked orders to reach terminal
                        // states, polling the tracker.
                        loop {
                            if fills.active().is_empty() {
                                return true;
                            }
                            tokio::time::sleep(Duration::from_millis(500)).await;
                        }
                    })
                },
                || {
                    Box::pin(async move {
                        // The stop flag already flipped; wait for the
                        // connection loop to report Disconnected.
                        while *state.borrow_and_update() != ConnectionState::Disconnected {
                            if state.changed().await.is_err() {
                                break;
                            }
                        }
                    })
                },
                || {
                    Box::pin(async move {
                        session.clear().await;
                    })
                },
            )
            .await;

        if let Err(e) = result {
            warn!(error = %e, "Shutdown completed with errors");
        }
    }
}
