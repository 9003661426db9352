//! Realtime connection lifecycle.
//!
//! Owns the WebSocket session end to end: connect, subscribe in declared
//! order, reconcile away the gap, then pump events until the connection
//! dies and the cycle starts again. Consumers observe state through a
//! watch channel and events through a broadcast channel; they never see
//! the socket itself.

use rand::Rng;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::RealtimeConfig;
use crate::domain::{Position, RealtimeEvent};
use crate::error::{Result, SentraError};
use crate::reconcile::StateReconciler;
use crate::session::SessionManager;
use crate::transport::realtime::{Inbound, RealtimeSession, RealtimeTransport};
use crate::transport::store::StateStore;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// One topic subscription, applied in declaration order on every
/// (re)connect.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub topic: String,
    /// Required subscriptions fail the whole connection cycle when the
    /// server rejects them; optional ones just log and continue.
    pub required: bool,
}

impl Subscription {
    pub fn required(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            required: true,
        }
    }

    pub fn optional(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            required: false,
        }
    }
}

pub struct ConnectionManager {
    transport: Arc<dyn RealtimeTransport>,
    session: Arc<SessionManager>,
    reconciler: Arc<StateReconciler>,
    store: Arc<dyn StateStore>,
    config: RealtimeConfig,
    subscriptions: Vec<Subscription>,
    state_tx: watch::Sender<ConnectionState>,
    event_tx: broadcast::Sender<RealtimeEvent>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn RealtimeTransport>,
        session: Arc<SessionManager>,
        reconciler: Arc<StateReconciler>,
        store: Arc<dyn StateStore>,
        config: RealtimeConfig,
        subscriptions: Vec<Subscription>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            transport,
            session,
            reconciler,
            store,
            config,
            subscriptions,
            state_tx,
            event_tx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Subscribe to the ordered event stream. Events are broadcast in
    /// arrival order; a slow consumer that lags simply misses events and
    /// should treat `RecvError::Lagged` as a reconcile trigger.
    pub fn subscribe_events(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.event_tx.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        if *self.state_tx.borrow() != state {
            info!(state = %state, "Connection state changed");
            self.state_tx.send_replace(state);
        }
    }

    /// Run the connection until shutdown. Returns an error only when the
    /// reconnect cycle budget is exhausted.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let schedule = backoff_schedule(&self.config);
        let mut failed_cycles: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            if failed_cycles > 0 {
                self.set_state(ConnectionState::Reconnecting);
                let delay = delay_for_cycle(&schedule, failed_cycles);
                if !delay.is_zero() {
                    debug!(delay_ms = delay.as_millis() as u64, "Reconnect backoff");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => continue,
                    }
                }
            } else {
                self.set_state(ConnectionState::Connecting);
            }

            match self.run_cycle(&mut shutdown).await {
                Ok(CycleEnd::Shutdown) => break,
                Ok(CycleEnd::ConnectionLost(reason)) => {
                    warn!(reason = %reason, "Connection lost, will reconnect");
                    // The cycle reached Connected, so the budget of
                    // consecutive failed attempts starts over. The next
                    // attempt uses the first schedule entry.
                    failed_cycles = 1;
                }
                Err(e) => {
                    if let SentraError::RequiredSubscriptionFailed { topic } = &e {
                        error!(topic, "Required subscription rejected");
                    } else {
                        warn!(error = %e, "Connection cycle failed");
                    }
                    failed_cycles += 1;

                    if self.config.max_reconnect_cycles > 0
                        && failed_cycles >= self.config.max_reconnect_cycles
                    {
                        self.set_state(ConnectionState::Disconnected);
                        return Err(SentraError::ReconnectExhausted {
                            attempts: failed_cycles,
                        });
                    }
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("Connection manager stopped");
        Ok(())
    }

    /// One connect-subscribe-reconcile-pump cycle.
    async fn run_cycle(&self, shutdown: &mut watch::Receiver<bool>) -> Result<CycleEnd> {
        let credential = self.session.get_valid_credential().await?;
        let mut session = self.transport.connect(&credential).await?;

        // Subscriptions go out strictly in declaration order.
        for subscription in &self.subscriptions {
            match session.subscribe(&subscription.topic).await {
                Ok(()) => debug!(topic = %subscription.topic, "Subscribed"),
                Err(e) if subscription.required => {
                    warn!(topic = %subscription.topic, error = %e, "Required subscription failed");
                    session.close().await;
                    return Err(SentraError::RequiredSubscriptionFailed {
                        topic: subscription.topic.clone(),
                    });
                }
                Err(e) => {
                    warn!(topic = %subscription.topic, error = %e, "Optional subscription failed");
                }
            }
        }

        // Close the gap before exposing the stream. Events arriving while
        // reconciliation runs are buffered and flushed in order, so
        // consumers never observe a pre-reconcile event after a
        // post-reconcile one.
        let buffered = match self.reconcile_with_buffering(&mut session).await {
            Ok(buffered) => buffered,
            Err(e) => {
                session.close().await;
                return Err(e);
            }
        };

        for event in buffered {
            self.deliver(event);
        }

        self.set_state(ConnectionState::Connected);
        let end = self.pump(&mut session, shutdown).await;
        session.close().await;
        end
    }

    /// Run reconciliation while draining the socket into a bounded
    /// buffer. Returns the buffered events once reconciliation succeeds.
    async fn reconcile_with_buffering(
        &self,
        session: &mut Box<dyn RealtimeSession>,
    ) -> Result<Vec<RealtimeEvent>> {
        let mut buffer: VecDeque<RealtimeEvent> = VecDeque::new();
        let reconcile = self.reconciler.reconcile();
        tokio::pin!(reconcile);

        loop {
            tokio::select! {
                report = &mut reconcile => {
                    report?;
                    return Ok(buffer.into_iter().collect());
                }
                frame = session.next_event() => {
                    match frame? {
                        Some(Inbound::Event(event)) => {
                            if buffer.len() >= self.config.resume_buffer_size {
                                // Oldest events are superseded by the
                                // reconciled snapshot anyway.
                                warn!("Resume buffer full, dropping oldest event");
                                buffer.pop_front();
                            }
                            buffer.push_back(event);
                        }
                        Some(Inbound::Pong) => {}
                        None => {
                            return Err(SentraError::WebSocket(
                                "connection closed during reconciliation".to_string(),
                            ));
                        }
                    }
                }
            }
        }
    }

    /// Steady-state event pump with heartbeat liveness.
    async fn pump(
        &self,
        session: &mut Box<dyn RealtimeSession>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<CycleEnd> {
        let heartbeat_interval = Duration::from_secs(self.config.heartbeat_interval_secs);
        let heartbeat_timeout = Duration::from_secs(self.config.heartbeat_timeout_secs);

        let mut ping_timer = tokio::time::interval_at(
            Instant::now() + heartbeat_interval,
            heartbeat_interval,
        );
        ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut pong_deadline: Option<Instant> = None;
        let mut missed_heartbeats: u32 = 0;

        loop {
            let deadline = pong_deadline.unwrap_or_else(|| Instant::now() + heartbeat_interval);

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(CycleEnd::Shutdown);
                    }
                }
                _ = ping_timer.tick() => {
                    if let Err(e) = session.ping().await {
                        return Ok(CycleEnd::ConnectionLost(format!("ping failed: {}", e)));
                    }
                    pong_deadline = Some(Instant::now() + heartbeat_timeout);
                }
                _ = tokio::time::sleep_until(deadline), if pong_deadline.is_some() => {
                    pong_deadline = None;
                    missed_heartbeats += 1;
                    warn!(missed_heartbeats, "Heartbeat response missed");
                    if missed_heartbeats >= 2 {
                        return Ok(CycleEnd::ConnectionLost(
                            "stale connection, heartbeats unanswered".to_string(),
                        ));
                    }
                }
                frame = session.next_event() => {
                    match frame {
                        Ok(Some(Inbound::Event(event))) => self.deliver(event),
                        Ok(Some(Inbound::Pong)) => {
                            pong_deadline = None;
                            missed_heartbeats = 0;
                        }
                        Ok(None) => {
                            return Ok(CycleEnd::ConnectionLost("server closed stream".to_string()));
                        }
                        Err(e) => {
                            return Ok(CycleEnd::ConnectionLost(e.to_string()));
                        }
                    }
                }
            }
        }
    }

    /// Apply an event to the local cache, then broadcast it.
    fn deliver(&self, event: RealtimeEvent) {
        self.apply_to_store(&event);
        // Send fails only when no consumer is subscribed yet.
        let _ = self.event_tx.send(event);
    }

    fn apply_to_store(&self, event: &RealtimeEvent) {
        match event {
            RealtimeEvent::Position(update) => {
                let existing = self.store.position(&update.symbol);
                let position = Position {
                    position_id: update.position_id.clone(),
                    symbol: update.symbol.clone(),
                    size: update.size,
                    avg_entry_price: update.avg_entry_price,
                    unrealized_pnl: existing
                        .map(|p| p.unrealized_pnl)
                        .unwrap_or_default(),
                    opened_at: update.timestamp,
                };
                self.store.upsert_position(position);
            }
            RealtimeEvent::Order(update) => {
                match self.store.order(&update.order_id) {
                    Some(mut order) => {
                        order.status = update.status;
                        order.filled_size = update.filled_size;
                        order.updated_at = update.timestamp;
                        self.store.upsert_order(order);
                    }
                    None if update.status.is_terminal() => {
                        self.store.remove_order(&update.order_id);
                    }
                    None => {
                        // Update for an order the cache never saw. The
                        // event carries too little to synthesize a full
                        // snapshot; the next reconciliation fills it in.
                        debug!(
                            order_id = %update.order_id,
                            status = ?update.status,
                            "Order update for unknown order"
                        );
                    }
                }
            }
            RealtimeEvent::Trade(_) => {
                // Fills do not mutate the cache directly; order updates
                // carry the cumulative filled size.
            }
            RealtimeEvent::Account(update) => {
                if let Some(mut account) = self.store.account() {
                    account.balance = update.balance;
                    account.equity = update.equity;
                    account.updated_at = update.timestamp;
                    self.store.set_account(account);
                }
            }
        }
    }
}

enum CycleEnd {
    Shutdown,
    ConnectionLost(String),
}

fn backoff_schedule(config: &RealtimeConfig) -> Vec<Duration> {
    config
        .backoff_schedule_ms
        .iter()
        .map(|ms| Duration::from_millis(*ms))
        .collect()
}

/// Delay for the Nth consecutive failed cycle, with +/-20% jitter. The
/// schedule's last entry repeats once exhausted.
fn delay_for_cycle(schedule: &[Duration], failed_cycles: u32) -> Duration {
    if schedule.is_empty() {
        return Duration::ZERO;
    }
    let index = (failed_cycles as usize - 1).min(schedule.len() - 1);
    let base = schedule[index];
    if base.is_zero() {
        return Duration::ZERO;
    }
    let jitter = rand::thread_rng().gen_range(0.8..1.2);
    Duration::from_millis((base.as_millis() as f64 * jitter) as u64)
}
