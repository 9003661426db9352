//! End-to-end resilience scenarios against scripted broker mocks.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal_macros::dec;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use sentra::config::{
    AuthConfig, CircuitBreakerConfig, ExecutionConfig, RateLimitConfig, RealtimeConfig,
    RetryConfig,
};
use sentra::domain::{
    AccountStatus, OrderAck, OrderIntent, OrderRequest, OrderSide, OrderSnapshot, OrderStatus,
    Position, PositionUpdate, RealtimeEvent,
};
use sentra::error::{Result, SentraError};
use sentra::execution::{ExecutionManager, FillTracker};
use sentra::gateway::{BrokerGateway, RateLimiter, RequestExecutor};
use sentra::realtime::{ConnectionManager, ConnectionState, Subscription};
use sentra::reconcile::StateReconciler;
use sentra::session::{Credential, SessionManager};
use sentra::transport::realtime::{Inbound, RealtimeSession, RealtimeTransport};
use sentra::transport::rest::{AuthApi, BrokerApi};
use sentra::transport::store::{MemoryStateStore, StateStore};
use sentra::{AppConfig, Coordinator};

// === Broker mock ===

#[derive(Default)]
struct MockBroker {
    auth_calls: AtomicU32,
    submit_calls: AtomicU32,
    /// Upstream statuses to fail upcoming submissions with, in order.
    submit_failures: Mutex<VecDeque<u16>>,
    positions: Mutex<Vec<Position>>,
    open_orders: Mutex<Vec<OrderSnapshot>>,
    placed: Mutex<HashMap<String, OrderSnapshot>>,
    /// When set, placed orders never show up in order fetches, as if the
    /// broker acked into a void.
    hide_placed_orders: AtomicBool,
}

impl MockBroker {
    fn with_positions(positions: Vec<Position>) -> Self {
        Self {
            positions: Mutex::new(positions),
            ..Default::default()
        }
    }

    fn fail_next_submits(&self, statuses: &[u16]) {
        self.submit_failures
            .lock()
            .unwrap()
            .extend(statuses.iter().copied());
    }
}

#[async_trait]
impl AuthApi for MockBroker {
    async fn authenticate(&self) -> Result<Credential> {
        self.auth_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Credential::new(
            format!("tok-{}", self.auth_calls.load(Ordering::SeqCst)),
            Utc::now() + ChronoDuration::hours(24),
        ))
    }

    async fn renew(&self, _current: &Credential) -> Result<Credential> {
        self.authenticate().await
    }
}

#[async_trait]
impl BrokerApi for MockBroker {
    async fn fetch_positions(
        &self,
        _credential: &Credential,
        _account_id: &str,
    ) -> Result<Vec<Position>> {
        Ok(self.positions.lock().unwrap().clone())
    }

    async fn fetch_open_orders(
        &self,
        _credential: &Credential,
        _account_id: &str,
    ) -> Result<Vec<OrderSnapshot>> {
        Ok(self.open_orders.lock().unwrap().clone())
    }

    async fn fetch_account(
        &self,
        _credential: &Credential,
        _account_id: &str,
    ) -> Result<AccountStatus> {
        Ok(AccountStatus {
            account_id: "acct-1".to_string(),
            balance: dec!(10000),
            equity: dec!(10000),
            day_pnl: dec!(0),
            locked: false,
            updated_at: Utc::now(),
        })
    }

    async fn submit_order(
        &self,
        _credential: &Credential,
        _account_id: &str,
        request: &OrderRequest,
    ) -> Result<OrderAck> {
        if let Some(status) = self.submit_failures.lock().unwrap().pop_front() {
            return Err(SentraError::UpstreamStatus {
                status,
                body: "injected failure".to_string(),
            });
        }

        let n = self.submit_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let order_id = format!("ord-{}", n);
        let snapshot = OrderSnapshot {
            order_id: order_id.clone(),
            client_order_id: Some(request.client_order_id.clone()),
            symbol: request.symbol.clone(),
            side: request.side,
            size: request.size,
            filled_size: dec!(0),
            limit_price: request.limit_price,
            status: OrderStatus::Open,
            updated_at: Utc::now(),
        };
        self.placed
            .lock()
            .unwrap()
            .insert(order_id.clone(), snapshot);

        Ok(OrderAck {
            order_id,
            client_order_id: request.client_order_id.clone(),
            status: OrderStatus::Submitted,
            accepted_at: Utc::now(),
        })
    }

    async fn cancel_order(
        &self,
        _credential: &Credential,
        _account_id: &str,
        order_id: &str,
    ) -> Result<bool> {
        Ok(self.placed.lock().unwrap().remove(order_id).is_some())
    }

    async fn fetch_order(
        &self,
        _credential: &Credential,
        _account_id: &str,
        order_id: &str,
    ) -> Result<OrderSnapshot> {
        if self.hide_placed_orders.load(Ordering::SeqCst) {
            return Err(SentraError::UpstreamStatus {
                status: 404,
                body: "order not found".to_string(),
            });
        }
        self.placed
            .lock()
            .unwrap()
            .get(order_id)
            .cloned()
            .ok_or_else(|| SentraError::UpstreamStatus {
                status: 404,
                body: "order not found".to_string(),
            })
    }

    async fn fetch_order_history(
        &self,
        _credential: &Credential,
        _account_id: &str,
        limit: u32,
    ) -> Result<Vec<OrderSnapshot>> {
        let placed = self.placed.lock().unwrap();
        Ok(placed.values().take(limit as usize).cloned().collect())
    }
}

// === Stack assembly ===

struct Stack {
    broker: Arc<MockBroker>,
    gateway: Arc<BrokerGateway>,
    execution: Arc<ExecutionManager>,
    store: Arc<MemoryStateStore>,
}

fn build_stack(broker: Arc<MockBroker>, retry: RetryConfig, breaker: CircuitBreakerConfig) -> Stack {
    let session = Arc::new(SessionManager::new(
        broker.clone() as Arc<dyn AuthApi>,
        AuthConfig::default(),
    ));
    let limiter = Arc::new(RateLimiter::new(&RateLimitConfig::default()));
    let executor = RequestExecutor::new(session, limiter, &breaker, retry);
    let gateway = Arc::new(BrokerGateway::new(
        executor,
        broker.clone() as Arc<dyn BrokerApi>,
        "acct-1".to_string(),
    ));
    let execution = Arc::new(ExecutionManager::new(
        Arc::clone(&gateway),
        Arc::new(FillTracker::new()),
        ExecutionConfig {
            verification_timeout_ms: 200,
            poll_interval_ms: 20,
            ..Default::default()
        },
    ));
    let store = Arc::new(MemoryStateStore::new());

    Stack {
        broker,
        gateway,
        execution,
        store,
    }
}

fn quick_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        base_delay_ms: 1,
        max_delay_ms: 5,
    }
}

fn position(symbol: &str, size: rust_decimal::Decimal) -> Position {
    Position {
        position_id: format!("pos-{}", symbol),
        symbol: symbol.to_string(),
        size,
        avg_entry_price: dec!(100),
        unrealized_pnl: dec!(0),
        opened_at: Utc::now(),
    }
}

#[tokio::test]
async fn order_history_flows_through_the_history_budget() {
    let stack = build_stack(
        Arc::new(MockBroker::default()),
        quick_retry(2),
        CircuitBreakerConfig::default(),
    );

    let request = OrderRequest::limit("ES-DEC26", OrderSide::Buy, dec!(1), dec!(4500));
    let intent = OrderIntent::new("intent-history", request);
    let ack = stack.execution.place_order(&intent).await.unwrap();

    let history = stack.gateway.get_order_history(10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].order_id, ack.order_id);
}

// === Idempotent execution ===

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sixty_concurrent_placements_share_one_order() {
    let stack = build_stack(
        Arc::new(MockBroker::default()),
        quick_retry(3),
        CircuitBreakerConfig::default(),
    );

    let request = OrderRequest::limit("ES-DEC26", OrderSide::Buy, dec!(5), dec!(4500));
    let intent = OrderIntent::new("intent-1", request);

    let mut handles = Vec::new();
    for _ in 0..60 {
        let execution = Arc::clone(&stack.execution);
        let intent = intent.clone();
        handles.push(tokio::spawn(async move {
            execution.place_order(&intent).await
        }));
    }

    let mut order_ids = Vec::new();
    for handle in handles {
        let ack = handle.await.unwrap().unwrap();
        order_ids.push(ack.order_id);
    }

    assert_eq!(stack.broker.submit_calls.load(Ordering::SeqCst), 1);
    assert!(order_ids.iter().all(|id| id == &order_ids[0]));
}

#[tokio::test]
async fn distinct_intent_keys_place_distinct_orders() {
    let stack = build_stack(
        Arc::new(MockBroker::default()),
        quick_retry(3),
        CircuitBreakerConfig::default(),
    );

    let first = OrderIntent::new(
        "intent-a",
        OrderRequest::limit("ES-DEC26", OrderSide::Buy, dec!(1), dec!(4500)),
    );
    let second = OrderIntent::new(
        "intent-b",
        OrderRequest::limit("ES-DEC26", OrderSide::Buy, dec!(1), dec!(4500)),
    );

    let ack_a = stack.execution.place_order(&first).await.unwrap();
    let ack_b = stack.execution.place_order(&second).await.unwrap();

    assert_ne!(ack_a.order_id, ack_b.order_id);
    assert_eq!(stack.broker.submit_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn transient_submit_failures_retry_to_one_order() {
    let broker = Arc::new(MockBroker::default());
    broker.fail_next_submits(&[503, 502]);
    let stack = build_stack(broker, quick_retry(4), CircuitBreakerConfig::default());

    let intent = OrderIntent::new(
        "intent-retry",
        OrderRequest::limit("NQ-DEC26", OrderSide::Sell, dec!(2), dec!(16000)),
    );

    let ack = stack.execution.place_order(&intent).await.unwrap();
    assert_eq!(ack.order_id, "ord-1");
    assert_eq!(stack.broker.submit_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rejected_order_surfaces_without_retry() {
    let broker = Arc::new(MockBroker::default());
    broker.fail_next_submits(&[422]);
    let stack = build_stack(broker, quick_retry(4), CircuitBreakerConfig::default());

    let intent = OrderIntent::new(
        "intent-bad",
        OrderRequest::limit("ES-DEC26", OrderSide::Buy, dec!(1), dec!(4500)),
    );

    let err = stack.execution.place_order(&intent).await.unwrap_err();
    assert!(matches!(err, SentraError::OrderSubmission(_)));
    assert_eq!(stack.broker.submit_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unverifiable_ack_never_resubmits_the_key() {
    let broker = Arc::new(MockBroker::default());
    broker.hide_placed_orders.store(true, Ordering::SeqCst);
    let stack = build_stack(broker, quick_retry(2), CircuitBreakerConfig::default());

    let intent = OrderIntent::new(
        "intent-unverified",
        OrderRequest::limit("ES-DEC26", OrderSide::Buy, dec!(1), dec!(4500)),
    );

    let err = stack.execution.place_order(&intent).await.unwrap_err();
    assert!(matches!(err, SentraError::OrderVerificationFailed { .. }));

    // The broker acked, so an upstream order exists under this key.
    // Retrying the same key within the idempotency window must not
    // produce a second broker-side order.
    let err = stack.execution.place_order(&intent).await.unwrap_err();
    assert!(matches!(err, SentraError::OrderVerificationFailed { .. }));
    assert_eq!(stack.broker.submit_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn modify_is_cancel_then_place() {
    let stack = build_stack(
        Arc::new(MockBroker::default()),
        quick_retry(3),
        CircuitBreakerConfig::default(),
    );

    let original = OrderIntent::new(
        "intent-orig",
        OrderRequest::limit("ES-DEC26", OrderSide::Buy, dec!(1), dec!(4500)),
    );
    let ack = stack.execution.place_order(&original).await.unwrap();

    let replacement = OrderIntent::new(
        "intent-replacement",
        OrderRequest::limit("ES-DEC26", OrderSide::Buy, dec!(1), dec!(4490)),
    );
    let new_ack = stack
        .execution
        .modify_order(&ack.order_id, &replacement)
        .await
        .unwrap();

    assert_ne!(new_ack.order_id, ack.order_id);
    // Original is gone from the broker.
    assert!(!stack.broker.placed.lock().unwrap().contains_key(&ack.order_id));
}

// === Circuit breaker behavior through the gateway ===

#[tokio::test]
async fn five_upstream_500s_open_the_circuit() {
    let broker = Arc::new(MockBroker::default());
    broker.fail_next_submits(&[500, 500, 500, 500, 500]);
    let stack = build_stack(
        broker,
        quick_retry(1),
        CircuitBreakerConfig {
            failure_threshold: 5,
            open_timeout_secs: 60,
            ..Default::default()
        },
    );

    for _ in 0..5 {
        let request = OrderRequest::limit("ES-DEC26", OrderSide::Buy, dec!(1), dec!(4500));
        let err = stack.gateway.place_order(&request).await.unwrap_err();
        assert!(matches!(err, SentraError::MaxRetriesExceeded { .. }), "{:?}", err);
    }

    // Circuit is now open; the next request fails fast without reaching
    // the broker.
    let err = stack.gateway.get_positions().await.unwrap_err();
    assert!(matches!(err, SentraError::ServiceUnavailable(_)));
}

#[tokio::test]
async fn upstream_401_triggers_reauthentication() {
    let broker = Arc::new(MockBroker::default());
    broker.fail_next_submits(&[401]);
    let stack = build_stack(broker, quick_retry(2), CircuitBreakerConfig::default());

    let intent = OrderIntent::new(
        "intent-auth",
        OrderRequest::limit("ES-DEC26", OrderSide::Buy, dec!(1), dec!(4500)),
    );

    let ack = stack.execution.place_order(&intent).await.unwrap();
    assert_eq!(ack.order_id, "ord-1");
    // Initial authentication plus the forced re-auth after the 401.
    assert_eq!(stack.broker.auth_calls.load(Ordering::SeqCst), 2);
}

// === Reconciliation ===

#[tokio::test]
async fn reconciliation_detects_missed_opens() {
    let broker = Arc::new(MockBroker::with_positions(vec![
        position("ES-DEC26", dec!(2)),
        position("NQ-DEC26", dec!(1)),
        position("CL-JAN27", dec!(-3)),
    ]));
    let stack = build_stack(broker, quick_retry(3), CircuitBreakerConfig::default());

    let reconciler = StateReconciler::new(
        Arc::clone(&stack.gateway),
        stack.store.clone() as Arc<dyn StateStore>,
    );

    let report = reconciler.reconcile().await.unwrap();

    assert_eq!(report.missed_opens.len(), 3);
    assert!(report.missed_closes.is_empty());
    assert_eq!(stack.store.positions().len(), 3);
    assert_eq!(stack.store.position("CL-JAN27").unwrap().size, dec!(-3));
}

#[tokio::test]
async fn reconciliation_detects_missed_close_and_size_drift() {
    let broker = Arc::new(MockBroker::with_positions(vec![position(
        "ES-DEC26",
        dec!(5),
    )]));
    let stack = build_stack(broker, quick_retry(3), CircuitBreakerConfig::default());

    // Cache believes in a stale world.
    stack.store.upsert_position(position("ES-DEC26", dec!(2)));
    stack.store.upsert_position(position("GC-FEB27", dec!(1)));

    let reconciler = StateReconciler::new(
        Arc::clone(&stack.gateway),
        stack.store.clone() as Arc<dyn StateStore>,
    );
    let report = reconciler.reconcile().await.unwrap();

    assert_eq!(report.size_mismatches, vec!["ES-DEC26".to_string()]);
    assert_eq!(report.missed_closes, vec!["GC-FEB27".to_string()]);
    // Cache now matches the broker.
    assert!(stack.store.position("GC-FEB27").is_none());
    assert_eq!(stack.store.position("ES-DEC26").unwrap().size, dec!(5));
}

// === Coordinator surface ===

#[tokio::test]
async fn current_state_snapshot_reads_the_cache() {
    let broker = Arc::new(MockBroker::with_positions(vec![position(
        "ES-DEC26",
        dec!(2),
    )]));
    let transport = Arc::new(ScriptedTransport {
        sessions: Mutex::new(VecDeque::new()),
    });

    let config: AppConfig = serde_json::from_value(serde_json::json!({
        "broker": {
            "rest_url": "https://api.broker.test",
            "ws_url": "wss://stream.broker.test",
            "account_id": "acct-1"
        }
    }))
    .unwrap();

    let coordinator = Coordinator::with_transports(
        config,
        broker.clone() as Arc<dyn AuthApi>,
        broker as Arc<dyn BrokerApi>,
        transport,
    )
    .unwrap();

    coordinator.reconcile_now().await.unwrap();

    let snapshot = coordinator.current_state();
    assert_eq!(snapshot.connection, ConnectionState::Disconnected);
    assert_eq!(snapshot.positions.len(), 1);
    assert_eq!(snapshot.positions[0].symbol, "ES-DEC26");
    assert!(snapshot.open_orders.is_empty());
    assert!(snapshot.account.is_some());
    assert!(snapshot.last_refreshed.is_some());
}

// === Realtime connection lifecycle ===

enum Frame {
    Event(RealtimeEvent),
    Close,
}

struct ScriptedSession {
    topics: Arc<Mutex<Vec<String>>>,
    frames: VecDeque<Frame>,
}

#[async_trait]
impl RealtimeSession for ScriptedSession {
    async fn subscribe(&mut self, topic: &str) -> Result<()> {
        self.topics.lock().unwrap().push(topic.to_string());
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<Inbound>> {
        match self.frames.pop_front() {
            Some(Frame::Event(event)) => Ok(Some(Inbound::Event(event))),
            Some(Frame::Close) => Ok(None),
            // Script exhausted: hang like an idle socket.
            None => std::future::pending().await,
        }
    }

    async fn ping(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) {}
}

struct ScriptedTransport {
    sessions: Mutex<VecDeque<ScriptedSession>>,
}

#[async_trait]
impl RealtimeTransport for ScriptedTransport {
    async fn connect(&self, _credential: &Credential) -> Result<Box<dyn RealtimeSession>> {
        match self.sessions.lock().unwrap().pop_front() {
            Some(session) => Ok(Box::new(session)),
            None => Err(SentraError::WebSocket("connect refused".to_string())),
        }
    }
}

fn position_event(symbol: &str, size: rust_decimal::Decimal) -> RealtimeEvent {
    RealtimeEvent::Position(PositionUpdate {
        account_id: "acct-1".to_string(),
        position_id: format!("pos-{}", symbol),
        symbol: symbol.to_string(),
        size,
        avg_entry_price: dec!(100),
        timestamp: Utc::now(),
    })
}

fn connection_stack(
    transport: Arc<ScriptedTransport>,
    realtime: RealtimeConfig,
) -> (Arc<ConnectionManager>, Arc<MemoryStateStore>) {
    let broker = Arc::new(MockBroker::with_positions(vec![position(
        "ES-DEC26",
        dec!(2),
    )]));
    let session = Arc::new(SessionManager::new(
        broker.clone() as Arc<dyn AuthApi>,
        AuthConfig::default(),
    ));
    let limiter = Arc::new(RateLimiter::new(&RateLimitConfig::default()));
    let executor = RequestExecutor::new(
        Arc::clone(&session),
        limiter,
        &CircuitBreakerConfig::default(),
        quick_retry(3),
    );
    let gateway = Arc::new(BrokerGateway::new(
        executor,
        broker as Arc<dyn BrokerApi>,
        "acct-1".to_string(),
    ));
    let store = Arc::new(MemoryStateStore::new());
    let reconciler = Arc::new(StateReconciler::new(
        gateway,
        store.clone() as Arc<dyn StateStore>,
    ));

    let subscriptions = vec![
        Subscription::required("positions"),
        Subscription::required("orders"),
        Subscription::required("account"),
        Subscription::optional("trades"),
    ];
    let connection = Arc::new(ConnectionManager::new(
        transport,
        session,
        reconciler,
        store.clone() as Arc<dyn StateStore>,
        realtime,
        subscriptions,
    ));

    (connection, store)
}

#[tokio::test]
async fn connect_subscribes_in_order_and_reconciles_before_events() {
    let topics = Arc::new(Mutex::new(Vec::new()));
    let transport = Arc::new(ScriptedTransport {
        sessions: Mutex::new(VecDeque::from([ScriptedSession {
            topics: Arc::clone(&topics),
            frames: VecDeque::from([
                Frame::Event(position_event("NQ-DEC26", dec!(1))),
                Frame::Event(position_event("NQ-DEC26", dec!(2))),
            ]),
        }])),
    });

    let (connection, store) = connection_stack(transport, RealtimeConfig::default());
    let mut events = connection.subscribe_events();
    let (stop_tx, stop_rx) = watch::channel(false);

    let runner = {
        let connection = Arc::clone(&connection);
        tokio::spawn(async move { connection.run(stop_rx).await })
    };

    // Events arrive in publication order, after the reconciled snapshot
    // landed in the store.
    let first = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    let second = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();

    match (&first, &second) {
        (RealtimeEvent::Position(a), RealtimeEvent::Position(b)) => {
            assert_eq!(a.size, dec!(1));
            assert_eq!(b.size, dec!(2));
        }
        other => panic!("unexpected events: {:?}", other),
    }

    // Reconciled snapshot is present alongside the buffered updates.
    assert!(store.position("ES-DEC26").is_some());
    assert_eq!(store.position("NQ-DEC26").unwrap().size, dec!(2));

    assert_eq!(
        *topics.lock().unwrap(),
        vec!["positions", "orders", "account", "trades"]
    );
    assert_eq!(connection.state(), ConnectionState::Connected);

    stop_tx.send(true).unwrap();
    runner.await.unwrap().unwrap();
    assert_eq!(connection.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn reconnect_budget_exhaustion_is_fatal() {
    // No sessions available: every connect attempt fails.
    let transport = Arc::new(ScriptedTransport {
        sessions: Mutex::new(VecDeque::new()),
    });

    let realtime = RealtimeConfig {
        backoff_schedule_ms: vec![0, 0],
        max_reconnect_cycles: 3,
        ..Default::default()
    };
    let (connection, _store) = connection_stack(transport, realtime);
    let (_stop_tx, stop_rx) = watch::channel(false);

    let err = tokio::time::timeout(Duration::from_secs(5), connection.run(stop_rx))
        .await
        .unwrap()
        .unwrap_err();

    assert!(matches!(err, SentraError::ReconnectExhausted { attempts: 3 }));
    assert_eq!(connection.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn dropped_connection_reconnects_and_resubscribes() {
    let topics = Arc::new(Mutex::new(Vec::new()));
    let transport = Arc::new(ScriptedTransport {
        sessions: Mutex::new(VecDeque::from([
            ScriptedSession {
                topics: Arc::clone(&topics),
                frames: VecDeque::from([Frame::Close]),
            },
            ScriptedSession {
                topics: Arc::clone(&topics),
                frames: VecDeque::new(),
            },
        ])),
    });

    let realtime = RealtimeConfig {
        backoff_schedule_ms: vec![0],
        ..Default::default()
    };
    let (connection, _store) = connection_stack(transport, realtime);
    let mut state = connection.watch_state();
    let (stop_tx, stop_rx) = watch::channel(false);

    let runner = {
        let connection = Arc::clone(&connection);
        tokio::spawn(async move { connection.run(stop_rx).await })
    };

    // Wait until the second session is up and idle.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if *state.borrow_and_update() == ConnectionState::Connected
                && topics.lock().unwrap().len() == 8
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // Both sessions saw the full subscription set, in the same order.
    let seen = topics.lock().unwrap().clone();
    assert_eq!(&seen[0..4], &seen[4..8]);

    stop_tx.send(true).unwrap();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn unanswered_heartbeats_force_a_reconnect() {
    let topics = Arc::new(Mutex::new(Vec::new()));
    // Two idle sessions: pings succeed but no pong ever comes back.
    let transport = Arc::new(ScriptedTransport {
        sessions: Mutex::new(VecDeque::from([
            ScriptedSession {
                topics: Arc::clone(&topics),
                frames: VecDeque::new(),
            },
            ScriptedSession {
                topics: Arc::clone(&topics),
                frames: VecDeque::new(),
            },
        ])),
    });

    let realtime = RealtimeConfig {
        backoff_schedule_ms: vec![0],
        heartbeat_interval_secs: 2,
        heartbeat_timeout_secs: 1,
        ..Default::default()
    };
    let (connection, _store) = connection_stack(transport, realtime);
    let (stop_tx, stop_rx) = watch::channel(false);

    let runner = {
        let connection = Arc::clone(&connection);
        tokio::spawn(async move { connection.run(stop_rx).await })
    };

    // The second unanswered heartbeat declares the connection stale, and
    // the manager resubscribes on the fresh session.
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            if topics.lock().unwrap().len() >= 8 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let seen = topics.lock().unwrap().clone();
    assert_eq!(&seen[0..4], &seen[4..8]);

    stop_tx.send(true).unwrap();
    runner.await.unwrap().unwrap();
}
