//! Order execution.
//!
//! Wraps the gateway with an idempotency layer and post-submit
//! verification. Any number of concurrent placements sharing an
//! intent key collapse into one broker submission; every caller gets
//! the same outcome.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ExecutionConfig;
use crate::domain::{OrderAck, OrderIntent, OrderRequest, OrderSnapshot};
use crate::error::{Result, SentraError};
use crate::execution::fills::FillTracker;
use crate::gateway::BrokerGateway;

/// Cached result of one submission attempt. Failures are cached too so
/// concurrent callers sharing a key observe the same outcome.
#[derive(Debug, Clone)]
enum Outcome {
    Placed(OrderAck),
    /// No broker-side order exists; the slot is released afterwards so a
    /// later retry can attempt again.
    Rejected(String),
    /// The broker acked but the order never became visible. An upstream
    /// order may exist under this key, so the slot stays cached for the
    /// full idempotency window to block a doubling resubmission.
    Unverified { order_id: String, reason: String },
}

struct IntentSlot {
    created: Instant,
    cell: OnceCell<Outcome>,
}

pub struct ExecutionManager {
    gateway: Arc<BrokerGateway>,
    fills: Arc<FillTracker>,
    config: ExecutionConfig,
    in_flight: DashMap<String, Arc<IntentSlot>>,
}

impl ExecutionManager {
    pub fn new(
        gateway: Arc<BrokerGateway>,
        fills: Arc<FillTracker>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            gateway,
            fills,
            config,
            in_flight: DashMap::new(),
        }
    }

    pub fn fills(&self) -> &Arc<FillTracker> {
        &self.fills
    }

    /// Place an order, idempotent on the intent key. The first caller
    /// for a key performs the submission; concurrent callers await and
    /// share its outcome.
    pub async fn place_order(&self, intent: &OrderIntent) -> Result<OrderAck> {
        self.purge_expired();

        let slot = self
            .in_flight
            .entry(intent.key.clone())
            .or_insert_with(|| {
                Arc::new(IntentSlot {
                    created: Instant::now(),
                    cell: OnceCell::new(),
                })
            })
            .clone();

        let outcome = slot
            .cell
            .get_or_init(|| async {
                let ack = match self.submit(&intent.request).await {
                    Ok(ack) => ack,
                    Err(e) => return Outcome::Rejected(e.to_string()),
                };

                if self.config.verify_orders {
                    if let Err(e) = self.verify(&ack).await {
                        return Outcome::Unverified {
                            order_id: ack.order_id.clone(),
                            reason: e.to_string(),
                        };
                    }
                }

                self.fills.track(&ack, &intent.request);
                info!(
                    order_id = %ack.order_id,
                    symbol = %intent.request.symbol,
                    side = %intent.request.side,
                    size = %intent.request.size,
                    "Order placed"
                );
                Outcome::Placed(ack)
            })
            .await
            .clone();

        match outcome {
            Outcome::Placed(ack) => Ok(ack),
            Outcome::Unverified { order_id, reason } => {
                // The slot stays cached: the ack means a broker-side
                // order exists, and resubmitting the key would double it.
                warn!(
                    key = %intent.key,
                    order_id = %order_id,
                    reason = %reason,
                    "Key holds an unverified order, refusing to resubmit"
                );
                Err(SentraError::OrderVerificationFailed { order_id })
            }
            Outcome::Rejected(reason) => {
                // Release the slot so a deliberate retry is possible;
                // everyone already waiting has the shared failure.
                self.in_flight
                    .remove_if(&intent.key, |_, v| Arc::ptr_eq(v, &slot));
                Err(SentraError::OrderSubmission(reason))
            }
        }
    }

    /// Submit through the gateway, resolving ambiguous transport
    /// failures by probing for the client order id.
    async fn submit(&self, request: &OrderRequest) -> Result<OrderAck> {
        match self.gateway.place_order(request).await {
            Ok(ack) => Ok(ack),
            Err(e) if is_ambiguous(&e) => {
                // The submission may have landed despite the error. The
                // client order id is the ground truth.
                warn!(
                    client_order_id = %request.client_order_id,
                    error = %e,
                    "Ambiguous submission result, probing broker"
                );
                match self.find_by_client_id(&request.client_order_id).await? {
                    Some(snapshot) => {
                        info!(
                            order_id = %snapshot.order_id,
                            "Submission landed despite transport failure"
                        );
                        Ok(OrderAck {
                            order_id: snapshot.order_id.clone(),
                            client_order_id: request.client_order_id.clone(),
                            status: snapshot.status,
                            accepted_at: snapshot.updated_at,
                        })
                    }
                    None => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Poll until the broker reports the order, within the verification
    /// window. A broker that acked but cannot return the order is
    /// treated as a failed placement.
    async fn verify(&self, ack: &OrderAck) -> Result<()> {
        let deadline = Instant::now() + Duration::from_millis(self.config.verification_timeout_ms);
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            match self.gateway.get_order(&ack.order_id).await {
                Ok(snapshot) => {
                    debug!(order_id = %ack.order_id, status = ?snapshot.status, "Order verified");
                    return Ok(());
                }
                Err(SentraError::UpstreamStatus { status: 404, .. }) => {
                    // Not yet visible; keep polling.
                }
                Err(e) => {
                    warn!(order_id = %ack.order_id, error = %e, "Verification fetch failed");
                }
            }

            if Instant::now() + poll_interval > deadline {
                return Err(SentraError::OrderVerificationFailed {
                    order_id: ack.order_id.clone(),
                });
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    async fn find_by_client_id(&self, client_order_id: &str) -> Result<Option<OrderSnapshot>> {
        let open = self.gateway.get_open_orders().await?;
        Ok(open
            .into_iter()
            .find(|o| o.client_order_id.as_deref() == Some(client_order_id)))
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<bool> {
        match self.gateway.cancel_order(order_id).await {
            Ok(cancelled) => {
                if cancelled {
                    info!(order_id, "Order cancelled");
                    self.fills.stop_tracking(order_id);
                }
                Ok(cancelled)
            }
            // Already gone means nothing left to cancel.
            Err(SentraError::UpstreamStatus { status: 404, .. }) => {
                self.fills.stop_tracking(order_id);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Modify an order as cancel-then-place. The replacement carries its
    /// own intent key, so a retried modify never doubles the new order.
    pub async fn modify_order(&self, order_id: &str, replacement: &OrderIntent) -> Result<OrderAck> {
        let cancelled = self.cancel_order(order_id).await?;
        if !cancelled {
            let snapshot = self.gateway.get_order(order_id).await?;
            if snapshot.status.is_terminal() {
                return Err(SentraError::OrderRejected(format!(
                    "cannot modify {}, already {:?}",
                    order_id, snapshot.status
                )));
            }
        }

        self.place_order(replacement).await
    }

    pub async fn order_status(&self, order_id: &str) -> Result<OrderSnapshot> {
        self.gateway.get_order(order_id).await
    }

    fn purge_expired(&self) {
        let ttl = Duration::from_secs(self.config.idempotency_ttl_secs);
        self.in_flight
            .retain(|_, slot| slot.created.elapsed() < ttl);
    }
}

fn is_ambiguous(error: &SentraError) -> bool {
    match error {
        SentraError::MaxRetriesExceeded { .. } => true,
        SentraError::Http(e) => e.is_timeout(),
        SentraError::ServiceUnavailable(_) => false,
        _ => false,
    }
}
