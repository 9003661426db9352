//! WebSocket transport over tokio-tungstenite.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::domain::RealtimeEvent;
use crate::error::{Result, SentraError};
use crate::session::Credential;
use crate::transport::realtime::{Inbound, RealtimeSession, RealtimeTransport};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SUBSCRIBE_ACK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct WsTransport {
    ws_url: String,
}

impl WsTransport {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
        }
    }
}

#[async_trait]
impl RealtimeTransport for WsTransport {
    async fn connect(&self, credential: &Credential) -> Result<Box<dyn RealtimeSession>> {
        let mut request = self
            .ws_url
            .as_str()
            .into_client_request()
            .map_err(|e| SentraError::WebSocket(format!("invalid WS URL: {}", e)))?;

        let bearer = format!("Bearer {}", credential.token());
        request.headers_mut().insert(
            "Authorization",
            bearer
                .parse()
                .map_err(|_| SentraError::WebSocket("invalid bearer header".to_string()))?,
        );

        let connect = connect_async(request);
        let (stream, response) = tokio::time::timeout(CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| SentraError::WebSocket("connect timed out".to_string()))?
            .map_err(|e| SentraError::WebSocket(format!("connect failed: {}", e)))?;

        debug!(status = %response.status(), "WebSocket connected");

        Ok(Box::new(WsSession { stream }))
    }
}

struct WsSession {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl RealtimeSession for WsSession {
    async fn subscribe(&mut self, topic: &str) -> Result<()> {
        let frame = json!({
            "op": "subscribe",
            "topic": topic,
        });
        self.stream
            .send(Message::Text(frame.to_string().into()))
            .await
            .map_err(|e| SentraError::WebSocket(format!("subscribe send failed: {}", e)))?;

        // Wait for the ack frame, passing through nothing else. The server
        // does not interleave events before acking a subscribe.
        let ack = tokio::time::timeout(SUBSCRIBE_ACK_TIMEOUT, self.stream.next())
            .await
            .map_err(|_| SentraError::WebSocket(format!("subscribe ack timed out: {}", topic)))?;

        match ack {
            Some(Ok(Message::Text(text))) => {
                let value: serde_json::Value = serde_json::from_str(&text)?;
                if value.get("op").and_then(|v| v.as_str()) == Some("subscribed") {
                    debug!(topic, "Subscription acknowledged");
                    Ok(())
                } else if value.get("op").and_then(|v| v.as_str()) == Some("error") {
                    let reason = value
                        .get("message")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown");
                    Err(SentraError::WebSocket(format!(
                        "subscribe rejected for {}: {}",
                        topic, reason
                    )))
                } else {
                    Err(SentraError::WebSocket(format!(
                        "unexpected frame while awaiting subscribe ack for {}",
                        topic
                    )))
                }
            }
            Some(Ok(other)) => Err(SentraError::WebSocket(format!(
                "unexpected non-text frame awaiting ack: {:?}",
                other
            ))),
            Some(Err(e)) => Err(SentraError::WebSocket(format!("stream error: {}", e))),
            None => Err(SentraError::WebSocket(
                "stream closed during subscribe".to_string(),
            )),
        }
    }

    async fn next_event(&mut self) -> Result<Option<Inbound>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<RealtimeEvent>(&text) {
                        Ok(event) => return Ok(Some(Inbound::Event(event))),
                        Err(e) => {
                            // Unknown frame types are logged and skipped, not fatal.
                            warn!(error = %e, "Unparseable realtime frame, skipping");
                        }
                    }
                }
                Some(Ok(Message::Pong(_))) => return Ok(Some(Inbound::Pong)),
                Some(Ok(Message::Ping(payload))) => {
                    self.stream
                        .send(Message::Pong(payload))
                        .await
                        .map_err(|e| SentraError::WebSocket(format!("pong failed: {}", e)))?;
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Server closed WebSocket");
                    return Ok(None);
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(SentraError::WebSocket(format!("stream error: {}", e)));
                }
                None => return Ok(None),
            }
        }
    }

    async fn ping(&mut self) -> Result<()> {
        self.stream
            .send(Message::Ping(Vec::new().into()))
            .await
            .map_err(|e| SentraError::WebSocket(format!("ping failed: {}", e)))
    }

    async fn close(&mut self) {
        let _ = self.stream.send(Message::Close(None)).await;
    }
}
