// ABOUTME: Realtime hub — fan-out WebSocket broker for browser clients
// ABOUTME: Broadcast and per-user targeting with bounded queues; slow clients are evicted

use anyhow::{anyhow, Result};
use axum::extract::ws::{Message, WebSocket};
use chrono::{DateTime, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Outbound queue depth per client
const SEND_BUFFER: usize = 256;
/// Per-message write deadline
const WRITE_WAIT: Duration = Duration::from_secs(10);
/// Time allowed between pongs from the client
const PONG_WAIT: Duration = Duration::from_secs(60);
/// Ping interval: pongWait * 9 / 10
const PING_PERIOD: Duration = Duration::from_secs(54);
/// Maximum accepted client message size
const MAX_MESSAGE_BYTES: usize = 32 * 1024;

/// Server-originated event delivered to UI clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "userId", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl RealtimeMessage {
    pub fn new(kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            channel: None,
            data,
            timestamp: Utc::now(),
            user_id: None,
        }
    }
}

/// A connected browser client. The outbound cell doubles as the closed flag:
/// `close()` takes the sender, which both marks the client closed and closes
/// the queue so the write pump exits. UI clients are replaceable, so eviction
/// is silent.
pub struct RealtimeClient {
    pub id: String,
    pub user_id: String,
    outbound: RwLock<Option<mpsc::Sender<String>>>,
}

impl RealtimeClient {
    fn new(id: String, user_id: String, outbound: mpsc::Sender<String>) -> Self {
        Self {
            id,
            user_id,
            outbound: RwLock::new(Some(outbound)),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.read().expect("client lock poisoned").is_none()
    }

    /// Enqueue one message. Returns "client closed" once closed and
    /// "send buffer full" on saturation; never panics under concurrent close.
    pub fn send_message(&self, msg: &RealtimeMessage) -> Result<()> {
        let text = serde_json::to_string(msg)?;
        self.send_raw(text)
    }

    fn send_raw(&self, text: String) -> Result<()> {
        let sender = {
            let guard = self.outbound.read().expect("client lock poisoned");
            guard.clone()
        };
        let Some(sender) = sender else {
            return Err(anyhow!("client closed"));
        };
        sender.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => anyhow!("send buffer full"),
            mpsc::error::TrySendError::Closed(_) => anyhow!("client closed"),
        })
    }

    /// Idempotent close: exactly one queue-close across concurrent callers.
    pub fn close(&self) {
        let taken = {
            let mut guard = self.outbound.write().expect("client lock poisoned");
            guard.take()
        };
        if taken.is_some() {
            tracing::debug!(client_id = %self.id, "Realtime client closed");
        }
    }
}

/// Handler for client-originated messages, keyed by the `type` field.
pub type ClientCommandHandler =
    Arc<dyn Fn(&Arc<RealtimeClient>, serde_json::Value) + Send + Sync>;

/// Fan-out hub for browser clients.
pub struct RealtimeHub {
    clients: RwLock<HashMap<String, Arc<RealtimeClient>>>,
    handlers: RwLock<HashMap<String, ClientCommandHandler>>,
}

impl RealtimeHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
        })
    }

    /// Install a handler for a client message type (e.g. "rewrite").
    pub fn set_handler(&self, kind: impl Into<String>, handler: ClientCommandHandler) {
        self.handlers
            .write()
            .expect("handlers lock poisoned")
            .insert(kind.into(), handler);
    }

    pub fn register(&self, client: Arc<RealtimeClient>) {
        let mut clients = self.clients.write().expect("clients lock poisoned");
        clients.insert(client.id.clone(), client);
    }

    pub fn unregister(&self, client_id: &str) {
        let removed = {
            let mut clients = self.clients.write().expect("clients lock poisoned");
            clients.remove(client_id)
        };
        if let Some(client) = removed {
            client.close();
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().expect("clients lock poisoned").len()
    }

    /// Deliver to every client. A client with a full queue is evicted — its
    /// queue is closed and it is removed — so one slow client never stalls
    /// the fan-out.
    pub fn broadcast(&self, msg: &RealtimeMessage) {
        self.fan_out(msg, None)
    }

    /// Deliver only to clients owned by `user_id`.
    pub fn broadcast_to_user(&self, user_id: &str, msg: &RealtimeMessage) {
        self.fan_out(msg, Some(user_id))
    }

    fn fan_out(&self, msg: &RealtimeMessage, user_id: Option<&str>) {
        let text = match serde_json::to_string(msg) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize realtime message");
                return;
            }
        };

        let targets: Vec<Arc<RealtimeClient>> = {
            let clients = self.clients.read().expect("clients lock poisoned");
            clients
                .values()
                .filter(|c| user_id.is_none_or(|u| c.user_id == u))
                .cloned()
                .collect()
        };

        let mut evict = Vec::new();
        for client in targets {
            if let Err(e) = client.send_raw(text.clone()) {
                if e.to_string().contains("send buffer full") {
                    tracing::warn!(client_id = %client.id, "Evicting slow realtime client");
                }
                evict.push(client.id.clone());
            }
        }
        for id in evict {
            self.unregister(&id);
        }
    }

    /// Entry point for an upgraded `/ws` connection.
    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket, client_id: String, user_id: String) {
        let (outbound_tx, outbound_rx) = mpsc::channel::<String>(SEND_BUFFER);
        let client = Arc::new(RealtimeClient::new(client_id.clone(), user_id, outbound_tx));
        self.register(Arc::clone(&client));
        tracing::debug!(client_id = %client_id, count = self.client_count(), "Realtime client connected");

        let (sink, stream) = socket.split();
        let writer = tokio::spawn(client_write_pump(sink, outbound_rx));

        self.read_pump(stream, &client).await;

        self.unregister(&client_id);
        writer.abort();
        tracing::debug!(client_id = %client_id, count = self.client_count(), "Realtime client disconnected");
    }

    async fn read_pump(&self, mut stream: SplitStream<WebSocket>, client: &Arc<RealtimeClient>) {
        loop {
            let msg = match timeout(PONG_WAIT, stream.next()).await {
                Err(_) => {
                    tracing::debug!(client_id = %client.id, "Realtime client pong deadline expired");
                    return;
                }
                Ok(None) => return,
                Ok(Some(Err(e))) => {
                    tracing::debug!(client_id = %client.id, error = %e, "Realtime read error");
                    return;
                }
                Ok(Some(Ok(msg))) => msg,
            };

            match msg {
                Message::Text(text) => {
                    if text.len() > MAX_MESSAGE_BYTES {
                        tracing::warn!(client_id = %client.id, "Client message exceeds size cap, closing");
                        return;
                    }
                    self.dispatch_client_message(client, text.as_str());
                }
                Message::Close(_) => return,
                Message::Pong(_) | Message::Ping(_) | Message::Binary(_) => {}
            }
        }
    }

    /// Dispatch a client text message by its `type` field. `ping` is built in;
    /// anything else goes through the installed handlers.
    fn dispatch_client_message(&self, client: &Arc<RealtimeClient>, text: &str) {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(client_id = %client.id, error = %e, "Invalid client message");
                return;
            }
        };
        let kind = value.get("type").and_then(|t| t.as_str()).unwrap_or("");

        if kind == "ping" {
            let pong = RealtimeMessage::new("pong", serde_json::json!({}));
            if let Err(e) = client.send_message(&pong) {
                tracing::debug!(client_id = %client.id, error = %e, "Failed to answer client ping");
            }
            return;
        }

        let handler = {
            let handlers = self.handlers.read().expect("handlers lock poisoned");
            handlers.get(kind).cloned()
        };
        match handler {
            Some(h) => h(client, value),
            None => tracing::debug!(client_id = %client.id, kind = %kind, "Unhandled client message type"),
        }
    }
}

async fn client_write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<String>,
) {
    let mut ping = tokio::time::interval(PING_PERIOD);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await;

    loop {
        tokio::select! {
            msg = outbound_rx.recv() => {
                let Some(text) = msg else {
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                };
                match timeout(WRITE_WAIT, sink.send(Message::Text(text.into()))).await {
                    Ok(Ok(())) => {}
                    _ => return,
                }
            }
            _ = ping.tick() => {
                if timeout(WRITE_WAIT, sink.send(Message::Ping(Vec::new().into())))
                    .await
                    .map(|r| r.is_err())
                    .unwrap_or(true)
                {
                    return;
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_client(id: &str, user_id: &str, capacity: usize) -> (Arc<RealtimeClient>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Arc::new(RealtimeClient::new(id.to_string(), user_id.to_string(), tx)),
            rx,
        )
    }

    #[tokio::test]
    async fn test_register_and_count() {
        let hub = RealtimeHub::new();
        let (client, _rx) = test_client("c1", "u1", 4);
        hub.register(client);
        assert_eq!(hub.client_count(), 1);
        hub.unregister("c1");
        assert_eq!(hub.client_count(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_clients() {
        let hub = RealtimeHub::new();
        let (c1, mut rx1) = test_client("c1", "u1", 4);
        let (c2, mut rx2) = test_client("c2", "u2", 4);
        hub.register(c1);
        hub.register(c2);

        hub.broadcast(&RealtimeMessage::new("notice", json!({"n": 1})));

        let m1: serde_json::Value = serde_json::from_str(&rx1.recv().await.unwrap()).unwrap();
        let m2: serde_json::Value = serde_json::from_str(&rx2.recv().await.unwrap()).unwrap();
        assert_eq!(m1["type"], "notice");
        assert_eq!(m2["data"]["n"], 1);
    }

    #[tokio::test]
    async fn test_broadcast_to_user_filters() {
        let hub = RealtimeHub::new();
        let (c1, mut rx1) = test_client("c1", "alice", 4);
        let (c2, mut rx2) = test_client("c2", "bob", 4);
        hub.register(c1);
        hub.register(c2);

        hub.broadcast_to_user("alice", &RealtimeMessage::new("dm", json!({})));

        assert!(rx1.recv().await.is_some());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slow_client_evicted_on_broadcast() {
        let hub = RealtimeHub::new();
        let (slow, _slow_rx) = test_client("slow", "u1", 1);
        let (fast, mut fast_rx) = test_client("fast", "u2", 4);
        hub.register(slow);
        hub.register(fast);

        // Fill the slow client's queue, then broadcast twice
        hub.broadcast(&RealtimeMessage::new("m1", json!({})));
        hub.broadcast(&RealtimeMessage::new("m2", json!({})));

        assert_eq!(hub.client_count(), 1);
        assert!(hub.clients.read().unwrap().contains_key("fast"));
        // The healthy client received both messages
        assert!(fast_rx.recv().await.is_some());
        assert!(fast_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_send_after_close_returns_closed_error() {
        let (client, mut rx) = test_client("c1", "u1", 4);
        client.close();
        let err = client
            .send_message(&RealtimeMessage::new("x", json!({})))
            .unwrap_err();
        assert!(err.to_string().contains("client closed"));
        // Queue was closed exactly once
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_close_idempotent_under_concurrency() {
        let (client, mut rx) = test_client("c1", "u1", 4);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let c = Arc::clone(&client);
            handles.push(tokio::spawn(async move { c.close() }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(client.is_closed());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_send_buffer_full_error() {
        let (client, _rx) = test_client("c1", "u1", 1);
        client
            .send_message(&RealtimeMessage::new("m1", json!({})))
            .unwrap();
        let err = client
            .send_message(&RealtimeMessage::new("m2", json!({})))
            .unwrap_err();
        assert!(err.to_string().contains("send buffer full"));
    }

    #[tokio::test]
    async fn test_ping_handled_builtin() {
        let hub = RealtimeHub::new();
        let (client, mut rx) = test_client("c1", "u1", 4);
        hub.register(Arc::clone(&client));

        hub.dispatch_client_message(&client, r#"{"type":"ping"}"#);

        let reply: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(reply["type"], "pong");
    }

    #[tokio::test]
    async fn test_installed_handler_dispatch() {
        let hub = RealtimeHub::new();
        let (client, _rx) = test_client("c1", "u1", 4);
        let (seen_tx, mut seen_rx) = mpsc::channel::<serde_json::Value>(1);
        hub.set_handler(
            "rewrite",
            Arc::new(move |_client, value| {
                let _ = seen_tx.try_send(value);
            }),
        );

        hub.dispatch_client_message(&client, r#"{"type":"rewrite","text":"hello"}"#);
        let seen = seen_rx.recv().await.unwrap();
        assert_eq!(seen["text"], "hello");
    }

    #[tokio::test]
    async fn test_invalid_client_json_dropped() {
        let hub = RealtimeHub::new();
        let (client, mut rx) = test_client("c1", "u1", 4);
        hub.dispatch_client_message(&client, "not json");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_message_wire_shape() {
        let mut msg = RealtimeMessage::new("agent_status", json!({"state": "connected"}));
        msg.user_id = Some("alice".into());
        let text = serde_json::to_string(&msg).unwrap();
        assert!(text.contains("\"type\":\"agent_status\""));
        assert!(text.contains("\"userId\":\"alice\""));
        assert!(!text.contains("\"channel\""));
    }
}
