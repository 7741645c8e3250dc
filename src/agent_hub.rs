// ABOUTME: Single-bot WebSocket control plane — at most one live agent connection process-wide
// ABOUTME: Runs read/write pumps with ping/pong liveness and dispatches frames by type

use anyhow::{anyhow, Result};
use axum::extract::ws::{Message, WebSocket};
use chrono::{DateTime, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;
use tokio::time::timeout;

use crate::protocol::{Frame, FrameType};

/// Outbound queue depth per agent connection
const SEND_BUFFER: usize = 256;
/// Read deadline, refreshed by any inbound frame (incl. pongs)
const READ_WAIT: Duration = Duration::from_secs(600);
/// Per-message write deadline
const WRITE_WAIT: Duration = Duration::from_secs(10);
/// Interval between server-originated pings
const PING_PERIOD: Duration = Duration::from_secs(30);
/// Maximum accepted frame size
const MAX_FRAME_BYTES: usize = 512 * 1024;

/// Lifecycle events emitted by the hub's serialiser task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    Connected { agent_id: String },
    Disconnected { agent_id: String },
}

/// The single live agent connection. Cloning clones the queue handle, not the
/// socket; the hub's serialiser task is the sole owner of the installed cell.
#[derive(Clone)]
pub struct AgentConnection {
    pub id: String,
    outbound: mpsc::Sender<String>,
    reader: AbortHandle,
    pub connected_at: DateTime<Utc>,
}

impl AgentConnection {
    /// Tear down the socket tasks behind this connection. Aborting the read
    /// pump drops its queue handle, so once the hub's copy is dropped too the
    /// write pump observes the closed queue and emits a close frame.
    fn shutdown(&self) {
        self.reader.abort();
    }
}

/// Callback invoked for res/stream frames: (agent_id, frame).
pub type ResponseHandler = Arc<dyn Fn(&str, Frame) + Send + Sync>;
/// Callback invoked for approval_request frames:
/// (agent_id, request_id, tool_name, input).
pub type ApprovalHandler = Arc<dyn Fn(&str, &str, &str, serde_json::Value) + Send + Sync>;

/// Single-bot hub. A new successful registration displaces the previous
/// connection: its send queue is closed and its socket shut down before the
/// new one is installed.
pub struct AgentHub {
    current: RwLock<Option<AgentConnection>>,
    register_tx: mpsc::Sender<AgentConnection>,
    unregister_tx: mpsc::Sender<String>,
    events: broadcast::Sender<AgentEvent>,
    response_handler: RwLock<Option<ResponseHandler>>,
    approval_handler: RwLock<Option<ApprovalHandler>>,
}

impl AgentHub {
    /// Create the hub and spawn its serialiser task.
    pub fn new() -> Arc<Self> {
        let (register_tx, register_rx) = mpsc::channel(16);
        let (unregister_tx, unregister_rx) = mpsc::channel(16);
        let (events, _) = broadcast::channel(64);

        let hub = Arc::new(Self {
            current: RwLock::new(None),
            register_tx,
            unregister_tx,
            events,
            response_handler: RwLock::new(None),
            approval_handler: RwLock::new(None),
        });

        tokio::spawn(Arc::clone(&hub).run(register_rx, unregister_rx));
        hub
    }

    /// Serialiser task: the only mutator of the connection cell, so
    /// displacement is sequential and observable via lifecycle events.
    async fn run(
        self: Arc<Self>,
        mut register_rx: mpsc::Receiver<AgentConnection>,
        mut unregister_rx: mpsc::Receiver<String>,
    ) {
        loop {
            tokio::select! {
                conn = register_rx.recv() => {
                    let Some(conn) = conn else { break };
                    let new_id = conn.id.clone();
                    let displaced = {
                        let mut current = self.current.write().expect("agent cell poisoned");
                        current.replace(conn)
                    };
                    if let Some(old) = displaced {
                        tracing::info!(old_agent = %old.id, new_agent = %new_id, "Displacing agent connection");
                        // Abort the old read pump so its queue handle drops;
                        // with our copy gone too the write pump sees the
                        // closed queue, emits a close frame, and exits.
                        old.shutdown();
                        let old_id = old.id.clone();
                        drop(old);
                        let _ = self.events.send(AgentEvent::Disconnected { agent_id: old_id });
                    }
                    tracing::info!(agent_id = %new_id, "Agent connected");
                    let _ = self.events.send(AgentEvent::Connected { agent_id: new_id });
                }
                id = unregister_rx.recv() => {
                    let Some(id) = id else { break };
                    // Remove only if still the registered connection; a stale
                    // unregister after displacement is a no-op.
                    let removed = {
                        let mut current = self.current.write().expect("agent cell poisoned");
                        match current.as_ref() {
                            Some(c) if c.id == id => current.take(),
                            _ => None,
                        }
                    };
                    if removed.is_some() {
                        tracing::info!(agent_id = %id, "Agent disconnected");
                        let _ = self.events.send(AgentEvent::Disconnected { agent_id: id });
                    }
                }
            }
        }
    }

    /// Subscribe to connect/disconnect lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.current
            .read()
            .expect("agent cell poisoned")
            .is_some()
    }

    /// Snapshot of the single live agent, if any.
    pub fn the_agent(&self) -> Option<AgentConnection> {
        self.current.read().expect("agent cell poisoned").clone()
    }

    /// Legacy enumeration shim: zero or one ID.
    pub fn agent_ids(&self) -> Vec<String> {
        self.the_agent().map(|c| c.id).into_iter().collect()
    }

    /// Encode and enqueue a frame to the bot. Non-blocking: a saturated queue
    /// is a contract violation surfaced to the caller, never silently dropped.
    pub fn send(&self, frame: &Frame) -> Result<()> {
        let conn = self
            .the_agent()
            .ok_or_else(|| anyhow!("agent not connected"))?;
        let text = serde_json::to_string(frame)?;
        conn.outbound.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => anyhow!("agent send buffer full"),
            mpsc::error::TrySendError::Closed(_) => anyhow!("agent not connected"),
        })
    }

    /// Legacy per-agent send shim: always resolves to the single live agent.
    pub fn send_to_agent(&self, agent_id: &str, frame: &Frame) -> Result<()> {
        if let Some(current) = self.the_agent() {
            if current.id != agent_id {
                tracing::debug!(
                    requested = %agent_id,
                    active = %current.id,
                    "Resolving legacy agent ID to the active agent"
                );
            }
        }
        self.send(frame)
    }

    /// Answer a pending approval_request.
    pub fn send_approval_response(
        &self,
        agent_id: &str,
        request_id: &str,
        approved: bool,
    ) -> Result<()> {
        self.send_to_agent(agent_id, &Frame::approval_response(request_id, approved))
    }

    /// Install the res/stream frame callback (the router's response path).
    pub fn set_response_handler(&self, handler: ResponseHandler) {
        *self
            .response_handler
            .write()
            .expect("handler lock poisoned") = Some(handler);
    }

    /// Install the approval_request callback.
    pub fn set_approval_handler(&self, handler: ApprovalHandler) {
        *self
            .approval_handler
            .write()
            .expect("handler lock poisoned") = Some(handler);
    }

    /// Entry point for an upgraded agent WebSocket. Spawns the pumps,
    /// registers the connection, awaits the read pump, then unregisters.
    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket, agent_id: String) {
        let (outbound_tx, outbound_rx) = mpsc::channel::<String>(SEND_BUFFER);
        let connected_at = Utc::now();

        let (sink, stream) = socket.split();
        let writer = tokio::spawn(write_pump(sink, outbound_rx));
        let reader = tokio::spawn({
            let hub = Arc::clone(&self);
            let agent_id = agent_id.clone();
            let outbound = outbound_tx.clone();
            async move {
                hub.read_pump(stream, &agent_id, connected_at, outbound)
                    .await;
            }
        });

        let conn = AgentConnection {
            id: agent_id.clone(),
            outbound: outbound_tx,
            reader: reader.abort_handle(),
            connected_at,
        };
        if self.register_tx.send(conn).await.is_err() {
            tracing::error!(agent_id = %agent_id, "Agent hub serialiser is gone");
            reader.abort();
            writer.abort();
            return;
        }

        // Resolves on socket close, read error, deadline, or displacement.
        let _ = reader.await;
        let _ = self.unregister_tx.send(agent_id).await;
        // Both queue handles are gone once the hub drops its connection; wait
        // for the write pump to flush the close frame.
        let _ = timeout(WRITE_WAIT, writer).await;
    }

    /// Read pump: applies the read deadline, caps frame size, decodes JSON
    /// frames, and dispatches by frame type. Any read error is terminal.
    async fn read_pump(
        &self,
        mut stream: SplitStream<WebSocket>,
        agent_id: &str,
        connected_at: DateTime<Utc>,
        outbound: mpsc::Sender<String>,
    ) {
        loop {
            let msg = match timeout(READ_WAIT, stream.next()).await {
                Err(_) => {
                    tracing::warn!(agent_id = %agent_id, "Agent read deadline expired");
                    return;
                }
                Ok(None) => return,
                Ok(Some(Err(e))) => {
                    tracing::debug!(agent_id = %agent_id, error = %e, "Agent read error");
                    return;
                }
                Ok(Some(Ok(msg))) => msg,
            };

            match msg {
                Message::Text(text) => {
                    if text.len() > MAX_FRAME_BYTES {
                        tracing::warn!(
                            agent_id = %agent_id,
                            len = text.len(),
                            "Agent frame exceeds size cap, closing"
                        );
                        return;
                    }
                    let frame: Frame = match serde_json::from_str(text.as_str()) {
                        Ok(f) => f,
                        Err(e) => {
                            tracing::warn!(agent_id = %agent_id, error = %e, "Dropping malformed agent frame");
                            continue;
                        }
                    };
                    self.dispatch(agent_id, connected_at, &outbound, frame);
                }
                Message::Close(_) => return,
                // Pongs (and any other traffic) refresh the read deadline by
                // restarting the timeout above. Pings are answered by axum.
                Message::Pong(_) | Message::Ping(_) | Message::Binary(_) => {}
            }
        }
    }

    fn dispatch(
        &self,
        agent_id: &str,
        connected_at: DateTime<Utc>,
        outbound: &mpsc::Sender<String>,
        frame: Frame,
    ) {
        match frame.frame_type {
            FrameType::Res | FrameType::Stream => {
                let handler = self
                    .response_handler
                    .read()
                    .expect("handler lock poisoned")
                    .clone();
                match handler {
                    Some(h) => h(agent_id, frame),
                    None => tracing::debug!(agent_id = %agent_id, "No response handler installed"),
                }
            }
            FrameType::ApprovalRequest => {
                let handler = self
                    .approval_handler
                    .read()
                    .expect("handler lock poisoned")
                    .clone();
                let Some(h) = handler else {
                    tracing::debug!(agent_id = %agent_id, "No approval handler installed");
                    return;
                };
                let request_id = frame.id.clone().unwrap_or_default();
                let params = frame.params.unwrap_or(serde_json::Value::Null);
                let tool = params
                    .get("tool")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let input = params
                    .get("input")
                    .cloned()
                    .unwrap_or(serde_json::Value::Null);
                h(agent_id, &request_id, &tool, input);
            }
            FrameType::Req => {
                let reply = handle_inline_request(agent_id, connected_at, &frame);
                match serde_json::to_string(&reply) {
                    Ok(text) => {
                        if outbound.try_send(text).is_err() {
                            tracing::warn!(agent_id = %agent_id, "Failed to enqueue inline reply");
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "Failed to serialize inline reply"),
                }
            }
            // Extension point; currently discarded
            FrameType::Event => {
                tracing::debug!(agent_id = %agent_id, "Discarding agent event frame");
            }
            FrameType::ApprovalResponse => {}
        }
    }
}

#[cfg(test)]
impl AgentHub {
    /// Install a connection backed by plain channels, standing in for the
    /// socket pumps. The spawned task holds a queue handle the way the real
    /// read pump does, so displacement must go through the abort path.
    pub(crate) async fn register_stub(
        self: &Arc<Self>,
        id: &str,
        capacity: usize,
    ) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(capacity);
        let reader = tokio::spawn({
            let tx = tx.clone();
            async move {
                let _tx = tx;
                std::future::pending::<()>().await;
            }
        });
        self.register_tx
            .send(AgentConnection {
                id: id.to_string(),
                outbound: tx,
                reader: reader.abort_handle(),
                connected_at: Utc::now(),
            })
            .await
            .expect("hub serialiser gone");
        // Let the serialiser task install the connection
        tokio::task::yield_now().await;
        rx
    }
}

/// Answer bot-originated requests the server handles inline.
fn handle_inline_request(agent_id: &str, connected_at: DateTime<Utc>, frame: &Frame) -> Frame {
    match frame.method.as_deref() {
        Some("ping") => Frame::response(
            frame.id.clone(),
            serde_json::json!({ "pong": true, "time": Utc::now().timestamp() }),
        ),
        Some("status") => {
            let uptime = (Utc::now() - connected_at).num_seconds().max(0);
            Frame::response(
                frame.id.clone(),
                serde_json::json!({
                    "agent_id": agent_id,
                    "connected": true,
                    "uptime_sec": uptime,
                }),
            )
        }
        other => Frame::error_response(
            frame.id.clone(),
            format!("unknown method: {}", other.unwrap_or("")),
        ),
    }
}

/// Write pump: serialises all outbound bytes for one socket, fires pings, and
/// emits a close frame when the queue closes.
async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<String>,
) {
    let mut ping = tokio::time::interval(PING_PERIOD);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // Consume the immediate first tick
    ping.tick().await;

    loop {
        tokio::select! {
            msg = outbound_rx.recv() => {
                let Some(text) = msg else {
                    // Queue closed: connection was removed or displaced
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                };
                match timeout(WRITE_WAIT, sink.send(Message::Text(text.into()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::debug!(error = %e, "Agent write error");
                        return;
                    }
                    Err(_) => {
                        tracing::warn!("Agent write deadline expired");
                        return;
                    }
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

    async fn register_test_conn(
        hub: &Arc<AgentHub>,
        id: &str,
        capacity: usize,
    ) -> mpsc::Receiver<String> {
        hub.register_stub(id, capacity).await
    }

    async fn wait_event(rx: &mut broadcast::Receiver<AgentEvent>) -> AgentEvent {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event wait timed out")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_register_single_agent() {
        let hub = AgentHub::new();
        let mut events = hub.subscribe_events();
        assert!(!hub.is_connected());

        let _rx = register_test_conn(&hub, "agent-a", 4).await;

        assert_eq!(
            wait_event(&mut events).await,
            AgentEvent::Connected {
                agent_id: "agent-a".into()
            }
        );
        assert!(hub.is_connected());
        assert_eq!(hub.the_agent().unwrap().id, "agent-a");
        assert_eq!(hub.agent_ids(), vec!["agent-a".to_string()]);
    }

    #[tokio::test]
    async fn test_displacement_order_and_queue_close() {
        let hub = AgentHub::new();
        let mut events = hub.subscribe_events();

        let mut rx_a = register_test_conn(&hub, "agent-a", 4).await;
        let _rx_b = register_test_conn(&hub, "agent-b", 4).await;

        assert_eq!(
            wait_event(&mut events).await,
            AgentEvent::Connected {
                agent_id: "agent-a".into()
            }
        );
        assert_eq!(
            wait_event(&mut events).await,
            AgentEvent::Disconnected {
                agent_id: "agent-a".into()
            }
        );
        assert_eq!(
            wait_event(&mut events).await,
            AgentEvent::Connected {
                agent_id: "agent-b".into()
            }
        );

        // The displaced connection's send queue closes even though its socket
        // tasks hold their own queue handles; the hub aborts them.
        let closed = timeout(Duration::from_secs(1), rx_a.recv()).await;
        assert_eq!(closed.expect("displaced queue never closed"), None);
        assert_eq!(hub.the_agent().unwrap().id, "agent-b");
    }

    #[tokio::test]
    async fn test_stale_unregister_is_noop() {
        let hub = AgentHub::new();
        let _rx_a = register_test_conn(&hub, "agent-a", 4).await;
        let _rx_b = register_test_conn(&hub, "agent-b", 4).await;

        // A's pump exiting after displacement must not remove B
        hub.unregister_tx.send("agent-a".to_string()).await.unwrap();
        tokio::task::yield_now().await;

        assert!(hub.is_connected());
        assert_eq!(hub.the_agent().unwrap().id, "agent-b");
    }

    #[tokio::test]
    async fn test_unregister_current() {
        let hub = AgentHub::new();
        let mut events = hub.subscribe_events();
        let _rx = register_test_conn(&hub, "agent-a", 4).await;
        assert_eq!(
            wait_event(&mut events).await,
            AgentEvent::Connected {
                agent_id: "agent-a".into()
            }
        );

        hub.unregister_tx.send("agent-a".to_string()).await.unwrap();
        assert_eq!(
            wait_event(&mut events).await,
            AgentEvent::Disconnected {
                agent_id: "agent-a".into()
            }
        );
        assert!(!hub.is_connected());
        assert!(hub.agent_ids().is_empty());
    }

    #[tokio::test]
    async fn test_send_not_connected() {
        let hub = AgentHub::new();
        let err = hub
            .send(&Frame::request("r-1", "chat", json!({})))
            .unwrap_err();
        assert!(err.to_string().contains("agent not connected"));
    }

    #[tokio::test]
    async fn test_send_delivers_json() {
        let hub = AgentHub::new();
        let mut rx = register_test_conn(&hub, "agent-a", 4).await;

        hub.send(&Frame::request("r-1", "chat", json!({"message": "hi"})))
            .unwrap();
        let text = rx.recv().await.unwrap();
        let frame: Frame = serde_json::from_str(&text).unwrap();
        assert_eq!(frame.frame_type, FrameType::Req);
        assert_eq!(frame.id.as_deref(), Some("r-1"));
    }

    #[tokio::test]
    async fn test_send_buffer_full() {
        let hub = AgentHub::new();
        let _rx = register_test_conn(&hub, "agent-a", 1).await;

        hub.send(&Frame::request("r-1", "chat", json!({}))).unwrap();
        let err = hub
            .send(&Frame::request("r-2", "chat", json!({})))
            .unwrap_err();
        assert!(err.to_string().contains("send buffer full"));
    }

    #[tokio::test]
    async fn test_send_to_agent_resolves_to_active() {
        let hub = AgentHub::new();
        let mut rx = register_test_conn(&hub, "agent-b", 4).await;

        // Legacy callers may name a stale agent; the single bot still gets it
        hub.send_to_agent("agent-a", &Frame::request("r-1", "chat", json!({})))
            .unwrap();
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_approval_response_frame() {
        let hub = AgentHub::new();
        let mut rx = register_test_conn(&hub, "agent-a", 4).await;

        hub.send_approval_response("agent-a", "req-7", false).unwrap();
        let text = rx.recv().await.unwrap();
        let frame: Frame = serde_json::from_str(&text).unwrap();
        assert_eq!(frame.frame_type, FrameType::ApprovalResponse);
        assert_eq!(frame.payload.unwrap()["approved"], false);
    }

    #[test]
    fn test_inline_ping_reply() {
        let req = Frame::request("p-1", "ping", json!({}));
        let reply = handle_inline_request("agent-a", Utc::now(), &req);
        assert_eq!(reply.ok, Some(true));
        assert_eq!(reply.id.as_deref(), Some("p-1"));
        assert_eq!(reply.payload.as_ref().unwrap()["pong"], true);
        assert!(reply.payload.unwrap()["time"].is_i64());
    }

    #[test]
    fn test_inline_status_reply() {
        let connected_at = Utc::now() - chrono::Duration::seconds(42);
        let req = Frame::request("s-1", "status", json!({}));
        let reply = handle_inline_request("agent-a", connected_at, &req);
        let payload = reply.payload.unwrap();
        assert_eq!(payload["agent_id"], "agent-a");
        assert_eq!(payload["connected"], true);
        assert!(payload["uptime_sec"].as_i64().unwrap() >= 42);
    }

    #[test]
    fn test_inline_unknown_method() {
        let req = Frame::request("u-1", "frobnicate", json!({}));
        let reply = handle_inline_request("agent-a", Utc::now(), &req);
        assert_eq!(reply.ok, Some(false));
        assert_eq!(
            reply.error.as_deref(),
            Some("unknown method: frobnicate")
        );
    }

    #[tokio::test]
    async fn test_response_handler_dispatch() {
        let hub = AgentHub::new();
        let (seen_tx, mut seen_rx) = mpsc::channel::<(String, Frame)>(4);
        hub.set_response_handler(Arc::new(move |agent_id, frame| {
            let _ = seen_tx.try_send((agent_id.to_string(), frame));
        }));

        let (outbound, _outbound_rx) = mpsc::channel(4);
        let frame = Frame {
            frame_type: FrameType::Res,
            id: Some("r-1".into()),
            method: None,
            params: None,
            ok: Some(true),
            payload: Some(json!({"text": "hi"})),
            error: None,
        };
        hub.dispatch("agent-a", Utc::now(), &outbound, frame);

        let (agent_id, frame) = seen_rx.recv().await.unwrap();
        assert_eq!(agent_id, "agent-a");
        assert_eq!(frame.id.as_deref(), Some("r-1"));
    }

    #[tokio::test]
    async fn test_approval_handler_dispatch() {
        let hub = AgentHub::new();
        let (seen_tx, mut seen_rx) = mpsc::channel::<(String, String, serde_json::Value)>(4);
        hub.set_approval_handler(Arc::new(move |_agent, request_id, tool, input| {
            let _ = seen_tx.try_send((request_id.to_string(), tool.to_string(), input));
        }));

        let (outbound, _outbound_rx) = mpsc::channel(4);
        let frame = Frame {
            frame_type: FrameType::ApprovalRequest,
            id: Some("apr-1".into()),
            method: None,
            params: Some(json!({"tool": "shell", "input": {"cmd": "ls"}})),
            ok: None,
            payload: None,
            error: None,
        };
        hub.dispatch("agent-a", Utc::now(), &outbound, frame);

        let (request_id, tool, input) = seen_rx.recv().await.unwrap();
        assert_eq!(request_id, "apr-1");
        assert_eq!(tool, "shell");
        assert_eq!(input["cmd"], "ls");
    }
}
