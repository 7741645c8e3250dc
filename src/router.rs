// ABOUTME: Channel-to-agent routing engine with request/response correlation
// ABOUTME: Forwards inbound channel messages to the bot and replies on the originating channel

use anyhow::{anyhow, bail, Context, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::agent_hub::AgentHub;
use crate::bindings::BindingStore;
use crate::channel::{ChannelRegistry, InboundMessage, OutboundMessage};
use crate::protocol::Frame;

/// Default deadline for the matching agent response.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Routes inbound channel messages to the bot agent and correlates responses.
pub struct Router {
    hub: Arc<AgentHub>,
    bindings: Arc<BindingStore>,
    channels: Arc<ChannelRegistry>,
    /// requestID -> capacity-1 response channel
    pending: Mutex<HashMap<String, mpsc::Sender<Frame>>>,
    timeout: Duration,
}

/// Removes the pending entry when the routing future exits — normally,
/// on timeout, or on caller cancellation.
struct PendingGuard<'a> {
    router: &'a Router,
    request_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut pending = self.router.pending.lock().expect("pending lock poisoned");
        pending.remove(&self.request_id);
    }
}

impl Router {
    pub fn new(
        hub: Arc<AgentHub>,
        bindings: Arc<BindingStore>,
        channels: Arc<ChannelRegistry>,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            hub,
            bindings,
            channels,
            pending: Mutex::new(HashMap::new()),
            timeout,
        })
    }

    /// Wire this router's response path into the agent hub. The hub holds a
    /// weak reference so ownership stays acyclic.
    pub fn install(self: &Arc<Self>) {
        let weak: Weak<Router> = Arc::downgrade(self);
        self.hub.set_response_handler(Arc::new(move |_agent_id, frame| {
            if let Some(router) = weak.upgrade() {
                router.handle_agent_response(frame);
            }
        }));
    }

    /// Route one inbound message: resolve the binding, forward a `chat`
    /// request to the bot, await the correlated response under the deadline,
    /// and reply on the originating channel.
    pub async fn route(&self, msg: InboundMessage) -> Result<()> {
        let binding = self
            .bindings
            .get_by_channel(&msg.channel_type, &msg.channel_id)
            .ok_or_else(|| {
                anyhow!("no agent bound for {}:{}", msg.channel_type, msg.channel_id)
            })?;

        if !self.hub.is_connected() {
            bail!("agent not connected");
        }

        let request_id = uuid::Uuid::new_v4().to_string();
        let frame = Frame::request(
            request_id.clone(),
            "chat",
            json!({
                "message": msg.text,
                "channel_type": msg.channel_type,
                "channel_id": msg.channel_id,
                "sender_id": msg.sender_id,
                "sender_name": msg.sender_name,
                "message_id": msg.message_id,
                "reply_to_id": msg.reply_to_id,
                "thread_id": msg.thread_id,
            }),
        );

        let (response_tx, mut response_rx) = mpsc::channel::<Frame>(1);
        {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            pending.insert(request_id.clone(), response_tx);
        }
        let _guard = PendingGuard {
            router: self,
            request_id: request_id.clone(),
        };

        match binding.agent_id.as_deref() {
            Some(agent_id) => self.hub.send_to_agent(agent_id, &frame)?,
            None => self.hub.send(&frame)?,
        }

        tracing::debug!(
            request_id = %request_id,
            channel = %msg.channel_type,
            channel_id = %msg.channel_id,
            "Forwarded message to agent"
        );

        let response = tokio::select! {
            _ = tokio::time::sleep(self.timeout) => {
                bail!("agent response timeout");
            }
            maybe = response_rx.recv() => {
                maybe.ok_or_else(|| anyhow!("agent response timeout"))?
            }
        };

        let text = extract_response_text(&response)?;
        if response.ok == Some(false) {
            tracing::warn!(
                request_id = %request_id,
                error = response.error.as_deref().unwrap_or("unspecified"),
                "Agent reported an error; delivering payload text anyway"
            );
        }
        if text.is_empty() {
            return Ok(());
        }

        let adapter = self
            .channels
            .get(&msg.channel_type)
            .ok_or_else(|| anyhow!("channel adapter not registered: {}", msg.channel_type))?;
        let out = OutboundMessage {
            channel_id: msg.channel_id.clone(),
            text,
            reply_to_id: Some(msg.message_id.clone()),
            thread_id: msg.thread_id.clone(),
            parse_mode: Some("markdown".to_string()),
        };
        adapter
            .send(out)
            .await
            .with_context(|| format!("failed to send reply on {}", msg.channel_type))
    }

    /// Deliver a `res`/`stream` frame to the waiter. Non-blocking: a stale
    /// response after timeout, or a duplicate, is dropped silently.
    pub fn handle_agent_response(&self, frame: Frame) {
        let Some(ref id) = frame.id else {
            tracing::debug!("Dropping agent response without an ID");
            return;
        };
        let waiter = {
            let pending = self.pending.lock().expect("pending lock poisoned");
            pending.get(id).cloned()
        };
        match waiter {
            Some(tx) => {
                let _ = tx.try_send(frame);
            }
            None => {
                tracing::debug!(request_id = %id, "No waiter for agent response (stale?)");
            }
        }
    }

    /// Number of in-flight requests, for diagnostics.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("pending lock poisoned").len()
    }
}

/// Extract the reply text from a response payload.
/// Precedence: plain string, object `text`, object `content`, serialized object.
fn extract_response_text(frame: &Frame) -> Result<String> {
    match frame.payload {
        None => Ok(String::new()),
        Some(Value::String(ref s)) => Ok(s.clone()),
        Some(Value::Object(ref obj)) => {
            if let Some(text) = obj.get("text").and_then(|v| v.as_str()) {
                return Ok(text.to_string());
            }
            if let Some(content) = obj.get("content").and_then(|v| v.as_str()) {
                return Ok(content.to_string());
            }
            serde_json::to_string(obj).context("failed to serialize agent payload")
        }
        Some(ref other) => bail!("unsupported agent payload type: {}", value_kind(other)),
    }
}

fn value_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// =============================================================================
// Tests
// =============================================================================
