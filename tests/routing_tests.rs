// ABOUTME: Integration tests for the binding store and channel-to-agent router
// ABOUTME: Covers binding uniqueness, disabled bindings, persistence, and error dispositions

use anyhow::Result;
use async_trait::async_trait;
use botgate::agent_hub::AgentHub;
use botgate::bindings::{Binding, BindingStore};
use botgate::channel::{ChannelAdapter, ChannelRegistry, InboundHandler, InboundMessage, OutboundMessage};
use botgate::router::Router;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct RecordingAdapter {
    sent: Mutex<Vec<OutboundMessage>>,
}

impl RecordingAdapter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ChannelAdapter for RecordingAdapter {
    fn id(&self) -> &'static str {
        "mock"
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn send(&self, out: OutboundMessage) -> Result<()> {
        self.sent.lock().unwrap().push(out);
        Ok(())
    }

    fn set_handler(&self, _handler: InboundHandler) {}
}

fn router_fixture() -> (Arc<Router>, Arc<BindingStore>, Arc<ChannelRegistry>) {
    let hub = AgentHub::new();
    let bindings = Arc::new(BindingStore::new());
    let channels = Arc::new(ChannelRegistry::new());
    channels.register(RecordingAdapter::new());
    let router = Router::new(hub, Arc::clone(&bindings), Arc::clone(&channels), Duration::from_millis(200));
    router.install();
    (router, bindings, channels)
}

fn inbound(channel_id: &str) -> InboundMessage {
    InboundMessage {
        channel_type: "mock".to_string(),
        channel_id: channel_id.to_string(),
        message_id: "m1".to_string(),
        text: "hello".to_string(),
        sender_id: "u1".to_string(),
        sender_name: "User One".to_string(),
        reply_to_id: None,
        thread_id: None,
        raw: None,
    }
}

#[tokio::test]
async fn test_route_without_binding_fails() {
    let (router, _bindings, _channels) = router_fixture();
    let err = router.route(inbound("chan-1")).await.unwrap_err();
    assert!(err.to_string().contains("no agent bound"));
    assert_eq!(router.pending_count(), 0);
}

#[tokio::test]
async fn test_route_disabled_binding_invisible() {
    let (router, bindings, _channels) = router_fixture();
    let mut binding = Binding::new("mock", "chan-1", "org-1");
    binding.enabled = false;
    bindings.add(binding).unwrap();

    let err = router.route(inbound("chan-1")).await.unwrap_err();
    assert!(err.to_string().contains("no agent bound"));
}

#[tokio::test]
async fn test_route_without_agent_fails() {
    let (router, bindings, _channels) = router_fixture();
    bindings.add(Binding::new("mock", "chan-1", "org-1")).unwrap();

    let err = router.route(inbound("chan-1")).await.unwrap_err();
    assert_eq!(err.to_string(), "agent not connected");
    assert_eq!(router.pending_count(), 0);
}

#[tokio::test]
async fn test_duplicate_binding_rejected() {
    let (_router, bindings, _channels) = router_fixture();
    bindings.add(Binding::new("mock", "chan-1", "org-1")).unwrap();
    let err = bindings
        .add(Binding::new("mock", "chan-1", "org-2"))
        .unwrap_err();
    assert!(err.to_string().contains("already exists"));
    assert_eq!(bindings.count(), 1);
}

#[tokio::test]
async fn test_same_channel_id_across_types_allowed() {
    let (_router, bindings, _channels) = router_fixture();
    bindings.add(Binding::new("mock", "chan-1", "org-1")).unwrap();
    bindings.add(Binding::new("other", "chan-1", "org-1")).unwrap();
    assert_eq!(bindings.count(), 2);
}

#[tokio::test]
async fn test_binding_persistence_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let store = BindingStore::with_dir(dir.path());
    let mut binding = Binding::new("telegram", "12345", "org-1");
    binding.agent_id = Some("agent-7".to_string());
    let id = binding.id.clone();
    store.add(binding).unwrap();

    // Persistence happens on a background blocking task.
    let file = dir.path().join("bindings.json");
    for _ in 0..50 {
        if file.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(file.exists(), "bindings.json was not written");

    let reloaded = BindingStore::with_dir(dir.path());
    reloaded.load().unwrap();
    let binding = reloaded.get(&id).expect("binding survived restart");
    assert_eq!(binding.channel_type, "telegram");
    assert_eq!(binding.agent_id.as_deref(), Some("agent-7"));
    assert_eq!(
        reloaded.get_by_channel("telegram", "12345").unwrap().id,
        id
    );
}
