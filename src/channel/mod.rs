// ABOUTME: Channel adapter abstraction normalising Telegram/Discord/Slack into one message shape
// ABOUTME: Defines the ChannelAdapter trait, Inbound/OutboundMessage, and the adapter registry

#[cfg(feature = "discord")]
pub mod discord;
#[cfg(feature = "slack")]
pub mod slack;
#[cfg(feature = "telegram")]
pub mod telegram;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A message arriving from an external channel, normalised for the router.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Stable adapter identifier ("telegram", "discord", "slack")
    pub channel_type: String,
    /// Platform-native channel/chat ID
    pub channel_id: String,
    /// Platform-native message ID
    pub message_id: String,
    pub text: String,
    pub sender_id: String,
    pub sender_name: String,
    /// Message this one replies to, when the platform reports it
    pub reply_to_id: Option<String>,
    /// Thread identifier (Slack thread_ts, Telegram topic, Discord thread)
    pub thread_id: Option<String>,
    /// Raw platform payload preserved for adapter-aware features
    pub raw: Option<serde_json::Value>,
}

/// A reply leaving the router toward a channel.
#[derive(Debug, Clone, Default)]
pub struct OutboundMessage {
    pub channel_id: String,
    pub text: String,
    /// Message to reply to (threads the reply where the platform supports it)
    pub reply_to_id: Option<String>,
    pub thread_id: Option<String>,
    /// "markdown" or platform default when unset
    pub parse_mode: Option<String>,
}

/// Callback the router installs on each adapter. Adapters invoke it for every
/// normalised inbound message; the callback owns any further async work.
pub type InboundHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// Contract every channel adapter implements. Protocol quirks (Slack bot-self
/// detection, Discord intents, Telegram thread IDs) stay inside the adapter so
/// the router remains adapter-agnostic.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Stable identifier ("telegram" | "discord" | "slack")
    fn id(&self) -> &'static str;

    /// Connect to the platform and start the receive loop.
    /// Fails with "<platform> token is required" when credentials are absent.
    async fn connect(&self) -> Result<()>;

    /// Cancel the receive loop.
    async fn disconnect(&self) -> Result<()>;

    /// Deliver an outbound message, preserving reply/thread parameters.
    async fn send(&self, out: OutboundMessage) -> Result<()>;

    /// Install the single router callback.
    fn set_handler(&self, handler: InboundHandler);
}

/// Registry of connected channel adapters, keyed by adapter ID.
pub struct ChannelRegistry {
    adapters: RwLock<HashMap<String, Arc<dyn ChannelAdapter>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            adapters: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, adapter: Arc<dyn ChannelAdapter>) {
        let mut adapters = self.adapters.write().expect("registry lock poisoned");
        adapters.insert(adapter.id().to_string(), adapter);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ChannelAdapter>> {
        let adapters = self.adapters.read().expect("registry lock poisoned");
        adapters.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let adapters = self.adapters.read().expect("registry lock poisoned");
        adapters.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        let adapters = self.adapters.read().expect("registry lock poisoned");
        adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Disconnect all adapters, best effort.
    pub async fn disconnect_all(&self) {
        let adapters: Vec<_> = {
            let guard = self.adapters.read().expect("registry lock poisoned");
            guard.values().cloned().collect()
        };
        for adapter in adapters {
            if let Err(e) = adapter.disconnect().await {
                tracing::warn!(channel = adapter.id(), error = %e, "Adapter disconnect failed");
            }
        }
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    pub(crate) struct MockAdapter {
        pub id: &'static str,
        pub sent: Mutex<Vec<OutboundMessage>>,
        handler: RwLock<Option<InboundHandler>>,
    }

    impl MockAdapter {
        pub fn new(id: &'static str) -> Self {
            Self {
                id,
                sent: Mutex::new(Vec::new()),
                handler: RwLock::new(None),
            }
        }
    }

    #[async_trait]
    impl ChannelAdapter for MockAdapter {
        fn id(&self) -> &'static str {
            self.id
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

        fn set_handler(&self, handler: InboundHandler) {
            *self.handler.write().unwrap() = Some(handler);
        }
    }

    #[test]
    fn test_empty_registry() {
        let registry = ChannelRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.get("telegram").is_none());
    }

    #[test]
    fn test_register_and_get() {
        let registry = ChannelRegistry::new();
        registry.register(Arc::new(MockAdapter::new("telegram")));
        registry.register(Arc::new(MockAdapter::new("slack")));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("telegram").unwrap().id(), "telegram");
        assert!(registry.get("discord").is_none());

        let mut ids = registry.ids();
        ids.sort();
        assert_eq!(ids, vec!["slack".to_string(), "telegram".to_string()]);
    }

    #[test]
    fn test_register_overwrites_duplicate_id() {
        let registry = ChannelRegistry::new();
        registry.register(Arc::new(MockAdapter::new("telegram")));
        registry.register(Arc::new(MockAdapter::new("telegram")));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_all() {
        let registry = ChannelRegistry::new();
        registry.register(Arc::new(MockAdapter::new("telegram")));
        registry.disconnect_all().await;
    }

    #[test]
    fn test_handler_installation() {
        let adapter = MockAdapter::new("telegram");
        adapter.set_handler(Arc::new(|_msg| {}));
        assert!(adapter.handler.read().unwrap().is_some());
        // Re-installation replaces the previous callback
        adapter.set_handler(Arc::new(|_msg| {}));
        assert!(adapter.handler.read().unwrap().is_some());
    }
}
