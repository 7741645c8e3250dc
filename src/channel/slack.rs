// ABOUTME: Slack channel adapter using slack-morphism Socket Mode
// ABOUTME: Filters self/bot/subtype events and threads replies via thread_ts

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use slack_morphism::prelude::*;
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::channel::{ChannelAdapter, InboundHandler, InboundMessage, OutboundMessage};
use crate::config::SlackConfig;

// =============================================================================
// Shared state passed to Socket Mode callbacks via SlackClientEventsUserState
// =============================================================================

/// State shared with Socket Mode callback functions via user state storage.
/// Callbacks are fn pointers (not closures), so they cannot capture variables.
#[derive(Clone)]
struct SlackBridgeState {
    handler: Arc<RwLock<Option<InboundHandler>>>,
    /// Bot's user ID (to skip self-messages)
    bot_user_id: String,
}

// =============================================================================
// Socket Mode callback functions (must be fn pointers, not closures)
// =============================================================================

async fn handle_push_event(
    event: SlackPushEventCallback,
    _client: Arc<SlackHyperClient>,
    states: SlackClientEventsUserState,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let bridge = {
        let guard = states.read().await;
        guard
            .get_user_state::<SlackBridgeState>()
            .cloned()
            .ok_or("SlackBridgeState not found in user state")?
    };

    if let SlackEventCallbackBody::Message(msg_event) = event.event {
        handle_message_event(&bridge, &msg_event);
    }
    Ok(())
}

/// Process a Slack message event into an InboundMessage.
fn handle_message_event(bridge: &SlackBridgeState, msg_event: &SlackMessageEvent) {
    // Edits, joins, and other subtyped events are not user chat.
    if msg_event.subtype.is_some() {
        return;
    }

    // Skip system messages (no user) and anything sent by a bot,
    // including our own replies echoed back by Slack.
    let sender_id = match &msg_event.sender.user {
        Some(user_id) => user_id.to_string(),
        None => return,
    };
    if sender_id == bridge.bot_user_id || msg_event.sender.bot_id.is_some() {
        return;
    }

    let channel_id = match &msg_event.origin.channel {
        Some(ch) => ch.to_string(),
        None => return,
    };

    let text = msg_event
        .content
        .as_ref()
        .and_then(|c| c.text.as_ref())
        .map(|t| t.to_string())
        .unwrap_or_default();
    if text.is_empty() {
        return;
    }

    let inbound = InboundMessage {
        channel_type: "slack".to_string(),
        channel_id,
        message_id: msg_event.origin.ts.to_string(),
        text,
        sender_id,
        sender_name: msg_event.sender.username.clone().unwrap_or_default(),
        reply_to_id: None,
        thread_id: msg_event.origin.thread_ts.as_ref().map(|ts| ts.to_string()),
        raw: serde_json::to_value(msg_event).ok(),
    };

    let installed = bridge.handler.read().expect("handler lock poisoned").clone();
    match installed {
        Some(h) => h(inbound),
        None => tracing::debug!(channel = "slack", "No handler installed"),
    }
}

/// Socket Mode error handler
fn socket_mode_error_handler(
    err: Box<dyn std::error::Error + Send + Sync>,
    _client: Arc<SlackHyperClient>,
    _states: SlackClientEventsUserState,
) -> HttpStatusCode {
    tracing::error!(channel = "slack", error = %err, "Socket Mode error");
    HttpStatusCode::OK
}

// =============================================================================
// SlackAdapter
// =============================================================================

/// Slack adapter bridging Socket Mode and the router.
pub struct SlackAdapter {
    config: SlackConfig,
    client: Mutex<Option<Arc<SlackHyperClient>>>,
    bot_token: Mutex<Option<SlackApiToken>>,
    handler: Arc<RwLock<Option<InboundHandler>>>,
    listener_task: Mutex<Option<JoinHandle<()>>>,
}

impl SlackAdapter {
    pub fn new(config: SlackConfig) -> Self {
        Self {
            config,
            client: Mutex::new(None),
            bot_token: Mutex::new(None),
            handler: Arc::new(RwLock::new(None)),
            listener_task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ChannelAdapter for SlackAdapter {
    fn id(&self) -> &'static str {
        "slack"
    }

    async fn connect(&self) -> Result<()> {
        if self.config.bot_token.trim().is_empty() || self.config.app_token.trim().is_empty() {
            bail!("slack token is required");
        }

        let client = Arc::new(SlackClient::new(
            SlackClientHyperConnector::new().context("Failed to create Slack HTTP connector")?,
        ));
        let bot_token = SlackApiToken::new(SlackApiTokenValue(self.config.bot_token.clone()));
        let app_token = SlackApiToken::new(SlackApiTokenValue(self.config.app_token.clone()));

        // Resolve bot user ID via auth.test so we can drop our own echoes.
        let session = client.open_session(&bot_token);
        let auth_response = session
            .auth_test()
            .await
            .context("Failed to call Slack auth.test — check bot_token")?;
        let bot_user_id = auth_response.user_id.to_string();

        tracing::info!(
            bot_user = %bot_user_id,
            team = %auth_response.team,
            "Slack bot authenticated"
        );

        *self.client.lock().expect("client lock poisoned") = Some(Arc::clone(&client));
        *self.bot_token.lock().expect("token lock poisoned") = Some(bot_token);

        let bridge_state = SlackBridgeState {
            handler: Arc::clone(&self.handler),
            bot_user_id,
        };

        // Spawn Socket Mode listener
        let task = tokio::spawn(async move {
            let socket_mode_callbacks =
                SlackSocketModeListenerCallbacks::new().with_push_events(handle_push_event);

            let listener_environment = Arc::new(
                SlackClientEventsListenerEnvironment::new(client)
                    .with_error_handler(socket_mode_error_handler)
                    .with_user_state(bridge_state),
            );

            let socket_mode_listener = SlackClientSocketModeListener::new(
                &SlackClientSocketModeConfig::new(),
                listener_environment,
                socket_mode_callbacks,
            );

            match socket_mode_listener.listen_for(&app_token).await {
                Ok(_) => {
                    tracing::info!(channel = "slack", "Socket Mode connected");
                    // serve() blocks until the listener is shut down
                    socket_mode_listener.serve().await;
                }
                Err(e) => {
                    tracing::error!(
                        channel = "slack",
                        error = %e,
                        "Failed to start Socket Mode listener"
                    );
                }
            }
        });
        *self.listener_task.lock().expect("task lock poisoned") = Some(task);

        tracing::info!(channel = "slack", "Slack adapter connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(task) = self.listener_task.lock().expect("task lock poisoned").take() {
            task.abort();
        }
        *self.client.lock().expect("client lock poisoned") = None;
        *self.bot_token.lock().expect("token lock poisoned") = None;
        tracing::info!(channel = "slack", "Slack adapter disconnected");
        Ok(())
    }

    async fn send(&self, out: OutboundMessage) -> Result<()> {
        let client = self
            .client
            .lock()
            .expect("client lock poisoned")
            .clone()
            .context("slack adapter not connected")?;
        let bot_token = self
            .bot_token
            .lock()
            .expect("token lock poisoned")
            .clone()
            .context("slack adapter not connected")?;

        let mut req = SlackApiChatPostMessageRequest::new(
            out.channel_id.as_str().into(),
            SlackMessageContent::new().with_text(out.text.clone()),
        );
        // Slack threads by ts; replying to a root message starts its thread.
        if let Some(thread_ts) = out.thread_id.as_deref().or(out.reply_to_id.as_deref()) {
            req = req.with_thread_ts(thread_ts.into());
        }

        let session = client.open_session(&bot_token);
        session
            .chat_post_message(&req)
            .await
            .context("Failed to send Slack message")?;
        Ok(())
    }

    fn set_handler(&self, handler: InboundHandler) {
        *self.handler.write().expect("handler lock poisoned") = Some(handler);
    }
}

// =============================================================================
// Tests
// =============================================================================
