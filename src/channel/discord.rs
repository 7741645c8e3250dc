// ABOUTME: Discord channel adapter using serenity's gateway client
// ABOUTME: Filters bot-authored messages and preserves reply references on send

use anyhow::{bail, Context as AnyhowContext, Result};
use async_trait::async_trait;
use serenity::all::{
    ChannelId, Client, Context, CreateMessage, EventHandler, GatewayIntents, Http,
    Message as DiscordMessage, MessageId, MessageReference, Ready,
};
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::channel::{ChannelAdapter, InboundHandler, InboundMessage, OutboundMessage};
use crate::config::DiscordConfig;

/// Discord adapter bridging the gateway and the router.
pub struct DiscordAdapter {
    config: DiscordConfig,
    http: Mutex<Option<Arc<Http>>>,
    handler: Arc<RwLock<Option<InboundHandler>>>,
    gateway_task: Mutex<Option<JoinHandle<()>>>,
}

impl DiscordAdapter {
    pub fn new(config: DiscordConfig) -> Self {
        Self {
            config,
            http: Mutex::new(None),
            handler: Arc::new(RwLock::new(None)),
            gateway_task: Mutex::new(None),
        }
    }
}

struct GatewayHandler {
    handler: Arc<RwLock<Option<InboundHandler>>>,
}

#[serenity::async_trait]
impl EventHandler for GatewayHandler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        tracing::info!(
            bot_username = %ready.user.name,
            channel = "discord",
            "Discord gateway ready"
        );
    }

    async fn message(&self, _ctx: Context, msg: DiscordMessage) {
        // Drop everything authored by bots, including our own echoes.
        if msg.author.bot {
            return;
        }
        if msg.content.is_empty() {
            return;
        }

        let inbound = InboundMessage {
            channel_type: "discord".to_string(),
            channel_id: msg.channel_id.get().to_string(),
            message_id: msg.id.get().to_string(),
            text: msg.content.clone(),
            sender_id: msg.author.id.get().to_string(),
            sender_name: msg.author.name.clone(),
            reply_to_id: msg.referenced_message.as_ref().map(|m| m.id.get().to_string()),
            // Discord threads are channels of their own, so channel_id already
            // names the thread when one is involved.
            thread_id: None,
            raw: serde_json::to_value(&msg).ok(),
        };

        let installed = self.handler.read().expect("handler lock poisoned").clone();
        match installed {
            Some(h) => h(inbound),
            None => tracing::debug!(channel = "discord", "No handler installed"),
        }
    }
}

#[async_trait]
impl ChannelAdapter for DiscordAdapter {
    fn id(&self) -> &'static str {
        "discord"
    }

    async fn connect(&self) -> Result<()> {
        if self.config.bot_token.trim().is_empty() {
            bail!("discord token is required");
        }

        let intents = GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::DIRECT_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT;
        let mut client = Client::builder(&self.config.bot_token, intents)
            .event_handler(GatewayHandler {
                handler: Arc::clone(&self.handler),
            })
            .await
            .context("Failed to build Discord client")?;

        *self.http.lock().expect("http lock poisoned") = Some(Arc::clone(&client.http));

        let task = tokio::spawn(async move {
            if let Err(e) = client.start().await {
                tracing::error!(channel = "discord", error = %e, "Discord gateway stopped");
            }
        });
        *self.gateway_task.lock().expect("task lock poisoned") = Some(task);

        tracing::info!(channel = "discord", "Discord adapter connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(task) = self.gateway_task.lock().expect("task lock poisoned").take() {
            task.abort();
        }
        *self.http.lock().expect("http lock poisoned") = None;
        tracing::info!(channel = "discord", "Discord adapter disconnected");
        Ok(())
    }

    async fn send(&self, out: OutboundMessage) -> Result<()> {
        let http = self
            .http
            .lock()
            .expect("http lock poisoned")
            .clone()
            .context("discord adapter not connected")?;
        let channel_id = ChannelId::new(
            out.channel_id
                .parse::<u64>()
                .with_context(|| format!("Invalid Discord channel ID '{}'", out.channel_id))?,
        );

        let mut builder = CreateMessage::new().content(&out.text);
        if let Some(ref reply_to) = out.reply_to_id {
            if let Ok(id) = reply_to.parse::<u64>() {
                builder =
                    builder.reference_message(MessageReference::from((channel_id, MessageId::new(id))));
            }
        }

        channel_id
            .send_message(&http, builder)
            .await
            .context("Failed to send Discord message")?;
        Ok(())
    }

    fn set_handler(&self, handler: InboundHandler) {
        *self.handler.write().expect("handler lock poisoned") = Some(handler);
    }
}

// =============================================================================
// Tests
// =============================================================================
