// ABOUTME: Telegram channel adapter using teloxide with long polling
// ABOUTME: Normalises chat messages into InboundMessage and sends replies with reply/thread params

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, RwLock};
use teloxide::prelude::*;
use teloxide::types::{MediaKind, MessageId, MessageKind, ParseMode, ReplyParameters, ThreadId, UpdateKind};
use tokio::task::JoinHandle;

use crate::channel::{ChannelAdapter, InboundHandler, InboundMessage, OutboundMessage};
use crate::config::TelegramConfig;

/// Telegram adapter bridging the Bot API and the router.
pub struct TelegramAdapter {
    config: TelegramConfig,
    bot: Mutex<Option<Bot>>,
    handler: Arc<RwLock<Option<InboundHandler>>>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl TelegramAdapter {
    pub fn new(config: TelegramConfig) -> Self {
        Self {
            config,
            bot: Mutex::new(None),
            handler: Arc::new(RwLock::new(None)),
            poll_task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ChannelAdapter for TelegramAdapter {
    fn id(&self) -> &'static str {
        "telegram"
    }

    async fn connect(&self) -> Result<()> {
        if self.config.bot_token.trim().is_empty() {
            bail!("telegram token is required");
        }
        let bot = Bot::new(&self.config.bot_token);

        let me = bot.get_me().await.context("Failed to call Telegram getMe")?;
        tracing::info!(
            bot_username = %me.username(),
            bot_id = me.id.0,
            "Telegram bot authenticated"
        );

        *self.bot.lock().expect("bot lock poisoned") = Some(bot.clone());

        // Long-polling receive loop. Messages from the bot itself never appear
        // in getUpdates, so no self-filter is needed on this platform.
        let handler = Arc::clone(&self.handler);
        let task = tokio::spawn(async move {
            let mut offset: i32 = 0;
            loop {
                let updates = match bot.get_updates().offset(offset).timeout(30).await {
                    Ok(updates) => updates,
                    Err(e) => {
                        tracing::warn!(
                            channel = "telegram",
                            error = %e,
                            "Long polling error, retrying in 5s"
                        );
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        continue;
                    }
                };

                for update in &updates {
                    offset = update.id.as_offset();

                    let message = match &update.kind {
                        UpdateKind::Message(msg) => msg,
                        _ => continue,
                    };
                    let Some(inbound) = message_to_inbound(message) else {
                        continue;
                    };

                    let installed = handler.read().expect("handler lock poisoned").clone();
                    match installed {
                        Some(h) => h(inbound),
                        None => tracing::debug!(channel = "telegram", "No handler installed"),
                    }
                }
            }
        });
        *self.poll_task.lock().expect("task lock poisoned") = Some(task);

        tracing::info!(channel = "telegram", "Telegram adapter connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(task) = self.poll_task.lock().expect("task lock poisoned").take() {
            task.abort();
        }
        *self.bot.lock().expect("bot lock poisoned") = None;
        tracing::info!(channel = "telegram", "Telegram adapter disconnected");
        Ok(())
    }

    async fn send(&self, out: OutboundMessage) -> Result<()> {
        let bot = self
            .bot
            .lock()
            .expect("bot lock poisoned")
            .clone()
            .context("telegram adapter not connected")?;
        let chat_id = ChatId(
            out.channel_id
                .parse::<i64>()
                .with_context(|| format!("Invalid Telegram chat ID '{}'", out.channel_id))?,
        );

        let mut req = bot.send_message(chat_id, &out.text);
        if let Some(ref reply_to) = out.reply_to_id {
            if let Ok(id) = reply_to.parse::<i32>() {
                req = req.reply_parameters(ReplyParameters::new(MessageId(id)));
            }
        }
        if let Some(ref thread) = out.thread_id {
            if let Ok(id) = thread.parse::<i32>() {
                req = req.message_thread_id(ThreadId(MessageId(id)));
            }
        }
        if matches!(out.parse_mode.as_deref(), Some("markdown")) {
            req = req.parse_mode(ParseMode::Markdown);
        }

        req.await.context("Failed to send Telegram message")?;
        Ok(())
    }

    fn set_handler(&self, handler: InboundHandler) {
        *self.handler.write().expect("handler lock poisoned") = Some(handler);
    }
}

/// Convert a Telegram message into the uniform inbound shape.
/// Non-text messages are skipped.
fn message_to_inbound(message: &teloxide::types::Message) -> Option<InboundMessage> {
    let common = match &message.kind {
        MessageKind::Common(common) => common,
        _ => return None,
    };
    let text = match &common.media_kind {
        MediaKind::Text(text) => text.text.clone(),
        _ => return None,
    };
    let from = message.from.as_ref()?;

    let sender_name = {
        let mut parts = vec![from.first_name.clone()];
        if let Some(ref last) = from.last_name {
            parts.push(last.clone());
        }
        parts.join(" ")
    };

    Some(InboundMessage {
        channel_type: "telegram".to_string(),
        channel_id: message.chat.id.0.to_string(),
        message_id: message.id.0.to_string(),
        text,
        sender_id: from.id.0.to_string(),
        sender_name,
        reply_to_id: message.reply_to_message().map(|m| m.id.0.to_string()),
        thread_id: message.thread_id.map(|t| t.0 .0.to_string()),
        raw: serde_json::to_value(message).ok(),
    })
}

// =============================================================================
// Tests
// =============================================================================
