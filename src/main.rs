// ABOUTME: Main entry point for the botgate message routing core
// ABOUTME: Initializes logging, config, hubs, channel adapters, router, and the HTTP server

use anyhow::{Context, Result};
use botgate::agent_hub::AgentHub;
use botgate::bindings::BindingStore;
use botgate::channel::{ChannelAdapter, ChannelRegistry, InboundMessage};
use botgate::config::Config;
use botgate::middleware::csrf::CsrfProtect;
use botgate::realtime::RealtimeHub;
use botgate::router::Router;
use botgate::server::{self, AppState, SharedSecretAuthenticator};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "botgate", about = "Real-time message routing core for chat bots")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Set up panic hook to log panics before they crash the process
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("\n╔══════════════════════════════════════════════════════════╗");
        eprintln!("║ PANIC! Gateway crashed with the following error:        ║");
        eprintln!("╚══════════════════════════════════════════════════════════╝\n");
        eprintln!("{}", panic_info);
        eprintln!("\nBacktrace:");
        eprintln!("{:?}", std::backtrace::Backtrace::force_capture());
    }));

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting botgate");

    // Load configuration
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::load_from(&cli.config)?;

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        data_dir = %config.storage.data_dir,
        router_timeout_secs = config.router.timeout_secs,
        telegram = config.telegram.is_some(),
        discord = config.discord.is_some(),
        slack = config.slack.is_some(),
        "Configuration loaded"
    );

    // Binding store with JSON persistence
    let bindings = Arc::new(BindingStore::with_dir(&config.storage.data_dir));
    bindings.load().context("Failed to load bindings")?;
    tracing::info!(count = bindings.count(), "Binding store loaded");

    // Hubs and registry
    let agent_hub = AgentHub::new();
    let realtime = RealtimeHub::new();
    let channels = Arc::new(ChannelRegistry::new());

    // Router wires channels to the agent
    let router = Router::new(
        Arc::clone(&agent_hub),
        Arc::clone(&bindings),
        Arc::clone(&channels),
        Duration::from_secs(config.router.timeout_secs),
    );
    router.install();

    // Channel adapters: connect each configured platform and point its
    // inbound handler at the router.
    #[cfg(feature = "telegram")]
    if let Some(telegram_config) = config.telegram.clone() {
        let adapter = Arc::new(botgate::channel::telegram::TelegramAdapter::new(
            telegram_config,
        ));
        start_adapter(adapter, &channels, &router).await?;
    }
    #[cfg(feature = "discord")]
    if let Some(discord_config) = config.discord.clone() {
        let adapter = Arc::new(botgate::channel::discord::DiscordAdapter::new(
            discord_config,
        ));
        start_adapter(adapter, &channels, &router).await?;
    }
    #[cfg(feature = "slack")]
    if let Some(slack_config) = config.slack.clone() {
        let adapter = Arc::new(botgate::channel::slack::SlackAdapter::new(slack_config));
        start_adapter(adapter, &channels, &router).await?;
    }

    if channels.is_empty() {
        tracing::warn!("No channel adapters configured; only WebSocket endpoints are active");
    }

    // CSRF protection
    let csrf = CsrfProtect::new(&config.csrf, &config.effective_csrf_secret())?;

    let agent_token = config.auth.agent_token.clone().unwrap_or_default();
    let state = AppState {
        agent_hub,
        realtime,
        router,
        bindings,
        channels: Arc::clone(&channels),
        csrf,
        authenticator: SharedSecretAuthenticator::new(agent_token),
    };

    let result = server::serve(&config, state).await;

    channels.disconnect_all().await;
    tracing::info!("Shutdown complete");
    result
}

/// Connect one adapter, register it, and route its inbound messages.
async fn start_adapter(
    adapter: Arc<dyn ChannelAdapter>,
    channels: &Arc<ChannelRegistry>,
    router: &Arc<Router>,
) -> Result<()> {
    let router = Arc::clone(router);
    adapter.set_handler(Arc::new(move |msg: InboundMessage| {
        let router = Arc::clone(&router);
        tokio::spawn(async move {
            let channel_type = msg.channel_type.clone();
            let channel_id = msg.channel_id.clone();
            if let Err(e) = router.route(msg).await {
                tracing::warn!(
                    channel_type = %channel_type,
                    channel_id = %channel_id,
                    error = %e,
                    "Failed to route inbound message"
                );
            }
        });
    }));

    adapter
        .connect()
        .await
        .with_context(|| format!("Failed to connect {} adapter", adapter.id()))?;
    channels.register(Arc::clone(&adapter));
    Ok(())
}
