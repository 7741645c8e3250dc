// ABOUTME: Configuration parsing from TOML file with environment variable overrides
// ABOUTME: Validates required fields and provides sensible defaults for optional ones
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub csrf: CsrfConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telegram: Option<TelegramConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discord: Option<DiscordConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slack: Option<SlackConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    /// Shared secret presented by the agent when opening its WebSocket.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_router_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Sustained refill rate for general API traffic.
    #[serde(default = "default_rate_requests")]
    pub requests_per_interval: f64,
    #[serde(default = "default_rate_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_rate_burst")]
    pub burst: f64,
    /// Sliding-window cap for authentication-tier endpoints.
    #[serde(default = "default_auth_limit")]
    pub auth_limit: usize,
    #[serde(default = "default_auth_window")]
    pub auth_window_secs: u64,
    /// Endpoints throttled by the stricter sliding-window tier.
    #[serde(default = "default_auth_tier_paths")]
    pub auth_tier_paths: Vec<String>,
    /// Endpoints exempt from rate limiting.
    #[serde(default = "default_rate_skip_paths")]
    pub skip_paths: Vec<String>,
}

/// Which CSRF check the middleware enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CsrfMode {
    /// HMAC-signed tokens carrying their own expiry; the submitted token
    /// must match the cookie and verify.
    #[default]
    Synchroniser,
    /// Stateless double-submit: cookie and submitted token need only be
    /// byte-equal under constant-time compare.
    DoubleSubmit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsrfConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub mode: CsrfMode,
    /// HMAC key for token signing. Falls back to auth.agent_token when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default = "default_csrf_ttl")]
    pub token_ttl_secs: u64,
    #[serde(default = "default_csrf_cookie")]
    pub cookie_name: String,
    #[serde(default = "default_csrf_header")]
    pub header_name: String,
    #[serde(default)]
    pub secure_cookies: bool,
    #[serde(default = "default_csrf_skip_paths")]
    pub skip_paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_max_url_len")]
    pub max_url_len: usize,
    #[serde(default = "default_allowed_content_types")]
    pub allowed_content_types: Vec<String>,
    /// Origins accepted on non-safe requests. Empty means any.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    /// Redirect plain-HTTP requests (as seen via X-Forwarded-Proto) to HTTPS.
    #[serde(default)]
    pub force_https: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DiscordConfig {
    #[serde(default)]
    pub bot_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SlackConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub app_token: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_router_timeout() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

fn default_rate_requests() -> f64 {
    100.0
}

fn default_rate_interval() -> u64 {
    60
}

fn default_rate_burst() -> f64 {
    20.0
}

fn default_auth_limit() -> usize {
    10
}

fn default_auth_window() -> u64 {
    900
}

fn default_auth_tier_paths() -> Vec<String> {
    vec!["/api/v1/agent/ws".to_string()]
}

fn default_rate_skip_paths() -> Vec<String> {
    vec!["/healthz".to_string()]
}

fn default_csrf_ttl() -> u64 {
    3600
}

fn default_csrf_cookie() -> String {
    "csrf_token".to_string()
}

fn default_csrf_header() -> String {
    "X-CSRF-Token".to_string()
}

fn default_csrf_skip_paths() -> Vec<String> {
    vec!["/api/v1/agent/ws".to_string(), "/ws".to_string()]
}

fn default_max_url_len() -> usize {
    2048
}

fn default_allowed_content_types() -> Vec<String> {
    vec![
        "application/json".to_string(),
        "application/x-www-form-urlencoded".to_string(),
        "multipart/form-data".to_string(),
        "text/plain".to_string(),
    ]
}

fn default_data_dir() -> String {
    "./data".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_router_timeout(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_interval: default_rate_requests(),
            interval_secs: default_rate_interval(),
            burst: default_rate_burst(),
            auth_limit: default_auth_limit(),
            auth_window_secs: default_auth_window(),
            auth_tier_paths: default_auth_tier_paths(),
            skip_paths: default_rate_skip_paths(),
        }
    }
}

impl Default for CsrfConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: CsrfMode::default(),
            secret: None,
            token_ttl_secs: default_csrf_ttl(),
            cookie_name: default_csrf_cookie(),
            header_name: default_csrf_header(),
            secure_cookies: false,
            skip_paths: default_csrf_skip_paths(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_url_len: default_max_url_len(),
            allowed_content_types: default_allowed_content_types(),
            allowed_origins: Vec::new(),
            force_https: false,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Config {
    /// Load configuration from config.toml with environment variable overrides
    pub fn load() -> Result<Self> {
        Self::load_from("config.toml")
    }

    /// Load configuration from the given path with environment variable overrides
    pub fn load_from(config_path: &str) -> Result<Self> {
        let mut config = if Path::new(config_path).exists() {
            let content = std::fs::read_to_string(config_path)
                .with_context(|| format!("Failed to read {}", config_path))?;
            toml::from_str::<Config>(&content)
                .with_context(|| format!("Failed to parse {}", config_path))?
        } else {
            Config::default()
        };

        // Override with environment variables if present
        if let Ok(val) = std::env::var("BOTGATE_HOST") {
            config.server.host = val;
        }
        if let Ok(val) = std::env::var("BOTGATE_PORT") {
            config.server.port = val.parse().with_context(|| {
                format!("BOTGATE_PORT must be a valid port number, got: {}", val)
            })?;
        }
        if let Ok(val) = std::env::var("AGENT_TOKEN") {
            config.auth.agent_token = Some(val);
        }
        if let Ok(val) = std::env::var("ROUTER_TIMEOUT_SECS") {
            config.router.timeout_secs = val
                .parse()
                .with_context(|| format!("ROUTER_TIMEOUT_SECS must be seconds, got: {}", val))?;
        }
        if let Ok(val) = std::env::var("CSRF_SECRET") {
            config.csrf.secret = Some(val);
        }
        if let Ok(val) = std::env::var("DATA_DIR") {
            config.storage.data_dir = val;
        }
        if let Ok(val) = std::env::var("TELEGRAM_BOT_TOKEN") {
            config.telegram = Some(TelegramConfig { bot_token: val });
        }
        if let Ok(val) = std::env::var("DISCORD_BOT_TOKEN") {
            config.discord = Some(DiscordConfig { bot_token: val });
        }
        if let Ok(val) = std::env::var("SLACK_BOT_TOKEN") {
            let mut slack = config.slack.take().unwrap_or_default();
            slack.bot_token = val;
            config.slack = Some(slack);
        }
        if let Ok(val) = std::env::var("SLACK_APP_TOKEN") {
            let mut slack = config.slack.take().unwrap_or_default();
            slack.app_token = val;
            config.slack = Some(slack);
        }

        // Validate required fields
        match &config.auth.agent_token {
            Some(token) if !token.trim().is_empty() => {}
            _ => anyhow::bail!(
                "auth.agent_token is required (set in config.toml or AGENT_TOKEN env var)"
            ),
        }
        if config.csrf.enabled && config.effective_csrf_secret().trim().is_empty() {
            anyhow::bail!("csrf.secret is required when CSRF protection is enabled");
        }

        Ok(config)
    }

    /// The HMAC key used for CSRF token signing.
    pub fn effective_csrf_secret(&self) -> String {
        self.csrf
            .secret
            .clone()
            .or_else(|| self.auth.agent_token.clone())
            .unwrap_or_default()
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.router.timeout_secs, 120);
        assert_eq!(config.rate_limit.interval_secs, 60);
        assert!((config.rate_limit.burst - 20.0).abs() < f64::EPSILON);
        assert_eq!(config.csrf.cookie_name, "csrf_token");
        assert_eq!(config.security.max_url_len, 2048);
        assert!(config.telegram.is_none());
    }

    #[test]
    fn test_parse_toml() {
        let toml_src = r#"
            [auth]
            agent_token = "secret"

            [server]
            port = 9090

            [telegram]
            bot_token = "123:abc"

            [csrf]
            secure_cookies = true
        "#;
        let config: Config = toml::from_str(toml_src).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.auth.agent_token.as_deref(), Some("secret"));
        assert_eq!(config.telegram.unwrap().bot_token, "123:abc");
        assert!(config.csrf.secure_cookies);
        // Untouched sections keep their defaults
        assert_eq!(config.csrf.token_ttl_secs, 3600);
        assert_eq!(config.rate_limit.auth_limit, 10);
    }

    #[test]
    fn test_csrf_secret_falls_back_to_agent_token() {
        let config: Config = toml::from_str("[auth]\nagent_token = \"tok\"").unwrap();
        assert_eq!(config.effective_csrf_secret(), "tok");
    }

    #[test]
    fn test_explicit_csrf_secret_wins() {
        let config: Config =
            toml::from_str("[auth]\nagent_token = \"tok\"\n[csrf]\nsecret = \"other\"").unwrap();
        assert_eq!(config.effective_csrf_secret(), "other");
    }

    #[test]
    fn test_bind_addr() {
        let config = Config::default();
        assert_eq!(config.bind_addr(), "0.0.0.0:8080");
    }

    #[test]
    #[serial_test::serial]
    fn test_env_overrides() {
        std::env::set_var("AGENT_TOKEN", "env-token");
        std::env::set_var("BOTGATE_PORT", "9999");
        std::env::set_var("TELEGRAM_BOT_TOKEN", "123:env");
        let config = Config::load_from("/nonexistent/config.toml").unwrap();
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.auth.agent_token.as_deref(), Some("env-token"));
        assert_eq!(config.telegram.unwrap().bot_token, "123:env");
        std::env::remove_var("AGENT_TOKEN");
        std::env::remove_var("BOTGATE_PORT");
        std::env::remove_var("TELEGRAM_BOT_TOKEN");
    }

    #[test]
    #[serial_test::serial]
    fn test_missing_agent_token_rejected() {
        std::env::remove_var("AGENT_TOKEN");
        let err = Config::load_from("/nonexistent/config.toml").unwrap_err();
        assert!(err.to_string().contains("agent_token"));
    }
}
