// ABOUTME: HTTP server wiring: WebSocket upgrades, CSRF token endpoint, bindings admin API
// ABOUTME: Applies the middleware stack and forwards agent lifecycle events to browsers

use anyhow::{Context, Result};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::middleware as axum_middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::agent_hub::{AgentEvent, AgentHub};
use crate::bindings::{Binding, BindingStore};
use crate::channel::ChannelRegistry;
use crate::config::Config;
use crate::middleware::csrf::{csrf_middleware, CsrfProtect};
use crate::middleware::rate_limit::{rate_limit_middleware, RateLimiters};
use crate::middleware::validate::{validate_middleware, RequestValidator};
use crate::middleware::{constant_time_eq, error_response};
use crate::realtime::{RealtimeHub, RealtimeMessage};
use crate::router::Router as MessageRouter;

// =============================================================================
// Agent authentication
// =============================================================================

/// Seam for validating the token an agent presents before its upgrade.
pub trait AgentAuthenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> bool;
}

/// Compares the presented token against one shared secret.
pub struct SharedSecretAuthenticator {
    token: String,
}

impl SharedSecretAuthenticator {
    pub fn new(token: String) -> Arc<Self> {
        Arc::new(Self { token })
    }
}

impl AgentAuthenticator for SharedSecretAuthenticator {
    fn authenticate(&self, token: &str) -> bool {
        !self.token.is_empty() && constant_time_eq(token.as_bytes(), self.token.as_bytes())
    }
}

// =============================================================================
// State and server entry point
// =============================================================================

#[derive(Clone)]
pub struct AppState {
    pub agent_hub: Arc<AgentHub>,
    pub realtime: Arc<RealtimeHub>,
    pub router: Arc<MessageRouter>,
    pub bindings: Arc<BindingStore>,
    pub channels: Arc<ChannelRegistry>,
    pub csrf: Arc<CsrfProtect>,
    pub authenticator: Arc<dyn AgentAuthenticator>,
}

pub async fn serve(config: &Config, state: AppState) -> Result<()> {
    let limiters = RateLimiters::new(&config.rate_limit);
    limiters.spawn_sweeper();
    state.csrf.spawn_sweeper();
    let validator = RequestValidator::new(&config.security)?;

    spawn_agent_status_forwarder(&state.agent_hub, &state.realtime);

    let app = build_router(state, config, limiters, validator);

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!(addr = %addr, "Starting server");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    Ok(())
}

fn build_router(
    state: AppState,
    config: &Config,
    limiters: Arc<RateLimiters>,
    validator: Arc<RequestValidator>,
) -> axum::Router {
    let csrf = Arc::clone(&state.csrf);
    axum::Router::new()
        .route("/healthz", get(health_handler))
        .route("/ws", get(realtime_ws_handler))
        .route("/api/v1/agent/ws", get(agent_ws_handler))
        .route("/api/v1/csrf-token", get(csrf_token_handler))
        .route("/api/v1/status", get(status_handler))
        .route(
            "/api/v1/bindings",
            get(list_bindings_handler).post(create_binding_handler),
        )
        .route("/api/v1/bindings/{id}", delete(delete_binding_handler))
        .with_state(state)
        .layer(axum_middleware::from_fn_with_state(csrf, csrf_middleware))
        .layer(axum_middleware::from_fn_with_state(
            validator,
            validate_middleware,
        ))
        .layer(axum_middleware::from_fn_with_state(
            limiters,
            rate_limit_middleware,
        ))
        .layer(axum::extract::DefaultBodyLimit::max(
            config.server.max_body_bytes,
        ))
        .layer(TraceLayer::new_for_http())
}

/// Mirror agent connect/disconnect into the browser fan-out so UIs can
/// show bot presence live.
fn spawn_agent_status_forwarder(hub: &Arc<AgentHub>, realtime: &Arc<RealtimeHub>) {
    let mut events = hub.subscribe_events();
    let realtime = Arc::clone(realtime);
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Agent event stream lagged");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            let (agent_id, connected) = match event {
                AgentEvent::Connected { agent_id } => (agent_id, true),
                AgentEvent::Disconnected { agent_id } => (agent_id, false),
            };
            realtime.broadcast(&RealtimeMessage::new(
                "agent_status",
                json!({ "agentId": agent_id, "connected": connected }),
            ));
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    tracing::info!("Shutdown signal received");
}

// =============================================================================
// Handlers
// =============================================================================

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Deserialize)]
struct AgentWsQuery {
    agent_id: Option<String>,
    #[allow(dead_code)]
    org_id: Option<String>,
    token: Option<String>,
}

async fn agent_ws_handler(
    State(state): State<AppState>,
    Query(query): Query<AgentWsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(agent_id) = query.agent_id.filter(|id| !id.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "agent_id is required");
    };
    let token = query.token.unwrap_or_default();
    if !state.authenticator.authenticate(&token) {
        tracing::warn!(agent_id = %agent_id, "Agent auth failed");
        return error_response(StatusCode::UNAUTHORIZED, "Invalid token");
    }

    let hub = Arc::clone(&state.agent_hub);
    ws.on_upgrade(move |socket| hub.handle_socket(socket, agent_id))
}

#[derive(Deserialize)]
struct RealtimeWsQuery {
    #[serde(rename = "clientId")]
    client_id: Option<String>,
    #[serde(rename = "userId")]
    user_id: Option<String>,
}

async fn realtime_ws_handler(
    State(state): State<AppState>,
    Query(query): Query<RealtimeWsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let client_id = query
        .client_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| "anonymous".to_string());
    let user_id = query
        .user_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| "anonymous".to_string());

    let hub = Arc::clone(&state.realtime);
    ws.on_upgrade(move |socket| hub.handle_socket(socket, client_id, user_id))
}

async fn csrf_token_handler(State(state): State<AppState>) -> Response {
    let token = state.csrf.issue();
    let cookie = state.csrf.set_cookie(&token);
    let mut resp = Json(json!({ "token": token })).into_response();
    match axum::http::HeaderValue::from_str(&cookie) {
        Ok(v) => {
            resp.headers_mut().append(axum::http::header::SET_COOKIE, v);
            resp
        }
        Err(_) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to issue token"),
    }
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "agentConnected": state.agent_hub.is_connected(),
        "agentIds": state.agent_hub.agent_ids(),
        "realtimeClients": state.realtime.client_count(),
        "bindings": state.bindings.count(),
        "channels": state.channels.ids(),
    }))
}

#[derive(Deserialize)]
struct ListBindingsQuery {
    org_id: Option<String>,
}

async fn list_bindings_handler(
    State(state): State<AppState>,
    Query(query): Query<ListBindingsQuery>,
) -> impl IntoResponse {
    let bindings = match query.org_id {
        Some(org_id) => state.bindings.list_by_org(&org_id),
        None => state.bindings.list_all(),
    };
    Json(json!({ "bindings": bindings }))
}

#[derive(Deserialize)]
struct CreateBindingRequest {
    channel_type: String,
    channel_id: String,
    org_id: String,
    agent_id: Option<String>,
    enabled: Option<bool>,
    settings: Option<serde_json::Map<String, serde_json::Value>>,
}

async fn create_binding_handler(
    State(state): State<AppState>,
    Json(req): Json<CreateBindingRequest>,
) -> Response {
    if req.channel_type.trim().is_empty() || req.channel_id.trim().is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "channel_type and channel_id are required",
        );
    }

    let mut binding = Binding::new(&req.channel_type, &req.channel_id, &req.org_id);
    binding.agent_id = req.agent_id;
    binding.enabled = req.enabled.unwrap_or(true);
    if let Some(settings) = req.settings {
        binding.settings = settings;
    }

    if let Err(e) = state.bindings.add(binding.clone()) {
        return error_response(StatusCode::CONFLICT, &e.to_string());
    }

    tracing::info!(
        binding_id = %binding.id,
        channel_type = %binding.channel_type,
        channel_id = %binding.channel_id,
        "Binding created"
    );
    (StatusCode::CREATED, Json(binding)).into_response()
}

async fn delete_binding_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    if state.bindings.remove(&id).is_err() {
        return error_response(StatusCode::NOT_FOUND, "Binding not found");
    }
    tracing::info!(binding_id = %id, "Binding deleted");
    StatusCode::NO_CONTENT.into_response()
}

// =============================================================================
// Tests
// =============================================================================
