//! Admin HTTP surface (spec.md §6). Serves the status/setup pages and the
//! HTTP fallback for the operations also reachable over the data channel.
//! Router construction follows the rendezvous's own `ws::router` shape —
//! one `Router::new()` with typed state, CORS, and a handful of routes.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{ConnectInfo, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::{async_trait, RequestPartsExt, Router};
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;

use vibe_coder_proto::{totp, SignalingMessage};

use crate::bridge::{assistant::AssistantError, Bridge};
use crate::config::HostConfig;
use crate::session::SharedSessionTable;

#[derive(Clone)]
pub struct AppState {
    pub sessions: SharedSessionTable,
    pub bridge: Arc<Bridge>,
    pub config: Arc<HostConfig>,
    pub started_at: Instant,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(status_page))
        .route("/setup", get(setup_page))
        .route("/api/auth/setup", get(auth_setup))
        .route("/api/auth/renew-host-id", post(renew_host_id))
        .route("/api/health", get(health))
        .route("/api/claude/execute", post(claude_execute))
        .route("/api/claude/cancel", post(claude_cancel))
        .route("/api/claude/status", get(claude_status))
        .route("/api/claude/health", get(claude_health))
        .route("/api/webrtc/channels", get(webrtc_channels))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Rejects every HTTP error category to a stable status code (spec.md §7).
pub enum AdminError {
    BadRequest(String),
    Unauthorized,
    Forbidden,
    NotFound(String),
    Conflict(String),
    Internal(String),
    Unavailable(String),
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AdminError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            AdminError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            AdminError::Forbidden => (StatusCode::FORBIDDEN, "forbidden".to_string()),
            AdminError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            AdminError::Conflict(m) => (StatusCode::CONFLICT, m),
            AdminError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
            AdminError::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Bearer-token extractor: every `/api/claude/*` route requires a valid,
/// authenticated, unexpired session token in the `Authorization` header.
pub struct AuthenticatedSession {
    pub session_id: String,
    pub host_id: String,
}

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedSession {
    type Rejection = AdminError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(AdminError::Unauthorized)?;
        let token = auth_header
            .strip_prefix("Bearer ")
            .ok_or(AdminError::Unauthorized)?;
        let (session_id, host_id) = state
            .sessions
            .verify_token(token)
            .ok_or(AdminError::Unauthorized)?;
        Ok(AuthenticatedSession { session_id, host_id })
    }
}

async fn status_page(State(state): State<AppState>) -> Html<String> {
    let host_id = state.sessions.host_id();
    Html(format!(
        "<html><body><h1>vibe-coder host</h1><p>Host ID: {host_id}</p><p>Active sessions: {}</p></body></html>",
        state.sessions.session_count()
    ))
}

/// Only reachable from loopback or the docker-bridge range (spec.md §6).
async fn setup_page(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Result<Html<String>, AdminError> {
    if !is_local_origin(addr.ip()) {
        return Err(AdminError::Forbidden);
    }
    let totp_url = totp::provisioning_url(
        &format!("vibe-coder-{}", state.sessions.host_id()),
        "host",
        &state.sessions.totp_secret(),
    );
    Ok(Html(format!(
        "<html><body><h1>Set up 2FA</h1><p>{totp_url}</p></body></html>"
    )))
}

fn is_local_origin(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || (v4.octets()[0] == 172 && (16..=31).contains(&v4.octets()[1])),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

#[derive(Serialize)]
struct AuthSetupResponse {
    session_id: String,
    totp_secret: String,
    totp_url: String,
}

async fn auth_setup(State(state): State<AppState>) -> Result<Json<AuthSetupResponse>, AdminError> {
    let (session_id, totp_secret) = state
        .sessions
        .create_session()
        .map_err(|e| AdminError::Unavailable(e.to_string()))?;
    // Without this the rendezvous has no host socket on file for the
    // session (vibe-coder-rendezvous/src/ws.rs registers one only on
    // receiving `register-host`), so the first verify-totp/offer a client
    // sends would bounce with "Host not available".
    state.bridge.send_signaling(SignalingMessage::RegisterHost {
        session_id: session_id.clone(),
    });
    let totp_url = totp::provisioning_url(
        &format!("vibe-coder-{}", state.sessions.host_id()),
        &session_id,
        &totp_secret,
    );
    Ok(Json(AuthSetupResponse {
        session_id,
        totp_secret,
        totp_url,
    }))
}

#[derive(Serialize)]
struct RenewHostIdResponse {
    host_id: String,
}

async fn renew_host_id(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Result<Json<RenewHostIdResponse>, AdminError> {
    if !is_local_origin(addr.ip()) {
        return Err(AdminError::Forbidden);
    }
    let host_id = state
        .sessions
        .renew_host_id()
        .map_err(|e| AdminError::Internal(e.to_string()))?;
    Ok(Json(RenewHostIdResponse { host_id }))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    active_sessions: usize,
    uptime_secs: u64,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        active_sessions: state.sessions.session_count(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

#[derive(Deserialize)]
struct ClaudeExecuteRequest {
    command: String,
}

#[derive(Serialize)]
struct ClaudeExecuteResponse {
    output: Vec<String>,
}

async fn claude_execute(
    State(state): State<AppState>,
    auth: AuthenticatedSession,
    Json(req): Json<ClaudeExecuteRequest>,
) -> Result<Json<ClaudeExecuteResponse>, AdminError> {
    if let Err(rejection) = vibe_coder_proto::safety::check_command(&req.command) {
        return Err(AdminError::BadRequest(rejection.reason()));
    }
    let assistant = state
        .bridge
        .get_or_create_assistant_public(&auth.session_id)
        .await
        .map_err(|e| AdminError::Internal(e.to_string()))?;
    let timeout = std::time::Duration::from_secs(state.config.command_timeout_secs);
    let output = assistant.run_command(&req.command, timeout).await.map_err(|e| match e {
        AssistantError::Busy => AdminError::Conflict(e.to_string()),
        other => AdminError::Internal(other.to_string()),
    })?;
    Ok(Json(ClaudeExecuteResponse { output }))
}

async fn claude_cancel(State(state): State<AppState>, auth: AuthenticatedSession) -> Result<StatusCode, AdminError> {
    let assistant = state
        .bridge
        .find_assistant(&auth.session_id)
        .ok_or_else(|| AdminError::NotFound("no command is running for this session".to_string()))?;
    assistant.request_cancel();
    Ok(StatusCode::ACCEPTED)
}

#[derive(Serialize)]
struct ClaudeStatusResponse {
    has_assistant: bool,
}

async fn claude_status(State(state): State<AppState>, auth: AuthenticatedSession) -> Json<ClaudeStatusResponse> {
    Json(ClaudeStatusResponse {
        has_assistant: state.bridge.has_assistant(&auth.session_id),
    })
}

async fn claude_health(State(state): State<AppState>) -> Json<HealthResponse> {
    health(State(state)).await
}

#[derive(Serialize)]
struct WebrtcChannelsResponse {
    peer_channel_count: usize,
    assistant_session_count: usize,
}

async fn webrtc_channels(State(state): State<AppState>) -> Json<WebrtcChannelsResponse> {
    Json(WebrtcChannelsResponse {
        peer_channel_count: state.bridge.peer_channel_count(),
        assistant_session_count: state.bridge.assistant_session_count(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn loopback_and_docker_bridge_are_local() {
        assert!(is_local_origin(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))));
        assert!(is_local_origin(IpAddr::V4(Ipv4Addr::new(172, 17, 0, 1))));
        assert!(!is_local_origin(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))));
    }
}
