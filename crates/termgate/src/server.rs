use std::time::Duration;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::routing::{get, post};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use crate::admission::AdmissionGate;
use crate::gateway::GatewayService;
use crate::handlers;

/// Floor for the request body limit, so small stdin caps still leave room
/// for the JSON envelope.
const MIN_BODY_LIMIT: usize = 16 * 1024;

// ============================================================================
// Application State
// ============================================================================

#[derive(Clone)]
pub struct AppState {
    pub gateway: GatewayService,
    /// Wire-protocol session gate, read for readiness.
    pub shell_gate: AdmissionGate,
    pub api_token: Option<String>,
    pub max_connections: usize,
}

// ============================================================================
// Server Setup
// ============================================================================

/// Body limit that fits a base64 payload of `stdin_max_bytes` plus its envelope.
pub fn body_limit(stdin_max_bytes: usize) -> usize {
    (stdin_max_bytes.div_ceil(3) * 4 + 1024).max(MIN_BODY_LIMIT)
}

pub fn build_app(state: AppState, request_timeout: Duration) -> Router {
    let max_connections = state.max_connections;
    let body_limit = body_limit(state.gateway.stdin_max_bytes());

    let gateway_routes = Router::new()
        .route("/sessions", post(handlers::gateway::open_session))
        .route("/sessions/resume", post(handlers::gateway::resume_session))
        .route(
            "/sessions/{session_id}",
            get(handlers::gateway::get_session).delete(handlers::gateway::close_session),
        )
        .route(
            "/sessions/{session_id}/stdin",
            post(handlers::gateway::write_stdin),
        )
        .route(
            "/sessions/{session_id}/resize",
            post(handlers::gateway::resize_session),
        )
        .with_state(state.clone())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            handlers::api_auth::require_api_token,
        ))
        .layer(ConcurrencyLimitLayer::new(max_connections));

    Router::new()
        .route("/livez", get(handlers::livez))
        .route("/readyz", get(handlers::readyz))
        .route("/version", get(handlers::version))
        .with_state(state)
        .nest("/gateway", gateway_routes)
}
