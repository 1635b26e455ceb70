//! Gateway session HTTP handlers.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{FromRequest, Path, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::de::DeserializeOwned;
use tracing::error;

use crate::api::{OpenSessionRequest, ResizeRequest, ResumeRequest, SessionResponse, StdinRequest};
use crate::gateway::{GatewayError, RequestedLimits};
use crate::handlers::problem_details::{self, ProblemDetails};
use crate::server::AppState;

// ============================================================================
// Body extraction
// ============================================================================

/// JSON body whose every parse failure is a problem-details 400.
///
/// axum's own `Json` answers 415/422 for some of these; the gateway API
/// promises 400 for any malformed body.
pub struct JsonBody<T>(pub T);

impl<T, S> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ProblemDetails;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state).await.map_err(|rejection| {
            if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
                problem_details::payload_too_large(rejection.body_text())
            } else {
                problem_details::bad_request(rejection.body_text())
            }
        })?;
        serde_json::from_slice(&bytes)
            .map(JsonBody)
            .map_err(|e| problem_details::bad_request(format!("invalid request body: {e}")))
    }
}

// ============================================================================
// Error mapping
// ============================================================================

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let problem = match &self {
            GatewayError::Invalid(message) => problem_details::bad_request(message.clone()),
            GatewayError::PayloadTooLarge { .. } => {
                problem_details::payload_too_large(self.to_string())
            }
            GatewayError::SessionNotFound(_) => problem_details::not_found("session not found"),
            GatewayError::ResumeTokenNotFound => {
                problem_details::not_found("resume token not found")
            }
            GatewayError::NoProcess(session_id) => {
                problem_details::conflict("no running process")
                    .with_code("no_process")
                    .with_session_id(session_id.clone())
            }
            GatewayError::Launch { session_id, source } => {
                problem_details::internal_error("failed to launch session process")
                    .with_code(source.code())
                    .with_session_id(session_id.clone())
            }
            GatewayError::Process(_) | GatewayError::Storage(_) => {
                error!(error = %self, "gateway request failed");
                problem_details::internal_error("internal error")
            }
        };
        problem.into_response()
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /gateway/sessions
pub async fn open_session(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<OpenSessionRequest>,
) -> Result<(StatusCode, Json<SessionResponse>), GatewayError> {
    let limits = RequestedLimits {
        cpu_seconds: req.cpu_seconds,
        memory_bytes: req.memory_bytes,
        max_duration_seconds: req.max_duration_seconds,
    };
    let metadata = state.gateway.open(&req.user, &req.host, limits).await?;
    Ok((StatusCode::CREATED, Json(metadata.into())))
}

/// GET /gateway/sessions/{session_id}
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionResponse>, GatewayError> {
    let metadata = state.gateway.get(&session_id).await?;
    Ok(Json(metadata.into()))
}

/// POST /gateway/sessions/{session_id}/stdin
pub async fn write_stdin(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    JsonBody(req): JsonBody<StdinRequest>,
) -> Result<StatusCode, GatewayError> {
    state.gateway.stdin(&session_id, &req.data).await?;
    Ok(StatusCode::ACCEPTED)
}

/// POST /gateway/sessions/{session_id}/resize
pub async fn resize_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    JsonBody(req): JsonBody<ResizeRequest>,
) -> Result<StatusCode, GatewayError> {
    state
        .gateway
        .resize(&session_id, req.cols, req.rows)
        .await?;
    Ok(StatusCode::ACCEPTED)
}

/// DELETE /gateway/sessions/{session_id}
pub async fn close_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, GatewayError> {
    state.gateway.close(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /gateway/sessions/resume
pub async fn resume_session(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<ResumeRequest>,
) -> Result<Json<SessionResponse>, GatewayError> {
    let metadata = state.gateway.resume(&req.resume_token).await?;
    Ok(Json(metadata.into()))
}
