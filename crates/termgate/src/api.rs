//! Request and response bodies of the gateway HTTP API.
//!
//! Request types reject unknown fields. Numeric fields are signed so that a
//! negative value reaches validation as a 400 instead of a parse quirk.

use serde::{Deserialize, Serialize};

use crate::store::GatewaySessionMetadata;

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpenSessionRequest {
    pub user: String,
    pub host: String,
    pub cpu_seconds: i64,
    pub memory_bytes: i64,
    pub max_duration_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StdinRequest {
    /// Standard base64.
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResizeRequest {
    pub cols: i64,
    pub rows: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResumeRequest {
    pub resume_token: String,
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionResponse {
    pub session_id: String,
    pub resume_token: String,
    pub user: String,
    pub host: String,
    pub cpu_seconds: u64,
    pub memory_bytes: u64,
    pub max_duration_seconds: u64,
    pub created_at: String,
}

impl From<GatewaySessionMetadata> for SessionResponse {
    fn from(m: GatewaySessionMetadata) -> Self {
        Self {
            session_id: m.session_id,
            resume_token: m.resume_token,
            user: m.user,
            host: m.host,
            cpu_seconds: m.limits.cpu_seconds,
            memory_bytes: m.limits.memory_bytes,
            max_duration_seconds: m.limits.max_duration_seconds,
            created_at: m.created_at.to_rfc3339(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_fields_are_rejected() {
        let err = serde_json::from_str::<ResizeRequest>(r#"{"cols":1,"rows":2,"depth":3}"#)
            .unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn negative_numbers_parse_for_later_validation() {
        let req: ResizeRequest = serde_json::from_str(r#"{"cols":-5,"rows":10}"#).unwrap();
        assert_eq!(req.cols, -5);
    }
}
