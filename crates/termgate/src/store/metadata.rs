//! Gateway session metadata and the store contract that persists it.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use super::error::StorageResult;

/// Prefix on every gateway session id.
pub const SESSION_ID_PREFIX: &str = "gw_";

const RESUME_TOKEN_BYTES: usize = 32;

/// Resource limits requested at open. Forwarded to the launcher untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu_seconds: u64,
    pub memory_bytes: u64,
    pub max_duration_seconds: u64,
}

/// One gateway session row. `session_id` and `resume_token` never change
/// after open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewaySessionMetadata {
    pub session_id: String,
    pub resume_token: String,
    pub user: String,
    pub host: String,
    pub limits: ResourceLimits,
    pub created_at: DateTime<Utc>,
}

impl GatewaySessionMetadata {
    /// A new row with a fresh id and resume token.
    pub fn new(user: impl Into<String>, host: impl Into<String>, limits: ResourceLimits) -> Self {
        Self {
            session_id: new_session_id(),
            resume_token: new_resume_token(),
            user: user.into(),
            host: host.into(),
            limits,
            created_at: Utc::now(),
        }
    }
}

pub fn new_session_id() -> String {
    format!("{SESSION_ID_PREFIX}{}", Ulid::new())
}

/// 256 random bits, URL-safe base64 without padding.
pub fn new_resume_token() -> String {
    let bytes: [u8; RESUME_TOKEN_BYTES] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Ids safe to use as a file name or map key.
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Persistence for gateway session rows.
///
/// Implementations must keep the resume-token lookup consistent with the
/// latest upsert for each session id.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert or replace the row for `metadata.session_id`.
    async fn upsert(&self, metadata: &GatewaySessionMetadata) -> StorageResult<()>;

    async fn get(&self, session_id: &str) -> StorageResult<Option<GatewaySessionMetadata>>;

    async fn find_by_resume_token(
        &self,
        resume_token: &str,
    ) -> StorageResult<Option<GatewaySessionMetadata>>;
}
