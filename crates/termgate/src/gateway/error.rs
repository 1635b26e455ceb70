//! Gateway error taxonomy.

use thiserror::Error;

use super::process::{LaunchError, ProcessError};
use crate::store::StorageError;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed or out-of-range input. Nothing was changed.
    #[error("{0}")]
    Invalid(String),

    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("resume token not found")]
    ResumeTokenNotFound,

    /// The row exists but no process is attached (launch failed or it exited).
    #[error("no running process for session {0}")]
    NoProcess(String),

    /// The row was written; the process did not start.
    #[error("session {session_id}: {source}")]
    Launch {
        session_id: String,
        #[source]
        source: LaunchError,
    },

    #[error("process error: {0}")]
    Process(#[from] ProcessError),

    #[error("metadata store error: {0}")]
    Storage(#[from] StorageError),
}

impl GatewayError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
