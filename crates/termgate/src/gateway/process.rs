//! Process and launcher contracts.
//!
//! The gateway drives a backing program only through [`Process`], and gets
//! one only from a [`ProcessLauncher`]. Local pipes, containers and remote
//! exec all fit behind the same two traits.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::store::GatewaySessionMetadata;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("process has exited")]
    Exited,

    #[error("process I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a process ended. Delivered once through [`LaunchedProcess::completion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Exited { code: i32 },
    Killed,
    TimedOut,
    Lost,
}

impl Completion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Completion::Exited { .. } => "exited",
            Completion::Killed => "killed",
            Completion::TimedOut => "timed_out",
            Completion::Lost => "lost",
        }
    }
}

/// A running backing program bound to one gateway session.
#[async_trait]
pub trait Process: Send + Sync {
    /// Write bytes to the program's input, in order.
    async fn write(&self, data: &[u8]) -> Result<(), ProcessError>;

    async fn resize(&self, cols: u16, rows: u16) -> Result<(), ProcessError>;

    /// Stop the program. Closing an already finished process succeeds.
    async fn close(&self) -> Result<(), ProcessError>;
}

pub struct LaunchedProcess {
    pub process: Arc<dyn Process>,
    /// Fires exactly once when the program ends.
    pub completion: oneshot::Receiver<Completion>,
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("binary not found: {program}")]
    BinaryNotFound { program: String },

    #[error("failed to launch {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl LaunchError {
    /// Sort a spawn error into a configuration problem or an I/O failure.
    pub fn classify(program: impl Into<String>, source: std::io::Error) -> Self {
        let program = program.into();
        match source.kind() {
            std::io::ErrorKind::NotFound => LaunchError::BinaryNotFound { program },
            _ => LaunchError::Io { program, source },
        }
    }

    /// Stable code surfaced to API callers.
    pub fn code(&self) -> &'static str {
        match self {
            LaunchError::BinaryNotFound { .. } => "binary_not_found",
            LaunchError::Io { .. } => "launch_io",
        }
    }
}

#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Start the program for `metadata`, honouring its limits where possible.
    async fn launch(&self, metadata: &GatewaySessionMetadata)
    -> Result<LaunchedProcess, LaunchError>;
}
