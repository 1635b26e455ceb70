//! Control-plane session lifecycle.
//!
//! [`GatewayService`] owns the live process table and talks to the outside
//! world only through [`ProcessLauncher`] and [`MetadataStore`]. Every
//! operation on one session id runs under that id's lock, so writes to one
//! process never interleave. Validation happens before anything is touched.

pub mod error;
pub mod local;
pub mod process;

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::store::{GatewaySessionMetadata, MetadataStore, ResourceLimits};
use crate::sync::KeyedLocks;

pub use error::{GatewayError, GatewayResult};
pub use local::{LocalLauncherConfig, LocalProcessLauncher};
pub use process::{
    Completion, LaunchError, LaunchedProcess, Process, ProcessError, ProcessLauncher,
};

/// Largest accepted terminal dimension for resize.
pub const MAX_DIMENSION: i64 = 1000;

pub const DEFAULT_STDIN_MAX_BYTES: usize = 64 * 1024;

/// Limits as they arrive from a caller, before validation.
#[derive(Debug, Clone, Copy)]
pub struct RequestedLimits {
    pub cpu_seconds: i64,
    pub memory_bytes: i64,
    pub max_duration_seconds: i64,
}

impl RequestedLimits {
    fn validate(self) -> GatewayResult<ResourceLimits> {
        Ok(ResourceLimits {
            cpu_seconds: positive("cpu_seconds", self.cpu_seconds)?,
            memory_bytes: positive("memory_bytes", self.memory_bytes)?,
            max_duration_seconds: positive("max_duration_seconds", self.max_duration_seconds)?,
        })
    }
}

fn positive(field: &str, value: i64) -> GatewayResult<u64> {
    u64::try_from(value)
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| GatewayError::invalid(format!("{field} must be a positive integer")))
}

fn dimension(field: &str, value: i64) -> GatewayResult<u16> {
    if !(1..=MAX_DIMENSION).contains(&value) {
        return Err(GatewayError::invalid(format!(
            "{field} must be between 1 and {MAX_DIMENSION}"
        )));
    }
    u16::try_from(value).map_err(|_| GatewayError::invalid(format!("{field} is out of range")))
}

fn required(field: &str, value: &str) -> GatewayResult<()> {
    if value.trim().is_empty() {
        return Err(GatewayError::invalid(format!("{field} must not be empty")));
    }
    Ok(())
}

#[derive(Clone)]
pub struct GatewayService {
    launcher: Arc<dyn ProcessLauncher>,
    store: Arc<dyn MetadataStore>,
    processes: Arc<DashMap<String, Arc<dyn Process>>>,
    locks: KeyedLocks,
    stdin_max_bytes: usize,
}

impl GatewayService {
    pub fn new(
        launcher: Arc<dyn ProcessLauncher>,
        store: Arc<dyn MetadataStore>,
        stdin_max_bytes: usize,
    ) -> Self {
        Self {
            launcher,
            store,
            processes: Arc::new(DashMap::new()),
            locks: KeyedLocks::new(),
            stdin_max_bytes,
        }
    }

    pub fn stdin_max_bytes(&self) -> usize {
        self.stdin_max_bytes
    }

    pub fn locks(&self) -> &KeyedLocks {
        &self.locks
    }

    /// Number of sessions with a process attached.
    pub fn live_sessions(&self) -> usize {
        self.processes.len()
    }

    /// Persist a new row, then launch its process.
    ///
    /// A launch failure leaves the row in place and reports its id.
    pub async fn open(
        &self,
        user: &str,
        host: &str,
        limits: RequestedLimits,
    ) -> GatewayResult<GatewaySessionMetadata> {
        required("user", user)?;
        required("host", host)?;
        let limits = limits.validate()?;

        let metadata = GatewaySessionMetadata::new(user, host, limits);
        let _guard = self.locks.acquire(&metadata.session_id).await;
        self.store.upsert(&metadata).await?;

        let launched = match self.launcher.launch(&metadata).await {
            Ok(launched) => launched,
            Err(source) => {
                warn!(
                    session_id = %metadata.session_id,
                    code = source.code(),
                    error = %source,
                    "process launch failed"
                );
                return Err(GatewayError::Launch {
                    session_id: metadata.session_id,
                    source,
                });
            }
        };

        self.attach(&metadata.session_id, launched);
        info!(
            session_id = %metadata.session_id,
            user = %metadata.user,
            host = %metadata.host,
            "gateway session opened"
        );
        Ok(metadata)
    }

    fn attach(&self, session_id: &str, launched: LaunchedProcess) {
        let LaunchedProcess {
            process,
            completion,
        } = launched;
        self.processes
            .insert(session_id.to_string(), process.clone());

        let processes = self.processes.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            let completion = completion.await.unwrap_or(Completion::Lost);
            // Only drop the entry if it still points at this process.
            processes.remove_if(&session_id, |_, current| Arc::ptr_eq(current, &process));
            match completion {
                Completion::Exited { code } => {
                    info!(session_id = %session_id, code, "gateway process exited")
                }
                other => info!(session_id = %session_id, completion = other.as_str(), "gateway process ended"),
            }
        });
    }

    pub async fn get(&self, session_id: &str) -> GatewayResult<GatewaySessionMetadata> {
        self.store
            .get(session_id)
            .await?
            .ok_or_else(|| GatewayError::SessionNotFound(session_id.to_string()))
    }

    /// Decode `data` and write it to the session's process.
    pub async fn stdin(&self, session_id: &str, data: &str) -> GatewayResult<()> {
        // Reject before decoding anything an attacker can make large.
        let upper_bound = data.len() / 4 * 3;
        if upper_bound > self.stdin_max_bytes + 2 {
            return Err(GatewayError::PayloadTooLarge {
                size: upper_bound,
                max: self.stdin_max_bytes,
            });
        }
        let bytes = STANDARD
            .decode(data.as_bytes())
            .map_err(|e| GatewayError::invalid(format!("data is not valid base64: {e}")))?;
        if bytes.len() > self.stdin_max_bytes {
            return Err(GatewayError::PayloadTooLarge {
                size: bytes.len(),
                max: self.stdin_max_bytes,
            });
        }

        let _guard = self.locks.acquire(session_id).await;
        let process = self.live_process(session_id).await?;
        if bytes.is_empty() {
            return Ok(());
        }
        match process.write(&bytes).await {
            Ok(()) => {
                debug!(session_id, bytes = bytes.len(), "stdin written");
                Ok(())
            }
            Err(ProcessError::Exited) => Err(GatewayError::NoProcess(session_id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn resize(&self, session_id: &str, cols: i64, rows: i64) -> GatewayResult<()> {
        let cols = dimension("cols", cols)?;
        let rows = dimension("rows", rows)?;

        let _guard = self.locks.acquire(session_id).await;
        let process = self.live_process(session_id).await?;
        match process.resize(cols, rows).await {
            Ok(()) => Ok(()),
            Err(ProcessError::Exited) => Err(GatewayError::NoProcess(session_id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Stop the session's process. A row without a process closes cleanly.
    pub async fn close(&self, session_id: &str) -> GatewayResult<()> {
        let result = {
            let _guard = self.locks.acquire(session_id).await;
            match self.processes.remove(session_id) {
                Some((_, process)) => {
                    info!(session_id, "closing gateway session");
                    process.close().await.map_err(GatewayError::from)
                }
                None => self.get(session_id).await.map(|_| ()),
            }
        };
        self.locks.remove_if_unused(session_id);
        result
    }

    pub async fn resume(&self, resume_token: &str) -> GatewayResult<GatewaySessionMetadata> {
        required("resume_token", resume_token)?;
        self.store
            .find_by_resume_token(resume_token)
            .await?
            .ok_or(GatewayError::ResumeTokenNotFound)
    }

    /// Close every live process. Used at shutdown.
    pub async fn close_all(&self) {
        let ids: Vec<String> = self.processes.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Err(e) = self.close(&id).await {
                warn!(session_id = %id, error = %e, "failed to close session at shutdown");
            }
        }
    }

    /// The attached process, or which of the two "missing" cases applies.
    async fn live_process(&self, session_id: &str) -> GatewayResult<Arc<dyn Process>> {
        if let Some(process) = self.processes.get(session_id) {
            return Ok(process.clone());
        }
        match self.store.get(session_id).await? {
            Some(_) => Err(GatewayError::NoProcess(session_id.to_string())),
            None => Err(GatewayError::SessionNotFound(session_id.to_string())),
        }
    }
}
