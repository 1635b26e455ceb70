//! Launcher that runs the configured program as a local child process.
//!
//! The child gets piped stdio. Its output is never written to disk: stdout
//! and stderr chunks are fanned out over a broadcast channel that a bridge
//! can [`subscribe`](LocalProcessLauncher::subscribe) to. A monitor task
//! waits for exit, the `max_duration_seconds` deadline, or a close request,
//! and fires the completion signal exactly once.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, broadcast, oneshot};
use tracing::{debug, error, info, warn};

use super::process::{Completion, LaunchError, LaunchedProcess, Process, ProcessError, ProcessLauncher};
use crate::store::{GatewaySessionMetadata, ResourceLimits};

/// Output chunks buffered per subscriber before it starts lagging.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Time a child gets to exit after SIGTERM before SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(2);

pub type OutputChunk = Arc<[u8]>;

#[derive(Debug, Clone)]
pub struct LocalLauncherConfig {
    pub command: String,
    pub args: Vec<String>,
    pub workdir: Option<PathBuf>,
}

impl Default for LocalLauncherConfig {
    fn default() -> Self {
        Self {
            command: "/bin/sh".to_string(),
            args: vec!["-i".to_string()],
            workdir: None,
        }
    }
}

// ============================================================================
// Launcher
// ============================================================================

#[derive(Clone)]
pub struct LocalProcessLauncher {
    config: LocalLauncherConfig,
    outputs: Arc<DashMap<String, broadcast::Sender<OutputChunk>>>,
}

impl LocalProcessLauncher {
    pub fn new(config: LocalLauncherConfig) -> Self {
        Self {
            config,
            outputs: Arc::new(DashMap::new()),
        }
    }

    /// Receive output of a running session. `None` once the process has ended.
    pub fn subscribe(&self, session_id: &str) -> Option<broadcast::Receiver<OutputChunk>> {
        self.outputs.get(session_id).map(|tx| tx.subscribe())
    }

    fn command(&self, metadata: &GatewaySessionMetadata) -> Command {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .env("TERMGATE_SESSION_ID", &metadata.session_id)
            .env("TERMGATE_USER", &metadata.user)
            .env("TERMGATE_HOST", &metadata.host)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.workdir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        apply_limits(&mut cmd, metadata.limits);
        cmd
    }
}

#[async_trait]
impl ProcessLauncher for LocalProcessLauncher {
    async fn launch(
        &self,
        metadata: &GatewaySessionMetadata,
    ) -> Result<LaunchedProcess, LaunchError> {
        let mut child = self
            .command(metadata)
            .spawn()
            .map_err(|e| LaunchError::classify(&self.config.command, e))?;

        let session_id = metadata.session_id.clone();
        let (output_tx, _) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        self.outputs.insert(session_id.clone(), output_tx.clone());

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(fan_out(stdout, output_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(fan_out(stderr, output_tx));
        }

        let exited = Arc::new(AtomicBool::new(false));
        let (close_tx, close_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();

        info!(
            session_id = %session_id,
            pid = child.id(),
            program = %self.config.command,
            "launched local process"
        );

        let process = LocalProcess {
            session_id: session_id.clone(),
            stdin: Mutex::new(child.stdin.take()),
            close_tx: StdMutex::new(Some(close_tx)),
            exited: exited.clone(),
            size: StdMutex::new(None),
        };

        tokio::spawn(monitor(
            session_id,
            child,
            Duration::from_secs(metadata.limits.max_duration_seconds),
            close_rx,
            done_tx,
            exited,
            self.outputs.clone(),
        ));

        Ok(LaunchedProcess {
            process: Arc::new(process),
            completion: done_rx,
        })
    }
}

#[cfg(unix)]
fn apply_limits(cmd: &mut Command, limits: ResourceLimits) {
    let cpu = limits.cpu_seconds as libc::rlim_t;
    let memory = limits.memory_bytes as libc::rlim_t;

    // SAFETY: pre_exec runs in the forked child before exec. The closure only
    // calls async-signal-safe libc functions on values copied into it.
    unsafe {
        cmd.pre_exec(move || {
            let cpu_limit = libc::rlimit {
                rlim_cur: cpu,
                rlim_max: cpu,
            };
            if libc::setrlimit(libc::RLIMIT_CPU, &cpu_limit) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            let memory_limit = libc::rlimit {
                rlim_cur: memory,
                rlim_max: memory,
            };
            if libc::setrlimit(libc::RLIMIT_AS, &memory_limit) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            #[cfg(target_os = "linux")]
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

async fn fan_out<R>(mut reader: R, tx: broadcast::Sender<OutputChunk>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                // No subscribers is fine; output is not retained.
                let _ = tx.send(Arc::from(&buf[..n]));
            }
        }
    }
}

async fn monitor(
    session_id: String,
    mut child: Child,
    max_duration: Duration,
    close_rx: oneshot::Receiver<()>,
    done_tx: oneshot::Sender<Completion>,
    exited: Arc<AtomicBool>,
    outputs: Arc<DashMap<String, broadcast::Sender<OutputChunk>>>,
) {
    let completion = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => Completion::Exited { code: status.code().unwrap_or(-1) },
            Err(e) => {
                error!(session_id = %session_id, error = %e, "failed to wait on child");
                Completion::Lost
            }
        },
        _ = tokio::time::sleep(max_duration) => {
            warn!(session_id = %session_id, max_duration_secs = max_duration.as_secs(), "process exceeded max duration");
            graceful_kill(&mut child).await;
            Completion::TimedOut
        }
        // Also fires when the process handle is dropped without close.
        _ = close_rx => {
            debug!(session_id = %session_id, "process closed");
            graceful_kill(&mut child).await;
            Completion::Killed
        }
    };

    exited.store(true, Ordering::Release);
    outputs.remove(&session_id);
    let _ = done_tx.send(completion);
}

/// SIGTERM, wait, SIGKILL.
async fn graceful_kill(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: pid comes from a Child that has not been reaped yet.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
        debug!(pid, "child ignored SIGTERM, sending SIGKILL");
    }

    let _ = child.kill().await;
}

// ============================================================================
// Process handle
// ============================================================================

pub struct LocalProcess {
    session_id: String,
    stdin: Mutex<Option<ChildStdin>>,
    close_tx: StdMutex<Option<oneshot::Sender<()>>>,
    exited: Arc<AtomicBool>,
    size: StdMutex<Option<(u16, u16)>>,
}

impl LocalProcess {
    /// Last size passed to `resize`. Pipes have no window, so it is only recorded.
    pub fn size(&self) -> Option<(u16, u16)> {
        *self.size.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_running(&self) -> Result<(), ProcessError> {
        if self.exited.load(Ordering::Acquire) {
            return Err(ProcessError::Exited);
        }
        Ok(())
    }
}

#[async_trait]
impl Process for LocalProcess {
    async fn write(&self, data: &[u8]) -> Result<(), ProcessError> {
        self.ensure_running()?;
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(ProcessError::Exited)?;

        let result = async {
            stdin.write_all(data).await?;
            stdin.flush().await
        }
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                guard.take();
                Err(ProcessError::Exited)
            }
            Err(e) => Err(ProcessError::Io(e)),
        }
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<(), ProcessError> {
        self.ensure_running()?;
        *self.size.lock().unwrap_or_else(PoisonError::into_inner) = Some((cols, rows));
        debug!(session_id = %self.session_id, cols, rows, "resize recorded");
        Ok(())
    }

    async fn close(&self) -> Result<(), ProcessError> {
        self.stdin.lock().await.take();
        let close_tx = self
            .close_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = close_tx {
            let _ = tx.send(());
        }
        Ok(())
    }
}
