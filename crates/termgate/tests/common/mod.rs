//! Common test utilities.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::extract::connect_info::MockConnectInfo;
use tokio::sync::oneshot;

use termgate::admission::AdmissionGate;
use termgate::gateway::{
    Completion, GatewayService, LaunchError, LaunchedProcess, Process, ProcessError,
    ProcessLauncher,
};
use termgate::server::{self, AppState};
use termgate::store::{GatewaySessionMetadata, MemoryMetadataStore};

/// Everything the fake processes were asked to do.
#[derive(Default)]
pub struct Recorded {
    pub writes: Mutex<Vec<(String, Vec<u8>)>>,
    pub resizes: Mutex<Vec<(String, u16, u16)>>,
    pub closed: Mutex<Vec<String>>,
}

impl Recorded {
    pub fn writes(&self) -> Vec<(String, Vec<u8>)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn resizes(&self) -> Vec<(String, u16, u16)> {
        self.resizes.lock().unwrap().clone()
    }

    pub fn closed(&self) -> Vec<String> {
        self.closed.lock().unwrap().clone()
    }
}

struct RecordingProcess {
    session_id: String,
    recorded: Arc<Recorded>,
    done: Mutex<Option<oneshot::Sender<Completion>>>,
}

#[async_trait]
impl Process for RecordingProcess {
    async fn write(&self, data: &[u8]) -> Result<(), ProcessError> {
        self.recorded
            .writes
            .lock()
            .unwrap()
            .push((self.session_id.clone(), data.to_vec()));
        Ok(())
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<(), ProcessError> {
        self.recorded
            .resizes
            .lock()
            .unwrap()
            .push((self.session_id.clone(), cols, rows));
        Ok(())
    }

    async fn close(&self) -> Result<(), ProcessError> {
        self.recorded.closed.lock().unwrap().push(self.session_id.clone());
        if let Some(tx) = self.done.lock().unwrap().take() {
            let _ = tx.send(Completion::Killed);
        }
        Ok(())
    }
}

/// Launcher that records instead of spawning. `fail` makes every launch
/// report a missing binary.
#[derive(Default)]
pub struct RecordingLauncher {
    pub recorded: Arc<Recorded>,
    pub fail: bool,
}

#[async_trait]
impl ProcessLauncher for RecordingLauncher {
    async fn launch(
        &self,
        metadata: &GatewaySessionMetadata,
    ) -> Result<LaunchedProcess, LaunchError> {
        if self.fail {
            return Err(LaunchError::BinaryNotFound {
                program: "/opt/missing/shell".to_string(),
            });
        }
        let (tx, rx) = oneshot::channel();
        Ok(LaunchedProcess {
            process: Arc::new(RecordingProcess {
                session_id: metadata.session_id.clone(),
                recorded: self.recorded.clone(),
                done: Mutex::new(Some(tx)),
            }),
            completion: rx,
        })
    }
}

pub struct TestApp {
    pub router: Router,
    pub recorded: Arc<Recorded>,
    pub gateway: GatewayService,
}

pub struct TestOptions {
    pub fail_launch: bool,
    pub stdin_max_bytes: usize,
    pub api_token: Option<String>,
    pub peer: SocketAddr,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            fail_launch: false,
            stdin_max_bytes: 1024,
            api_token: None,
            peer: SocketAddr::from(([127, 0, 0, 1], 40000)),
        }
    }
}

pub fn test_app_with(options: TestOptions) -> TestApp {
    let launcher = Arc::new(RecordingLauncher {
        recorded: Arc::new(Recorded::default()),
        fail: options.fail_launch,
    });
    let recorded = launcher.recorded.clone();
    let gateway = GatewayService::new(
        launcher,
        Arc::new(MemoryMetadataStore::new()),
        options.stdin_max_bytes,
    );
    let state = AppState {
        gateway: gateway.clone(),
        shell_gate: AdmissionGate::new(4),
        api_token: options.api_token,
        max_connections: 64,
    };
    let router = server::build_app(state, Duration::from_secs(30))
        .layer(MockConnectInfo(options.peer));
    TestApp {
        router,
        recorded,
        gateway,
    }
}

pub fn test_app() -> TestApp {
    test_app_with(TestOptions::default())
}
