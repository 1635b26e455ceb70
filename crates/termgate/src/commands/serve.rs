//! `termgate serve`: shell listener plus HTTP control plane.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

use termgate::admission::{AdmissionGate, RateLimitConfig, RateLimiter};
use termgate::config::{self, Config};
use termgate::gateway::{GatewayService, LocalProcessLauncher};
use termgate::server::{self, AppState};
use termgate::shell::{RuntimeSettings, ShellServer, TelnetHandshake};
use termgate::shutdown::{Drain, Tasks};
use termgate::store::{FileMetadataStore, MemoryMetadataStore, MetadataStore};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const SESSION_LOCK_IDLE: Duration = Duration::from_secs(600);

pub struct Overrides {
    pub host: Option<IpAddr>,
    pub port: Option<u16>,
    pub shell_port: Option<u16>,
}

pub async fn run(config_path: &str, overrides: Overrides) -> Result<()> {
    let mut config = Config::load(config_path)
        .await
        .with_context(|| format!("failed to load {config_path}"))?;

    // CLI overrides config
    if let Some(host) = overrides.host {
        config.server.host = host.to_string();
    }
    if let Some(port) = overrides.port {
        config.server.port = port;
    }
    if let Some(port) = overrides.shell_port {
        config.shell.port = port;
    }
    config.validate()?;

    let tasks = Tasks::new();

    // Gateway
    let store: Arc<dyn MetadataStore> = match &config.gateway.store_path {
        Some(path) => {
            let dir = config::resolve_path(Path::new(config_path), path);
            info!(path = %dir.display(), "using file metadata store");
            Arc::new(FileMetadataStore::new(dir))
        }
        None => {
            info!("using in-memory metadata store");
            Arc::new(MemoryMetadataStore::new())
        }
    };
    let launcher = Arc::new(LocalProcessLauncher::new(config.gateway.launcher_config()));
    let gateway = GatewayService::new(launcher, store, config.gateway.stdin_max_bytes);
    gateway
        .locks()
        .spawn_sweeper(SWEEP_INTERVAL, SESSION_LOCK_IDLE, tasks.token());

    // Shell
    let limiter = Arc::new(RateLimiter::new(RateLimitConfig::from(&config.rate_limit)));
    limiter.spawn_sweeper(
        SWEEP_INTERVAL.min(Duration::from_secs(config.rate_limit.idle_ttl_seconds)),
        tasks.token(),
    );
    let shell_gate = AdmissionGate::new(config.shell.max_sessions);

    if config.shell.enabled {
        let shell = Arc::new(ShellServer::new(
            limiter,
            shell_gate.clone(),
            Arc::new(config.identity_resolver()),
            Arc::new(TelnetHandshake::new()),
            RuntimeSettings::from_config(&config.shell),
            config.shell.handshake_timeout(),
            tasks.clone(),
        ));
        let ip: IpAddr = config.shell.host.parse()?;
        let addr = SocketAddr::new(ip, config.shell.port);
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind shell listener on {addr}"))?;
        tasks.spawn(async move {
            if let Err(e) = shell.serve(listener).await {
                error!(error = %e, "shell listener failed");
            }
        });
    } else {
        info!("shell listener disabled");
    }

    // HTTP
    let state = AppState {
        gateway: gateway.clone(),
        shell_gate,
        api_token: config.server.api_token.clone(),
        max_connections: config.server.max_connections,
    };
    let app = server::build_app(state, config.server.request_timeout());

    let ip: IpAddr = config.server.host.parse()?;
    let addr = SocketAddr::new(ip, config.server.port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {addr}"))?;

    info!(addr = %addr, version = termgate::build_info::VERSION, "starting server");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    gateway.close_all().await;
    if let Drain::TimedOut { remaining } = tasks.shutdown(config.server.shutdown_grace()).await {
        warn!(remaining, "exiting with sessions still running");
    }

    info!("server stopped");
    Ok(())
}

/// Load and validate a config file without starting anything.
pub async fn check_config(config_path: &str) -> Result<()> {
    let config = Config::load(config_path)
        .await
        .with_context(|| format!("failed to load {config_path}"))?;
    config.validate()?;

    println!("{config_path}: ok");
    println!(
        "  http  {}:{}  shell  {}:{} ({})",
        config.server.host,
        config.server.port,
        config.shell.host,
        config.shell.port,
        if config.shell.enabled { "enabled" } else { "disabled" },
    );
    println!(
        "  identities: {}",
        config.identity_resolver().len()
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
