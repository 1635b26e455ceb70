mod commands;

use std::net::IpAddr;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use termgate::config::DEFAULT_CONFIG_PATH;

// ============================================================================
// CLI Types
// ============================================================================

/// termgate - interactive terminal service with an HTTP session gateway
#[derive(Parser, Debug)]
#[command(version = termgate::build_info::VERSION, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the shell listener and the HTTP control plane
    Serve {
        /// Path to configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: String,

        /// HTTP host to bind to (overrides config file)
        #[arg(long)]
        host: Option<IpAddr>,

        /// HTTP port (overrides config file)
        #[arg(short, long)]
        port: Option<u16>,

        /// Shell listener port (overrides config file)
        #[arg(long)]
        shell_port: Option<u16>,
    },

    /// Load and validate a configuration file
    CheckConfig {
        /// Path to configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: String,
    },
}

// ============================================================================
// Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> std::process::ExitCode {
    init_tracing();

    match run().await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            host,
            port,
            shell_port,
        } => {
            let overrides = commands::serve::Overrides {
                host,
                port,
                shell_port,
            };
            commands::serve::run(&config, overrides).await
        }
        Commands::CheckConfig { config } => commands::serve::check_config(&config).await,
    }
}

// ============================================================================
// Initialization
// ============================================================================

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
