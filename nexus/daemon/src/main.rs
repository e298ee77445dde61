//! Nexus Daemon - Adaptive LLM Router Service
//!
//! Reads JSON-lines generation requests on stdin and writes one JSON
//! response per line on stdout. Requests run concurrently; a response
//! carries the `id` of its request when one was given.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (~/.config/nexus/router.toml)
//! nexus-daemon
//!
//! # With config file and a custom ledger location
//! nexus-daemon --config /etc/nexus/router.toml --performance-db /var/lib/nexus/perf.json
//!
//! # One-off request
//! echo '{"id":1,"messages":[{"role":"user","content":"hi"}],"intent":"chit_chat"}' | nexus-daemon
//!
//! # Verbose logging
//! RUST_LOG=debug nexus-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: stop reading input, cancel in-flight requests,
//!   write a final ledger checkpoint

mod server;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use nexus_core::{load_config, load_config_from_path, ConfigOverrides};
use server::DaemonServer;

/// Nexus Daemon - adaptive multi-provider LLM router
#[derive(Parser, Debug)]
#[command(name = "nexus-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "NEXUS_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Performance ledger path
    #[arg(long, env = "NEXUS_PERFORMANCE_DB", value_name = "PATH")]
    performance_db: Option<PathBuf>,

    /// Cap on attempts per request, overriding config and environment
    #[arg(long, value_name = "N")]
    max_attempts: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "NEXUS_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

/// Initialize logging with the specified level
///
/// Logs go to stderr; stdout carries responses.
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("nexus_daemon={level},nexus_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    Ok(())
}

/// CLI flags that take precedence over file and environment settings
fn cli_overrides(args: &Args) -> ConfigOverrides {
    let mut overrides = ConfigOverrides::new();
    if let Some(ref path) = args.performance_db {
        overrides = overrides.with_performance_db(path.clone());
    }
    if let Some(attempts) = args.max_attempts {
        overrides = overrides.with_max_attempts(attempts);
    }
    overrides
}

/// Cancel `shutdown` on SIGINT or SIGTERM
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => info!("Received Ctrl+C, shutting down"),
            () = terminate => info!("Received SIGTERM, shutting down"),
        }

        shutdown.cancel();
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging first
    init_logging(&args.log_level)?;

    info!("Nexus daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = match args.config.clone() {
        Some(path) => load_config_from_path(Some(path)),
        None => load_config(),
    }
    .context("Failed to load configuration")?;

    cli_overrides(&args).apply(&mut config);

    info!(
        source = %config.source(),
        config_path = ?config.config_file_path,
        providers = config.router.providers.len(),
        performance_db = ?config.router.persistence.path,
        "Configuration loaded"
    );

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let server = DaemonServer::start(&config.router, shutdown.clone()).await?;

    let result = server
        .serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
        .await;

    info!("Shutting down...");
    if let Err(e) = server.shutdown().await {
        error!(error = %e, "Final ledger checkpoint failed");
    }

    match result {
        Ok(stats) => {
            info!(
                received = stats.received,
                answered = stats.answered,
                "Nexus daemon stopped cleanly"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}
