// crates/server/src/main.rs
//! audioscribe server binary.
//!
//! Starts the job system, then serves the HTTP API until SIGINT/SIGTERM.
//! On shutdown the queue stops first so running transcribers are terminated
//! and open event streams end.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use audioscribe_jobs::{JobStore, JobSystem, JobsConfig, MemoryJobStore};
use audioscribe_observability::{init_tracing, LogFormat};
use audioscribe_server::{create_app, AppState};
use clap::Parser;

/// Default port for the server.
const DEFAULT_PORT: u16 = 47900;

#[derive(Debug, Parser)]
#[command(name = "audioscribe", version, about = "Audio transcription job server")]
struct Cli {
    /// Port to listen on [env: AUDIOSCRIBE_PORT, PORT]
    #[arg(long)]
    port: Option<u16>,

    /// Worker pool size (multi-track jobs need at least 2)
    #[arg(long)]
    workers: Option<usize>,

    /// Transcriber executable
    #[arg(long)]
    transcriber: Option<PathBuf>,

    /// Emit JSON log lines instead of compact text
    #[arg(long, env = "AUDIOSCRIBE_JSON_LOGS")]
    json_logs: bool,
}

/// Get the server port from environment or use default.
fn get_port() -> u16 {
    std::env::var("AUDIOSCRIBE_PORT")
        .ok()
        .or_else(|| std::env::var("PORT").ok())
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

fn jobs_config(cli: &Cli) -> JobsConfig {
    let mut config = JobsConfig::from_env();
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if let Some(transcriber) = &cli.transcriber {
        config.executable = transcriber.clone();
    }
    config
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let format = if cli.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };
    init_tracing(format)?;

    let config = jobs_config(&cli);
    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    let jobs = Arc::new(JobSystem::start(config, store).context("invalid job configuration")?);
    let state = AppState::new(Arc::clone(&jobs));
    let app = create_app(Arc::clone(&state));

    let port = cli.port.unwrap_or_else(get_port);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "audioscribe listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            jobs.stop().await;
            state.shutdown.cancel();
        })
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}
