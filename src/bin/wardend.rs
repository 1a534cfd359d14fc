//! warden daemon: loads a spec set, starts supervision, reloads on
//! SIGHUP and shuts down gracefully on SIGINT/SIGTERM.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use warden::config::load_specs;
use warden::events::LogReporter;
use warden::supervisor::{Supervisor, SupervisorSettings};

#[derive(Debug, Parser)]
#[command(name = "wardend", about = "Sandboxing process supervisor")]
struct Options {
    /// Path to the process spec file (.toml or .json)
    #[arg(short, long)]
    config: PathBuf,

    /// Liveness grace window in milliseconds
    #[arg(long, default_value_t = 500)]
    grace_window_ms: u64,

    /// Log filter, e.g. "info" or "warden=debug"
    #[arg(long, default_value = "info")]
    log_filter: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = Options::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&options.log_filter)),
        )
        .init();

    let specs = load_specs(&options.config)
        .with_context(|| format!("loading {}", options.config.display()))?;
    info!(
        config = %options.config.display(),
        processes = specs.len(),
        "Configuration loaded"
    );

    let settings = SupervisorSettings {
        grace_window: Duration::from_millis(options.grace_window_ms),
    };
    let supervisor = Supervisor::new(Arc::new(LogReporter), settings);

    supervisor
        .start_all(specs)
        .await
        .context("starting supervision")?;

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down");
                break;
            }
            _ = sighup.recv() => {
                info!("SIGHUP received, reloading configuration");
                match load_specs(&options.config) {
                    Ok(specs) => {
                        if let Err(e) = supervisor.reload(specs).await {
                            error!(error = %e, "Reload failed");
                        }
                    }
                    Err(e) => error!(error = %e, "Reload skipped, config invalid"),
                }
            }
        }
    }

    supervisor.shutdown().await.context("stopping processes")?;
    info!("Shutdown complete");

    Ok(())
}
