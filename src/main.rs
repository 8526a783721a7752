//! latch-echo: a single-connection TCP echo server
//!
//! Accepts one client at a time on a fixed address and writes back every
//! byte it reads, in chunks of at most 16 bytes, until the client closes
//! the stream. SIGINT or SIGTERM stops the server cleanly with exit status 0.
//!
//! Features:
//! - Bounded accept/read waits raced against a shutdown latch
//! - systemd readiness/stopping notifications (opt-in via environment)
//! - Configuration via CLI arguments or TOML file

mod config;
mod notify;
mod server;
mod signal;

use config::Config;
use notify::Notifier;
use server::EchoServer;
use signal::SignalLatch;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::fmt::{format::Writer, time::FormatTime};
use tracing_subscriber::EnvFilter;

/// Local wall-clock timestamps, e.g. `2024-05-01 12:00:00,123`.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S,%3f"))
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_timer(LocalTimer)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        "Starting latch-echo server"
    );

    // One thread serves everything: listener, client, and signal delivery.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run(config)).inspect_err(|e| {
        error!(error = %e, "Server failed");
    })
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let latch = Arc::new(SignalLatch::new());
    let _signals = signal::listen(Arc::clone(&latch))?;

    let notifier = Notifier::from_env();
    info!(enabled = notifier.is_enabled(), "Supervisor notifications");

    let server = EchoServer::bind(&config.host, config.port).await?;
    server.run(latch, notifier).await?;

    Ok(())
}
