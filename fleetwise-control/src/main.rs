//! # Fleetwise Binary
//!
//! Entry point for the Fleetwise control plane process. It loads the TOML
//! configuration, wires the composition root with the system clock, the
//! in-memory store, and the HTTP invoker, starts the background loops, and
//! runs until interrupted.
//!
//! ## Usage
//!
//! ```bash
//! # Default configuration file (fleetwise.toml)
//! fleetwise
//!
//! # Custom configuration and debug logging
//! fleetwise --config fleet.toml --log-level debug
//! ```
//!
//! Credentials never appear in configuration: each instance names the
//! environment variable holding its key via `credential_ref`.

use clap::Parser;
use fleetwise_control::config::ControlPlaneConfig;
use fleetwise_control::plane::ControlPlane;
use fleetwise_core::{HttpInvoker, MemoryStore, SyntheticProber, SystemClock};
use std::sync::Arc;
use std::time::Duration;

/// Command line arguments for the control plane.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "fleetwise.toml")]
    config: String,

    /// Logging filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Seconds to wait for background loops during shutdown.
    #[arg(long, default_value_t = 5)]
    shutdown_grace_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .init();

    let config = if std::path::Path::new(&args.config).exists() {
        ControlPlaneConfig::load(&args.config)?
    } else {
        tracing::warn!(path = %args.config, "config file not found, starting with defaults");
        ControlPlaneConfig::default()
    };

    let invoker = Arc::new(HttpInvoker::new());
    let plane = ControlPlane::new(
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(SystemClock),
        invoker.clone(),
        Arc::new(SyntheticProber::new(invoker)),
    );

    plane.start().await?;
    tracing::info!("fleetwise control plane running, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    plane
        .shutdown(Duration::from_secs(args.shutdown_grace_secs))
        .await;

    Ok(())
}
