//! Canopy radio-mesh supervisor daemon.
//!
//! Long-running controller attached to a gateway micro-controller over a
//! line-oriented byte link (serial device or TCP). Brings the mesh of radio
//! leaf nodes up, keeps it up through packet loss and node reboots, and
//! surfaces sensor state to an external HTTP uplink.
//!
//! - One task owns the link and drives the scheduling engine
//! - A debug TCP interface mirrors traffic and injects operator commands
//! - A lossy uplink worker pushes status changes and statistics
//! - A status writer dumps a human-readable snapshot every second

mod debug;
mod link;
mod master;
mod state_writer;
mod uplink;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::{broadcast, Mutex};
use tracing_subscriber::EnvFilter;

use canopy_mesh::engine::Engine;

/// Canopy mesh supervisor daemon.
#[derive(Parser, Debug)]
#[command(name = "canopy-agent", about = "Canopy radio-mesh supervisor")]
struct Cli {
    /// Configuration file.
    #[arg(long, default_value = "canopy.toml")]
    config: PathBuf,

    /// Debug interface listen address.
    #[arg(long, default_value = "0.0.0.0:1337")]
    debug_addr: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let resolved = canopy_mesh::config::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;

    tracing::info!(
        nodes = resolved.registry.len(),
        config = %cli.config.display(),
        "canopy-agent starting"
    );

    let engine = Arc::new(Mutex::new(Engine::new(resolved.registry, resolved.engine)));
    let (tap, _) = broadcast::channel(256);
    let uplink = uplink::spawn(resolved.uplink);
    let link = link::Link::new(resolved.link).await?;

    // ── Debug interface ─────────────────────────────────────────
    let debug_engine = engine.clone();
    let debug_tap = tap.clone();
    let debug_addr = cli.debug_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = debug::run(debug_engine, debug_tap, &debug_addr).await {
            tracing::error!(error = %e, "debug interface failed");
        }
    });

    // ── Status writer ───────────────────────────────────────────
    tokio::spawn(state_writer::run(engine.clone(), resolved.state_file));

    // ── Main link loop ──────────────────────────────────────────
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
            Ok(())
        }
        result = master::run(engine, link, tap, uplink) => result,
    }
}
