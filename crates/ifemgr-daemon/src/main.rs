//! ifemgr Daemon - Main entry point
//!
//! Runs the ISP hardware manager on simulated hardware and serves the
//! control API and event stream.

mod api;
mod config;
mod server;
mod state;
mod ws;

use anyhow::{Context, Result};
use clap::Parser;
use ifemgr_core::{
    AcquireRequest, ErrorKind, HwEventKind, HwType, IfeSrc, InPort, NodeRes, OutPortId, StopMode,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::state::AppState;

#[derive(Parser, Debug)]
#[command(name = "ifemgr")]
#[command(about = "Camera ISP hardware manager daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "ifemgr.toml")]
    config: PathBuf,

    /// Bind address for the control server
    #[arg(short, long)]
    bind: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Run one acquire/start/overflow/recover/stop/release cycle and exit
    #[arg(long)]
    demo: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("ifemgr v{}", env!("CARGO_PKG_VERSION"));

    let mut config = config::load_config(&args.config)?;

    // Override bind address if specified
    if let Some(bind) = args.bind {
        config.daemon.bind = bind;
    }

    info!(
        full = config.platform.num_full,
        lite = config.platform.num_lite,
        sfe = config.platform.num_sfe,
        remote = config.platform.num_virtual,
        max_contexts = config.manager.max_contexts,
        "Configuration loaded"
    );

    let state = AppState::new(config.clone())?;

    if args.demo {
        let state = state.clone();
        tokio::task::spawn_blocking(move || run_demo(&state)).await??;
    } else {
        server::run(state, &config.daemon.bind).await?;
    }

    Ok(())
}

/// Scripted lifecycle against the simulated hardware, printed to stdout
fn run_demo(state: &Arc<AppState>) -> Result<()> {
    let manager = &state.manager;
    let req = AcquireRequest::new(vec![InPort::with_outputs([OutPortId::FULL, OutPortId::RDI0])]);

    let ctx = manager.acquire(&req, state.callback())?;
    let summary = manager.summary(ctx)?;
    println!("Acquired context {} ({:?}):", ctx, summary.ctx_type);
    for entry in &summary.base {
        println!("  - {} ({:?})", entry.hw, entry.split);
    }

    manager.start(ctx)?;
    println!("Context {} streaming", ctx);

    let ife = summary
        .base
        .iter()
        .map(|b| b.hw)
        .find(|hw| hw.hw_type == HwType::Ife)
        .context("context has no IFE")?;
    let hw = state.sim.hw(ife).context("IFE missing from platform")?;
    for _ in 0..3 {
        hw.raise(NodeRes::IfeSrc(IfeSrc::Camif), HwEventKind::Sof);
    }

    hw.raise(
        NodeRes::IfeSrc(IfeSrc::Camif),
        HwEventKind::Error {
            kind: ErrorKind::Overflow,
        },
    );
    let processed = manager.process_pending_work();
    let after = manager.summary(ctx)?;
    println!(
        "Overflow on {}: {} work item(s), state {}, recovery id {}",
        ife, processed, after.state, after.recovery_id
    );

    manager.stop(ctx, StopMode::AtFrameBoundary)?;
    manager.release(ctx)?;
    println!(
        "Context {} released, {} context(s) in use",
        ctx,
        manager.active_context_count()
    );
    Ok(())
}
