//! Project lifecycle monitor binary.
//!
//! Spawned alongside a session; outlives the orchestrator and archives the
//! active episode when the watched session ends or signals its close.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use engram_encoder::{EncoderConfig, EncoderSupervisor};
use engram_memory::manager::default_user_dir;
use engram_memory::{run_monitor, MonitorConfig};

#[derive(Debug, Parser)]
#[command(
    name = "engram-monitor",
    about = "Watches a session process and archives its episode on exit"
)]
struct MonitorArgs {
    /// Pid of the session process to watch.
    #[arg(long)]
    watch_pid: u32,

    /// Project memory directory.
    #[arg(long)]
    project_path: PathBuf,

    /// User-tier memory directory.
    #[arg(long)]
    user_path: Option<PathBuf>,
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

fn main() -> Result<()> {
    let args = MonitorArgs::parse();
    init_tracing();

    let config = MonitorConfig::new(
        args.project_path,
        args.user_path.unwrap_or_else(default_user_dir),
        args.watch_pid,
    );
    let encoder = EncoderSupervisor::new(EncoderConfig::default());
    run_monitor(&config, &encoder)
}
