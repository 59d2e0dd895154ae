//! Project lifecycle monitor.
//!
//! A long-lived process independent of the orchestrator: it warms the
//! encoder, watches the owning session's pid, consumes the external close
//! signal, and archives (or discards) the active episode when the session
//! ends. Shutdown of the worker runs here too, so the owner-died path leaks
//! no model-holding process.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use engram_core::{process_alive, write_text_atomic};
use engram_encoder::EncoderSupervisor;

use crate::episode::{generate_summary, load_recovery};
use crate::manager::{MemoryManager, RECOVERY_FILE};

/// Name of the close-signal document inside the project directory.
pub const CLOSE_SIGNAL_FILE: &str = "close_signal.json";

/// Written by a session-termination collaborator; consumed and deleted by
/// the monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseSignal {
    pub reason: String,
    pub timestamp: u64,
    pub pid: u32,
}

pub fn write_close_signal(project_dir: &Path, signal: &CloseSignal) -> Result<()> {
    let encoded = serde_json::to_string(signal)?;
    write_text_atomic(&project_dir.join(CLOSE_SIGNAL_FILE), &encoded)
}

/// Reads and deletes the close signal. A corrupt signal file is deleted and
/// reported as absent so a bad writer cannot wedge the monitor loop.
pub fn take_close_signal(project_dir: &Path) -> Option<CloseSignal> {
    let path = project_dir.join(CLOSE_SIGNAL_FILE);
    let content = std::fs::read_to_string(&path).ok()?;
    let _ = std::fs::remove_file(&path);
    match serde_json::from_str(&content) {
        Ok(signal) => Some(signal),
        Err(error) => {
            warn!(path = %path.display(), %error, "discarding corrupt close signal");
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub project_dir: PathBuf,
    pub user_dir: PathBuf,
    /// Pid of the session process whose lifetime bounds the episode.
    pub watch_pid: u32,
    pub poll_interval: Duration,
    /// Wait after owner death for a late close signal before archiving.
    pub grace_period: Duration,
    /// How long to wait for the encoder before archiving without embeddings.
    pub encoder_wait: Duration,
}

impl MonitorConfig {
    pub fn new(project_dir: PathBuf, user_dir: PathBuf, watch_pid: u32) -> Self {
        Self {
            project_dir,
            user_dir,
            watch_pid,
            poll_interval: Duration::from_secs(2),
            grace_period: Duration::from_secs(3),
            encoder_wait: Duration::from_secs(60),
        }
    }
}

fn has_active_episode(project_dir: &Path) -> bool {
    load_recovery(&project_dir.join(RECOVERY_FILE)).episode.is_some()
}

/// Archives the active episode with a reason-prefixed summary, or discards
/// it when nothing was buffered. Reconstructing the manager re-runs its own
/// staleness pass first, so an already-expired episode is not archived twice.
fn close_active_episode(
    config: &MonitorConfig,
    encoder: &EncoderSupervisor,
    reason: &str,
) -> Result<()> {
    if !has_active_episode(&config.project_dir) {
        return Ok(());
    }
    if encoder.wait_until_ready(config.encoder_wait).is_err() {
        warn!("encoder not ready; archiving without embeddings");
    }
    let mut manager =
        MemoryManager::open(&config.project_dir, &config.user_dir, encoder.clone())?;
    let Some(episode) = manager.active_episode() else {
        return Ok(());
    };
    let episode_id = episode.id.clone();
    let title = episode.title.clone();
    if manager.buffered_messages().is_empty() {
        info!(%episode_id, "discarding empty episode");
        manager.discard_episode()?;
        return Ok(());
    }
    let summary = format!(
        "[{reason}] {}",
        generate_summary(&title, manager.buffered_messages())
    );
    manager.close_episode(Some(summary))?;
    Ok(())
}

/// The monitor loop. Returns once the episode is closed, the owner is gone,
/// or no episode remains active; always shuts the encoder down on the way
/// out (redundant shutdown is safe).
pub fn run_monitor(config: &MonitorConfig, encoder: &EncoderSupervisor) -> Result<()> {
    info!(
        watch_pid = config.watch_pid,
        project_dir = %config.project_dir.display(),
        "lifecycle monitor started"
    );
    encoder.start_warmup();

    let outcome = monitor_loop(config, encoder);
    encoder.shutdown();
    outcome
}

fn monitor_loop(config: &MonitorConfig, encoder: &EncoderSupervisor) -> Result<()> {
    loop {
        if let Some(signal) = take_close_signal(&config.project_dir) {
            info!(reason = %signal.reason, "close signal received");
            close_active_episode(config, encoder, &format!("session ended: {}", signal.reason))?;
            return Ok(());
        }

        if !process_alive(config.watch_pid) {
            info!(watch_pid = config.watch_pid, "watched session exited");
            // The terminating session may still be writing its signal.
            thread::sleep(config.grace_period);
            let reason = match take_close_signal(&config.project_dir) {
                Some(signal) => format!("session ended: {}", signal.reason),
                None => "owning session exited".to_string(),
            };
            close_active_episode(config, encoder, &reason)?;
            return Ok(());
        }

        if !has_active_episode(&config.project_dir) {
            info!("no active episode left to watch");
            return Ok(());
        }

        thread::sleep(config.poll_interval);
    }
}
