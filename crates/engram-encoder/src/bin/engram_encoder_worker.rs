//! Out-of-process embedding worker.
//!
//! Hosts the fastembed model and serves line-delimited JSON encode requests
//! on stdin/stdout. Runs isolated from the orchestrator so model load never
//! blocks it, and self-terminates when the owning process disappears.

use std::io::{self, Write};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::Parser;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use engram_core::process_alive;
use engram_encoder::{run_worker, TextEncoder, WorkerResponse};

const OWNER_POLL_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Parser)]
#[command(
    name = "engram-encoder-worker",
    about = "Embedding worker speaking line-delimited JSON over stdin/stdout"
)]
struct WorkerArgs {
    /// Pid of the owning process; the worker exits once it is gone.
    #[arg(long)]
    parent_pid: Option<u32>,

    /// Embedding model identifier.
    #[arg(long, env = "ENGRAM_ENCODER_MODEL", default_value = "paraphrase-multilingual-MiniLM-L12-v2")]
    model: String,
}

struct FastembedEncoder {
    model: TextEmbedding,
}

impl TextEncoder for FastembedEncoder {
    fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.model
            .embed(texts.to_vec(), None)
            .map_err(|error| anyhow!("{error}"))
    }
}

fn resolve_model(name: &str) -> Result<EmbeddingModel> {
    match name {
        "paraphrase-multilingual-MiniLM-L12-v2" | "ParaphraseMLMiniLML12V2" => {
            Ok(EmbeddingModel::ParaphraseMLMiniLML12V2)
        }
        "all-MiniLM-L6-v2" | "AllMiniLML6V2" => Ok(EmbeddingModel::AllMiniLML6V2),
        "all-MiniLM-L12-v2" | "AllMiniLML12V2" => Ok(EmbeddingModel::AllMiniLML12V2),
        "multilingual-e5-small" | "MultilingualE5Small" => Ok(EmbeddingModel::MultilingualE5Small),
        other => Err(anyhow!("unknown embedding model '{other}'")),
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    // stdout carries the wire protocol; diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .with_target(false)
        .compact()
        .init();
}

fn spawn_owner_watch(parent_pid: u32) {
    let _ = thread::Builder::new()
        .name("engram-owner-watch".to_string())
        .spawn(move || loop {
            thread::sleep(OWNER_POLL_INTERVAL);
            if !process_alive(parent_pid) {
                // Owner is gone; exit instead of lingering as an orphaned
                // model-holding process.
                std::process::exit(0);
            }
        });
}

fn emit_load_failure(message: String) {
    let reply = WorkerResponse::error(message);
    if let Ok(encoded) = serde_json::to_string(&reply) {
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{encoded}");
        let _ = stdout.flush();
    }
}

fn main() {
    let args = WorkerArgs::parse();
    init_tracing();

    let model_name = match resolve_model(&args.model) {
        Ok(model_name) => model_name,
        Err(error) => {
            emit_load_failure(format!("model load failed: {error}"));
            std::process::exit(1);
        }
    };
    let options = InitOptions::new(model_name).with_show_download_progress(false);
    let model = match TextEmbedding::try_new(options) {
        Ok(model) => model,
        Err(error) => {
            emit_load_failure(format!("model load failed: {error}"));
            std::process::exit(1);
        }
    };

    if let Some(parent_pid) = args.parent_pid {
        spawn_owner_watch(parent_pid);
    }

    let encoder = FastembedEncoder { model };
    let stdin = io::stdin().lock();
    let mut stdout = io::stdout().lock();
    if let Err(error) = run_worker(&encoder, stdin, &mut stdout) {
        tracing::error!(%error, "worker loop failed");
        std::process::exit(1);
    }
}
