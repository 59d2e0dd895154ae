//! Worker process supervision: spawn, readiness, encode exchanges, shutdown.
//!
//! The supervisor owns at most one worker process. Warmup is single-flight:
//! the first caller transitions the state machine to `Loading` and performs
//! the spawn + readiness probe; every concurrent caller blocks on the same
//! condvar broadcast instead of spawning a duplicate or being told "not
//! ready" mid-warmup.

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

use crate::protocol::{WorkerRequest, WorkerResponse};

/// Overrides the worker executable path; defaults to a sibling binary.
pub const ENCODER_WORKER_COMMAND_ENV: &str = "ENGRAM_ENCODER_WORKER";

const DEFAULT_WORKER_BINARY_NAME: &str = "engram-encoder-worker";

/// Lifecycle phases of the embedding worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderPhase {
    NotStarted,
    Loading,
    Ready,
    Failed,
}

impl EncoderPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EncoderError {
    /// The worker is not ready, crashed, or the exchange timed out.
    #[error("embedding worker unavailable: {0}")]
    WorkerUnavailable(String),
    /// The worker rejected this request but remains healthy.
    #[error("embedding request failed: {0}")]
    RequestFailed(String),
}

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Worker executable; resolved from `ENGRAM_ENCODER_WORKER` or the
    /// sibling binary next to the current executable.
    pub command: String,
    pub args: Vec<String>,
    pub warmup_timeout: Duration,
    pub encode_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            command: default_worker_command(),
            args: Vec::new(),
            warmup_timeout: Duration::from_secs(60),
            encode_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

fn default_worker_command() -> String {
    if let Ok(value) = std::env::var(ENCODER_WORKER_COMMAND_ENV) {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| {
            exe.parent()
                .map(|dir| dir.join(DEFAULT_WORKER_BINARY_NAME))
        })
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| DEFAULT_WORKER_BINARY_NAME.to_string())
}

struct WorkerChannel {
    child: Child,
    stdin: ChildStdin,
    replies: Receiver<WorkerResponse>,
}

struct SupervisorState {
    phase: EncoderPhase,
    last_error: Option<String>,
    // Bumped on every shutdown/discard so a stale in-flight warmup cannot
    // resurrect a worker that was torn down while it loaded.
    generation: u64,
}

struct SupervisorInner {
    config: EncoderConfig,
    state: Mutex<SupervisorState>,
    readiness: Condvar,
    // Held across a full request/response exchange, which serializes
    // concurrent `encode` callers around the single outstanding request.
    // Never acquired while holding `state` except in `install_worker`;
    // holders of `channel` drop it before touching `state`.
    channel: Mutex<Option<WorkerChannel>>,
}

/// Handle to the supervised embedding worker; clones share one worker.
#[derive(Clone)]
pub struct EncoderSupervisor {
    inner: Arc<SupervisorInner>,
}

impl EncoderSupervisor {
    pub fn new(config: EncoderConfig) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                config,
                state: Mutex::new(SupervisorState {
                    phase: EncoderPhase::NotStarted,
                    last_error: None,
                    generation: 0,
                }),
                readiness: Condvar::new(),
                channel: Mutex::new(None),
            }),
        }
    }

    /// Begins warmup in the background. Idempotent: only the first caller
    /// spawns a worker; later callers join the in-flight attempt. A `Failed`
    /// phase is resettable — calling again retries the spawn.
    pub fn start_warmup(&self) {
        let generation;
        {
            let mut state = lock_or_recover(&self.inner.state);
            match state.phase {
                EncoderPhase::Ready | EncoderPhase::Loading => return,
                EncoderPhase::NotStarted | EncoderPhase::Failed => {
                    state.phase = EncoderPhase::Loading;
                    state.last_error = None;
                    generation = state.generation;
                }
            }
        }
        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("engram-encoder-warmup".to_string())
            .spawn(move || run_warmup(inner, generation));
        if let Err(error) = spawned {
            fail_warmup(
                &self.inner,
                generation,
                format!("failed to spawn warmup thread: {error}"),
            );
        }
    }

    pub fn is_ready(&self) -> bool {
        self.phase() == EncoderPhase::Ready
    }

    pub fn is_loading(&self) -> bool {
        self.phase() == EncoderPhase::Loading
    }

    pub fn phase(&self) -> EncoderPhase {
        lock_or_recover(&self.inner.state).phase
    }

    /// Default per-request deadline from the supervisor's configuration.
    pub fn encode_timeout(&self) -> Duration {
        self.inner.config.encode_timeout
    }

    pub fn last_error(&self) -> Option<String> {
        lock_or_recover(&self.inner.state).last_error.clone()
    }

    /// Blocks until the worker is ready or `timeout` elapses. Joins an
    /// in-flight warmup; does not start one.
    pub fn wait_until_ready(&self, timeout: Duration) -> Result<(), EncoderError> {
        self.wait_ready_until(Instant::now() + timeout)
    }

    /// Encodes `text` into a fixed-dimension vector.
    ///
    /// A `NotStarted` phase triggers a fresh warmup; a `Loading` phase is
    /// awaited up to the deadline. A `Failed` warmup is not retried here —
    /// callers opt into that via `start_warmup`. Exchange failures discard
    /// the worker (reset to `NotStarted`) so the channel can never serve a
    /// misaligned response; the next call re-spawns.
    pub fn encode(&self, text: &str, timeout: Duration) -> Result<Vec<f32>, EncoderError> {
        let deadline = Instant::now() + timeout;
        if self.phase() == EncoderPhase::NotStarted {
            self.start_warmup();
        }
        self.wait_ready_until(deadline)?;

        let mut channel_guard = lock_or_recover(&self.inner.channel);
        let Some(channel) = channel_guard.as_mut() else {
            // Ready phase with no worker means a teardown raced this call;
            // reset so the next encode re-spawns.
            drop(channel_guard);
            let reason = "worker exited before the request was issued".to_string();
            self.discard_worker(None, reason.clone());
            return Err(EncoderError::WorkerUnavailable(reason));
        };

        let request = WorkerRequest::Encode {
            text: text.to_string(),
        };
        let encoded = serde_json::to_string(&request).map_err(|error| {
            EncoderError::RequestFailed(format!("failed to encode request: {error}"))
        })?;
        if let Err(error) = writeln!(channel.stdin, "{encoded}").and_then(|()| channel.stdin.flush())
        {
            let reason = format!("failed to write to worker stdin: {error}");
            let dead = channel_guard.take();
            drop(channel_guard);
            self.discard_worker(dead, reason.clone());
            return Err(EncoderError::WorkerUnavailable(reason));
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        match channel.replies.recv_timeout(remaining) {
            Ok(WorkerResponse::Vector { vector }) => Ok(vector),
            Ok(WorkerResponse::Error { error }) => Err(EncoderError::RequestFailed(error)),
            Ok(other) => {
                let reason = format!("protocol desync: unexpected reply {other:?}");
                let dead = channel_guard.take();
                drop(channel_guard);
                self.discard_worker(dead, reason.clone());
                Err(EncoderError::WorkerUnavailable(reason))
            }
            Err(RecvTimeoutError::Timeout) => {
                let reason = format!("no reply within {timeout:?}");
                let dead = channel_guard.take();
                drop(channel_guard);
                self.discard_worker(dead, reason.clone());
                Err(EncoderError::WorkerUnavailable(reason))
            }
            Err(RecvTimeoutError::Disconnected) => {
                let reason = "worker exited mid-request".to_string();
                let dead = channel_guard.take();
                drop(channel_guard);
                self.discard_worker(dead, reason.clone());
                Err(EncoderError::WorkerUnavailable(reason))
            }
        }
    }

    /// Cooperative shutdown: quit message, bounded wait, forced kill. Always
    /// lands in `NotStarted` and is safe to call redundantly — including from
    /// both the orchestrator teardown path and a monitor's owner-died path.
    /// An in-flight warmup is invalidated rather than awaited.
    pub fn shutdown(&self) {
        {
            let mut state = lock_or_recover(&self.inner.state);
            state.generation = state.generation.wrapping_add(1);
            state.phase = EncoderPhase::NotStarted;
            state.last_error = None;
            self.inner.readiness.notify_all();
        }
        let taken = lock_or_recover(&self.inner.channel).take();
        if let Some(mut channel) = taken {
            if let Ok(encoded) = serde_json::to_string(&WorkerRequest::quit()) {
                let _ = writeln!(channel.stdin, "{encoded}");
                let _ = channel.stdin.flush();
            }
            match channel.child.wait_timeout(self.inner.config.shutdown_grace) {
                Ok(Some(status)) => debug!(?status, "embedding worker exited"),
                Ok(None) => {
                    warn!("embedding worker ignored quit; killing");
                    let _ = channel.child.kill();
                    let _ = channel.child.wait();
                }
                Err(error) => {
                    warn!(%error, "failed to wait for embedding worker; killing");
                    let _ = channel.child.kill();
                    let _ = channel.child.wait();
                }
            }
        }
    }

    fn wait_ready_until(&self, deadline: Instant) -> Result<(), EncoderError> {
        let mut state = lock_or_recover(&self.inner.state);
        loop {
            match state.phase {
                EncoderPhase::Ready => return Ok(()),
                EncoderPhase::Failed => {
                    let reason = state
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "worker warmup failed".to_string());
                    return Err(EncoderError::WorkerUnavailable(reason));
                }
                EncoderPhase::NotStarted => {
                    return Err(EncoderError::WorkerUnavailable(
                        "worker not started".to_string(),
                    ));
                }
                EncoderPhase::Loading => {
                    let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                        return Err(EncoderError::WorkerUnavailable(
                            "timed out waiting for worker warmup".to_string(),
                        ));
                    };
                    let (guard, wait) = match self.inner.readiness.wait_timeout(state, remaining) {
                        Ok(result) => result,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    state = guard;
                    if wait.timed_out() && state.phase == EncoderPhase::Loading {
                        return Err(EncoderError::WorkerUnavailable(
                            "timed out waiting for worker warmup".to_string(),
                        ));
                    }
                }
            }
        }
    }

    /// Kills a worker taken out of the channel slot and resets the state
    /// machine to `NotStarted`. Callers must have released the channel lock.
    fn discard_worker(&self, channel: Option<WorkerChannel>, reason: String) {
        if let Some(channel) = channel {
            kill_channel(channel);
        }
        warn!(%reason, "discarding embedding worker");
        let mut state = lock_or_recover(&self.inner.state);
        state.generation = state.generation.wrapping_add(1);
        state.phase = EncoderPhase::NotStarted;
        state.last_error = Some(reason);
        self.inner.readiness.notify_all();
    }
}

fn run_warmup(inner: Arc<SupervisorInner>, generation: u64) {
    let channel = match spawn_worker(&inner.config) {
        Ok(channel) => channel,
        Err(error) => {
            fail_warmup(&inner, generation, error);
            return;
        }
    };

    // Readiness probe: the worker's first line is `{"status":"ready"}` once
    // the model has loaded, or `{"error": ...}` when loading failed.
    match channel.replies.recv_timeout(inner.config.warmup_timeout) {
        Ok(reply) if reply.is_ready() => install_worker(&inner, generation, channel),
        Ok(WorkerResponse::Error { error }) => {
            kill_channel(channel);
            fail_warmup(&inner, generation, format!("worker model load failed: {error}"));
        }
        Ok(other) => {
            kill_channel(channel);
            fail_warmup(
                &inner,
                generation,
                format!("unexpected first worker reply {other:?}"),
            );
        }
        Err(_) => {
            kill_channel(channel);
            fail_warmup(
                &inner,
                generation,
                format!("worker not ready within {:?}", inner.config.warmup_timeout),
            );
        }
    }
}

fn install_worker(inner: &SupervisorInner, generation: u64, channel: WorkerChannel) {
    let mut state = lock_or_recover(&inner.state);
    if state.generation != generation || state.phase != EncoderPhase::Loading {
        // A shutdown overlapped this warmup; the worker must not survive it.
        drop(state);
        kill_channel(channel);
        return;
    }
    *lock_or_recover(&inner.channel) = Some(channel);
    state.phase = EncoderPhase::Ready;
    state.last_error = None;
    inner.readiness.notify_all();
}

fn fail_warmup(inner: &SupervisorInner, generation: u64, reason: String) {
    let mut state = lock_or_recover(&inner.state);
    if state.generation != generation || state.phase != EncoderPhase::Loading {
        return;
    }
    state.phase = EncoderPhase::Failed;
    state.last_error = Some(reason);
    inner.readiness.notify_all();
}

fn spawn_worker(config: &EncoderConfig) -> Result<WorkerChannel, String> {
    let command_name = config.command.trim();
    if command_name.is_empty() {
        return Err("worker command must be non-empty".to_string());
    }

    let mut command = Command::new(command_name);
    command.args(&config.args);
    command.arg("--parent-pid");
    command.arg(std::process::id().to_string());
    command.stdin(Stdio::piped());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .map_err(|error| format!("failed to spawn worker '{command_name}': {error}"))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| "worker stdin unavailable".to_string())?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "worker stdout unavailable".to_string())?;
    if let Some(stderr) = child.stderr.take() {
        spawn_stderr_logger(stderr);
    }

    let (reply_sender, replies) = mpsc::channel();
    let _ = thread::Builder::new()
        .name("engram-encoder-replies".to_string())
        .spawn(move || {
            let mut buffered = BufReader::new(stdout);
            let mut line = String::new();
            loop {
                line.clear();
                match buffered.read_line(&mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        let reply = serde_json::from_str::<WorkerResponse>(trimmed)
                            .unwrap_or_else(|_| {
                                WorkerResponse::error(format!("malformed worker reply: {trimmed}"))
                            });
                        if reply_sender.send(reply).is_err() {
                            break;
                        }
                    }
                }
            }
        });

    Ok(WorkerChannel {
        child,
        stdin,
        replies,
    })
}

fn spawn_stderr_logger<R>(reader: R)
where
    R: Read + Send + 'static,
{
    let _ = thread::Builder::new()
        .name("engram-encoder-stderr".to_string())
        .spawn(move || {
            let buffered = BufReader::new(reader);
            for line in buffered.lines() {
                match line {
                    Ok(line) if !line.trim().is_empty() => {
                        debug!(target: "engram::encoder_worker", "{}", line.trim());
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        });
}

fn kill_channel(mut channel: WorkerChannel) {
    let _ = channel.child.kill();
    let _ = channel.child.wait();
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
