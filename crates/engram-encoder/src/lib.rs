//! Out-of-process embedding for engram.
//!
//! Hosts the line-delimited worker protocol, the worker request loop, and the
//! single-flight `EncoderSupervisor` that owns the worker process lifecycle.

pub mod protocol;
pub mod supervisor;
pub mod worker;

pub use protocol::{WorkerRequest, WorkerResponse};
pub use supervisor::{
    EncoderConfig, EncoderError, EncoderPhase, EncoderSupervisor, ENCODER_WORKER_COMMAND_ENV,
};
pub use worker::{run_worker, TextEncoder};
