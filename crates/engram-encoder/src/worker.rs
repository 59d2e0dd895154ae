//! The worker-side request loop, kept generic over I/O and the model so the
//! protocol is testable without loading an embedding model.

use std::io::{BufRead, Write};

use anyhow::{Context, Result};

use crate::protocol::{WorkerRequest, WorkerResponse, WORKER_QUIT_COMMAND};

/// Text-to-vector backend hosted by the worker process.
pub trait TextEncoder {
    fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Runs the worker loop: announce readiness, then serve one request per line
/// in arrival order until EOF or a quit command.
///
/// Malformed or unknown requests produce `{"error": ...}` replies and never
/// terminate the loop.
pub fn run_worker<R, W>(encoder: &dyn TextEncoder, input: R, output: &mut W) -> Result<()>
where
    R: BufRead,
    W: Write,
{
    write_reply(output, &WorkerResponse::ready())?;

    for line in input.lines() {
        let line = line.context("failed to read request line")?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<WorkerRequest>(trimmed) {
            Ok(WorkerRequest::Encode { text }) => match encoder.encode_batch(&[text]) {
                Ok(mut vectors) if !vectors.is_empty() => WorkerResponse::Vector {
                    vector: vectors.remove(0),
                },
                Ok(_) => WorkerResponse::error("encoder returned no vectors"),
                Err(error) => WorkerResponse::error(format!("encode failed: {error}")),
            },
            Ok(WorkerRequest::EncodeBatch { texts }) => match encoder.encode_batch(&texts) {
                Ok(vectors) => WorkerResponse::Vectors { vectors },
                Err(error) => WorkerResponse::error(format!("encode failed: {error}")),
            },
            Ok(WorkerRequest::Command { cmd }) if cmd == WORKER_QUIT_COMMAND => break,
            Ok(WorkerRequest::Command { cmd }) => {
                WorkerResponse::error(format!("unknown command '{cmd}'"))
            }
            Err(_) => WorkerResponse::error("unknown request"),
        };
        write_reply(output, &reply)?;
    }

    Ok(())
}

fn write_reply<W: Write>(output: &mut W, reply: &WorkerResponse) -> Result<()> {
    let encoded = serde_json::to_string(reply).context("failed to encode worker reply")?;
    writeln!(output, "{encoded}").context("failed to write worker reply")?;
    output.flush().context("failed to flush worker reply")?;
    Ok(())
}
