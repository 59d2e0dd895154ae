//! Wire contract between the supervisor and the embedding worker.
//!
//! One JSON object per line in each direction. Requests and responses are
//! transient and never persisted.

use serde::{Deserialize, Serialize};

pub const WORKER_QUIT_COMMAND: &str = "quit";

/// Request objects accepted by the worker, one per input line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum WorkerRequest {
    /// `{"text": "..."}` — encode a single string.
    Encode { text: String },
    /// `{"texts": ["...", ...]}` — encode a batch in order.
    EncodeBatch { texts: Vec<String> },
    /// `{"cmd": "quit"}` — drain and exit cleanly.
    Command { cmd: String },
}

impl WorkerRequest {
    pub fn quit() -> Self {
        Self::Command {
            cmd: WORKER_QUIT_COMMAND.to_string(),
        }
    }
}

/// Response objects written by the worker, one per output line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum WorkerResponse {
    /// `{"status": "ready"}` — first line once the model has loaded.
    Status { status: String },
    /// `{"vector": [...]}` — reply to a single-text request.
    Vector { vector: Vec<f32> },
    /// `{"vectors": [[...], ...]}` — reply to a batch request.
    Vectors { vectors: Vec<Vec<f32>> },
    /// `{"error": "..."}` — request-level failure; the worker stays alive.
    Error { error: String },
}

impl WorkerResponse {
    pub fn ready() -> Self {
        Self::Status {
            status: "ready".to_string(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Status { status } if status == "ready")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_requests_round_trip_their_wire_shapes() {
        let encode: WorkerRequest = serde_json::from_str(r#"{"text":"hello"}"#).expect("parse");
        assert_eq!(
            encode,
            WorkerRequest::Encode {
                text: "hello".to_string()
            }
        );

        let batch: WorkerRequest = serde_json::from_str(r#"{"texts":["a","b"]}"#).expect("parse");
        assert_eq!(
            batch,
            WorkerRequest::EncodeBatch {
                texts: vec!["a".to_string(), "b".to_string()]
            }
        );

        let quit = serde_json::to_string(&WorkerRequest::quit()).expect("encode");
        assert_eq!(quit, r#"{"cmd":"quit"}"#);
    }

    #[test]
    fn unit_responses_distinguish_ready_vector_and_error() {
        let ready: WorkerResponse = serde_json::from_str(r#"{"status":"ready"}"#).expect("parse");
        assert!(ready.is_ready());

        let vector: WorkerResponse =
            serde_json::from_str(r#"{"vector":[0.5,-0.5]}"#).expect("parse");
        assert_eq!(
            vector,
            WorkerResponse::Vector {
                vector: vec![0.5, -0.5]
            }
        );

        let error: WorkerResponse = serde_json::from_str(r#"{"error":"boom"}"#).expect("parse");
        assert!(!error.is_ready());
        assert_eq!(error, WorkerResponse::error("boom"));
    }

    #[test]
    fn unit_unknown_request_objects_fail_to_parse() {
        assert!(serde_json::from_str::<WorkerRequest>(r#"{"frobnicate":1}"#).is_err());
    }
}
