//! Episodic + entity memory for a coding assistant.
//!
//! Composes the embedding supervisor and the vector collections into a
//! memory manager: confidence-gated entity extraction, a single-active
//! episode lifecycle with crash recovery, tiered recall, and a lifecycle
//! monitor that archives the active episode when its owning session dies.

pub mod episode;
pub mod extraction;
pub mod ids;
pub mod manager;
pub mod monitor;

pub use episode::{
    CleanupReport, Episode, EpisodeStatus, Message, MessageLog, MessageRole, RecoveryDocument,
};
pub use extraction::{
    detect_candidates, DetectionMethod, DetectionRule, EntityCandidate, AUTO_CONFIRM_THRESHOLD,
};
pub use manager::{ArchivedEpisode, EpisodeDetail, MemoryManager, MemoryStats, RecallResult};
pub use monitor::{run_monitor, take_close_signal, write_close_signal, CloseSignal, MonitorConfig};
