//! Persistent vector collections for engram memory records.
//!
//! Each named collection is a SQLite file holding typed records with their
//! embeddings; similarity search runs over cosine distance and transparently
//! degrades to keyword scoring when the index or the encoder is unusable.

pub mod record;
pub mod store;

pub use record::{
    EntityType, EpisodeMetadata, MetadataFilter, RecordMetadata, RecordStatus, SearchHit,
};
pub use store::{StoreError, VectorStore};
