//! SQLite-backed vector collection with keyword-search degradation.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::{debug, warn};

use engram_encoder::EncoderSupervisor;

use crate::record::{EntityType, MetadataFilter, RecordMetadata, RecordStatus, SearchHit};

// Keyword fallback inspects a bounded candidate pool per query.
const KEYWORD_CANDIDATE_MULTIPLIER: usize = 10;
const MIN_KEYWORD_TOKEN_CHARS: usize = 2;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Ids are generated, so a collision is a bug worth surfacing.
    #[error("record '{0}' already exists")]
    DuplicateId(String),
    #[error("record '{0}' was not found")]
    NotFound(String),
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),
    #[error("storage failure: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("metadata decode failed: {0}")]
    MetadataDecode(#[from] serde_json::Error),
    #[error("i/o failure: {0}")]
    Io(String),
}

struct StoredRow {
    id: String,
    content: String,
    metadata: RecordMetadata,
    embedding: Option<Vec<u8>>,
}

/// One named collection of records keyed by opaque id, with a JSON metadata
/// side-record and a cosine similarity space.
pub struct VectorStore {
    path: PathBuf,
    conn: Mutex<Connection>,
    encoder: EncoderSupervisor,
}

impl VectorStore {
    /// Opens (or creates) the collection `collection` under `dir`.
    pub fn open(
        dir: &Path,
        collection: &str,
        encoder: EncoderSupervisor,
    ) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)
            .map_err(|error| StoreError::Io(format!("failed to create {}: {error}", dir.display())))?;
        let path = dir.join(format!("{collection}.sqlite3"));
        let conn = Connection::open(&path)?;
        // WAL lets the orchestrator and a monitor process share the file.
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\n\
             CREATE TABLE IF NOT EXISTS records (\n\
               id TEXT PRIMARY KEY,\n\
               content TEXT NOT NULL,\n\
               metadata TEXT NOT NULL,\n\
               embedding BLOB\n\
             );",
        )?;
        Ok(Self {
            path,
            conn: Mutex::new(conn),
            encoder,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Inserts a new record, embedding its content via the supervisor.
    ///
    /// Duplicate ids are rejected. When the encoder is unavailable the record
    /// is stored without an embedding so durable writes never block on the
    /// semantic layer; such rows are served by keyword and metadata paths.
    pub fn add(&self, id: &str, content: &str, metadata: &RecordMetadata) -> Result<(), StoreError> {
        metadata.validate().map_err(StoreError::InvalidMetadata)?;
        let embedding = self.try_embed(content);
        let encoded_metadata = serde_json::to_string(metadata)?;

        let conn = lock_or_recover(&self.conn);
        let exists = conn
            .query_row("SELECT 1 FROM records WHERE id = ?1", params![id], |_| {
                Ok(())
            })
            .optional()?
            .is_some();
        if exists {
            return Err(StoreError::DuplicateId(id.to_string()));
        }
        conn.execute(
            "INSERT INTO records (id, content, metadata, embedding) VALUES (?1, ?2, ?3, ?4)",
            params![id, content, encoded_metadata, embedding.as_deref()],
        )?;
        Ok(())
    }

    /// Updates content and/or metadata; the embedding is recomputed only
    /// when new content is supplied.
    pub fn update(
        &self,
        id: &str,
        content: Option<&str>,
        metadata: Option<&RecordMetadata>,
    ) -> Result<(), StoreError> {
        if let Some(metadata) = metadata {
            metadata.validate().map_err(StoreError::InvalidMetadata)?;
        }
        let embedding = content.map(|text| self.try_embed(text));
        let encoded_metadata = metadata.map(serde_json::to_string).transpose()?;

        let conn = lock_or_recover(&self.conn);
        let mut updated = false;
        if let Some(content) = content {
            let changed = conn.execute(
                "UPDATE records SET content = ?2, embedding = ?3 WHERE id = ?1",
                params![id, content, embedding.flatten().as_deref()],
            )?;
            updated = updated || changed > 0;
        }
        if let Some(encoded) = encoded_metadata {
            let changed = conn.execute(
                "UPDATE records SET metadata = ?2 WHERE id = ?1",
                params![id, encoded],
            )?;
            updated = updated || changed > 0;
        }
        if content.is_none() && metadata.is_none() {
            updated = conn
                .query_row("SELECT 1 FROM records WHERE id = ?1", params![id], |_| {
                    Ok(())
                })
                .optional()?
                .is_some();
        }
        if updated {
            Ok(())
        } else {
            Err(StoreError::NotFound(id.to_string()))
        }
    }

    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        let conn = lock_or_recover(&self.conn);
        conn.execute("DELETE FROM records WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Exact lookup by id; never touches the encoder.
    pub fn get(&self, id: &str) -> Result<Option<SearchHit>, StoreError> {
        let conn = lock_or_recover(&self.conn);
        let row = conn
            .query_row(
                "SELECT id, content, metadata FROM records WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        match row {
            Some((id, content, metadata)) => Ok(Some(SearchHit {
                id,
                content,
                metadata: serde_json::from_str(&metadata)?,
                distance: None,
            })),
            None => Ok(None),
        }
    }

    /// Nearest-neighbor search over records passing `filter`.
    ///
    /// Degrades to keyword scoring when the encoder is unavailable or the
    /// embedding index is inconsistent with the stored documents; degradation
    /// is logged, never surfaced as an error.
    pub fn search(
        &self,
        query: &str,
        top_k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<SearchHit>, StoreError> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let query_vector = match self.encoder.encode(query, self.encoder.encode_timeout()) {
            Ok(vector) => vector,
            Err(error) => {
                debug!(%error, "encoder unavailable; using keyword search");
                return self.keyword_search(query, top_k, filter);
            }
        };

        let rows = self.load_rows(filter)?;
        let mut scored: Vec<(f32, StoredRow)> = Vec::new();
        for row in rows {
            let Some(blob) = row.embedding.as_deref() else {
                continue;
            };
            match decode_embedding(blob, query_vector.len()) {
                Ok(vector) => {
                    let similarity = cosine_similarity(&query_vector, &vector);
                    scored.push((similarity, row));
                }
                Err(reason) => {
                    warn!(id = %row.id, %reason, "embedding index inconsistent; using keyword search");
                    return self.keyword_search(query, top_k, filter);
                }
            }
        }
        scored.sort_by(|left, right| right.0.total_cmp(&left.0));
        scored.truncate(top_k);
        Ok(scored
            .into_iter()
            .map(|(similarity, row)| SearchHit {
                id: row.id,
                content: row.content,
                metadata: row.metadata,
                distance: Some(1.0 - similarity),
            })
            .collect())
    }

    /// Metadata-only scan by type and status; works with the embedding
    /// worker fully unavailable.
    pub fn get_by_type(
        &self,
        entity_type: EntityType,
        status: RecordStatus,
        limit: usize,
    ) -> Result<Vec<SearchHit>, StoreError> {
        let filter = MetadataFilter::of_type(entity_type).with_status(status);
        let rows = self.load_rows(&filter)?;
        Ok(rows
            .into_iter()
            .take(limit)
            .map(|row| SearchHit {
                id: row.id,
                content: row.content,
                metadata: row.metadata,
                distance: None,
            })
            .collect())
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        let conn = lock_or_recover(&self.conn);
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }

    fn try_embed(&self, content: &str) -> Option<Vec<u8>> {
        match self.encoder.encode(content, self.encoder.encode_timeout()) {
            Ok(vector) => Some(encode_embedding(&vector)),
            Err(error) => {
                debug!(%error, "storing record without an embedding");
                None
            }
        }
    }

    fn keyword_search(
        &self,
        query: &str,
        top_k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<SearchHit>, StoreError> {
        let tokens: Vec<String> = query
            .split_whitespace()
            .filter(|token| token.chars().count() >= MIN_KEYWORD_TOKEN_CHARS)
            .map(|token| token.to_lowercase())
            .collect();

        let rows = self.load_rows(filter)?;
        let mut scored: Vec<(usize, StoredRow)> = Vec::new();
        for row in rows.into_iter().take(top_k * KEYWORD_CANDIDATE_MULTIPLIER) {
            let content = row.content.to_lowercase();
            let score = tokens
                .iter()
                .filter(|token| content.contains(token.as_str()))
                .count();
            if score > 0 || tokens.is_empty() {
                scored.push((score, row));
            }
        }
        scored.sort_by(|left, right| right.0.cmp(&left.0));
        scored.truncate(top_k);
        Ok(scored
            .into_iter()
            .map(|(_, row)| SearchHit {
                id: row.id,
                content: row.content,
                metadata: row.metadata,
                distance: None,
            })
            .collect())
    }

    fn load_rows(&self, filter: &MetadataFilter) -> Result<Vec<StoredRow>, StoreError> {
        let conn = lock_or_recover(&self.conn);
        let mut statement =
            conn.prepare("SELECT id, content, metadata, embedding FROM records ORDER BY rowid")?;
        let rows = statement.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<Vec<u8>>>(3)?,
            ))
        })?;

        let mut loaded = Vec::new();
        for row in rows {
            let (id, content, metadata, embedding) = row?;
            let metadata: RecordMetadata = serde_json::from_str(&metadata)?;
            if filter.matches(&metadata) {
                loaded.push(StoredRow {
                    id,
                    content,
                    metadata,
                    embedding,
                });
            }
        }
        Ok(loaded)
    }
}

fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for component in vector {
        bytes.extend_from_slice(&component.to_le_bytes());
    }
    bytes
}

fn decode_embedding(blob: &[u8], expected_dimensions: usize) -> Result<Vec<f32>, String> {
    if blob.len() % 4 != 0 {
        return Err(format!(
            "embedding blob length {} is not a multiple of 4",
            blob.len()
        ));
    }
    let vector: Vec<f32> = blob
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    if vector.len() != expected_dimensions {
        return Err(format!(
            "embedding has {} dimensions, expected {}",
            vector.len(),
            expected_dimensions
        ));
    }
    Ok(vector)
}

fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    let dot: f32 = left.iter().zip(right).map(|(l, r)| l * r).sum();
    let left_norm: f32 = left.iter().map(|v| v * v).sum::<f32>().sqrt();
    let right_norm: f32 = right.iter().map(|v| v * v).sum::<f32>().sqrt();
    if left_norm == 0.0 || right_norm == 0.0 {
        return 0.0;
    }
    dot / (left_norm * right_norm)
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
