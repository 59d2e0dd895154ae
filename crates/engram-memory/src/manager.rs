//! The memory manager: composes the encoder supervisor, the tiered vector
//! collections, the extraction pipeline and the episode lifecycle.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info};

use engram_core::{current_unix_timestamp_ms, days_to_ms, write_text_atomic};
use engram_encoder::EncoderSupervisor;
use engram_store::{
    EntityType, EpisodeMetadata, MetadataFilter, RecordMetadata, RecordStatus, SearchHit,
    VectorStore,
};

use crate::episode::{
    generate_summary, is_stale, load_recovery, save_recovery, CleanupReport, Episode,
    EpisodeStatus, Message, MessageLog, MessageRole, RecoveryDocument,
};
use crate::extraction::{detect_candidates, EntityCandidate, AUTO_CONFIRM_THRESHOLD};
use crate::ids::short_id;

pub const RECOVERY_FILE: &str = "active_episode.json";
pub const MESSAGE_LOG_FILE: &str = "message_log.jsonl";
pub const PENDING_FILE: &str = "pending_entities.json";

const PROJECT_COLLECTION: &str = "project_memory";
const USER_COLLECTION: &str = "user_memory";
const DEFAULT_RETENTION_DAYS: u64 = 7;
const RECENT_MESSAGE_COUNT: usize = 5;
const MAX_CACHED_CONTENT_CHARS: usize = 2_000;

/// Default user-tier directory; project tiers are always explicit.
pub fn default_user_dir() -> PathBuf {
    if let Some(value) = std::env::var_os("ENGRAM_USER_DIR") {
        return PathBuf::from(value);
    }
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".engram").join("memory"))
        .unwrap_or_else(|| PathBuf::from(".engram-user"))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchivedEpisode {
    pub id: String,
    pub title: String,
    pub summary: String,
    pub message_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecallResult {
    pub episodes: Vec<SearchHit>,
    pub entities: Vec<SearchHit>,
    pub active_episode: Option<Episode>,
    pub recent_messages: Vec<Message>,
    /// True when the encoder was not ready at call time and results came
    /// from keyword matching.
    pub degraded: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EpisodeDetail {
    pub record: SearchHit,
    pub messages: Vec<Message>,
    pub entities: Vec<SearchHit>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TierStats {
    pub path: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub project: TierStats,
    pub user: TierStats,
    pub active_episode: Option<String>,
    pub buffered_messages: usize,
    pub pending_total: usize,
    pub pending_by_type: BTreeMap<String, usize>,
    pub auto_confirm_threshold: f32,
    pub encoder_phase: String,
}

/// Single-writer orchestrator of a project's memory. State transitions are
/// single-threaded; only the encoder warmup runs in the background.
pub struct MemoryManager {
    project_dir: PathBuf,
    encoder: EncoderSupervisor,
    project_store: VectorStore,
    user_store: VectorStore,
    log: MessageLog,
    recovery_path: PathBuf,
    pending_path: PathBuf,
    episode: Option<Episode>,
    messages: Vec<Message>,
    pending: Vec<EntityCandidate>,
}

impl MemoryManager {
    /// Opens the manager over a project tier and a user tier, starts encoder
    /// warmup in the background, restores buffered state from the recovery
    /// document (failing open) and expires a stale episode.
    pub fn open(project_dir: &Path, user_dir: &Path, encoder: EncoderSupervisor) -> Result<Self> {
        let project_store =
            VectorStore::open(&project_dir.join("project_db"), PROJECT_COLLECTION, encoder.clone())
                .context("failed to open project collection")?;
        let user_store =
            VectorStore::open(&user_dir.join("user_db"), USER_COLLECTION, encoder.clone())
                .context("failed to open user collection")?;

        // Startup must never block on model load.
        encoder.start_warmup();

        let recovery_path = project_dir.join(RECOVERY_FILE);
        let recovered = load_recovery(&recovery_path);
        let pending_path = project_dir.join(PENDING_FILE);
        let pending = load_pending(&pending_path);

        let mut manager = Self {
            project_dir: project_dir.to_path_buf(),
            encoder,
            project_store,
            user_store,
            log: MessageLog::new(project_dir.join(MESSAGE_LOG_FILE)),
            recovery_path,
            pending_path,
            episode: recovered.episode,
            messages: recovered.messages,
            pending,
        };
        manager.expire_stale_episode()?;
        Ok(manager)
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn active_episode(&self) -> Option<&Episode> {
        self.episode.as_ref()
    }

    pub fn buffered_messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn pending_candidates(&self) -> &[EntityCandidate] {
        &self.pending
    }

    pub fn encoder(&self) -> &EncoderSupervisor {
        &self.encoder
    }

    // ---- episode lifecycle ----

    /// Starts a fresh episode, closing the currently active one first.
    pub fn start_episode(&mut self, title: &str, tags: Vec<String>) -> Result<Episode> {
        if self.episode.is_some() {
            self.close_episode(None)?;
        }
        let episode = Episode {
            id: short_id("ep"),
            title: title.to_string(),
            tags,
            status: EpisodeStatus::Active,
            created_at: current_unix_timestamp_ms(),
            entity_ids: Vec::new(),
        };
        self.episode = Some(episode.clone());
        self.messages.clear();
        self.save_recovery()?;
        Ok(episode)
    }

    /// Closes the active episode and archives it as an Episode record in the
    /// project tier. With no caller-supplied summary, one is generated from
    /// the buffered messages.
    pub fn close_episode(&mut self, summary: Option<String>) -> Result<Option<ArchivedEpisode>> {
        let Some(episode) = self.episode.take() else {
            return Ok(None);
        };
        let summary =
            summary.unwrap_or_else(|| generate_summary(&episode.title, &self.messages));
        let message_count = self.messages.len();
        let metadata = RecordMetadata::archived_episode(
            episode.created_at,
            EpisodeMetadata {
                title: episode.title.clone(),
                tags: episode.tags.clone(),
                entity_ids: episode.entity_ids.clone(),
                message_count,
                closed_at: current_unix_timestamp_ms(),
            },
        );
        self.project_store
            .add(&episode.id, &summary, &metadata)
            .context("failed to archive episode")?;
        self.messages.clear();
        self.save_recovery()?;
        info!(episode_id = %episode.id, message_count, "episode archived");
        Ok(Some(ArchivedEpisode {
            id: episode.id,
            title: episode.title,
            summary,
            message_count,
        }))
    }

    /// Drops the active episode without archiving it. Used for empty
    /// episodes that carry nothing worth keeping.
    pub fn discard_episode(&mut self) -> Result<bool> {
        if self.episode.take().is_none() {
            return Ok(false);
        }
        self.messages.clear();
        self.save_recovery()?;
        Ok(true)
    }

    /// Buffers a message: durable log append first, then the in-memory
    /// episode buffer and the recovery mirror. User-authored text runs
    /// through the extraction pipeline. Succeeds with the encoder fully
    /// unavailable.
    pub fn cache_message(&mut self, role: MessageRole, content: &str) -> Result<Message> {
        let message = Message {
            id: short_id("msg"),
            role,
            content: clean_content(content),
            timestamp: current_unix_timestamp_ms(),
            episode_id: self.episode.as_ref().map(|episode| episode.id.clone()),
        };
        self.log.append(&message)?;
        self.messages.push(message.clone());

        // Only the user's own words carry decisions and preferences; the
        // assistant's replies are suggestions.
        if role == MessageRole::User {
            self.process_extractions(content)?;
        }
        self.save_recovery()?;
        Ok(message)
    }

    fn expire_stale_episode(&mut self) -> Result<()> {
        let Some(episode) = self.episode.as_ref() else {
            return Ok(());
        };
        if !is_stale(episode, &self.messages, current_unix_timestamp_ms()) {
            return Ok(());
        }
        let episode_id = episode.id.clone();
        let title = episode.title.clone();
        if self.messages.is_empty() {
            info!(%episode_id, "discarding stale empty episode");
            self.discard_episode()?;
        } else {
            let summary = format!(
                "[auto-closed after {} idle minutes] {}",
                crate::episode::STALE_EPISODE_MINUTES,
                generate_summary(&title, &self.messages)
            );
            self.close_episode(Some(summary))?;
        }
        Ok(())
    }

    // ---- entities and candidates ----

    /// Stores a durable entity in its tier and links it to the active
    /// episode. Episode records are created by `close_episode` only.
    pub fn add_entity(
        &mut self,
        entity_type: EntityType,
        content: &str,
        reason: Option<String>,
        related_ids: Vec<String>,
    ) -> Result<String> {
        if entity_type == EntityType::Episode {
            bail!("episodes are archived via close_episode, not add_entity");
        }
        let id = short_id("ent");
        let mut metadata = RecordMetadata::entity(entity_type, current_unix_timestamp_ms());
        metadata.reason = reason;
        metadata.related_ids = related_ids;
        metadata.episode_id = self.episode.as_ref().map(|episode| episode.id.clone());

        let store = self.tier_store(entity_type);
        store.add(&id, content, &metadata)?;

        if let Some(episode) = self.episode.as_mut() {
            episode.entity_ids.push(id.clone());
            self.save_recovery()?;
        }
        Ok(id)
    }

    /// Promotes a pending candidate to a durable entity. An unknown id is a
    /// no-op, not an error.
    pub fn confirm_candidate(&mut self, candidate_id: &str) -> Result<Option<String>> {
        let Some(index) = self.pending.iter().position(|c| c.id == candidate_id) else {
            return Ok(None);
        };
        let candidate = self.pending.remove(index);
        self.save_pending()?;
        let id = self.add_entity(
            candidate.entity_type,
            &candidate.extracted_content,
            Some("confirmed by user".to_string()),
            Vec::new(),
        )?;
        Ok(Some(id))
    }

    /// Removes a pending candidate. An unknown id is a no-op.
    pub fn reject_candidate(&mut self, candidate_id: &str) -> Result<bool> {
        let before = self.pending.len();
        self.pending.retain(|candidate| candidate.id != candidate_id);
        if self.pending.len() == before {
            return Ok(false);
        }
        self.save_pending()?;
        Ok(true)
    }

    /// Drops pending candidates older than the retention window.
    pub fn prune_stale_candidates(&mut self, days: Option<u64>) -> Result<usize> {
        let cutoff = current_unix_timestamp_ms()
            .saturating_sub(days_to_ms(days.unwrap_or(DEFAULT_RETENTION_DAYS)));
        let before = self.pending.len();
        self.pending.retain(|candidate| candidate.detected_at > cutoff);
        let removed = before - self.pending.len();
        if removed > 0 {
            self.save_pending()?;
        }
        Ok(removed)
    }

    /// Marks an entity deprecated in whichever tier holds it, optionally
    /// recording its replacement. Unknown ids report `false`.
    pub fn deprecate_entity(&mut self, id: &str, superseded_by: Option<&str>) -> Result<bool> {
        let (store, hit) = match self.project_store.get(id)? {
            Some(hit) => (&self.project_store, hit),
            None => match self.user_store.get(id)? {
                Some(hit) => (&self.user_store, hit),
                None => return Ok(false),
            },
        };
        let mut metadata = hit.metadata;
        metadata.status = RecordStatus::Deprecated;
        metadata.deprecated_at = Some(current_unix_timestamp_ms());
        metadata.superseded_by = superseded_by.map(str::to_string);
        store.update(id, None, Some(&metadata))?;
        Ok(true)
    }

    fn process_extractions(&mut self, content: &str) -> Result<()> {
        let candidates = detect_candidates(content);
        let mut pending_changed = false;
        for candidate in candidates {
            if candidate.confidence >= AUTO_CONFIRM_THRESHOLD {
                let reason = format!("auto-confirmed (confidence {:.2})", candidate.confidence);
                self.add_entity(
                    candidate.entity_type,
                    &candidate.extracted_content,
                    Some(reason),
                    Vec::new(),
                )?;
            } else {
                self.pending.push(candidate);
                pending_changed = true;
            }
        }
        if pending_changed {
            self.save_pending()?;
        }
        Ok(())
    }

    // ---- retrieval ----

    /// Combined retrieval: project entities (excluding episodes), archived
    /// episodes and user-tier entities, plus the in-memory active episode
    /// and its most recent messages. Never fails when the worker is down —
    /// results degrade to keyword matches and are tagged as such.
    pub fn recall(
        &self,
        query: &str,
        top_k: usize,
        include_deprecated: bool,
    ) -> Result<RecallResult> {
        let degraded = !self.encoder.is_ready();

        let mut entity_filter = MetadataFilter::excluding_type(EntityType::Episode);
        if !include_deprecated {
            entity_filter = entity_filter.with_status(RecordStatus::Active);
        }
        let mut entities = self.project_store.search(query, top_k, &entity_filter)?;

        let episode_filter =
            MetadataFilter::of_type(EntityType::Episode).with_status(RecordStatus::Completed);
        let episodes = self.project_store.search(query, top_k, &episode_filter)?;

        let mut user_filter = MetadataFilter::default();
        if !include_deprecated {
            user_filter = user_filter.with_status(RecordStatus::Active);
        }
        entities.extend(self.user_store.search(query, top_k, &user_filter)?);

        let recent_start = self.messages.len().saturating_sub(RECENT_MESSAGE_COUNT);
        Ok(RecallResult {
            episodes,
            entities,
            active_episode: self.episode.clone(),
            recent_messages: self.messages[recent_start..].to_vec(),
            degraded,
        })
    }

    /// Typed retrieval. Without a query this is a pure metadata scan and
    /// works with the worker fully unavailable; with one it is a semantic
    /// search. Episodes are matched in their archived (completed) state.
    pub fn search_by_type(
        &self,
        entity_type: EntityType,
        query: Option<&str>,
        top_k: usize,
    ) -> Result<Vec<SearchHit>> {
        let status = if entity_type == EntityType::Episode {
            RecordStatus::Completed
        } else {
            RecordStatus::Active
        };
        let store = self.tier_store(entity_type);
        let hits = match query {
            Some(query) => store.search(
                query,
                top_k,
                &MetadataFilter::of_type(entity_type).with_status(status),
            )?,
            None => store.get_by_type(entity_type, status, top_k)?,
        };
        Ok(hits)
    }

    /// Joins an archived episode with its logged messages and its linked
    /// entities from either tier.
    pub fn get_episode_detail(&self, episode_id: &str) -> Result<Option<EpisodeDetail>> {
        let Some(record) = self.project_store.get(episode_id)? else {
            return Ok(None);
        };
        if record.metadata.entity_type != EntityType::Episode {
            return Ok(None);
        }
        let messages = self.log.messages_for_episode(episode_id)?;
        let mut entities = Vec::new();
        if let Some(episode_meta) = record.metadata.episode.as_ref() {
            for entity_id in &episode_meta.entity_ids {
                let hit = match self.project_store.get(entity_id)? {
                    Some(hit) => Some(hit),
                    None => self.user_store.get(entity_id)?,
                };
                if let Some(hit) = hit {
                    entities.push(hit);
                }
            }
        }
        Ok(Some(EpisodeDetail {
            record,
            messages,
            entities,
        }))
    }

    /// Archived episodes, newest first; a metadata-only scan.
    pub fn list_episodes(&self, limit: usize) -> Result<Vec<SearchHit>> {
        let mut episodes =
            self.project_store
                .get_by_type(EntityType::Episode, RecordStatus::Completed, usize::MAX)?;
        episodes.sort_by(|left, right| right.metadata.created_at.cmp(&left.metadata.created_at));
        episodes.truncate(limit);
        Ok(episodes)
    }

    // ---- maintenance and stats ----

    pub fn cleanup_old_messages(&self, days: Option<u64>) -> Result<CleanupReport> {
        self.log
            .cleanup_older_than(days.unwrap_or(DEFAULT_RETENTION_DAYS))
    }

    /// Wholesale clear of the message log; callers confirm before invoking.
    pub fn clear_message_log(&self) -> Result<usize> {
        self.log.clear()
    }

    pub fn stats(&self) -> Result<MemoryStats> {
        let mut pending_by_type = BTreeMap::new();
        for candidate in &self.pending {
            *pending_by_type
                .entry(candidate.entity_type.as_str().to_string())
                .or_insert(0usize) += 1;
        }
        Ok(MemoryStats {
            project: TierStats {
                path: self.project_store.path().display().to_string(),
                records: self.project_store.count()?,
            },
            user: TierStats {
                path: self.user_store.path().display().to_string(),
                records: self.user_store.count()?,
            },
            active_episode: self.episode.as_ref().map(|episode| episode.title.clone()),
            buffered_messages: self.messages.len(),
            pending_total: self.pending.len(),
            pending_by_type,
            auto_confirm_threshold: AUTO_CONFIRM_THRESHOLD,
            encoder_phase: self.encoder.phase().as_str().to_string(),
        })
    }

    /// Shuts the embedding worker down; must run on orchestrator exit so no
    /// model-holding process outlives it. Safe to call redundantly.
    pub fn shutdown(&self) {
        self.encoder.shutdown();
    }

    fn tier_store(&self, entity_type: EntityType) -> &VectorStore {
        if entity_type.is_user_tier() {
            &self.user_store
        } else {
            &self.project_store
        }
    }

    fn save_recovery(&self) -> Result<()> {
        save_recovery(
            &self.recovery_path,
            &RecoveryDocument {
                episode: self.episode.clone(),
                messages: self.messages.clone(),
            },
        )
    }

    fn save_pending(&self) -> Result<()> {
        let encoded = serde_json::to_string_pretty(&self.pending)
            .context("failed to encode pending candidates")?;
        write_text_atomic(&self.pending_path, &encoded)
    }
}

fn load_pending(path: &Path) -> Vec<EntityCandidate> {
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(pending) => pending,
            Err(error) => {
                debug!(path = %path.display(), %error, "unreadable pending document; starting empty");
                Vec::new()
            }
        },
        Err(_) => Vec::new(),
    }
}

/// Collapses code blocks and bounds message length before buffering; code
/// rarely carries memorable facts and would bloat the log.
fn clean_content(content: &str) -> String {
    static CODE_BLOCK: OnceLock<Option<Regex>> = OnceLock::new();
    static INLINE_CODE: OnceLock<Option<Regex>> = OnceLock::new();
    let code_block = CODE_BLOCK.get_or_init(|| Regex::new(r"```\w*\n[\s\S]*?```").ok());
    let inline_code = INLINE_CODE.get_or_init(|| Regex::new(r"`[^`]+`").ok());

    let mut cleaned = content.to_string();
    if let Some(pattern) = code_block {
        cleaned = pattern.replace_all(&cleaned, "[code block omitted]").into_owned();
    }
    if let Some(pattern) = inline_code {
        cleaned = pattern.replace_all(&cleaned, "[code]").into_owned();
    }
    let cleaned = cleaned.trim();
    if cleaned.chars().count() > MAX_CACHED_CONTENT_CHARS {
        let truncated: String = cleaned.chars().take(MAX_CACHED_CONTENT_CHARS).collect();
        format!("{truncated}...[truncated]")
    } else {
        cleaned.to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use engram_encoder::EncoderConfig;

    use super::*;

    fn offline_encoder() -> EncoderSupervisor {
        EncoderSupervisor::new(EncoderConfig {
            command: "/nonexistent/engram-encoder-worker".to_string(),
            args: Vec::new(),
            warmup_timeout: Duration::from_secs(1),
            encode_timeout: Duration::from_secs(1),
            shutdown_grace: Duration::from_millis(100),
        })
    }

    fn open_manager(root: &Path) -> MemoryManager {
        MemoryManager::open(&root.join("project"), &root.join("user"), offline_encoder())
            .expect("open manager")
    }

    #[test]
    fn functional_at_most_one_active_episode_per_project() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut manager = open_manager(temp.path());

        let first = manager
            .start_episode("first session", vec!["a".to_string()])
            .expect("start first");
        manager
            .cache_message(MessageRole::Assistant, "working on it")
            .expect("cache");

        let second = manager
            .start_episode("second session", Vec::new())
            .expect("start second");
        assert_ne!(first.id, second.id);
        assert_eq!(manager.active_episode().expect("active").id, second.id);

        // Starting the second closed and archived the first.
        let archived = manager
            .get_episode_detail(&first.id)
            .expect("detail")
            .expect("archived");
        assert_eq!(archived.record.metadata.entity_type, EntityType::Episode);
        assert_eq!(archived.record.metadata.status, RecordStatus::Completed);
        assert_eq!(archived.messages.len(), 1);
    }

    #[test]
    fn functional_cache_message_logs_and_mirrors_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut manager = open_manager(temp.path());
        manager
            .start_episode("logging session", Vec::new())
            .expect("start");

        let message = manager
            .cache_message(MessageRole::User, "plain note without signals")
            .expect("cache");
        assert_eq!(message.episode_id.as_deref(), manager.active_episode().map(|e| e.id.as_str()));

        // The recovery mirror lets a restart resume buffering exactly here.
        let reopened = open_manager(temp.path());
        assert_eq!(reopened.buffered_messages().len(), 1);
        assert_eq!(reopened.buffered_messages()[0].id, message.id);
        assert!(reopened.active_episode().is_some());
    }

    #[test]
    fn functional_high_confidence_candidates_promote_synchronously() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut manager = open_manager(temp.path());
        manager
            .start_episode("architecture talk", Vec::new())
            .expect("start");

        manager
            .cache_message(MessageRole::User, "我决定采用微服务架构")
            .expect("cache");

        let decisions = manager
            .search_by_type(EntityType::Decision, None, 10)
            .expect("scan");
        let architectures = manager
            .search_by_type(EntityType::Architecture, None, 10)
            .expect("scan");
        assert!(!decisions.is_empty());
        assert!(!architectures.is_empty());
        assert!(manager.pending_candidates().is_empty());
        assert!(!manager.active_episode().expect("active").entity_ids.is_empty());
    }

    #[test]
    fn functional_low_confidence_candidates_queue_as_pending() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut manager = open_manager(temp.path());

        // Keyword-only match: below the auto-confirm threshold.
        manager
            .cache_message(MessageRole::User, "代码我喜欢简洁")
            .expect("cache");

        let pending = manager.pending_candidates();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].entity_type, EntityType::Preference);
        assert!(pending[0].confidence < AUTO_CONFIRM_THRESHOLD);
        assert!(manager
            .search_by_type(EntityType::Preference, None, 10)
            .expect("scan")
            .is_empty());
    }

    #[test]
    fn functional_assistant_messages_are_not_mined_for_entities() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut manager = open_manager(temp.path());
        manager
            .cache_message(MessageRole::Assistant, "我决定采用微服务架构")
            .expect("cache");
        assert!(manager.pending_candidates().is_empty());
        assert!(manager
            .search_by_type(EntityType::Decision, None, 10)
            .expect("scan")
            .is_empty());
    }

    #[test]
    fn functional_confirm_and_reject_are_no_ops_for_unknown_ids() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut manager = open_manager(temp.path());
        manager
            .cache_message(MessageRole::User, "代码我喜欢简洁")
            .expect("cache");
        let candidate_id = manager.pending_candidates()[0].id.clone();

        assert_eq!(manager.confirm_candidate("cand_missing").expect("confirm"), None);
        assert!(!manager.reject_candidate("cand_missing").expect("reject"));
        assert_eq!(manager.pending_candidates().len(), 1);

        let entity_id = manager
            .confirm_candidate(&candidate_id)
            .expect("confirm")
            .expect("promoted");
        assert!(manager.pending_candidates().is_empty());
        let preferences = manager
            .search_by_type(EntityType::Preference, None, 10)
            .expect("scan");
        assert_eq!(preferences.len(), 1);
        assert_eq!(preferences[0].id, entity_id);
    }

    #[test]
    fn functional_stale_episode_with_messages_archives_on_reopen() {
        let temp = tempfile::tempdir().expect("tempdir");
        let stale_ms = current_unix_timestamp_ms() - 31 * 60 * 1_000;
        let episode_id;
        {
            let mut manager = open_manager(temp.path());
            manager.start_episode("stale session", Vec::new()).expect("start");
            manager
                .cache_message(MessageRole::User, "note before going idle")
                .expect("cache");
            episode_id = manager.active_episode().expect("active").id.clone();
        }
        // Backdate the mirrored state to simulate a long idle gap.
        let recovery_path = temp.path().join("project").join(RECOVERY_FILE);
        let mut recovered = load_recovery(&recovery_path);
        recovered.episode.as_mut().expect("episode").created_at = stale_ms;
        recovered.messages[0].timestamp = stale_ms;
        save_recovery(&recovery_path, &recovered).expect("backdate");

        let manager = open_manager(temp.path());
        assert!(manager.active_episode().is_none());
        let archived = manager
            .get_episode_detail(&episode_id)
            .expect("detail")
            .expect("archived");
        assert!(archived.record.content.contains("auto-closed"));
    }

    #[test]
    fn functional_stale_empty_episode_is_discarded_not_archived() {
        let temp = tempfile::tempdir().expect("tempdir");
        let episode_id;
        {
            let mut manager = open_manager(temp.path());
            manager.start_episode("empty session", Vec::new()).expect("start");
            episode_id = manager.active_episode().expect("active").id.clone();
        }
        let recovery_path = temp.path().join("project").join(RECOVERY_FILE);
        let mut recovered = load_recovery(&recovery_path);
        recovered.episode.as_mut().expect("episode").created_at =
            current_unix_timestamp_ms() - 31 * 60 * 1_000;
        save_recovery(&recovery_path, &recovered).expect("backdate");

        let manager = open_manager(temp.path());
        assert!(manager.active_episode().is_none());
        assert!(manager.get_episode_detail(&episode_id).expect("detail").is_none());
    }

    #[test]
    fn functional_recall_degrades_instead_of_failing_without_the_worker() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut manager = open_manager(temp.path());
        manager.start_episode("recall session", Vec::new()).expect("start");
        manager
            .cache_message(MessageRole::User, "我决定采用微服务架构")
            .expect("cache");

        let result = manager.recall("微服务", 5, false).expect("recall");
        assert!(result.degraded);
        assert!(!result.entities.is_empty());
        assert!(result.entities.iter().all(|hit| hit.distance.is_none()));
        assert!(result.active_episode.is_some());
        assert_eq!(result.recent_messages.len(), 1);
    }

    #[test]
    fn functional_recall_includes_deprecated_only_on_request() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut manager = open_manager(temp.path());
        let entity_id = manager
            .add_entity(EntityType::Decision, "use sqlite for storage", None, Vec::new())
            .expect("add");
        assert!(manager.deprecate_entity(&entity_id, None).expect("deprecate"));

        let active_only = manager.recall("sqlite storage", 5, false).expect("recall");
        assert!(active_only.entities.is_empty());

        let with_deprecated = manager.recall("sqlite storage", 5, true).expect("recall");
        assert_eq!(with_deprecated.entities.len(), 1);
        assert_eq!(
            with_deprecated.entities[0].metadata.status,
            RecordStatus::Deprecated
        );
    }

    #[test]
    fn functional_deprecate_finds_entities_in_the_user_tier() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut manager = open_manager(temp.path());
        let entity_id = manager
            .add_entity(
                EntityType::Preference,
                "prefers short functions",
                None,
                Vec::new(),
            )
            .expect("add");

        assert!(manager
            .deprecate_entity(&entity_id, Some("ent_newer"))
            .expect("deprecate"));
        assert!(!manager.deprecate_entity("ent_missing", None).expect("deprecate"));

        let hits = manager
            .search_by_type(EntityType::Preference, None, 10)
            .expect("scan");
        assert!(hits.is_empty());
    }

    #[test]
    fn functional_episode_detail_joins_messages_and_linked_entities() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut manager = open_manager(temp.path());
        manager.start_episode("detail session", Vec::new()).expect("start");
        manager
            .cache_message(MessageRole::User, "我决定采用微服务架构")
            .expect("cache");
        manager
            .cache_message(MessageRole::Assistant, "sounds reasonable")
            .expect("cache");
        let archived = manager.close_episode(None).expect("close").expect("closed");

        let detail = manager
            .get_episode_detail(&archived.id)
            .expect("detail")
            .expect("present");
        assert_eq!(detail.messages.len(), 2);
        assert!(!detail.entities.is_empty());
        assert!(detail.record.content.starts_with("detail session:"));

        // Non-episode ids are not episode details.
        let entity_id = &detail.entities[0].id;
        assert!(manager.get_episode_detail(entity_id).expect("detail").is_none());
    }

    #[test]
    fn functional_list_episodes_orders_newest_first() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut manager = open_manager(temp.path());
        for index in 0..3 {
            manager
                .start_episode(&format!("session {index}"), Vec::new())
                .expect("start");
            manager
                .cache_message(MessageRole::User, "note")
                .expect("cache");
        }
        manager.close_episode(None).expect("close");

        let episodes = manager.list_episodes(10).expect("list");
        assert_eq!(episodes.len(), 3);
        let created: Vec<u64> = episodes
            .iter()
            .map(|hit| hit.metadata.created_at)
            .collect();
        let mut sorted = created.clone();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        assert_eq!(created, sorted);

        let limited = manager.list_episodes(2).expect("list");
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn functional_stats_reports_tiers_pending_and_encoder_phase() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut manager = open_manager(temp.path());
        manager.start_episode("stats session", Vec::new()).expect("start");
        manager
            .cache_message(MessageRole::User, "我决定采用微服务架构")
            .expect("cache");
        manager
            .cache_message(MessageRole::User, "代码我喜欢简洁")
            .expect("cache");

        let stats = manager.stats().expect("stats");
        assert!(stats.project.records >= 1);
        assert_eq!(stats.active_episode.as_deref(), Some("stats session"));
        assert_eq!(stats.buffered_messages, 2);
        assert_eq!(stats.pending_total, 1);
        assert_eq!(stats.pending_by_type.get("Preference"), Some(&1));
        assert!((stats.auto_confirm_threshold - AUTO_CONFIRM_THRESHOLD).abs() < f32::EPSILON);
        // The offline worker cannot load; the phase reflects that honestly.
        assert!(stats.encoder_phase == "failed" || stats.encoder_phase == "loading");
    }

    #[test]
    fn unit_clean_content_strips_code_and_bounds_length() {
        let text = "look at this\n```rust\nfn main() {}\n```\nand `inline()` too";
        let cleaned = clean_content(text);
        assert!(cleaned.contains("[code block omitted]"));
        assert!(cleaned.contains("[code]"));
        assert!(!cleaned.contains("fn main"));

        let long = "字".repeat(3_000);
        let cleaned = clean_content(&long);
        assert!(cleaned.chars().count() <= MAX_CACHED_CONTENT_CHARS + "...[truncated]".len());
        assert!(cleaned.ends_with("...[truncated]"));
    }

    #[test]
    fn unit_add_entity_refuses_the_episode_type() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut manager = open_manager(temp.path());
        assert!(manager
            .add_entity(EntityType::Episode, "not allowed", None, Vec::new())
            .is_err());
    }
}
