//! Episode and message primitives: the crash-recovery document, the
//! append-only message log, summaries and staleness.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use engram_core::{current_unix_timestamp_ms, days_to_ms, write_text_atomic};

/// An episode idle at least this long is auto-closed on the next startup.
pub const STALE_EPISODE_MINUTES: u64 = 30;

const SUMMARY_MESSAGE_COUNT: usize = 5;
const SUMMARY_MESSAGE_CHARS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpisodeStatus {
    Active,
    Completed,
}

/// A bounded unit of work. At most one episode is active per project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub status: EpisodeStatus,
    pub created_at: u64,
    #[serde(default)]
    pub entity_ids: Vec<String>,
}

/// Mirror of the active-episode state, rewritten atomically on every
/// mutation so a restart resumes message buffering where it left off.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryDocument {
    pub episode: Option<Episode>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// Loads the recovery document, failing open as "no active episode" when the
/// file is missing or unreadable. The durable message log is never at risk
/// here, so losing the mirror only forgets in-flight buffering.
pub fn load_recovery(path: &Path) -> RecoveryDocument {
    match fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(document) => document,
            Err(error) => {
                warn!(path = %path.display(), %error, "unreadable recovery document; starting with no active episode");
                RecoveryDocument::default()
            }
        },
        Err(_) => RecoveryDocument::default(),
    }
}

pub fn save_recovery(path: &Path, document: &RecoveryDocument) -> Result<()> {
    let encoded =
        serde_json::to_string_pretty(document).context("failed to encode recovery document")?;
    write_text_atomic(path, &encoded)
}

/// Returns true when the episode's last activity (last message, or creation
/// when no messages were buffered) is at least the staleness window ago.
pub fn is_stale(episode: &Episode, messages: &[Message], now_ms: u64) -> bool {
    let last_activity = messages
        .last()
        .map(|message| message.timestamp)
        .unwrap_or(episode.created_at);
    now_ms.saturating_sub(last_activity) >= STALE_EPISODE_MINUTES * 60 * 1_000
}

/// Title-prefixed summary of the last few messages, role-labeled and
/// truncated per line.
pub fn generate_summary(title: &str, messages: &[Message]) -> String {
    if messages.is_empty() {
        return title.to_string();
    }
    let mut lines = vec![format!("{title}:")];
    let start = messages.len().saturating_sub(SUMMARY_MESSAGE_COUNT);
    for message in &messages[start..] {
        let content: String = message.content.chars().take(SUMMARY_MESSAGE_CHARS).collect();
        lines.push(format!("- {}: {}", message.role.as_str(), content));
    }
    lines.join("\n")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub removed: usize,
    pub kept: usize,
}

/// Append-only JSONL message log; pruned only by age or an explicit clear.
pub struct MessageLog {
    path: PathBuf,
}

impl MessageLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, message: &Message) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open message log {}", self.path.display()))?;
        let encoded = serde_json::to_string(message).context("failed to encode message")?;
        file.write_all(encoded.as_bytes())
            .and_then(|()| file.write_all(b"\n"))
            .and_then(|()| file.flush())
            .with_context(|| format!("failed to append to message log {}", self.path.display()))?;
        Ok(())
    }

    /// Messages belonging to one episode, in log order. Unparseable lines
    /// are skipped for reads but never dropped from the file.
    pub fn messages_for_episode(&self, episode_id: &str) -> Result<Vec<Message>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&self.path)
            .with_context(|| format!("failed to open message log {}", self.path.display()))?;
        let mut messages = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.context("failed to read message log line")?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if let Ok(message) = serde_json::from_str::<Message>(trimmed) {
                if message.episode_id.as_deref() == Some(episode_id) {
                    messages.push(message);
                }
            }
        }
        Ok(messages)
    }

    /// Drops messages older than `days` days, keeping unparseable lines so a
    /// pruning pass can never lose data it does not understand.
    pub fn cleanup_older_than(&self, days: u64) -> Result<CleanupReport> {
        if !self.path.exists() {
            return Ok(CleanupReport { removed: 0, kept: 0 });
        }
        let cutoff = current_unix_timestamp_ms().saturating_sub(days_to_ms(days));
        let file = fs::File::open(&self.path)
            .with_context(|| format!("failed to open message log {}", self.path.display()))?;
        let mut kept_lines = Vec::new();
        let mut removed = 0usize;
        for line in BufReader::new(file).lines() {
            let line = line.context("failed to read message log line")?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(line.trim()) {
                Ok(message) if message.timestamp <= cutoff => removed += 1,
                _ => kept_lines.push(line),
            }
        }
        let kept = kept_lines.len();
        let mut content = kept_lines.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }
        write_text_atomic(&self.path, &content)?;
        Ok(CleanupReport { removed, kept })
    }

    /// Clears the log wholesale; returns the number of lines removed.
    pub fn clear(&self) -> Result<usize> {
        if !self.path.exists() {
            return Ok(0);
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read message log {}", self.path.display()))?;
        let removed = content.lines().filter(|line| !line.trim().is_empty()).count();
        write_text_atomic(&self.path, "")?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str, timestamp: u64, episode_id: Option<&str>) -> Message {
        Message {
            id: id.to_string(),
            role: MessageRole::User,
            content: format!("content of {id}"),
            timestamp,
            episode_id: episode_id.map(str::to_string),
        }
    }

    fn episode(created_at: u64) -> Episode {
        Episode {
            id: "ep_1".to_string(),
            title: "refactor session".to_string(),
            tags: vec!["refactor".to_string()],
            status: EpisodeStatus::Active,
            created_at,
            entity_ids: Vec::new(),
        }
    }

    #[test]
    fn unit_staleness_uses_last_message_then_creation_time() {
        let now = 100 * 60 * 1_000;
        let stale_window = STALE_EPISODE_MINUTES * 60 * 1_000;

        let fresh = episode(now - 1_000);
        assert!(!is_stale(&fresh, &[], now));

        let old = episode(now - stale_window);
        assert!(is_stale(&old, &[], now));

        // A recent message revives an old episode.
        let recent = [message("msg_1", now - 1_000, None)];
        assert!(!is_stale(&old, &recent, now));

        let ancient = [message("msg_1", now - stale_window - 1, None)];
        assert!(is_stale(&old, &ancient, now));
    }

    #[test]
    fn unit_summary_is_title_prefixed_and_truncated() {
        let episode = episode(0);
        assert_eq!(generate_summary(&episode.title, &[]), "refactor session");

        let mut messages = Vec::new();
        for i in 0..7u64 {
            messages.push(message(&format!("msg_{i}"), i, None));
        }
        messages[6].content = "x".repeat(250);
        let summary = generate_summary(&episode.title, &messages);
        let lines: Vec<&str> = summary.lines().collect();
        assert_eq!(lines[0], "refactor session:");
        // Only the last five messages are summarized.
        assert_eq!(lines.len(), 6);
        assert!(lines[1].contains("msg_2"));
        assert!(lines[5].starts_with("- user: "));
        assert!(lines[5].len() <= "- user: ".len() + 100);
    }

    #[test]
    fn functional_recovery_document_round_trips_and_fails_open() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("active_episode.json");

        // Missing file: no active episode.
        assert_eq!(load_recovery(&path), RecoveryDocument::default());

        let document = RecoveryDocument {
            episode: Some(episode(42)),
            messages: vec![message("msg_1", 43, Some("ep_1"))],
        };
        save_recovery(&path, &document).expect("save");
        assert_eq!(load_recovery(&path), document);

        // Corrupt file: fail open, never fail closed.
        fs::write(&path, "{ not json").expect("corrupt");
        assert_eq!(load_recovery(&path), RecoveryDocument::default());
    }

    #[test]
    fn functional_log_appends_and_filters_by_episode() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = MessageLog::new(temp.path().join("message_log.jsonl"));

        log.append(&message("msg_1", 1, Some("ep_1"))).expect("append");
        log.append(&message("msg_2", 2, Some("ep_2"))).expect("append");
        log.append(&message("msg_3", 3, Some("ep_1"))).expect("append");

        let for_episode = log.messages_for_episode("ep_1").expect("read");
        assert_eq!(for_episode.len(), 2);
        assert_eq!(for_episode[0].id, "msg_1");
        assert_eq!(for_episode[1].id, "msg_3");
        assert!(log.messages_for_episode("ep_404").expect("read").is_empty());
    }

    #[test]
    fn functional_cleanup_keeps_recent_and_unparseable_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = MessageLog::new(temp.path().join("message_log.jsonl"));
        let now = current_unix_timestamp_ms();

        // Ages in days: 0, 3, 8, 10 — a 7-day window keeps the newest two.
        for (index, age_days) in [0u64, 3, 8, 10].iter().enumerate() {
            log.append(&message(
                &format!("msg_{index}"),
                now - days_to_ms(*age_days),
                None,
            ))
            .expect("append");
        }
        // A torn line must survive pruning untouched.
        {
            let mut file = OpenOptions::new()
                .append(true)
                .open(log.path())
                .expect("open");
            writeln!(file, "{{ torn line").expect("write");
        }

        let report = log.cleanup_older_than(7).expect("cleanup");
        assert_eq!(report.removed, 2);
        assert_eq!(report.kept, 3);

        let content = fs::read_to_string(log.path()).expect("read");
        assert!(content.contains("msg_0"));
        assert!(content.contains("msg_1"));
        assert!(!content.contains("msg_2"));
        assert!(!content.contains("msg_3"));
        assert!(content.contains("torn line"));
    }

    #[test]
    fn functional_clear_empties_the_log_and_reports_line_count() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = MessageLog::new(temp.path().join("message_log.jsonl"));
        assert_eq!(log.clear().expect("clear empty"), 0);

        log.append(&message("msg_1", 1, None)).expect("append");
        log.append(&message("msg_2", 2, None)).expect("append");
        assert_eq!(log.clear().expect("clear"), 2);
        assert_eq!(fs::read_to_string(log.path()).expect("read"), "");
    }
}
