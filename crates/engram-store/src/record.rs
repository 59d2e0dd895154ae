//! Typed record model validated at the store boundary.

use serde::{Deserialize, Serialize};

/// Entity classification; fixes the storage tier of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityType {
    Decision,
    Preference,
    Concept,
    Habit,
    File,
    Architecture,
    Episode,
}

impl EntityType {
    pub const ALL: [EntityType; 7] = [
        Self::Decision,
        Self::Preference,
        Self::Concept,
        Self::Habit,
        Self::File,
        Self::Architecture,
        Self::Episode,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Decision => "Decision",
            Self::Preference => "Preference",
            Self::Concept => "Concept",
            Self::Habit => "Habit",
            Self::File => "File",
            Self::Architecture => "Architecture",
            Self::Episode => "Episode",
        }
    }

    /// Preferences, concepts and habits describe the user and live in the
    /// user tier; everything else is project-scoped.
    pub fn is_user_tier(&self) -> bool {
        matches!(self, Self::Preference | Self::Concept | Self::Habit)
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Active,
    Deprecated,
    Completed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Deprecated => "deprecated",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "deprecated" => Some(Self::Deprecated),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// Episode-only metadata carried by archived episodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeMetadata {
    pub title: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub entity_ids: Vec<String>,
    pub message_count: usize,
    pub closed_at: u64,
}

/// Metadata side-record stored as JSON next to every collection entry.
///
/// The `episode` block must be present exactly when `entity_type` is
/// [`EntityType::Episode`]; `validate` enforces this at the store boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub entity_type: EntityType,
    pub status: RecordStatus,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprecated_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode: Option<EpisodeMetadata>,
}

impl RecordMetadata {
    pub fn entity(entity_type: EntityType, created_at: u64) -> Self {
        Self {
            entity_type,
            status: RecordStatus::Active,
            created_at,
            reason: None,
            related_ids: Vec::new(),
            episode_id: None,
            superseded_by: None,
            deprecated_at: None,
            episode: None,
        }
    }

    pub fn archived_episode(created_at: u64, episode: EpisodeMetadata) -> Self {
        Self {
            entity_type: EntityType::Episode,
            status: RecordStatus::Completed,
            created_at,
            reason: None,
            related_ids: Vec::new(),
            episode_id: None,
            superseded_by: None,
            deprecated_at: None,
            episode: Some(episode),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match (self.entity_type, self.episode.as_ref()) {
            (EntityType::Episode, None) => {
                Err("Episode records require an episode metadata block".to_string())
            }
            (EntityType::Episode, Some(_)) => Ok(()),
            (other, Some(_)) => Err(format!(
                "{} records must not carry an episode metadata block",
                other.as_str()
            )),
            (_, None) => Ok(()),
        }
    }
}

/// Exact-match AND / NOT-equal filter evaluated against record metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataFilter {
    pub entity_type: Option<EntityType>,
    pub entity_type_not: Option<EntityType>,
    pub status: Option<RecordStatus>,
}

impl MetadataFilter {
    pub fn of_type(entity_type: EntityType) -> Self {
        Self {
            entity_type: Some(entity_type),
            ..Self::default()
        }
    }

    pub fn excluding_type(entity_type: EntityType) -> Self {
        Self {
            entity_type_not: Some(entity_type),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: RecordStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, metadata: &RecordMetadata) -> bool {
        if let Some(wanted) = self.entity_type {
            if metadata.entity_type != wanted {
                return false;
            }
        }
        if let Some(excluded) = self.entity_type_not {
            if metadata.entity_type == excluded {
                return false;
            }
        }
        if let Some(status) = self.status {
            if metadata.status != status {
                return false;
            }
        }
        true
    }
}

/// One search result; `distance` is absent on keyword-degraded and
/// exact-lookup paths.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub content: String,
    pub metadata: RecordMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f32>,
}
