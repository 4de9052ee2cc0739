//! Core types for the embedding versioning registry

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default embedding model identifier recorded against new versions.
pub const DEFAULT_MODEL_ID: &str = "Qwen/Qwen3-Embedding-0.6B";

/// Kind of content entity tracked by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Dataset,
    Citation,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Dataset => "dataset",
            EntityKind::Citation => "citation",
        }
    }

    pub fn parse(value: &str) -> Result<Self, RegistryError> {
        match value {
            "dataset" => Ok(EntityKind::Dataset),
            "citation" => Ok(EntityKind::Citation),
            other => Err(RegistryError::InvalidRecord(format!(
                "unknown entity kind: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named content source whose text gets embedded.
///
/// Datasets use accession-style ids (`ds000117`); citations use the
/// 8-character content hash of title+abstract (see [`crate::hashing::citation_id`]).
/// `sources` lists the declared content source names in a stable order -
/// the order contributes to the combined content hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub kind: EntityKind,
    pub id: String,
    pub sources: Vec<String>,
}

impl Entity {
    pub fn new(kind: EntityKind, id: impl Into<String>, sources: Vec<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            sources,
        }
    }

    pub fn dataset(id: impl Into<String>, sources: Vec<String>) -> Self {
        Self::new(EntityKind::Dataset, id, sources)
    }

    pub fn citation(id: impl Into<String>, sources: Vec<String>) -> Self {
        Self::new(EntityKind::Citation, id, sources)
    }
}

/// Lifecycle status of an embedding version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
    Current,
    Obsolete,
    Archived,
}

impl VersionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionStatus::Current => "current",
            VersionStatus::Obsolete => "obsolete",
            VersionStatus::Archived => "archived",
        }
    }

    pub fn parse(value: &str) -> Result<Self, RegistryError> {
        match value {
            "current" => Ok(VersionStatus::Current),
            "obsolete" => Ok(VersionStatus::Obsolete),
            "archived" => Ok(VersionStatus::Archived),
            other => Err(RegistryError::InvalidRecord(format!(
                "unknown version status: {other}"
            ))),
        }
    }
}

/// One immutable embedding artifact's metadata.
///
/// Versions are monotonically numbered from 1 per entity. At most one
/// version per entity has `status == Current`; `obsoleted_by`, when set,
/// references a strictly greater version of the same entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingVersion {
    pub entity_id: String,
    pub version: i64,
    pub content_hash: String,
    pub model_id: String,
    pub created_at: DateTime<Utc>,
    pub status: VersionStatus,
    pub obsoleted_by: Option<i64>,
    pub obsoleted_reason: Option<String>,
    pub obsoleted_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
    pub bytes_purged_at: Option<DateTime<Utc>>,
}

/// Lifecycle status of a composite confidence score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompositeStatus {
    Current,
    Obsolete,
}

impl CompositeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompositeStatus::Current => "current",
            CompositeStatus::Obsolete => "obsolete",
        }
    }

    pub fn parse(value: &str) -> Result<Self, RegistryError> {
        match value {
            "current" => Ok(CompositeStatus::Current),
            "obsolete" => Ok(CompositeStatus::Obsolete),
            other => Err(RegistryError::InvalidRecord(format!(
                "unknown composite status: {other}"
            ))),
        }
    }
}

/// A confidence score derived from one dataset embedding version and one
/// citation embedding version.
///
/// A composite is current only while both referenced component versions
/// are current; superseding either component obsoletes the composite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeVersion {
    pub dataset_id: String,
    pub dataset_version: i64,
    pub citation_id: String,
    pub citation_version: i64,
    pub confidence_score: f64,
    pub status: CompositeStatus,
    pub created_at: DateTime<Utc>,
    pub obsoleted_at: Option<DateTime<Utc>>,
    pub obsoleted_reason: Option<String>,
}

/// Why an `ensure_current` run was deferred without creating a version
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferReason {
    /// A declared content source could not be fetched; change detection
    /// is postponed rather than guessed.
    SourceUnavailable { source: String, detail: String },
    /// The embedding model kept failing; the entity stays on its last
    /// known-good current version.
    ModelFailure { detail: String },
}

/// Outcome of a [`crate::manager::VersionManager::ensure_current`] run
#[derive(Debug, Clone)]
pub enum EnsureOutcome {
    /// Content and model unchanged; the existing current version stands.
    UpToDate(EmbeddingVersion),
    /// A new version was created and the prior one (if any) retired.
    Updated {
        version: EmbeddingVersion,
        previous: Option<i64>,
    },
    /// No version was created; the entity will be retried later.
    Deferred(DeferReason),
}

impl EnsureOutcome {
    /// Human-readable one-line summary for operational output
    pub fn describe(&self) -> String {
        match self {
            EnsureOutcome::UpToDate(v) => format!("up to date (version {})", v.version),
            EnsureOutcome::Updated { version, .. } => {
                format!("updated to version {}", version.version)
            }
            EnsureOutcome::Deferred(DeferReason::SourceUnavailable { source, .. }) => {
                format!("deferred (source '{source}' unavailable)")
            }
            EnsureOutcome::Deferred(DeferReason::ModelFailure { detail }) => {
                format!("deferred (model failure: {detail})")
            }
        }
    }

    /// The version this outcome settled on, when one exists
    pub fn version(&self) -> Option<&EmbeddingVersion> {
        match self {
            EnsureOutcome::UpToDate(v) | EnsureOutcome::Updated { version: v, .. } => Some(v),
            EnsureOutcome::Deferred(_) => None,
        }
    }
}

/// Aggregate registry counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub datasets: u64,
    pub citations: u64,
    pub total_versions: u64,
    pub current_versions: u64,
    pub obsolete_versions: u64,
    pub archived_versions: u64,
    pub current_composites: u64,
    pub obsolete_composites: u64,
}

/// Tunables for versioning, retries, and retention
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Model identifier recorded against new versions
    pub model_id: String,
    /// Timeout for a single embedding model call
    pub model_timeout: std::time::Duration,
    /// Timeout for a single storage write (bytes or registry transaction)
    pub storage_timeout: std::time::Duration,
    /// Model call attempts before deferring the entity
    pub max_model_retries: u32,
    /// Base delay for exponential backoff between model retries
    pub retry_base_delay: std::time::Duration,
    /// Re-read-and-retry attempts after a conflicting concurrent update
    pub max_conflict_retries: u32,
    /// How long an obsolete version keeps its bytes before archival
    pub grace_period: Duration,
    /// How long an archived version keeps its bytes before deletion
    pub archive_window: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL_ID.to_string(),
            model_timeout: std::time::Duration::from_secs(60),
            storage_timeout: std::time::Duration::from_secs(10),
            max_model_retries: 3,
            retry_base_delay: std::time::Duration::from_millis(500),
            max_conflict_retries: 3,
            grace_period: Duration::days(30),
            archive_window: Duration::days(90),
        }
    }
}

/// Errors surfaced by registry operations
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A declared content source could not be fetched (recoverable:
    /// versioning for the entity is deferred).
    #[error("content source '{source_name}' unavailable for '{entity_id}': {detail}")]
    SourceUnavailable {
        entity_id: String,
        source_name: String,
        detail: String,
    },

    /// The embedding model failed or timed out (recoverable: retried with
    /// backoff, then deferred).
    #[error("embedding model failure: {0}")]
    ModelFailure(String),

    /// Another worker versioned the entity first (recoverable: re-read
    /// and retry).
    #[error("conflicting update for '{entity_id}': expected current version {expected:?}, found {found:?}")]
    ConflictingUpdate {
        entity_id: String,
        expected: Option<i64>,
        found: Option<i64>,
    },

    /// Vector bytes could not be written; no registry mutation occurred.
    #[error("embedding store write failed: {0}")]
    StorageWrite(String),

    /// The operation exceeded its configured timeout.
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// A stored record failed validation on read.
    #[error("invalid registry record: {0}")]
    InvalidRecord(String),

    #[error("registry database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("embedding store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("artifact serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
