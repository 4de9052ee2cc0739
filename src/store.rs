//! Vector byte store
//!
//! Owns the actual embedding artifacts on disk, addressed by entity id and
//! version. Metadata lives in the registry; the two are linked only by
//! `(entity_id, version)`, and bytes are always written before metadata is
//! committed. Artifacts are immutable JSON files written via tmp + rename so
//! readers never observe a partial vector.
//!
//! Layout:
//! ```text
//! <root>/dataset_embeddings/<entity_id>_v<version>.json
//! <root>/citation_embeddings/<entity_id>_v<version>.json
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{EntityKind, RegistryError};

/// One persisted embedding artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorArtifact {
    pub entity_id: String,
    pub version: i64,
    pub model_id: String,
    pub dim: usize,
    pub vector: Vec<f32>,
}

impl VectorArtifact {
    pub fn new(entity_id: impl Into<String>, version: i64, model_id: impl Into<String>, vector: Vec<f32>) -> Self {
        Self {
            entity_id: entity_id.into(),
            version,
            model_id: model_id.into(),
            dim: vector.len(),
            vector,
        }
    }
}

/// File-backed embedding artifact store
#[derive(Debug, Clone)]
pub struct EmbeddingStore {
    root: PathBuf,
}

impl EmbeddingStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the per-kind subdirectories if they don't exist.
    pub async fn init(&self) -> Result<(), RegistryError> {
        for kind in [EntityKind::Dataset, EntityKind::Citation] {
            tokio::fs::create_dir_all(self.kind_dir(kind)).await?;
        }
        Ok(())
    }

    fn kind_dir(&self, kind: EntityKind) -> PathBuf {
        match kind {
            EntityKind::Dataset => self.root.join("dataset_embeddings"),
            EntityKind::Citation => self.root.join("citation_embeddings"),
        }
    }

    fn artifact_path(&self, kind: EntityKind, entity_id: &str, version: i64) -> PathBuf {
        self.kind_dir(kind)
            .join(format!("{entity_id}_v{version}.json"))
    }

    /// Persist an artifact. Overwrites atomically if the path exists.
    pub async fn save(
        &self,
        kind: EntityKind,
        artifact: &VectorArtifact,
    ) -> Result<PathBuf, RegistryError> {
        let path = self.artifact_path(kind, &artifact.entity_id, artifact.version);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let bytes = serde_json::to_vec(artifact)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| RegistryError::StorageWrite(format!("{}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| RegistryError::StorageWrite(format!("{}: {e}", path.display())))?;

        debug!(path = %path.display(), dim = artifact.dim, "saved embedding artifact");
        Ok(path)
    }

    /// Load the artifact for `(entity_id, version)`.
    pub async fn load(
        &self,
        kind: EntityKind,
        entity_id: &str,
        version: i64,
    ) -> Result<VectorArtifact, RegistryError> {
        let path = self.artifact_path(kind, entity_id, version);
        let bytes = tokio::fs::read(&path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Whether bytes exist for `(entity_id, version)`.
    pub async fn exists(&self, kind: EntityKind, entity_id: &str, version: i64) -> bool {
        tokio::fs::try_exists(self.artifact_path(kind, entity_id, version))
            .await
            .unwrap_or(false)
    }

    /// Delete the artifact. Returns whether a file was removed.
    pub async fn delete(
        &self,
        kind: EntityKind,
        entity_id: &str,
        version: i64,
    ) -> Result<bool, RegistryError> {
        let path = self.artifact_path(kind, entity_id, version);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "deleted embedding artifact");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// List every `(entity_id, version)` with bytes on disk for `kind`.
    ///
    /// Used by the sweeper's orphan reconciliation pass. Files that don't
    /// match the artifact naming scheme (including leftover `.tmp` files)
    /// are ignored.
    pub async fn list(&self, kind: EntityKind) -> Result<Vec<(String, i64)>, RegistryError> {
        let dir = self.kind_dir(kind);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(parsed) = parse_artifact_name(&entry.path()) {
                found.push(parsed);
            }
        }
        found.sort();
        Ok(found)
    }
}

/// Parse `<entity_id>_v<version>.json` back into its key.
fn parse_artifact_name(path: &Path) -> Option<(String, i64)> {
    if path.extension()? != "json" {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let split_at = stem.rfind("_v")?;
    let (entity_id, version_part) = stem.split_at(split_at);
    let version: i64 = version_part[2..].parse().ok()?;
    if entity_id.is_empty() || version < 1 {
        return None;
    }
    Some((entity_id.to_string(), version))
}
