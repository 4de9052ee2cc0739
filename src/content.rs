//! Raw content retrieval and snapshotting
//!
//! Content providers are external collaborators (citation fetcher, metadata
//! retriever). The registry only needs three answers per declared source:
//! present (bytes), gone (the source disappeared - that is changed content),
//! or unavailable (fetch failed - change detection must be deferred, never
//! guessed).

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::hashing;
use crate::types::{Entity, RegistryError};

/// A content source fetch failed; the entity's versioning is deferred.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct SourceFetchError(pub String);

/// Provider of raw content for declared sources.
///
/// `Ok(Some(bytes))` - source exists with these contents.
/// `Ok(None)` - source no longer exists (treated as changed content).
/// `Err(_)` - source could not be fetched; the caller defers.
#[async_trait]
pub trait ContentProvider: Send + Sync {
    async fn fetch(
        &self,
        entity: &Entity,
        source_name: &str,
    ) -> Result<Option<Vec<u8>>, SourceFetchError>;
}

/// Hashes of one fetch pass over an entity's declared sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentSnapshot {
    /// Per-source hashes in declared order
    pub source_hashes: Vec<(String, String)>,
    /// Hash over all sources' bytes concatenated in declared order
    pub combined_hash: String,
    /// Concatenated text of the present sources, ready for the model
    pub text: String,
}

/// Fetch and hash every declared source of `entity`.
///
/// Any fetch failure aborts the snapshot with `SourceUnavailable`; a partial
/// snapshot would let an unreachable source masquerade as unchanged.
pub async fn snapshot(
    provider: &dyn ContentProvider,
    entity: &Entity,
) -> Result<ContentSnapshot, RegistryError> {
    let mut contents: Vec<Option<Vec<u8>>> = Vec::with_capacity(entity.sources.len());

    for source_name in &entity.sources {
        let fetched = provider.fetch(entity, source_name).await.map_err(|e| {
            RegistryError::SourceUnavailable {
                entity_id: entity.id.clone(),
                source_name: source_name.clone(),
                detail: e.to_string(),
            }
        })?;
        if fetched.is_none() {
            debug!(entity_id = %entity.id, source = %source_name, "declared source absent");
        }
        contents.push(fetched);
    }

    let source_hashes = entity
        .sources
        .iter()
        .zip(&contents)
        .map(|(name, bytes)| {
            let hash = match bytes {
                Some(bytes) => hashing::content_hash(bytes),
                None => hashing::content_hash(hashing::ABSENT_SOURCE_MARKER),
            };
            (name.clone(), hash)
        })
        .collect();

    let combined_hash = hashing::combined_hash(
        contents
            .iter()
            .map(|bytes| bytes.as_deref().unwrap_or(hashing::ABSENT_SOURCE_MARKER)),
    );

    let text = contents
        .iter()
        .filter_map(|bytes| bytes.as_deref())
        .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
        .collect::<Vec<_>>()
        .join("\n\n");

    Ok(ContentSnapshot {
        source_hashes,
        combined_hash,
        text,
    })
}

/// Content provider reading sources from a local directory tree.
///
/// Sources live at `<root>/<entity_id>/<source_name>`. A missing file is an
/// absent source; any other I/O failure is a fetch error.
pub struct FsContentProvider {
    root: PathBuf,
}

impl FsContentProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ContentProvider for FsContentProvider {
    async fn fetch(
        &self,
        entity: &Entity,
        source_name: &str,
    ) -> Result<Option<Vec<u8>>, SourceFetchError> {
        let path = self.root.join(&entity.id).join(source_name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SourceFetchError(format!(
                "failed to read {}: {e}",
                path.display()
            ))),
        }
    }
}
