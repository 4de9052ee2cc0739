//! Staleness detection
//!
//! Compares a fresh content snapshot against the hashes recorded with an
//! entity's current embedding version. Read-only: this component reports,
//! the version manager decides.

use std::sync::Arc;

use tracing::debug;

use crate::content::{self, ContentProvider, ContentSnapshot};
use crate::registry::SqliteRegistry;
use crate::types::{Entity, RegistryError};

/// Verdict of a staleness check.
///
/// Stale verdicts carry the snapshot that produced them and the current
/// version they were judged against (`expected_current`); the version
/// manager hands both to the registry's compare-and-swap so a verdict can
/// never be applied on top of some other worker's newer version.
#[derive(Debug, Clone)]
pub enum Staleness {
    /// No embedding has ever been computed for the entity.
    NeverEmbedded { snapshot: ContentSnapshot },
    /// Recorded hashes and model match the snapshot; nothing to do.
    Fresh,
    /// At least one declared source's hash differs from the recorded one.
    ContentChanged {
        snapshot: ContentSnapshot,
        expected_current: i64,
    },
    /// Content is identical but the configured model differs from the one
    /// that produced the current version.
    ModelChanged {
        snapshot: ContentSnapshot,
        expected_current: i64,
    },
}

impl Staleness {
    pub fn is_stale(&self) -> bool {
        !matches!(self, Staleness::Fresh)
    }
}

/// Read-only comparison of live content against recorded version hashes
pub struct ChangeDetector {
    registry: SqliteRegistry,
    provider: Arc<dyn ContentProvider>,
}

impl ChangeDetector {
    pub fn new(registry: SqliteRegistry, provider: Arc<dyn ContentProvider>) -> Self {
        Self { registry, provider }
    }

    /// Recompute hashes for all declared sources and compare against the
    /// current version. Surfaces `SourceUnavailable` when any source cannot
    /// be fetched - an unreachable source is never treated as unchanged.
    pub async fn assess(
        &self,
        entity: &Entity,
        model_id: &str,
    ) -> Result<Staleness, RegistryError> {
        let snapshot = content::snapshot(self.provider.as_ref(), entity).await?;

        let Some(current) = self.registry.get_current(&entity.id).await? else {
            return Ok(Staleness::NeverEmbedded { snapshot });
        };

        let recorded = self
            .registry
            .recorded_source_hashes(&entity.id, current.version)
            .await?;

        if recorded != snapshot.source_hashes {
            debug!(
                entity_id = %entity.id,
                version = current.version,
                "content hashes diverged from current version"
            );
            return Ok(Staleness::ContentChanged {
                snapshot,
                expected_current: current.version,
            });
        }

        if current.model_id != model_id {
            debug!(
                entity_id = %entity.id,
                recorded_model = %current.model_id,
                requested_model = %model_id,
                "model changed since current version"
            );
            return Ok(Staleness::ModelChanged {
                snapshot,
                expected_current: current.version,
            });
        }

        Ok(Staleness::Fresh)
    }

    /// Whether the entity's embedding must be recomputed.
    pub async fn is_stale(&self, entity: &Entity, model_id: &str) -> Result<bool, RegistryError> {
        Ok(self.assess(entity, model_id).await?.is_stale())
    }
}
