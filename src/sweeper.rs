//! Retention sweeper
//!
//! Two clocks govern a retired version's afterlife: the grace period
//! (obsolete -> archived) and the archive window (archived -> bytes
//! reclaimed). A version referenced by any still-current composite is
//! pinned: its bytes survive every sweep until the pin is released.
//! Current versions are never touched.
//!
//! The sweeper also reconciles orphans - artifact files whose registry
//! metadata never landed (a version run that died between writing bytes
//! and committing metadata). Files with matching metadata are adopted by
//! definition; the rest are deleted.

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::registry::SqliteRegistry;
use crate::store::EmbeddingStore;
use crate::types::{EmbeddingVersion, EntityKind, RegistryConfig, RegistryError, VersionStatus};

/// What one sweep pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Obsolete versions past the grace period, now archived
    pub archived: usize,
    /// Archived versions past the archive window whose bytes were deleted
    pub purged: usize,
    /// Versions past the archive window spared by a provenance pin
    pub pinned: usize,
    /// Artifact files with no registry metadata, deleted
    pub orphans_deleted: usize,
}

/// Grace-period archival and byte reclamation
pub struct RetentionSweeper {
    registry: SqliteRegistry,
    store: EmbeddingStore,
    config: RegistryConfig,
}

impl RetentionSweeper {
    pub fn new(registry: SqliteRegistry, store: EmbeddingStore, config: RegistryConfig) -> Self {
        Self {
            registry,
            store,
            config,
        }
    }

    /// Run one retention pass as of `now`.
    #[instrument(skip(self))]
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, RegistryError> {
        let mut report = SweepReport::default();

        // Obsolete -> archived once the grace period has elapsed.
        for version in self
            .registry
            .versions_with_status(VersionStatus::Obsolete)
            .await?
        {
            let retired_at = version.obsoleted_at.unwrap_or(version.created_at);
            if now - retired_at >= self.config.grace_period
                && self
                    .registry
                    .set_archived(&version.entity_id, version.version, now)
                    .await?
            {
                debug!(
                    entity_id = %version.entity_id,
                    version = version.version,
                    "archived obsolete version"
                );
                report.archived += 1;
            }
        }

        // Archived -> bytes reclaimed once the archive window has elapsed,
        // unless a current composite still pins the version.
        for version in self
            .registry
            .versions_with_status(VersionStatus::Archived)
            .await?
        {
            if version.bytes_purged_at.is_some() {
                continue;
            }
            let Some(archived_at) = version.archived_at else {
                warn!(
                    entity_id = %version.entity_id,
                    version = version.version,
                    "archived version missing archived_at; skipping"
                );
                continue;
            };
            if now - archived_at < self.config.archive_window {
                continue;
            }

            let Some(kind) = self.registry.entity_kind(&version.entity_id).await? else {
                continue;
            };

            if self
                .registry
                .pinned_by_current_composite(&version.entity_id, kind, version.version)
                .await?
            {
                debug!(
                    entity_id = %version.entity_id,
                    version = version.version,
                    "pinned by current composite; bytes retained"
                );
                report.pinned += 1;
                continue;
            }

            self.store
                .delete(kind, &version.entity_id, version.version)
                .await?;
            self.registry
                .set_bytes_purged(&version.entity_id, version.version, now)
                .await?;
            report.purged += 1;
        }

        report.orphans_deleted = self.delete_orphans().await?;

        info!(
            archived = report.archived,
            purged = report.purged,
            pinned = report.pinned,
            orphans_deleted = report.orphans_deleted,
            "sweep complete"
        );
        Ok(report)
    }

    /// Obsolete versions already past the grace period as of `now`,
    /// without mutating anything (dry-run view of the next sweep).
    pub async fn obsolete_report(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<EmbeddingVersion>, RegistryError> {
        let mut due = Vec::new();
        for version in self
            .registry
            .versions_with_status(VersionStatus::Obsolete)
            .await?
        {
            let retired_at = version.obsoleted_at.unwrap_or(version.created_at);
            if now - retired_at >= self.config.grace_period {
                due.push(version);
            }
        }
        Ok(due)
    }

    /// Delete artifact files that have no registry metadata. A retried
    /// version run that later commits matching metadata adopts its earlier
    /// bytes implicitly; everything else here is unreachable garbage.
    async fn delete_orphans(&self) -> Result<usize, RegistryError> {
        let mut deleted = 0;
        for kind in [EntityKind::Dataset, EntityKind::Citation] {
            for (entity_id, version) in self.store.list(kind).await? {
                if self.registry.has_version(&entity_id, version).await? {
                    continue;
                }
                if self.store.delete(kind, &entity_id, version).await? {
                    debug!(%entity_id, version, "deleted orphaned artifact");
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }
}
