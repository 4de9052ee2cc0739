//! SQLite-backed registry: entities and version lifecycle

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

use crate::content::ContentSnapshot;
use crate::types::{
    EmbeddingVersion, Entity, EntityKind, RegistryError, RegistryStats, VersionStatus,
};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS entities (
        entity_id TEXT PRIMARY KEY,
        entity_kind TEXT NOT NULL,
        current_version INTEGER,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS embedding_versions (
        entity_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        content_hash TEXT NOT NULL,
        model_id TEXT NOT NULL,
        created_at TEXT NOT NULL,
        status TEXT NOT NULL,
        obsoleted_by INTEGER,
        obsoleted_reason TEXT,
        obsoleted_at TEXT,
        archived_at TEXT,
        bytes_purged_at TEXT,
        PRIMARY KEY (entity_id, version)
    )
    "#,
    // The at-most-one-current invariant, enforced by the store itself.
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS ux_versions_current
        ON embedding_versions (entity_id) WHERE status = 'current'
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS version_sources (
        entity_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        position INTEGER NOT NULL,
        source_name TEXT NOT NULL,
        source_hash TEXT NOT NULL,
        PRIMARY KEY (entity_id, version, source_name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS composites (
        dataset_id TEXT NOT NULL,
        dataset_version INTEGER NOT NULL,
        citation_id TEXT NOT NULL,
        citation_version INTEGER NOT NULL,
        confidence_score REAL NOT NULL,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        obsoleted_at TEXT,
        obsoleted_reason TEXT,
        PRIMARY KEY (dataset_id, citation_id, dataset_version, citation_version)
    )
    "#,
    // At most one current composite per (dataset, citation) pair.
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS ux_composites_current
        ON composites (dataset_id, citation_id) WHERE status = 'current'
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS ix_composites_dataset
        ON composites (dataset_id, dataset_version)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS ix_composites_citation
        ON composites (citation_id, citation_version)
    "#,
];

const VERSION_COLUMNS: &str = "entity_id, version, content_hash, model_id, created_at, status, \
     obsoleted_by, obsoleted_reason, obsoleted_at, archived_at, bytes_purged_at";

type VersionRow = (
    String,
    i64,
    String,
    String,
    DateTime<Utc>,
    String,
    Option<i64>,
    Option<String>,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
);

fn version_from_row(row: VersionRow) -> Result<EmbeddingVersion, RegistryError> {
    let (
        entity_id,
        version,
        content_hash,
        model_id,
        created_at,
        status,
        obsoleted_by,
        obsoleted_reason,
        obsoleted_at,
        archived_at,
        bytes_purged_at,
    ) = row;
    Ok(EmbeddingVersion {
        entity_id,
        version,
        content_hash,
        model_id,
        created_at,
        status: VersionStatus::parse(&status)?,
        obsoleted_by,
        obsoleted_reason,
        obsoleted_at,
        archived_at,
        bytes_purged_at,
    })
}

/// Durable registry over a local SQLite database.
///
/// Cheap to clone; all clones share one connection pool. Every mutation of an
/// entity's version chain goes through [`append_version`] or
/// [`mark_obsolete`], both of which compare-and-swap on the entity's expected
/// current version so racing workers cannot both create version N+1.
///
/// [`append_version`]: SqliteRegistry::append_version
/// [`mark_obsolete`]: SqliteRegistry::mark_obsolete
#[derive(Clone)]
pub struct SqliteRegistry {
    pool: SqlitePool,
}

impl SqliteRegistry {
    /// Open (creating if missing) the registry database at `path`.
    pub async fn open(path: &Path) -> Result<Self, RegistryError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        info!(path = %path.display(), "opened registry database");
        Ok(Self { pool })
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the entity record if it doesn't exist yet.
    pub async fn ensure_entity(&self, entity: &Entity) -> Result<(), RegistryError> {
        sqlx::query(
            "INSERT OR IGNORE INTO entities (entity_id, entity_kind, current_version, updated_at)
             VALUES (?1, ?2, NULL, ?3)",
        )
        .bind(&entity.id)
        .bind(entity.kind.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Kind of a registered entity, if known.
    pub async fn entity_kind(&self, entity_id: &str) -> Result<Option<EntityKind>, RegistryError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT entity_kind FROM entities WHERE entity_id = ?1")
                .bind(entity_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(kind,)| EntityKind::parse(&kind)).transpose()
    }

    /// All registered entities, optionally filtered by kind.
    pub async fn list_entities(
        &self,
        kind: Option<EntityKind>,
    ) -> Result<Vec<(String, EntityKind, Option<i64>)>, RegistryError> {
        let rows: Vec<(String, String, Option<i64>)> = match kind {
            Some(kind) => {
                sqlx::query_as(
                    "SELECT entity_id, entity_kind, current_version FROM entities
                     WHERE entity_kind = ?1 ORDER BY entity_id",
                )
                .bind(kind.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT entity_id, entity_kind, current_version FROM entities
                     ORDER BY entity_id",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter()
            .map(|(id, kind, current)| Ok((id, EntityKind::parse(&kind)?, current)))
            .collect()
    }

    /// The entity's current version number, if any.
    pub async fn current_version_number(
        &self,
        entity_id: &str,
    ) -> Result<Option<i64>, RegistryError> {
        let row: Option<(Option<i64>,)> =
            sqlx::query_as("SELECT current_version FROM entities WHERE entity_id = ?1")
                .bind(entity_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(|(version,)| version))
    }

    /// The entity's current embedding version, if any.
    pub async fn get_current(
        &self,
        entity_id: &str,
    ) -> Result<Option<EmbeddingVersion>, RegistryError> {
        let row: Option<VersionRow> = sqlx::query_as(&format!(
            "SELECT {VERSION_COLUMNS} FROM embedding_versions
             WHERE entity_id = ?1 AND status = 'current'"
        ))
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(version_from_row).transpose()
    }

    /// Full version history for an entity, oldest first.
    pub async fn get_history(
        &self,
        entity_id: &str,
    ) -> Result<Vec<EmbeddingVersion>, RegistryError> {
        let rows: Vec<VersionRow> = sqlx::query_as(&format!(
            "SELECT {VERSION_COLUMNS} FROM embedding_versions
             WHERE entity_id = ?1 ORDER BY version"
        ))
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(version_from_row).collect()
    }

    /// One specific version's metadata.
    pub async fn get_version(
        &self,
        entity_id: &str,
        version: i64,
    ) -> Result<Option<EmbeddingVersion>, RegistryError> {
        let row: Option<VersionRow> = sqlx::query_as(&format!(
            "SELECT {VERSION_COLUMNS} FROM embedding_versions
             WHERE entity_id = ?1 AND version = ?2"
        ))
        .bind(entity_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;
        row.map(version_from_row).transpose()
    }

    /// Whether any metadata exists for `(entity_id, version)`.
    pub async fn has_version(&self, entity_id: &str, version: i64) -> Result<bool, RegistryError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM embedding_versions WHERE entity_id = ?1 AND version = ?2",
        )
        .bind(entity_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Per-source hashes recorded with a version, in declared order.
    pub async fn recorded_source_hashes(
        &self,
        entity_id: &str,
        version: i64,
    ) -> Result<Vec<(String, String)>, RegistryError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT source_name, source_hash FROM version_sources
             WHERE entity_id = ?1 AND version = ?2 ORDER BY position",
        )
        .bind(entity_id)
        .bind(version)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Every version currently in `status`, oldest obsolescence first.
    pub async fn versions_with_status(
        &self,
        status: VersionStatus,
    ) -> Result<Vec<EmbeddingVersion>, RegistryError> {
        let rows: Vec<VersionRow> = sqlx::query_as(&format!(
            "SELECT {VERSION_COLUMNS} FROM embedding_versions
             WHERE status = ?1 ORDER BY entity_id, version"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(version_from_row).collect()
    }

    /// The version number the next append should use: one past the highest
    /// ever recorded for the entity (numbers are never reused, even after a
    /// manual obsolescence leaves the entity with no current version).
    pub async fn next_version_number(&self, entity_id: &str) -> Result<i64, RegistryError> {
        let row: (Option<i64>,) =
            sqlx::query_as("SELECT MAX(version) FROM embedding_versions WHERE entity_id = ?1")
                .bind(entity_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0.unwrap_or(0) + 1)
    }

    /// Append `new_version` as current and retire the prior one, atomically.
    ///
    /// `expected_current` is the optimistic-concurrency guard: the entity's
    /// current version as observed by the caller before it computed the new
    /// embedding. If another worker moved the pointer in the meantime the
    /// transaction rolls back with [`RegistryError::ConflictingUpdate`] and
    /// the caller re-reads. `new_version` comes from
    /// [`next_version_number`](SqliteRegistry::next_version_number); a racer
    /// that lost after that read trips either the CAS or the primary key,
    /// both reported as conflicts.
    ///
    /// Vector bytes for the new version must already be durably written -
    /// this method commits metadata only.
    pub async fn append_version(
        &self,
        entity: &Entity,
        expected_current: Option<i64>,
        new_version: i64,
        snapshot: &ContentSnapshot,
        model_id: &str,
        retire_reason: &str,
        now: DateTime<Utc>,
    ) -> Result<EmbeddingVersion, RegistryError> {
        if new_version <= expected_current.unwrap_or(0) {
            return Err(RegistryError::InvalidRecord(format!(
                "new version {new_version} must exceed expected current {expected_current:?}"
            )));
        }
        let mut tx = self.pool.begin().await?;

        // CAS on the current pointer decides the race.
        let moved = sqlx::query(
            "UPDATE entities SET current_version = ?1, updated_at = ?2
             WHERE entity_id = ?3 AND current_version IS ?4",
        )
        .bind(new_version)
        .bind(now)
        .bind(&entity.id)
        .bind(expected_current)
        .execute(&mut *tx)
        .await?;

        if moved.rows_affected() != 1 {
            drop(tx);
            let found = self.current_version_number(&entity.id).await?;
            return Err(RegistryError::ConflictingUpdate {
                entity_id: entity.id.clone(),
                expected: expected_current,
                found,
            });
        }

        if let Some(previous) = expected_current {
            let retired = sqlx::query(
                "UPDATE embedding_versions
                 SET status = 'obsolete', obsoleted_by = ?1, obsoleted_reason = ?2, obsoleted_at = ?3
                 WHERE entity_id = ?4 AND version = ?5 AND status = 'current'",
            )
            .bind(new_version)
            .bind(retire_reason)
            .bind(now)
            .bind(&entity.id)
            .bind(previous)
            .execute(&mut *tx)
            .await?;

            if retired.rows_affected() != 1 {
                return Err(RegistryError::InvalidRecord(format!(
                    "entity '{}' pointer said version {previous} but no current row matched",
                    entity.id
                )));
            }
        }

        let inserted = sqlx::query(
            "INSERT INTO embedding_versions
                 (entity_id, version, content_hash, model_id, created_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, 'current')",
        )
        .bind(&entity.id)
        .bind(new_version)
        .bind(&snapshot.combined_hash)
        .bind(model_id)
        .bind(now)
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            let conflict = e
                .as_database_error()
                .map(|db| db.is_unique_violation())
                .unwrap_or(false);
            if conflict {
                drop(tx);
                let found = self.current_version_number(&entity.id).await?;
                return Err(RegistryError::ConflictingUpdate {
                    entity_id: entity.id.clone(),
                    expected: expected_current,
                    found,
                });
            }
            return Err(e.into());
        }

        for (position, (source_name, source_hash)) in snapshot.source_hashes.iter().enumerate() {
            sqlx::query(
                "INSERT INTO version_sources (entity_id, version, position, source_name, source_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(&entity.id)
            .bind(new_version)
            .bind(position as i64)
            .bind(source_name)
            .bind(source_hash)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(
            entity_id = %entity.id,
            version = new_version,
            previous = ?expected_current,
            "appended embedding version"
        );

        Ok(EmbeddingVersion {
            entity_id: entity.id.clone(),
            version: new_version,
            content_hash: snapshot.combined_hash.clone(),
            model_id: model_id.to_string(),
            created_at: now,
            status: VersionStatus::Current,
            obsoleted_by: None,
            obsoleted_reason: None,
            obsoleted_at: None,
            archived_at: None,
            bytes_purged_at: None,
        })
    }

    /// Manually retire an entity's current version without a successor.
    ///
    /// Operator escape hatch: the next `ensure_current` sees no current
    /// version and re-embeds. Returns the retired version number, or `None`
    /// if the entity had no current version.
    pub async fn mark_obsolete(
        &self,
        entity_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>, RegistryError> {
        let Some(current) = self.current_version_number(entity_id).await? else {
            return Ok(None);
        };

        let mut tx = self.pool.begin().await?;

        let moved = sqlx::query(
            "UPDATE entities SET current_version = NULL, updated_at = ?1
             WHERE entity_id = ?2 AND current_version = ?3",
        )
        .bind(now)
        .bind(entity_id)
        .bind(current)
        .execute(&mut *tx)
        .await?;

        if moved.rows_affected() != 1 {
            drop(tx);
            let found = self.current_version_number(entity_id).await?;
            return Err(RegistryError::ConflictingUpdate {
                entity_id: entity_id.to_string(),
                expected: Some(current),
                found,
            });
        }

        sqlx::query(
            "UPDATE embedding_versions
             SET status = 'obsolete', obsoleted_reason = ?1, obsoleted_at = ?2
             WHERE entity_id = ?3 AND version = ?4 AND status = 'current'",
        )
        .bind(reason)
        .bind(now)
        .bind(entity_id)
        .bind(current)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(%entity_id, version = current, reason, "manually obsoleted current version");
        Ok(Some(current))
    }

    /// Transition an obsolete version to archived.
    pub async fn set_archived(
        &self,
        entity_id: &str,
        version: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, RegistryError> {
        let result = sqlx::query(
            "UPDATE embedding_versions SET status = 'archived', archived_at = ?1
             WHERE entity_id = ?2 AND version = ?3 AND status = 'obsolete'",
        )
        .bind(now)
        .bind(entity_id)
        .bind(version)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Record that an archived version's bytes were reclaimed.
    pub async fn set_bytes_purged(
        &self,
        entity_id: &str,
        version: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, RegistryError> {
        let result = sqlx::query(
            "UPDATE embedding_versions SET bytes_purged_at = ?1
             WHERE entity_id = ?2 AND version = ?3 AND status = 'archived'",
        )
        .bind(now)
        .bind(entity_id)
        .bind(version)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Aggregate counts across entities, versions, and composites.
    pub async fn stats(&self) -> Result<RegistryStats, RegistryError> {
        let mut stats = RegistryStats::default();

        let kinds: Vec<(String, i64)> =
            sqlx::query_as("SELECT entity_kind, COUNT(*) FROM entities GROUP BY entity_kind")
                .fetch_all(&self.pool)
                .await?;
        for (kind, count) in kinds {
            match EntityKind::parse(&kind)? {
                EntityKind::Dataset => stats.datasets = count as u64,
                EntityKind::Citation => stats.citations = count as u64,
            }
        }

        let versions: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM embedding_versions GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        for (status, count) in versions {
            let count = count as u64;
            stats.total_versions += count;
            match VersionStatus::parse(&status)? {
                VersionStatus::Current => stats.current_versions = count,
                VersionStatus::Obsolete => stats.obsolete_versions = count,
                VersionStatus::Archived => stats.archived_versions = count,
            }
        }

        let composites: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM composites GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        for (status, count) in composites {
            match crate::types::CompositeStatus::parse(&status)? {
                crate::types::CompositeStatus::Current => stats.current_composites = count as u64,
                crate::types::CompositeStatus::Obsolete => stats.obsolete_composites = count as u64,
            }
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::snapshot_for;

    async fn registry() -> (tempfile::TempDir, SqliteRegistry) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let registry = SqliteRegistry::open(&dir.path().join("registry.db"))
            .await
            .expect("open registry");
        (dir, registry)
    }

    fn entity() -> Entity {
        Entity::dataset("ds000117", vec!["README".to_string()])
    }

    #[tokio::test]
    async fn test_first_version_is_one() {
        let (_dir, registry) = registry().await;
        let entity = entity();
        registry.ensure_entity(&entity).await.unwrap();

        assert_eq!(registry.next_version_number("ds000117").await.unwrap(), 1);
        let v = registry
            .append_version(&entity, None, 1, &snapshot_for("h1"), "m", "content changed", Utc::now())
            .await
            .unwrap();

        assert_eq!(v.version, 1);
        assert_eq!(v.status, VersionStatus::Current);
        assert_eq!(registry.current_version_number("ds000117").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_append_retires_prior_version() {
        let (_dir, registry) = registry().await;
        let entity = entity();
        registry.ensure_entity(&entity).await.unwrap();

        registry
            .append_version(&entity, None, 1, &snapshot_for("h1"), "m", "content changed", Utc::now())
            .await
            .unwrap();
        let v2 = registry
            .append_version(&entity, Some(1), 2, &snapshot_for("h2"), "m", "content changed", Utc::now())
            .await
            .unwrap();

        assert_eq!(v2.version, 2);

        let history = registry.get_history("ds000117").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, VersionStatus::Obsolete);
        assert_eq!(history[0].obsoleted_by, Some(2));
        assert_eq!(history[0].obsoleted_reason.as_deref(), Some("content changed"));
        assert!(history[0].obsoleted_at.is_some());
        assert_eq!(history[1].status, VersionStatus::Current);

        let current = registry.get_current("ds000117").await.unwrap().unwrap();
        assert_eq!(current.version, 2);
        assert_eq!(current.content_hash, snapshot_for("h2").combined_hash);
    }

    #[tokio::test]
    async fn test_append_with_stale_expectation_conflicts() {
        let (_dir, registry) = registry().await;
        let entity = entity();
        registry.ensure_entity(&entity).await.unwrap();

        registry
            .append_version(&entity, None, 1, &snapshot_for("h1"), "m", "content changed", Utc::now())
            .await
            .unwrap();

        // A racer that still believes there is no current version loses.
        let err = registry
            .append_version(&entity, None, 1, &snapshot_for("h1"), "m", "content changed", Utc::now())
            .await
            .unwrap_err();

        match err {
            RegistryError::ConflictingUpdate { expected, found, .. } => {
                assert_eq!(expected, None);
                assert_eq!(found, Some(1));
            }
            other => panic!("expected ConflictingUpdate, got {other:?}"),
        }

        // The loser did not create a second version.
        assert_eq!(registry.get_history("ds000117").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_source_hashes_recorded_in_order() {
        let (_dir, registry) = registry().await;
        let entity = Entity::dataset(
            "ds000117",
            vec!["README".to_string(), "dataset_description.json".to_string()],
        );
        registry.ensure_entity(&entity).await.unwrap();

        let mut snapshot = snapshot_for("h1");
        snapshot.source_hashes = vec![
            ("README".to_string(), "aaaa".to_string()),
            ("dataset_description.json".to_string(), "bbbb".to_string()),
        ];
        registry
            .append_version(&entity, None, 1, &snapshot, "m", "content changed", Utc::now())
            .await
            .unwrap();

        let recorded = registry.recorded_source_hashes("ds000117", 1).await.unwrap();
        assert_eq!(recorded, snapshot.source_hashes);
    }

    #[tokio::test]
    async fn test_mark_obsolete_clears_pointer() {
        let (_dir, registry) = registry().await;
        let entity = entity();
        registry.ensure_entity(&entity).await.unwrap();
        registry
            .append_version(&entity, None, 1, &snapshot_for("h1"), "m", "content changed", Utc::now())
            .await
            .unwrap();

        let retired = registry
            .mark_obsolete("ds000117", "manual", Utc::now())
            .await
            .unwrap();
        assert_eq!(retired, Some(1));
        assert_eq!(registry.current_version_number("ds000117").await.unwrap(), None);

        let history = registry.get_history("ds000117").await.unwrap();
        assert_eq!(history[0].status, VersionStatus::Obsolete);
        assert_eq!(history[0].obsoleted_by, None);
        assert_eq!(history[0].obsoleted_reason.as_deref(), Some("manual"));

        // Nothing current to retire on a second call.
        let again = registry
            .mark_obsolete("ds000117", "manual", Utc::now())
            .await
            .unwrap();
        assert_eq!(again, None);

        // Re-versioning after manual obsolescence never reuses numbers.
        assert_eq!(registry.next_version_number("ds000117").await.unwrap(), 2);
        let v2 = registry
            .append_version(&entity, None, 2, &snapshot_for("h2"), "m", "content changed", Utc::now())
            .await
            .unwrap();
        assert_eq!(v2.version, 2);
        assert_eq!(registry.current_version_number("ds000117").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_archival_transitions() {
        let (_dir, registry) = registry().await;
        let entity = entity();
        registry.ensure_entity(&entity).await.unwrap();
        registry
            .append_version(&entity, None, 1, &snapshot_for("h1"), "m", "content changed", Utc::now())
            .await
            .unwrap();
        registry
            .append_version(&entity, Some(1), 2, &snapshot_for("h2"), "m", "content changed", Utc::now())
            .await
            .unwrap();

        // Current versions are never archived.
        assert!(!registry.set_archived("ds000117", 2, Utc::now()).await.unwrap());
        assert!(registry.set_archived("ds000117", 1, Utc::now()).await.unwrap());

        let archived = registry.versions_with_status(VersionStatus::Archived).await.unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].version, 1);
        assert!(archived[0].archived_at.is_some());

        // Purge marker only applies to archived versions.
        assert!(registry.set_bytes_purged("ds000117", 1, Utc::now()).await.unwrap());
        assert!(!registry.set_bytes_purged("ds000117", 2, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_stats_counts() {
        let (_dir, registry) = registry().await;
        let dataset = entity();
        let citation = Entity::citation("abcd1234", vec!["title_abstract".to_string()]);
        registry.ensure_entity(&dataset).await.unwrap();
        registry.ensure_entity(&citation).await.unwrap();

        registry
            .append_version(&dataset, None, 1, &snapshot_for("h1"), "m", "content changed", Utc::now())
            .await
            .unwrap();
        registry
            .append_version(&dataset, Some(1), 2, &snapshot_for("h2"), "m", "content changed", Utc::now())
            .await
            .unwrap();
        registry
            .append_version(&citation, None, 1, &snapshot_for("h3"), "m", "content changed", Utc::now())
            .await
            .unwrap();

        let stats = registry.stats().await.unwrap();
        assert_eq!(stats.datasets, 1);
        assert_eq!(stats.citations, 1);
        assert_eq!(stats.total_versions, 3);
        assert_eq!(stats.current_versions, 2);
        assert_eq!(stats.obsolete_versions, 1);
        assert_eq!(stats.archived_versions, 0);
    }
}
