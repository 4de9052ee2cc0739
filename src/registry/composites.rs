//! Composite (dataset x citation) pair index
//!
//! Each pair has at most one current confidence score; superseded scores are
//! kept as obsolete rows for provenance. A current composite pins both of
//! its input versions against byte reclamation.

use chrono::{DateTime, Utc};
use tracing::debug;

use super::store::SqliteRegistry;
use crate::types::{CompositeStatus, CompositeVersion, EntityKind, RegistryError};

const COMPOSITE_COLUMNS: &str = "dataset_id, dataset_version, citation_id, citation_version, \
     confidence_score, status, created_at, obsoleted_at, obsoleted_reason";

type CompositeRow = (
    String,
    i64,
    String,
    i64,
    f64,
    String,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
    Option<String>,
);

fn composite_from_row(row: CompositeRow) -> Result<CompositeVersion, RegistryError> {
    let (
        dataset_id,
        dataset_version,
        citation_id,
        citation_version,
        confidence_score,
        status,
        created_at,
        obsoleted_at,
        obsoleted_reason,
    ) = row;
    Ok(CompositeVersion {
        dataset_id,
        dataset_version,
        citation_id,
        citation_version,
        confidence_score,
        status: CompositeStatus::parse(&status)?,
        created_at,
        obsoleted_at,
        obsoleted_reason,
    })
}

/// A replacement composite's component versions and score
#[derive(Debug, Clone, Copy)]
pub(crate) struct NewComposite {
    pub dataset_version: i64,
    pub citation_version: i64,
    pub confidence_score: f64,
}

impl SqliteRegistry {
    /// The current confidence score for a pair, if one exists.
    ///
    /// Obsolete composites are never returned; callers must not score
    /// against a composite whose inputs were superseded.
    pub async fn get_confidence(
        &self,
        dataset_id: &str,
        citation_id: &str,
    ) -> Result<Option<CompositeVersion>, RegistryError> {
        let row: Option<CompositeRow> = sqlx::query_as(&format!(
            "SELECT {COMPOSITE_COLUMNS} FROM composites
             WHERE dataset_id = ?1 AND citation_id = ?2 AND status = 'current'"
        ))
        .bind(dataset_id)
        .bind(citation_id)
        .fetch_optional(self.pool())
        .await?;
        row.map(composite_from_row).transpose()
    }

    /// Every composite ever recorded for a pair, oldest first.
    pub async fn composite_history(
        &self,
        dataset_id: &str,
        citation_id: &str,
    ) -> Result<Vec<CompositeVersion>, RegistryError> {
        let rows: Vec<CompositeRow> = sqlx::query_as(&format!(
            "SELECT {COMPOSITE_COLUMNS} FROM composites
             WHERE dataset_id = ?1 AND citation_id = ?2 ORDER BY created_at, dataset_version, citation_version"
        ))
        .bind(dataset_id)
        .bind(citation_id)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(composite_from_row).collect()
    }

    /// Current composites that reference the given entity (on either side).
    pub async fn current_composites_referencing(
        &self,
        entity_id: &str,
        kind: EntityKind,
    ) -> Result<Vec<CompositeVersion>, RegistryError> {
        let column = match kind {
            EntityKind::Dataset => "dataset_id",
            EntityKind::Citation => "citation_id",
        };
        let rows: Vec<CompositeRow> = sqlx::query_as(&format!(
            "SELECT {COMPOSITE_COLUMNS} FROM composites
             WHERE {column} = ?1 AND status = 'current'
             ORDER BY dataset_id, citation_id"
        ))
        .bind(entity_id)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(composite_from_row).collect()
    }

    /// Pairs referencing the entity whose composite was retired and never
    /// replaced (typically `"dependency missing"`). Once the missing side
    /// has a current version again, reconciliation re-derives these.
    pub async fn unresolved_pairs_referencing(
        &self,
        entity_id: &str,
        kind: EntityKind,
    ) -> Result<Vec<(String, String)>, RegistryError> {
        let column = match kind {
            EntityKind::Dataset => "dataset_id",
            EntityKind::Citation => "citation_id",
        };
        let rows: Vec<(String, String)> = sqlx::query_as(&format!(
            "SELECT DISTINCT dataset_id, citation_id FROM composites c
             WHERE {column} = ?1 AND NOT EXISTS (
                 SELECT 1 FROM composites cur
                 WHERE cur.dataset_id = c.dataset_id
                   AND cur.citation_id = c.citation_id
                   AND cur.status = 'current')
             ORDER BY dataset_id, citation_id"
        ))
        .bind(entity_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Whether `(entity_id, version)` is pinned by any current composite.
    ///
    /// Pinned versions keep their bytes regardless of the archive window.
    pub async fn pinned_by_current_composite(
        &self,
        entity_id: &str,
        kind: EntityKind,
        version: i64,
    ) -> Result<bool, RegistryError> {
        let (id_column, version_column) = match kind {
            EntityKind::Dataset => ("dataset_id", "dataset_version"),
            EntityKind::Citation => ("citation_id", "citation_version"),
        };
        let row: Option<(i64,)> = sqlx::query_as(&format!(
            "SELECT 1 FROM composites
             WHERE {id_column} = ?1 AND {version_column} = ?2 AND status = 'current'
             LIMIT 1"
        ))
        .bind(entity_id)
        .bind(version)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.is_some())
    }

    /// Retire the pair's current composite (if any) and install a
    /// replacement (if one can be built), in one transaction.
    ///
    /// `replacement = None` records the dependency-missing case: the old
    /// score is retired and nothing takes its place until the missing
    /// component gets a current version. Returns the new composite.
    pub(crate) async fn replace_composite(
        &self,
        dataset_id: &str,
        citation_id: &str,
        retire_reason: &str,
        replacement: Option<NewComposite>,
        now: DateTime<Utc>,
    ) -> Result<Option<CompositeVersion>, RegistryError> {
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            "UPDATE composites
             SET status = 'obsolete', obsoleted_at = ?1, obsoleted_reason = ?2
             WHERE dataset_id = ?3 AND citation_id = ?4 AND status = 'current'",
        )
        .bind(now)
        .bind(retire_reason)
        .bind(dataset_id)
        .bind(citation_id)
        .execute(&mut *tx)
        .await?;

        let created = match replacement {
            Some(new) => {
                sqlx::query(
                    "INSERT INTO composites
                         (dataset_id, dataset_version, citation_id, citation_version,
                          confidence_score, status, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, 'current', ?6)",
                )
                .bind(dataset_id)
                .bind(new.dataset_version)
                .bind(citation_id)
                .bind(new.citation_version)
                .bind(new.confidence_score)
                .bind(now)
                .execute(&mut *tx)
                .await?;

                Some(CompositeVersion {
                    dataset_id: dataset_id.to_string(),
                    dataset_version: new.dataset_version,
                    citation_id: citation_id.to_string(),
                    citation_version: new.citation_version,
                    confidence_score: new.confidence_score,
                    status: CompositeStatus::Current,
                    created_at: now,
                    obsoleted_at: None,
                    obsoleted_reason: None,
                })
            }
            None => None,
        };

        tx.commit().await?;
        debug!(
            dataset_id,
            citation_id,
            replaced = created.is_some(),
            "composite transition"
        );
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::snapshot_for;
    use crate::types::Entity;

    async fn registry() -> (tempfile::TempDir, SqliteRegistry) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let registry = SqliteRegistry::open(&dir.path().join("registry.db"))
            .await
            .expect("open registry");
        (dir, registry)
    }

    async fn seed_entities(registry: &SqliteRegistry) {
        let dataset = Entity::dataset("ds000117", vec!["README".to_string()]);
        let citation = Entity::citation("abcd1234", vec!["title_abstract".to_string()]);
        registry.ensure_entity(&dataset).await.unwrap();
        registry.ensure_entity(&citation).await.unwrap();
        registry
            .append_version(&dataset, None, 1, &snapshot_for("d1"), "m", "content changed", Utc::now())
            .await
            .unwrap();
        registry
            .append_version(&citation, None, 1, &snapshot_for("c1"), "m", "content changed", Utc::now())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_no_composite_returns_none() {
        let (_dir, registry) = registry().await;
        assert!(registry.get_confidence("dsX", "citY").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_and_lookup_current() {
        let (_dir, registry) = registry().await;
        seed_entities(&registry).await;

        let created = registry
            .replace_composite(
                "ds000117",
                "abcd1234",
                "input superseded",
                Some(NewComposite {
                    dataset_version: 1,
                    citation_version: 1,
                    confidence_score: 0.83,
                }),
                Utc::now(),
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(created.status, CompositeStatus::Current);

        let fetched = registry
            .get_confidence("ds000117", "abcd1234")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.dataset_version, 1);
        assert_eq!(fetched.citation_version, 1);
        assert!((fetched.confidence_score - 0.83).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_replace_retires_old_composite() {
        let (_dir, registry) = registry().await;
        seed_entities(&registry).await;

        registry
            .replace_composite(
                "ds000117",
                "abcd1234",
                "input superseded",
                Some(NewComposite { dataset_version: 1, citation_version: 1, confidence_score: 0.8 }),
                Utc::now(),
            )
            .await
            .unwrap();
        registry
            .replace_composite(
                "ds000117",
                "abcd1234",
                "input superseded",
                Some(NewComposite { dataset_version: 2, citation_version: 1, confidence_score: 0.9 }),
                Utc::now(),
            )
            .await
            .unwrap();

        let history = registry.composite_history("ds000117", "abcd1234").await.unwrap();
        assert_eq!(history.len(), 2);

        let obsolete: Vec<_> = history
            .iter()
            .filter(|c| c.status == CompositeStatus::Obsolete)
            .collect();
        assert_eq!(obsolete.len(), 1);
        assert_eq!(obsolete[0].dataset_version, 1);
        assert_eq!(obsolete[0].obsoleted_reason.as_deref(), Some("input superseded"));

        let current = registry.get_confidence("ds000117", "abcd1234").await.unwrap().unwrap();
        assert_eq!(current.dataset_version, 2);
    }

    #[tokio::test]
    async fn test_retire_without_replacement() {
        let (_dir, registry) = registry().await;
        seed_entities(&registry).await;

        registry
            .replace_composite(
                "ds000117",
                "abcd1234",
                "input superseded",
                Some(NewComposite { dataset_version: 1, citation_version: 1, confidence_score: 0.8 }),
                Utc::now(),
            )
            .await
            .unwrap();

        let replaced = registry
            .replace_composite("ds000117", "abcd1234", "dependency missing", None, Utc::now())
            .await
            .unwrap();
        assert!(replaced.is_none());

        assert!(registry.get_confidence("ds000117", "abcd1234").await.unwrap().is_none());
        let history = registry.composite_history("ds000117", "abcd1234").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].obsoleted_reason.as_deref(), Some("dependency missing"));
    }

    #[tokio::test]
    async fn test_pin_follows_current_composites_only() {
        let (_dir, registry) = registry().await;
        seed_entities(&registry).await;

        registry
            .replace_composite(
                "ds000117",
                "abcd1234",
                "input superseded",
                Some(NewComposite { dataset_version: 1, citation_version: 1, confidence_score: 0.8 }),
                Utc::now(),
            )
            .await
            .unwrap();

        assert!(registry
            .pinned_by_current_composite("ds000117", EntityKind::Dataset, 1)
            .await
            .unwrap());
        assert!(registry
            .pinned_by_current_composite("abcd1234", EntityKind::Citation, 1)
            .await
            .unwrap());

        // Replacing with a composite on dataset v2 releases the v1 pin.
        registry
            .replace_composite(
                "ds000117",
                "abcd1234",
                "input superseded",
                Some(NewComposite { dataset_version: 2, citation_version: 1, confidence_score: 0.9 }),
                Utc::now(),
            )
            .await
            .unwrap();

        assert!(!registry
            .pinned_by_current_composite("ds000117", EntityKind::Dataset, 1)
            .await
            .unwrap());
        assert!(registry
            .pinned_by_current_composite("ds000117", EntityKind::Dataset, 2)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_referencing_query_matches_side() {
        let (_dir, registry) = registry().await;
        seed_entities(&registry).await;

        registry
            .replace_composite(
                "ds000117",
                "abcd1234",
                "input superseded",
                Some(NewComposite { dataset_version: 1, citation_version: 1, confidence_score: 0.8 }),
                Utc::now(),
            )
            .await
            .unwrap();

        let by_dataset = registry
            .current_composites_referencing("ds000117", EntityKind::Dataset)
            .await
            .unwrap();
        assert_eq!(by_dataset.len(), 1);

        let by_citation = registry
            .current_composites_referencing("abcd1234", EntityKind::Citation)
            .await
            .unwrap();
        assert_eq!(by_citation.len(), 1);

        let unrelated = registry
            .current_composites_referencing("ds999999", EntityKind::Dataset)
            .await
            .unwrap();
        assert!(unrelated.is_empty());
    }
}
