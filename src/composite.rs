//! Composite resolver - cascading invalidation and confidence scoring
//!
//! A composite pairs one dataset embedding version with one citation
//! embedding version and carries their similarity as a confidence score.
//! Whenever either component's current version moves, every composite
//! referencing the superseded version must be retired and re-derived from
//! the components' current versions. The resolver owns that repair; the
//! similarity function itself is an injected collaborator.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::registry::{NewComposite, SqliteRegistry};
use crate::similarity;
use crate::store::EmbeddingStore;
use crate::types::{CompositeVersion, EntityKind, RegistryError};

/// Pluggable similarity collaborator, `(dataset, citation) -> [0, 1]`
pub type SimilarityFn = fn(&[f32], &[f32]) -> f32;

/// Outcome of scoring a (dataset, citation) pair
#[derive(Debug, Clone)]
pub enum ScoreOutcome {
    /// The existing composite already references both current versions.
    Current(CompositeVersion),
    /// A new composite was derived and installed.
    Created(CompositeVersion),
    /// One component has no current embedding; recorded, not an error.
    DependencyMissing { entity_id: String },
}

/// What a reconciliation pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Current composites found referencing a superseded version
    pub examined: usize,
    /// Composites re-derived from both components' current versions
    pub replaced: usize,
    /// Composites retired with no replacement (dependency missing)
    pub dropped: usize,
    /// Dependency-missing pairs resurrected now that the entity is back
    pub resurrected: usize,
}

/// Repairs composites after component version transitions
pub struct CompositeResolver {
    registry: SqliteRegistry,
    store: EmbeddingStore,
    similarity: SimilarityFn,
}

impl CompositeResolver {
    pub fn new(registry: SqliteRegistry, store: EmbeddingStore) -> Self {
        Self {
            registry,
            store,
            similarity: similarity::cosine_confidence,
        }
    }

    /// Swap in a different similarity collaborator.
    pub fn with_similarity(mut self, similarity: SimilarityFn) -> Self {
        self.similarity = similarity;
        self
    }

    /// The current confidence score for a pair, if any.
    pub async fn get_confidence(
        &self,
        dataset_id: &str,
        citation_id: &str,
    ) -> Result<Option<CompositeVersion>, RegistryError> {
        self.registry.get_confidence(dataset_id, citation_id).await
    }

    /// Repair every composite referencing `entity_id` after a version
    /// transition. Idempotent: a consistent dependent set is a no-op.
    #[instrument(skip(self))]
    pub async fn reconcile(&self, entity_id: &str) -> Result<ReconcileReport, RegistryError> {
        let mut report = ReconcileReport::default();

        let Some(kind) = self.registry.entity_kind(entity_id).await? else {
            debug!("entity unknown to registry; nothing to reconcile");
            return Ok(report);
        };
        let current = self.registry.current_version_number(entity_id).await?;

        let referencing = self
            .registry
            .current_composites_referencing(entity_id, kind)
            .await?;

        for composite in referencing {
            let referenced = match kind {
                EntityKind::Dataset => composite.dataset_version,
                EntityKind::Citation => composite.citation_version,
            };
            if Some(referenced) == current {
                continue;
            }

            report.examined += 1;
            match self
                .rederive_pair(&composite.dataset_id, &composite.citation_id, "input superseded")
                .await?
            {
                Some(_) => report.replaced += 1,
                None => report.dropped += 1,
            }
        }

        // Pairs retired for a missing dependency come back once this entity
        // has a current version again.
        if current.is_some() {
            for (dataset_id, citation_id) in self
                .registry
                .unresolved_pairs_referencing(entity_id, kind)
                .await?
            {
                if self
                    .try_score(&dataset_id, &citation_id)
                    .await?
                    .is_some()
                {
                    report.resurrected += 1;
                }
            }
        }

        if report != ReconcileReport::default() {
            info!(
                examined = report.examined,
                replaced = report.replaced,
                dropped = report.dropped,
                resurrected = report.resurrected,
                "reconciled composites"
            );
        }
        Ok(report)
    }

    /// Establish or refresh the composite for one pair.
    #[instrument(skip(self))]
    pub async fn score_pair(
        &self,
        dataset_id: &str,
        citation_id: &str,
    ) -> Result<ScoreOutcome, RegistryError> {
        let dataset_current = self.registry.current_version_number(dataset_id).await?;
        let citation_current = self.registry.current_version_number(citation_id).await?;

        if let Some(existing) = self.registry.get_confidence(dataset_id, citation_id).await? {
            if Some(existing.dataset_version) == dataset_current
                && Some(existing.citation_version) == citation_current
            {
                return Ok(ScoreOutcome::Current(existing));
            }
            // Stale composite for this pair: fall through and re-derive.
            return match self
                .rederive_pair(dataset_id, citation_id, "input superseded")
                .await?
            {
                Some(created) => Ok(ScoreOutcome::Created(created)),
                None => Ok(ScoreOutcome::DependencyMissing {
                    entity_id: if dataset_current.is_none() {
                        dataset_id.to_string()
                    } else {
                        citation_id.to_string()
                    },
                }),
            };
        }

        let (Some(_), Some(_)) = (dataset_current, citation_current) else {
            return Ok(ScoreOutcome::DependencyMissing {
                entity_id: if dataset_current.is_none() {
                    dataset_id.to_string()
                } else {
                    citation_id.to_string()
                },
            });
        };

        match self.try_score(dataset_id, citation_id).await? {
            Some(created) => Ok(ScoreOutcome::Created(created)),
            None => Ok(ScoreOutcome::DependencyMissing {
                entity_id: dataset_id.to_string(),
            }),
        }
    }

    /// Retire the pair's current composite and install a replacement built
    /// from both components' current versions, or none if a dependency is
    /// missing.
    async fn rederive_pair(
        &self,
        dataset_id: &str,
        citation_id: &str,
        retire_reason: &str,
    ) -> Result<Option<CompositeVersion>, RegistryError> {
        match self.load_current_pair(dataset_id, citation_id).await? {
            Some((dataset_version, citation_version, score)) => {
                self.registry
                    .replace_composite(
                        dataset_id,
                        citation_id,
                        retire_reason,
                        Some(NewComposite {
                            dataset_version,
                            citation_version,
                            confidence_score: score,
                        }),
                        Utc::now(),
                    )
                    .await
            }
            None => {
                warn!(
                    dataset_id,
                    citation_id, "composite retired; dependency missing"
                );
                self.registry
                    .replace_composite(dataset_id, citation_id, "dependency missing", None, Utc::now())
                    .await
            }
        }
    }

    /// Derive and install a composite when both components are current;
    /// returns `None` (installing nothing) otherwise.
    async fn try_score(
        &self,
        dataset_id: &str,
        citation_id: &str,
    ) -> Result<Option<CompositeVersion>, RegistryError> {
        let Some((dataset_version, citation_version, score)) =
            self.load_current_pair(dataset_id, citation_id).await?
        else {
            return Ok(None);
        };
        self.registry
            .replace_composite(
                dataset_id,
                citation_id,
                "input superseded",
                Some(NewComposite {
                    dataset_version,
                    citation_version,
                    confidence_score: score,
                }),
                Utc::now(),
            )
            .await
    }

    /// Load both components' current vectors and score them.
    async fn load_current_pair(
        &self,
        dataset_id: &str,
        citation_id: &str,
    ) -> Result<Option<(i64, i64, f64)>, RegistryError> {
        let Some(dataset) = self.registry.get_current(dataset_id).await? else {
            return Ok(None);
        };
        let Some(citation) = self.registry.get_current(citation_id).await? else {
            return Ok(None);
        };

        let dataset_vec = self
            .store
            .load(EntityKind::Dataset, dataset_id, dataset.version)
            .await?;
        let citation_vec = self
            .store
            .load(EntityKind::Citation, citation_id, citation.version)
            .await?;

        let score = (self.similarity)(&dataset_vec.vector, &citation_vec.vector) as f64;
        Ok(Some((dataset.version, citation.version, score)))
    }
}

/// Drain the version manager's cascade channel, reconciling each entity as
/// its version moves. Runs until every sender is dropped.
pub fn spawn_cascade_worker(
    resolver: Arc<CompositeResolver>,
    mut requests: mpsc::UnboundedReceiver<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(entity_id) = requests.recv().await {
            if let Err(e) = resolver.reconcile(&entity_id).await {
                warn!(%entity_id, error = %e, "cascade reconcile failed; will repair on next run");
            }
        }
    })
}
