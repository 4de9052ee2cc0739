//! Version manager - the write path of the registry
//!
//! `ensure_current` is the only operation that creates or retires embedding
//! versions:
//!
//! ```text
//! assess staleness ──► fresh? ──────────────► UpToDate
//!        │
//!        ▼
//! embed (timeout, retry+backoff) ──► fail? ─► Deferred (old current stands)
//!        │
//!        ▼
//! write vector bytes (timeout) ──► fail? ───► error, registry untouched
//!        │
//!        ▼
//! append + retire (CAS txn) ──► conflict? ──► re-read, maybe retry
//!        │
//!        ▼
//! enqueue composite cascade ─────────────────► Updated
//! ```
//!
//! Bytes always land before metadata; a run cancelled (dropped) before the
//! registry transaction commits leaves at most an orphaned artifact file for
//! the sweeper. Once the transaction commits the version exists.

use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::content::ContentSnapshot;
use crate::detector::{ChangeDetector, Staleness};
use crate::embedder::EmbeddingModel;
use crate::registry::SqliteRegistry;
use crate::store::{EmbeddingStore, VectorArtifact};
use crate::types::{DeferReason, EnsureOutcome, Entity, RegistryConfig, RegistryError};

/// Orchestrates staleness detection, embedding, and version bookkeeping.
///
/// One manager serves all entities; concurrent `ensure_current` calls for
/// different entities proceed independently, while racers on the same
/// entity are serialized by the registry's compare-and-swap (the loser
/// re-reads and usually finds the entity fresh).
pub struct VersionManager {
    registry: SqliteRegistry,
    store: EmbeddingStore,
    detector: ChangeDetector,
    model: Arc<dyn EmbeddingModel>,
    config: RegistryConfig,
    cascade: Option<mpsc::UnboundedSender<String>>,
}

impl VersionManager {
    pub fn new(
        registry: SqliteRegistry,
        store: EmbeddingStore,
        provider: Arc<dyn crate::content::ContentProvider>,
        model: Arc<dyn EmbeddingModel>,
        config: RegistryConfig,
    ) -> Self {
        let detector = ChangeDetector::new(registry.clone(), provider);
        Self {
            registry,
            store,
            detector,
            model,
            config,
            cascade: None,
        }
    }

    /// Entities whose version changed are sent here for composite
    /// reconciliation (see [`crate::composite::spawn_cascade_worker`]).
    pub fn with_cascade(mut self, cascade: mpsc::UnboundedSender<String>) -> Self {
        self.cascade = Some(cascade);
        self
    }

    pub fn registry(&self) -> &SqliteRegistry {
        &self.registry
    }

    /// Bring the entity's embedding up to date. Idempotent: unchanged
    /// content (and model) returns the existing current version and creates
    /// nothing.
    #[instrument(skip(self, entity), fields(entity_id = %entity.id))]
    pub async fn ensure_current(&self, entity: &Entity) -> Result<EnsureOutcome, RegistryError> {
        let mut last_conflict = None;

        for attempt in 0..=self.config.max_conflict_retries {
            if attempt > 0 {
                debug!(attempt, "re-reading after conflicting update");
            }
            match self.try_ensure(entity).await {
                Err(RegistryError::ConflictingUpdate {
                    entity_id,
                    expected,
                    found,
                }) => {
                    warn!(
                        expected = ?expected,
                        found = ?found,
                        "lost version race, retrying"
                    );
                    last_conflict = Some(RegistryError::ConflictingUpdate {
                        entity_id,
                        expected,
                        found,
                    });
                }
                other => return other,
            }
        }

        Err(last_conflict.expect("conflict retry loop exited without error"))
    }

    async fn try_ensure(&self, entity: &Entity) -> Result<EnsureOutcome, RegistryError> {
        self.registry.ensure_entity(entity).await?;

        let verdict = match self.detector.assess(entity, &self.config.model_id).await {
            Ok(verdict) => verdict,
            // Recoverable: defer rather than guess about unreachable content.
            Err(RegistryError::SourceUnavailable { source_name: source, detail, .. }) => {
                info!(source = %source, "deferring: content source unavailable");
                return Ok(EnsureOutcome::Deferred(DeferReason::SourceUnavailable {
                    source,
                    detail,
                }));
            }
            Err(e) => return Err(e),
        };

        let (snapshot, expected_current, retire_reason) = match verdict {
            Staleness::Fresh => {
                let current = self
                    .registry
                    .get_current(&entity.id)
                    .await?
                    .ok_or_else(|| RegistryError::ConflictingUpdate {
                        entity_id: entity.id.clone(),
                        expected: None,
                        found: None,
                    })?;
                debug!(version = current.version, "up to date");
                return Ok(EnsureOutcome::UpToDate(current));
            }
            Staleness::NeverEmbedded { snapshot } => (snapshot, None, "content changed"),
            Staleness::ContentChanged {
                snapshot,
                expected_current,
            } => (snapshot, Some(expected_current), "content changed"),
            Staleness::ModelChanged {
                snapshot,
                expected_current,
            } => (snapshot, Some(expected_current), "model changed"),
        };

        self.create_version(entity, snapshot, expected_current, retire_reason)
            .await
    }

    /// Embed and commit a new version on top of `expected_current`, the
    /// current version the staleness verdict was judged against. The
    /// registry's compare-and-swap rejects the append if any other worker
    /// has moved the pointer since.
    async fn create_version(
        &self,
        entity: &Entity,
        snapshot: ContentSnapshot,
        expected_current: Option<i64>,
        retire_reason: &str,
    ) -> Result<EnsureOutcome, RegistryError> {
        let new_version = self.registry.next_version_number(&entity.id).await?;

        let vector = match self.embed_with_retry(&snapshot.text).await {
            Ok(vector) => vector,
            Err(detail) => {
                warn!(%detail, "deferring: model attempts exhausted");
                return Ok(EnsureOutcome::Deferred(DeferReason::ModelFailure { detail }));
            }
        };

        // Bytes land before any metadata is committed. A failure here leaves
        // the registry untouched; a success followed by a metadata failure
        // leaves an orphan for the sweeper.
        let artifact =
            VectorArtifact::new(&entity.id, new_version, &self.config.model_id, vector);
        timeout(self.config.storage_timeout, self.store.save(entity.kind, &artifact))
            .await
            .map_err(|_| RegistryError::Timeout(self.config.storage_timeout))??;

        let version = timeout(
            self.config.storage_timeout,
            self.registry.append_version(
                entity,
                expected_current,
                new_version,
                &snapshot,
                &self.config.model_id,
                retire_reason,
                Utc::now(),
            ),
        )
        .await
        .map_err(|_| RegistryError::Timeout(self.config.storage_timeout))??;

        info!(
            version = version.version,
            previous = ?expected_current,
            reason = retire_reason,
            "created embedding version"
        );

        if let Some(cascade) = &self.cascade {
            // Receiver gone means no resolver worker; reconcile runs later.
            let _ = cascade.send(entity.id.clone());
        }

        Ok(EnsureOutcome::Updated {
            version,
            previous: expected_current,
        })
    }

    /// Call the model under the configured timeout, retrying transient
    /// failures with exponential backoff and jitter.
    async fn embed_with_retry(&self, text: &str) -> Result<Vec<f32>, String> {
        let mut delay = self.config.retry_base_delay;
        let mut last_error = String::from("no attempts made");

        for attempt in 1..=self.config.max_model_retries.max(1) {
            match timeout(
                self.config.model_timeout,
                self.model.embed(text, &self.config.model_id),
            )
            .await
            {
                Ok(Ok(vector)) => return Ok(vector),
                Ok(Err(e)) => {
                    last_error = e.to_string();
                    warn!(attempt, error = %last_error, "model call failed");
                }
                Err(_) => {
                    last_error = format!("timed out after {:?}", self.config.model_timeout);
                    warn!(attempt, "model call timed out");
                }
            }

            if attempt < self.config.max_model_retries {
                let jitter_ms = {
                    let mut rng = rand::thread_rng();
                    rng.gen_range(0..=delay.as_millis().max(1) as u64 / 2)
                };
                tokio::time::sleep(delay + std::time::Duration::from_millis(jitter_ms)).await;
                delay *= 2;
            }
        }

        Err(last_error)
    }
}
