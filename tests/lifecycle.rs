//! End-to-end lifecycle: versioning, cascade, retention

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::mpsc;

use dc_embedding_registry::composite::{spawn_cascade_worker, ScoreOutcome};
use dc_embedding_registry::testing::{HashEmbedder, MemoryContentProvider};
use dc_embedding_registry::{
    CompositeResolver, EmbeddingStore, EnsureOutcome, Entity, EntityKind, RegistryConfig,
    RetentionSweeper, SqliteRegistry, VersionManager, VersionStatus,
};

struct World {
    _dir: tempfile::TempDir,
    registry: SqliteRegistry,
    store: EmbeddingStore,
    provider: Arc<MemoryContentProvider>,
    manager: VersionManager,
    resolver: CompositeResolver,
    sweeper: RetentionSweeper,
}

async fn world() -> World {
    let dir = tempfile::tempdir().expect("create temp dir");
    let registry = SqliteRegistry::open(&dir.path().join("registry.db"))
        .await
        .expect("open registry");
    let store = EmbeddingStore::new(dir.path().join("embeddings"));
    store.init().await.expect("init store");

    let provider = Arc::new(MemoryContentProvider::new());
    let config = RegistryConfig {
        model_id: "test-model".to_string(),
        ..RegistryConfig::default()
    };
    let manager = VersionManager::new(
        registry.clone(),
        store.clone(),
        provider.clone(),
        Arc::new(HashEmbedder::default()),
        config.clone(),
    );
    let resolver = CompositeResolver::new(registry.clone(), store.clone());
    let sweeper = RetentionSweeper::new(registry.clone(), store.clone(), config);

    World {
        _dir: dir,
        registry,
        store,
        provider,
        manager,
        resolver,
        sweeper,
    }
}

fn ds000117() -> Entity {
    Entity::dataset("ds000117", vec!["README".to_string()])
}

fn citation_x() -> Entity {
    Entity::citation("citation_x", vec!["title_abstract".to_string()])
}

/// The full ds000117 scenario: version bump, obsoleted_by chain, composite
/// cascade to a fresh score against the still-current citation version.
#[tokio::test]
async fn content_change_cascades_to_composites() {
    let w = world().await;
    w.provider.set("ds000117", "README", b"multimodal faces dataset");
    w.provider
        .set("citation_x", "title_abstract", b"a study using the faces dataset");

    w.manager.ensure_current(&ds000117()).await.unwrap();
    w.manager.ensure_current(&citation_x()).await.unwrap();

    let first = match w.resolver.score_pair("ds000117", "citation_x").await.unwrap() {
        ScoreOutcome::Created(c) => c,
        other => panic!("expected Created, got {other:?}"),
    };
    assert_eq!((first.dataset_version, first.citation_version), (1, 1));

    // One byte of content changes.
    w.provider.set("ds000117", "README", b"multimodal faces dataset!");
    let outcome = w.manager.ensure_current(&ds000117()).await.unwrap();
    let v2 = match outcome {
        EnsureOutcome::Updated { version, previous } => {
            assert_eq!(previous, Some(1));
            version
        }
        other => panic!("expected Updated, got {other:?}"),
    };
    assert_eq!(v2.version, 2);

    let history = w.registry.get_history("ds000117").await.unwrap();
    assert_eq!(history[0].obsoleted_by, Some(2));
    assert_eq!(history[0].status, VersionStatus::Obsolete);

    // Cascade repairs the composite against the still-current citation v1.
    w.resolver.reconcile("ds000117").await.unwrap();
    let current = w
        .resolver
        .get_confidence("ds000117", "citation_x")
        .await
        .unwrap()
        .expect("current composite");
    assert_eq!((current.dataset_version, current.citation_version), (2, 1));

    // The superseded composite is never served.
    let history = w
        .registry
        .composite_history("ds000117", "citation_x")
        .await
        .unwrap();
    assert_eq!(history.len(), 2);

    // A second ensure pass changes nothing anywhere.
    let outcome = w.manager.ensure_current(&ds000117()).await.unwrap();
    assert!(matches!(outcome, EnsureOutcome::UpToDate(_)));
    let report = w.resolver.reconcile("ds000117").await.unwrap();
    assert_eq!(report.replaced, 0);
}

/// Confidence lookups before the citation has any embedding: None, not an
/// error.
#[tokio::test]
async fn confidence_before_embeddings_is_none() {
    let w = world().await;
    w.provider.set("ds000117", "README", b"dataset text");
    w.manager.ensure_current(&ds000117()).await.unwrap();

    assert!(w
        .resolver
        .get_confidence("ds000117", "citation_y")
        .await
        .unwrap()
        .is_none());

    let outcome = w.resolver.score_pair("ds000117", "citation_y").await.unwrap();
    assert!(matches!(outcome, ScoreOutcome::DependencyMissing { .. }));
}

/// The 31/91-day retention scenario, with the cascade worker wired the way
/// the refresh binary wires it.
#[tokio::test]
async fn retention_windows_archive_then_purge() {
    let w = world().await;
    let (tx, rx) = mpsc::unbounded_channel();
    let resolver = Arc::new(CompositeResolver::new(w.registry.clone(), w.store.clone()));
    let worker = spawn_cascade_worker(resolver.clone(), rx);

    let manager = VersionManager::new(
        w.registry.clone(),
        w.store.clone(),
        w.provider.clone(),
        Arc::new(HashEmbedder::default()),
        RegistryConfig {
            model_id: "test-model".to_string(),
            ..RegistryConfig::default()
        },
    )
    .with_cascade(tx);

    w.provider.set("ds000117", "README", b"dataset v1");
    w.provider.set("citation_x", "title_abstract", b"citation text");
    manager.ensure_current(&ds000117()).await.unwrap();
    manager.ensure_current(&citation_x()).await.unwrap();
    resolver.score_pair("ds000117", "citation_x").await.unwrap();

    w.provider.set("ds000117", "README", b"dataset v2");
    manager.ensure_current(&ds000117()).await.unwrap();

    drop(manager);
    worker.await.unwrap();

    // The cascade moved the composite off v1, so nothing pins it.
    let v1 = w.registry.get_version("ds000117", 1).await.unwrap().unwrap();
    let obsoleted_at = v1.obsoleted_at.expect("retired version has obsoleted_at");

    // Day 31: archived, bytes kept.
    let report = w.sweeper.sweep(obsoleted_at + Duration::days(31)).await.unwrap();
    assert_eq!(report.archived, 1);
    assert!(w.store.exists(EntityKind::Dataset, "ds000117", 1).await);

    // Day 31 + 91: bytes purged.
    let report = w
        .sweeper
        .sweep(obsoleted_at + Duration::days(31 + 91))
        .await
        .unwrap();
    assert_eq!(report.purged, 1);
    assert!(!w.store.exists(EntityKind::Dataset, "ds000117", 1).await);

    // Current artifacts and the current composite are untouched.
    assert!(w.store.exists(EntityKind::Dataset, "ds000117", 2).await);
    let current = w
        .resolver
        .get_confidence("ds000117", "citation_x")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.dataset_version, 2);
}

/// Registry survives reopen: history, current pointers, and composites are
/// durable.
#[tokio::test]
async fn registry_is_durable_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("registry.db");

    {
        let registry = SqliteRegistry::open(&db_path).await.unwrap();
        let store = EmbeddingStore::new(dir.path().join("embeddings"));
        store.init().await.unwrap();
        let provider = Arc::new(MemoryContentProvider::new());
        provider.set("ds000117", "README", b"dataset text");
        provider.set("citation_x", "title_abstract", b"citation text");

        let manager = VersionManager::new(
            registry.clone(),
            store.clone(),
            provider.clone(),
            Arc::new(HashEmbedder::default()),
            RegistryConfig {
                model_id: "test-model".to_string(),
                ..RegistryConfig::default()
            },
        );
        manager.ensure_current(&ds000117()).await.unwrap();
        manager.ensure_current(&citation_x()).await.unwrap();

        let resolver = CompositeResolver::new(registry.clone(), store);
        resolver.score_pair("ds000117", "citation_x").await.unwrap();
    }

    let reopened = SqliteRegistry::open(&db_path).await.unwrap();
    let current = reopened.get_current("ds000117").await.unwrap().unwrap();
    assert_eq!(current.version, 1);
    assert_eq!(current.model_id, "test-model");

    let composite = reopened
        .get_confidence("ds000117", "citation_x")
        .await
        .unwrap()
        .unwrap();
    assert_eq!((composite.dataset_version, composite.citation_version), (1, 1));
}
