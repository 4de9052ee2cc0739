//! Operational entry point for the embedding registry
//!
//! Subcommands:
//!   refresh    - bring every manifest entity's embedding up to date
//!   reconcile  - repair composites for one entity or all entities
//!   sweep      - run the retention pass (or report it with --dry-run)
//!   obsolete   - manually retire an entity's current version
//!   stats      - print registry counts
//!
//! The entity manifest is a JSON array of `{kind, id, sources}` records;
//! raw content is read from `--content-dir/<entity_id>/<source_name>`.
//!
//! Run with:
//!   refresh_embeddings --registry-db embeddings/registry.db \
//!       refresh --manifest entities.json --content-dir content/
//!
//! Environment fallbacks (also via .env): DC_REGISTRY_DB, DC_EMBEDDINGS_DIR,
//! DC_MODEL_ID, DC_MODEL_ENDPOINT.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn};

use dc_embedding_registry::composite::spawn_cascade_worker;
use dc_embedding_registry::testing::HashEmbedder;
use dc_embedding_registry::{
    CompositeResolver, EmbeddingModel, EmbeddingStore, Entity, HttpEmbeddingModel, RegistryConfig,
    RetentionSweeper, SqliteRegistry, VersionManager, DEFAULT_MODEL_ID,
};

#[derive(Parser)]
#[command(name = "refresh_embeddings", about = "Embedding registry operations")]
struct Cli {
    /// Registry database path
    #[arg(long, env = "DC_REGISTRY_DB", default_value = "embeddings/registry.db")]
    registry_db: PathBuf,

    /// Root directory for embedding artifact files
    #[arg(long, env = "DC_EMBEDDINGS_DIR", default_value = "embeddings")]
    embeddings_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Bring every manifest entity's embedding up to date
    Refresh {
        /// JSON manifest of entities and their declared sources
        #[arg(long)]
        manifest: PathBuf,

        /// Directory holding raw source content per entity
        #[arg(long, env = "DC_CONTENT_DIR", default_value = "content")]
        content_dir: PathBuf,

        /// Model identifier recorded against new versions
        #[arg(long, env = "DC_MODEL_ID", default_value = DEFAULT_MODEL_ID)]
        model_id: String,

        /// Embedding service endpoint (omit for --offline)
        #[arg(long, env = "DC_MODEL_ENDPOINT")]
        model_endpoint: Option<String>,

        /// Use the deterministic hash embedder instead of a model service
        #[arg(long)]
        offline: bool,

        /// Concurrent entity workers
        #[arg(long, default_value_t = 4)]
        workers: usize,
    },

    /// Repair composites for one entity (or every registered entity)
    Reconcile {
        /// Entity id; omitted means all entities
        entity: Option<String>,
    },

    /// Run the retention pass
    Sweep {
        /// Report versions due for archival without mutating anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Manually retire an entity's current version
    Obsolete {
        entity: String,

        #[arg(long, default_value = "manually obsoleted")]
        reason: String,
    },

    /// Print registry counts
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    if let Some(parent) = cli.registry_db.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }
    let registry = SqliteRegistry::open(&cli.registry_db)
        .await
        .context("failed to open registry database")?;
    let store = EmbeddingStore::new(&cli.embeddings_dir);
    store.init().await.context("failed to init embedding store")?;

    match cli.command {
        Command::Refresh {
            manifest,
            content_dir,
            model_id,
            model_endpoint,
            offline,
            workers,
        } => {
            refresh(
                registry,
                store,
                manifest,
                content_dir,
                model_id,
                model_endpoint,
                offline,
                workers,
            )
            .await
        }
        Command::Reconcile { entity } => reconcile(registry, store, entity).await,
        Command::Sweep { dry_run } => sweep(registry, store, dry_run).await,
        Command::Obsolete { entity, reason } => {
            match registry.mark_obsolete(&entity, &reason, Utc::now()).await? {
                Some(version) => info!(%entity, version, "retired current version"),
                None => warn!(%entity, "no current version to retire"),
            }
            // Dependent composites must not stay current.
            let resolver = CompositeResolver::new(registry.clone(), store);
            let report = resolver.reconcile(&entity).await?;
            info!(dropped = report.dropped, "dependents reconciled");
            print_stats(&registry).await
        }
        Command::Stats => print_stats(&registry).await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn refresh(
    registry: SqliteRegistry,
    store: EmbeddingStore,
    manifest: PathBuf,
    content_dir: PathBuf,
    model_id: String,
    model_endpoint: Option<String>,
    offline: bool,
    workers: usize,
) -> Result<()> {
    let entities = load_manifest(&manifest).await?;
    info!(count = entities.len(), "loaded entity manifest");

    let model: Arc<dyn EmbeddingModel> = match (offline, model_endpoint) {
        (true, _) => {
            info!("using deterministic offline embedder");
            Arc::new(HashEmbedder::default())
        }
        (false, Some(endpoint)) => {
            info!(%endpoint, "using embedding service");
            Arc::new(HttpEmbeddingModel::new(endpoint))
        }
        (false, None) => anyhow::bail!(
            "no embedding model configured: pass --model-endpoint (or DC_MODEL_ENDPOINT), or --offline"
        ),
    };

    let provider = Arc::new(dc_embedding_registry::FsContentProvider::new(content_dir));
    let config = RegistryConfig {
        model_id,
        ..RegistryConfig::default()
    };

    let (cascade_tx, cascade_rx) = mpsc::unbounded_channel();
    let resolver = Arc::new(CompositeResolver::new(registry.clone(), store.clone()));
    let cascade_worker = spawn_cascade_worker(resolver, cascade_rx);

    let manager = Arc::new(
        VersionManager::new(registry.clone(), store, provider, model, config)
            .with_cascade(cascade_tx),
    );

    let started = std::time::Instant::now();
    let limit = Arc::new(Semaphore::new(workers.max(1)));
    let mut tasks = JoinSet::new();

    for entity in entities {
        let manager = manager.clone();
        let limit = limit.clone();
        tasks.spawn(async move {
            let _permit = limit.acquire_owned().await.expect("semaphore closed");
            let outcome = manager.ensure_current(&entity).await;
            (entity.id, outcome)
        });
    }

    let mut updated = 0usize;
    let mut deferred = 0usize;
    let mut failed = 0usize;
    while let Some(joined) = tasks.join_next().await {
        let (entity_id, outcome) = joined.context("worker task panicked")?;
        match outcome {
            Ok(outcome) => {
                info!(%entity_id, "{}", outcome.describe());
                match outcome {
                    dc_embedding_registry::EnsureOutcome::Updated { .. } => updated += 1,
                    dc_embedding_registry::EnsureOutcome::Deferred(_) => deferred += 1,
                    dc_embedding_registry::EnsureOutcome::UpToDate(_) => {}
                }
            }
            Err(e) => {
                warn!(%entity_id, error = %e, "refresh failed");
                failed += 1;
            }
        }
    }

    // All senders dropped; the cascade worker drains and exits.
    drop(manager);
    cascade_worker.await.context("cascade worker panicked")?;

    info!(
        updated,
        deferred,
        failed,
        elapsed_secs = started.elapsed().as_secs_f64(),
        "refresh complete"
    );
    print_stats(&registry).await
}

async fn reconcile(
    registry: SqliteRegistry,
    store: EmbeddingStore,
    entity: Option<String>,
) -> Result<()> {
    let resolver = CompositeResolver::new(registry.clone(), store);

    let targets = match entity {
        Some(id) => vec![id],
        None => registry
            .list_entities(None)
            .await?
            .into_iter()
            .map(|(id, _, _)| id)
            .collect(),
    };

    let mut replaced = 0usize;
    let mut dropped = 0usize;
    for entity_id in targets {
        let report = resolver.reconcile(&entity_id).await?;
        replaced += report.replaced + report.resurrected;
        dropped += report.dropped;
    }

    info!(replaced, dropped, "reconcile complete");
    print_stats(&registry).await
}

async fn sweep(registry: SqliteRegistry, store: EmbeddingStore, dry_run: bool) -> Result<()> {
    let sweeper = RetentionSweeper::new(registry.clone(), store, RegistryConfig::default());
    let now = Utc::now();

    if dry_run {
        let due = sweeper.obsolete_report(now).await?;
        info!(due = due.len(), "versions past grace period");
        for version in due {
            info!(
                entity_id = %version.entity_id,
                version = version.version,
                obsoleted_at = ?version.obsoleted_at,
                "due for archival"
            );
        }
        return Ok(());
    }

    let report = sweeper.sweep(now).await?;
    info!(
        archived = report.archived,
        purged = report.purged,
        pinned = report.pinned,
        orphans_deleted = report.orphans_deleted,
        "sweep complete"
    );
    print_stats(&registry).await
}

async fn load_manifest(path: &PathBuf) -> Result<Vec<Entity>> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read manifest {}", path.display()))?;
    let entities: Vec<Entity> =
        serde_json::from_slice(&bytes).context("failed to parse entity manifest")?;
    Ok(entities)
}

async fn print_stats(registry: &SqliteRegistry) -> Result<()> {
    let stats = registry.stats().await?;
    info!(
        "Registry stats: {} datasets, {} citations, {} versions ({} current, {} obsolete, {} archived), {} current composites, {} obsolete composites",
        stats.datasets,
        stats.citations,
        stats.total_versions,
        stats.current_versions,
        stats.obsolete_versions,
        stats.archived_versions,
        stats.current_composites,
        stats.obsolete_composites
    );
    Ok(())
}
