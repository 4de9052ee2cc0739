//! Embedding Versioning & Staleness Registry
//!
//! Tracks derived embedding artifacts for mutable source content (dataset
//! descriptions, citation abstracts): which artifact is current for each
//! entity, when it became stale, and which composite confidence scores
//! depend on it. The embedding model, raw content providers, and score
//! consumers are external collaborators behind traits.
//!
//! # Architecture
//!
//! ```text
//! raw content
//!       │
//!       ▼
//! ┌─────────────────────────────────────────┐
//! │  ContentProvider + ChangeDetector       │
//! │  SHA-256/16 per source → stale verdict  │
//! └─────────────────────────────────────────┘
//!       │ stale
//!       ▼
//! ┌─────────────────────────────────────────┐
//! │  VersionManager                         │
//! │  embed → bytes → CAS append-and-retire  │
//! └─────────────────────────────────────────┘
//!       │                    │
//!       ▼                    ▼
//! ┌───────────────┐  ┌─────────────────────┐
//! │ EmbeddingStore│  │ SqliteRegistry      │
//! │ vector bytes  │  │ version metadata    │
//! └───────────────┘  └─────────────────────┘
//!       │ cascade
//!       ▼
//! ┌─────────────────────────────────────────┐
//! │  CompositeResolver                      │
//! │  (dataset, citation) → confidence score │
//! └─────────────────────────────────────────┘
//!       │
//!       ▼
//! ┌─────────────────────────────────────────┐
//! │  RetentionSweeper                       │
//! │  grace → archive → purge (unless pinned)│
//! └─────────────────────────────────────────┘
//! ```

pub mod composite;
pub mod content;
pub mod detector;
pub mod embedder;
pub mod hashing;
pub mod manager;
pub mod registry;
pub mod similarity;
pub mod store;
pub mod sweeper;
pub mod testing;
pub mod types;

pub use composite::{CompositeResolver, ReconcileReport, ScoreOutcome, SimilarityFn};
pub use content::{ContentProvider, ContentSnapshot, FsContentProvider, SourceFetchError};
pub use detector::{ChangeDetector, Staleness};
pub use embedder::{EmbeddingModel, HttpEmbeddingModel, ModelError};
pub use manager::VersionManager;
pub use registry::SqliteRegistry;
pub use store::{EmbeddingStore, VectorArtifact};
pub use sweeper::{RetentionSweeper, SweepReport};
pub use types::{
    CompositeStatus, CompositeVersion, DeferReason, EmbeddingVersion, EnsureOutcome, Entity,
    EntityKind, RegistryConfig, RegistryError, RegistryStats, VersionStatus, DEFAULT_MODEL_ID,
};
