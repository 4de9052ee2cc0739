//! Authoritative version metadata index
//!
//! This module provides:
//! - Entity records with a fast current-version pointer
//! - Ordered per-entity version history with lifecycle statuses
//! - Compare-and-swap append-and-retire (the only way versions mutate)
//! - The composite (dataset x citation) pair index
//!
//! ## Architecture
//!
//! ```text
//! ensure_current ──► append_version (CAS txn) ──► entities.current_version
//!                                              └► embedding_versions + version_sources
//!
//! reconcile ──► replace_composite (txn) ──► composites
//! ```

mod composites;
mod store;

pub(crate) use composites::NewComposite;
pub use store::SqliteRegistry;
