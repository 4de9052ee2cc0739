//! Deterministic in-process collaborators
//!
//! Stand-ins for the external content and model services: an in-memory
//! content provider with scriptable failures, and a hash-derived embedder
//! that produces stable vectors without a model. Used throughout the test
//! suite and by the binary's `--offline` mode.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::content::{ContentProvider, ContentSnapshot, SourceFetchError};
use crate::embedder::{EmbeddingModel, ModelError};
use crate::hashing;
use crate::similarity;
use crate::types::Entity;

/// In-memory content provider with scriptable sources and failures
#[derive(Default)]
pub struct MemoryContentProvider {
    sources: RwLock<HashMap<(String, String), Vec<u8>>>,
    unavailable: RwLock<HashSet<(String, String)>>,
}

impl MemoryContentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(entity_id: &str, source_name: &str) -> (String, String) {
        (entity_id.to_string(), source_name.to_string())
    }

    /// Set (or replace) a source's content.
    pub fn set(&self, entity_id: &str, source_name: &str, bytes: &[u8]) {
        self.sources
            .write()
            .expect("provider lock")
            .insert(Self::key(entity_id, source_name), bytes.to_vec());
    }

    /// Remove a source entirely (the source disappeared).
    pub fn remove(&self, entity_id: &str, source_name: &str) {
        self.sources
            .write()
            .expect("provider lock")
            .remove(&Self::key(entity_id, source_name));
    }

    /// Make fetches of this source fail until cleared.
    pub fn set_unavailable(&self, entity_id: &str, source_name: &str) {
        self.unavailable
            .write()
            .expect("provider lock")
            .insert(Self::key(entity_id, source_name));
    }

    /// Clear a scripted failure.
    pub fn clear_unavailable(&self, entity_id: &str, source_name: &str) {
        self.unavailable
            .write()
            .expect("provider lock")
            .remove(&Self::key(entity_id, source_name));
    }
}

#[async_trait]
impl ContentProvider for MemoryContentProvider {
    async fn fetch(
        &self,
        entity: &Entity,
        source_name: &str,
    ) -> Result<Option<Vec<u8>>, SourceFetchError> {
        let key = Self::key(&entity.id, source_name);
        if self.unavailable.read().expect("provider lock").contains(&key) {
            return Err(SourceFetchError(format!(
                "scripted outage for {source_name}"
            )));
        }
        Ok(self.sources.read().expect("provider lock").get(&key).cloned())
    }
}

/// Deterministic embedder: vectors derived from a hash of (model_id, text).
///
/// Different text or a different model id produces a different unit vector,
/// which is exactly what the versioning paths need to observe.
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(32)
    }
}

#[async_trait]
impl EmbeddingModel for HashEmbedder {
    async fn embed(&self, text: &str, model_id: &str) -> Result<Vec<f32>, ModelError> {
        let mut values = Vec::with_capacity(self.dim);
        let mut counter: u64 = 0;
        while values.len() < self.dim {
            let mut hasher = Sha256::new();
            hasher.update(model_id.as_bytes());
            hasher.update([0]);
            hasher.update(text.as_bytes());
            hasher.update(counter.to_le_bytes());
            let digest = hasher.finalize();
            for chunk in digest.chunks_exact(4) {
                if values.len() == self.dim {
                    break;
                }
                let raw = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                // Map to [-1, 1].
                values.push((raw as f32 / u32::MAX as f32) * 2.0 - 1.0);
            }
            counter += 1;
        }
        Ok(similarity::normalize(values))
    }
}

/// Embedder that fails a scripted number of times before succeeding
pub struct FlakyEmbedder {
    inner: HashEmbedder,
    failures_remaining: AtomicU32,
}

impl FlakyEmbedder {
    pub fn new(failures: u32) -> Self {
        Self {
            inner: HashEmbedder::default(),
            failures_remaining: AtomicU32::new(failures),
        }
    }

    /// Attempts consumed so far is observable through the counter reaching 0.
    pub fn failures_remaining(&self) -> u32 {
        self.failures_remaining.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingModel for FlakyEmbedder {
    async fn embed(&self, text: &str, model_id: &str) -> Result<Vec<f32>, ModelError> {
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(ModelError("scripted model outage".into()));
        }
        self.inner.embed(text, model_id).await
    }
}

/// Minimal one-source snapshot for registry-level tests.
pub fn snapshot_for(content: &str) -> ContentSnapshot {
    let hash = hashing::content_hash(content.as_bytes());
    ContentSnapshot {
        source_hashes: vec![("README".to_string(), hash.clone())],
        combined_hash: hash,
        text: content.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hash_embedder_deterministic() {
        let embedder = HashEmbedder::new(16);
        let a = embedder.embed("some text", "m").await.unwrap();
        let b = embedder.embed("some text", "m").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);

        let norm = similarity::l2_norm(&a);
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_hash_embedder_sensitive_to_text_and_model() {
        let embedder = HashEmbedder::new(16);
        let base = embedder.embed("some text", "m").await.unwrap();
        let other_text = embedder.embed("other text", "m").await.unwrap();
        let other_model = embedder.embed("some text", "m2").await.unwrap();
        assert_ne!(base, other_text);
        assert_ne!(base, other_model);
    }

    #[tokio::test]
    async fn test_flaky_embedder_recovers() {
        let embedder = FlakyEmbedder::new(2);
        assert!(embedder.embed("t", "m").await.is_err());
        assert!(embedder.embed("t", "m").await.is_err());
        assert!(embedder.embed("t", "m").await.is_ok());
        assert_eq!(embedder.failures_remaining(), 0);
    }
}
