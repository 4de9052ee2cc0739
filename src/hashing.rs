//! Content hashing for change detection
//!
//! Hashes are SHA-256 hex digests truncated to 16 characters - long enough
//! to make collisions irrelevant at this corpus size, short enough to stay
//! readable in registry records and logs.

use sha2::{Digest, Sha256};

/// Truncated hash length for content hashes
const CONTENT_HASH_LEN: usize = 16;

/// Truncated hash length for citation identifiers
const CITATION_ID_LEN: usize = 8;

/// Marker hashed in place of a declared source that has disappeared.
///
/// A removed README is changed content, not "no change": the marker makes
/// the combined hash differ from every hash the source's bytes could produce.
pub const ABSENT_SOURCE_MARKER: &[u8] = b"\0__source_absent__\0";

/// Hash a single content source's raw bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(digest)[..CONTENT_HASH_LEN].to_string()
}

/// Hash a snapshot of all declared sources in declared order.
///
/// `parts` yields the raw bytes per source, with [`ABSENT_SOURCE_MARKER`]
/// substituted for missing sources. Order matters: the same contents under
/// a reordered source list is a different snapshot.
pub fn combined_hash<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hex::encode(hasher.finalize())[..CONTENT_HASH_LEN].to_string()
}

/// Derive a citation's stable entity id from its title and abstract.
pub fn citation_id(title: &str, abstract_text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update(abstract_text.as_bytes());
    hex::encode(hasher.finalize())[..CITATION_ID_LEN].to_string()
}
