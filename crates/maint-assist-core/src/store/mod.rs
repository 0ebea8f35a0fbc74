//! Knowledge store abstraction.
//!
//! The [`KnowledgeStore`] trait defines the nearest-neighbor store that the
//! query worker reads from and the lifecycle indexer writes to, enabling
//! pluggable backends (SQLite, in-memory).
//!
//! Unavailability is a capability check, not an error path: callers test
//! [`KnowledgeStore::is_available`] first and degrade (empty results,
//! `false` returns) instead of propagating failures.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use async_trait::async_trait;

use crate::error::AdapterError;
use crate::models::{KnowledgeDocument, MetadataFilter, Neighbor};

/// Abstract nearest-neighbor store for embedded documents.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](KnowledgeStore::upsert) | Insert or atomically replace a document |
/// | [`delete`](KnowledgeStore::delete) | Remove a document by id |
/// | [`contains`](KnowledgeStore::contains) | Test whether an id is stored |
/// | [`query`](KnowledgeStore::query) | Nearest neighbors, ascending distance |
/// | [`count`](KnowledgeStore::count) | Count documents matching a filter |
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Whether the store was initialized and can serve requests.
    fn is_available(&self) -> bool;

    /// Insert a document, or replace vector, text, and metadata of an
    /// existing one in a single step.
    async fn upsert(&self, doc: &KnowledgeDocument) -> Result<(), AdapterError>;

    /// Delete a document. Returns `true` if it existed.
    async fn delete(&self, id: &str) -> Result<bool, AdapterError>;

    /// Whether a document with this id is stored.
    async fn contains(&self, id: &str) -> Result<bool, AdapterError>;

    /// Return up to `k` nearest documents in ascending cosine distance.
    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<Neighbor>, AdapterError>;

    /// Count documents, optionally restricted by a metadata filter.
    async fn count(&self, filter: Option<&MetadataFilter>) -> Result<u64, AdapterError>;
}

/// Sort neighbors by ascending distance and keep the first `k`.
///
/// Ties keep their relative order.
pub fn rank_neighbors(mut neighbors: Vec<Neighbor>, k: usize) -> Vec<Neighbor> {
    neighbors.sort_by(|a, b| {
        a.distance
            .partial_cmp(&b.distance)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    neighbors.truncate(k);
    neighbors
}

/// A store that is never available.
///
/// Stands in when the configured backend failed to initialize.
pub struct UnavailableStore;

#[async_trait]
impl KnowledgeStore for UnavailableStore {
    fn is_available(&self) -> bool {
        false
    }

    async fn upsert(&self, _doc: &KnowledgeDocument) -> Result<(), AdapterError> {
        Err(AdapterError::unavailable("knowledge store not initialized"))
    }

    async fn delete(&self, _id: &str) -> Result<bool, AdapterError> {
        Err(AdapterError::unavailable("knowledge store not initialized"))
    }

    async fn contains(&self, _id: &str) -> Result<bool, AdapterError> {
        Err(AdapterError::unavailable("knowledge store not initialized"))
    }

    async fn query(
        &self,
        _vector: &[f32],
        _k: usize,
        _filter: Option<&MetadataFilter>,
    ) -> Result<Vec<Neighbor>, AdapterError> {
        Err(AdapterError::unavailable("knowledge store not initialized"))
    }

    async fn count(&self, _filter: Option<&MetadataFilter>) -> Result<u64, AdapterError> {
        Err(AdapterError::unavailable("knowledge store not initialized"))
    }
}
