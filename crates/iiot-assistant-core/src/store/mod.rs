//! Knowledge store abstraction.
//!
//! The [`KnowledgeStore`] trait covers what ingestion and retrieval need
//! from an index: append, wholesale replace, size, and vector search.
//! Implementations must be `Send + Sync` and must never expose a partially
//! applied write to a concurrent reader.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::models::KnowledgeChunk;

/// A chunk together with its embedding vector.
#[derive(Debug, Clone)]
pub struct IndexedChunk {
    pub chunk: KnowledgeChunk,
    pub vector: Vec<f32>,
}

/// A chunk returned from vector search with its cosine similarity.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    pub chunk: KnowledgeChunk,
    pub score: f32,
}

/// Abstract retrieval index.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`append`](KnowledgeStore::append) | Add chunks; visible to readers once the call returns |
/// | [`replace_all`](KnowledgeStore::replace_all) | Swap the whole chunk set in one step |
/// | [`len`](KnowledgeStore::len) | Number of indexed chunks |
/// | [`vector_search`](KnowledgeStore::vector_search) | Candidates by cosine similarity, best first |
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    async fn append(&self, entries: Vec<IndexedChunk>) -> Result<()>;

    async fn replace_all(&self, entries: Vec<IndexedChunk>) -> Result<()>;

    async fn len(&self) -> Result<usize>;

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Return up to `limit` candidates sorted by descending similarity.
    /// Equal scores keep insertion order.
    async fn vector_search(&self, query_vec: &[f32], limit: usize) -> Result<Vec<ScoredChunk>>;
}
