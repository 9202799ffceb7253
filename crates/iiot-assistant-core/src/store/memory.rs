//! In-memory [`KnowledgeStore`].
//!
//! A `Vec` behind `std::sync::RwLock`. Appends extend the vector under the
//! write lock; replacement swaps in a fully built vector, so a reader sees
//! either the old set or the new one. Vector search is brute-force cosine
//! similarity, which is fine for the few thousand chunks a plant's manuals
//! produce.

use std::sync::{PoisonError, RwLock};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::embedding::cosine_similarity;

use super::{IndexedChunk, KnowledgeStore, ScoredChunk};

#[derive(Default)]
pub struct InMemoryIndex {
    entries: RwLock<Vec<IndexedChunk>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: PoisonError<T>) -> anyhow::Error {
    anyhow!("knowledge index lock poisoned")
}

#[async_trait]
impl KnowledgeStore for InMemoryIndex {
    async fn append(&self, entries: Vec<IndexedChunk>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.entries.write().map_err(poisoned)?.extend(entries);
        Ok(())
    }

    async fn replace_all(&self, entries: Vec<IndexedChunk>) -> Result<()> {
        *self.entries.write().map_err(poisoned)? = entries;
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.entries.read().map_err(poisoned)?.len())
    }

    async fn vector_search(&self, query_vec: &[f32], limit: usize) -> Result<Vec<ScoredChunk>> {
        let entries = self.entries.read().map_err(poisoned)?;
        let mut scored: Vec<ScoredChunk> = entries
            .iter()
            .map(|e| ScoredChunk {
                chunk: e.chunk.clone(),
                score: cosine_similarity(query_vec, &e.vector),
            })
            .collect();
        drop(entries);

        // sort_by is stable, so ties keep insertion order
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(limit);
        Ok(scored)
    }
}
