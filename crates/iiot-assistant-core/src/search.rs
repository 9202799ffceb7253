//! Top-K retrieval with a relevance floor.
//!
//! [`retrieve`] embeds the query through an [`Embedder`], asks the
//! [`KnowledgeStore`] for candidates, and keeps at most `top_k` of those
//! scoring at or above `min_relevance`. Results are sorted by descending
//! similarity. An empty result is not an error.

use anyhow::Result;

use crate::embedding::Embedder;
use crate::store::{KnowledgeStore, ScoredChunk};

/// Retrieval tuning, decoupled from application config.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrievalParams {
    pub top_k: usize,
    pub min_relevance: f32,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self {
            top_k: 3,
            min_relevance: 0.15,
        }
    }
}

/// Retrieve the chunks most relevant to `query`.
pub async fn retrieve(
    store: &dyn KnowledgeStore,
    embedder: &dyn Embedder,
    query: &str,
    params: RetrievalParams,
) -> Result<Vec<ScoredChunk>> {
    if query.trim().is_empty() || params.top_k == 0 {
        return Ok(Vec::new());
    }
    if store.is_empty().await? {
        return Ok(Vec::new());
    }

    let query_vec = embedder.embed_one(query).await?;
    let candidates = store.vector_search(&query_vec, params.top_k).await?;
    Ok(apply_floor(candidates, params))
}

/// Enforce ordering, the floor, and the `top_k` bound on a candidate list.
pub fn apply_floor(mut candidates: Vec<ScoredChunk>, params: RetrievalParams) -> Vec<ScoredChunk> {
    candidates.retain(|c| c.score >= params.min_relevance);
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates.truncate(params.top_k);
    candidates
}

/// Render retrieved chunks as a labeled reference block.
///
/// Each chunk is prefixed with its provenance so the model can cite it.
pub fn format_reference_context(chunks: &[ScoredChunk]) -> String {
    chunks
        .iter()
        .map(|c| format!("[{}] {}", c.chunk.source_description, c.chunk.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}
