//! Knowledge ingestion pipeline.
//!
//! Walks the knowledge root in sorted order, extracts text per file type,
//! chunks it, embeds the chunks in batches and writes them to the index:
//!
//! ```text
//! walk → classify → extract → chunk → embed (batched) → store
//! ```
//!
//! Per-file failures (unreadable, corrupt, embedding error) are logged and
//! counted; they never abort the run. Two write strategies exist:
//! [`IngestStrategy::Append`] makes each file searchable as soon as it is
//! embedded (startup), [`IngestStrategy::Replace`] builds a complete new
//! set and swaps it in at the end (reload).

use std::path::{Path, PathBuf};

use anyhow::Result;
use globset::GlobSet;
use iiot_assistant_core::chunk::ChunkSequence;
use iiot_assistant_core::embedding::Embedder;
use iiot_assistant_core::models::KnowledgeChunk;
use iiot_assistant_core::store::{IndexedChunk, KnowledgeStore};
use serde::Serialize;
use walkdir::WalkDir;

use crate::config::KnowledgeConfig;
use crate::extract::{extract_file, DocumentKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStrategy {
    Append,
    Replace,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub files_seen: usize,
    pub files_ingested: usize,
    pub files_skipped: usize,
    pub files_failed: usize,
    pub chunks: usize,
}

/// A file selected for extraction.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: PathBuf,
    /// Provenance label stored on every chunk: the file name.
    pub source: String,
    pub kind: DocumentKind,
}

/// Result of walking the knowledge root.
#[derive(Debug, Default)]
pub struct Discovery {
    pub files: Vec<SourceFile>,
    pub seen: usize,
    pub skipped: usize,
}

/// Enumerate candidate files under `config.root` in sorted path order.
pub fn discover(config: &KnowledgeConfig) -> Result<Discovery> {
    let mut discovery = Discovery::default();
    let root = &config.root;
    if !root.is_dir() {
        tracing::warn!(root = %root.display(), "knowledge root does not exist, nothing to ingest");
        return Ok(discovery);
    }
    let excludes = config.exclude_set()?;

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable directory entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if is_excluded(&excludes, root, path) {
            continue;
        }
        discovery.seen += 1;

        let Some(kind) = DocumentKind::from_path(path) else {
            tracing::debug!(path = %path.display(), "not a knowledge document");
            discovery.skipped += 1;
            continue;
        };
        if kind == DocumentKind::Image {
            tracing::warn!(path = %path.display(), "image files are not ingested (no OCR)");
            discovery.skipped += 1;
            continue;
        }
        match entry.metadata() {
            Ok(meta) if meta.len() > config.max_file_bytes => {
                tracing::warn!(
                    path = %path.display(),
                    bytes = meta.len(),
                    limit = config.max_file_bytes,
                    "file exceeds max_file_bytes, skipped"
                );
                discovery.skipped += 1;
                continue;
            }
            _ => {}
        }

        let source = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        discovery.files.push(SourceFile {
            path: path.to_path_buf(),
            source,
            kind,
        });
    }
    Ok(discovery)
}

fn is_excluded(excludes: &GlobSet, root: &Path, path: &Path) -> bool {
    let relative = path.strip_prefix(root).unwrap_or(path);
    excludes.is_match(relative)
}

async fn extract(file: &SourceFile) -> Result<String> {
    let path = file.path.clone();
    let kind = file.kind;
    let text = tokio::task::spawn_blocking(move || extract_file(&path, kind)).await??;
    Ok(text)
}

async fn embed_chunks(
    embedder: &dyn Embedder,
    chunks: Vec<KnowledgeChunk>,
    batch_size: usize,
) -> Result<Vec<IndexedChunk>> {
    let mut indexed = Vec::with_capacity(chunks.len());
    let mut pending = chunks.into_iter().peekable();
    while pending.peek().is_some() {
        let batch: Vec<KnowledgeChunk> = pending.by_ref().take(batch_size.max(1)).collect();
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        let vectors = embedder.embed(&texts).await?;
        indexed.extend(
            batch
                .into_iter()
                .zip(vectors)
                .map(|(chunk, vector)| IndexedChunk { chunk, vector }),
        );
    }
    Ok(indexed)
}

/// Run one ingestion pass over the knowledge root.
pub async fn run_ingest(
    config: &KnowledgeConfig,
    embedder: &dyn Embedder,
    batch_size: usize,
    store: &dyn KnowledgeStore,
    strategy: IngestStrategy,
) -> Result<IngestReport> {
    let discovery = discover(config)?;
    let mut report = IngestReport {
        files_seen: discovery.seen,
        files_skipped: discovery.skipped,
        ..IngestReport::default()
    };
    let mut sequence = ChunkSequence::new();
    let mut replacement = Vec::new();

    for file in &discovery.files {
        let text = match extract(file).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(path = %file.path.display(), error = %e, "extraction failed, file skipped");
                report.files_failed += 1;
                continue;
            }
        };

        let chunks = sequence.chunk_document(&file.source, &text, config.max_chunk_chars);
        if chunks.is_empty() {
            tracing::debug!(path = %file.path.display(), "no text extracted");
            report.files_skipped += 1;
            continue;
        }
        let count = chunks.len();

        let indexed = match embed_chunks(embedder, chunks, batch_size).await {
            Ok(indexed) => indexed,
            Err(e) => {
                tracing::warn!(path = %file.path.display(), error = %e, "embedding failed, file skipped");
                report.files_failed += 1;
                continue;
            }
        };

        match strategy {
            IngestStrategy::Append => store.append(indexed).await?,
            IngestStrategy::Replace => replacement.extend(indexed),
        }
        report.files_ingested += 1;
        report.chunks += count;
        tracing::info!(source = %file.source, chunks = count, "ingested");
    }

    if strategy == IngestStrategy::Replace {
        store.replace_all(replacement).await?;
    }

    tracing::info!(
        files_seen = report.files_seen,
        files_ingested = report.files_ingested,
        files_skipped = report.files_skipped,
        files_failed = report.files_failed,
        chunks = report.chunks,
        ?strategy,
        "ingestion finished"
    );
    Ok(report)
}

/// Extract and chunk without embedding or writing anything.
pub async fn dry_run(config: &KnowledgeConfig) -> Result<IngestReport> {
    let discovery = discover(config)?;
    let mut report = IngestReport {
        files_seen: discovery.seen,
        files_skipped: discovery.skipped,
        ..IngestReport::default()
    };
    let mut sequence = ChunkSequence::new();
    for file in &discovery.files {
        match extract(file).await {
            Ok(text) => {
                let chunks = sequence.chunk_document(&file.source, &text, config.max_chunk_chars);
                if chunks.is_empty() {
                    report.files_skipped += 1;
                } else {
                    report.files_ingested += 1;
                    report.chunks += chunks.len();
                }
            }
            Err(e) => {
                tracing::warn!(path = %file.path.display(), error = %e, "extraction failed");
                report.files_failed += 1;
            }
        }
    }
    Ok(report)
}
