//! Line-boundary text chunker.
//!
//! Splits extracted document text into chunks bounded by `max_chars`
//! characters (Unicode scalar values, not bytes; most manuals in this
//! deployment are CJK). Splitting happens on line boundaries so that table
//! rows and numbered procedure steps stay intact.
//!
//! # Algorithm
//!
//! 1. Split on `\n` (a trailing `\r` is dropped) and discard blank lines.
//! 2. Accumulate lines into a buffer, joined with `\n`.
//! 3. When adding the next line would exceed `max_chars` and the buffer is
//!    non-empty, flush the buffer as a chunk and start a new one.
//! 4. A single line longer than `max_chars` becomes its own oversized chunk.
//!    It is never truncated.
//!
//! # Example
//!
//! ```rust
//! use iiot_assistant_core::chunk::split_into_chunks;
//!
//! let chunks = split_into_chunks("Pump start-up.\nCheck valve V1.", 500);
//! assert_eq!(chunks, vec!["Pump start-up.\nCheck valve V1.".to_string()]);
//! ```

use crate::models::KnowledgeChunk;

/// Default chunk bound used by ingestion.
pub const DEFAULT_MAX_CHUNK_CHARS: usize = 500;

/// Split `text` into trimmed chunks of at most `max_chars` characters.
///
/// Returns an empty vector for blank input. A `max_chars` of zero is
/// treated as one so that every line becomes its own chunk.
pub fn split_into_chunks(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for line in text.split('\n') {
        let line = line.trim_end_matches('\r').trim();
        if line.is_empty() {
            continue;
        }
        let line_len = line.chars().count();
        let joined_len = if current.is_empty() {
            line_len
        } else {
            current_len + 1 + line_len
        };

        if joined_len > max_chars && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }

        if current.is_empty() {
            current.push_str(line);
            current_len = line_len;
        } else {
            current.push('\n');
            current.push_str(line);
            current_len += 1 + line_len;
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

/// Monotonic `doc_chunk_{n}` id generator, starting at 1.
///
/// One sequence is used per ingestion run so ids are unique across every
/// file in the run.
#[derive(Debug, Default)]
pub struct ChunkSequence {
    issued: u64,
}

impl ChunkSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> String {
        self.issued += 1;
        format!("doc_chunk_{}", self.issued)
    }

    /// Number of ids issued so far.
    pub fn issued(&self) -> u64 {
        self.issued
    }

    /// Chunk `text` and assign ids, tagging every chunk with `source`.
    pub fn chunk_document(
        &mut self,
        source: &str,
        text: &str,
        max_chars: usize,
    ) -> Vec<KnowledgeChunk> {
        split_into_chunks(text, max_chars)
            .into_iter()
            .map(|text| KnowledgeChunk {
                id: self.next_id(),
                text,
                source_description: source.to_string(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = split_into_chunks("Hello, world!", 500);
        assert_eq!(chunks, vec!["Hello, world!".to_string()]);
    }

    #[test]
    fn test_empty_text() {
        assert!(split_into_chunks("", 500).is_empty());
        assert!(split_into_chunks("\r\n\n   \n", 500).is_empty());
    }

    #[test]
    fn test_crlf_lines_joined() {
        let chunks = split_into_chunks("line one\r\nline two\r\n", 500);
        assert_eq!(chunks, vec!["line one\nline two".to_string()]);
    }

    #[test]
    fn test_lines_exceed_limit() {
        let text = "aaaa\nbbbb\ncccc";
        let chunks = split_into_chunks(text, 9);
        assert_eq!(chunks, vec!["aaaa\nbbbb".to_string(), "cccc".to_string()]);
    }

    #[test]
    fn test_bound_respected_except_oversized_line() {
        let long = "x".repeat(40);
        let text = format!("short one\n{long}\nshort two\nshort three");
        let chunks = split_into_chunks(&text, 20);
        for c in &chunks {
            if c.contains('\n') {
                assert!(c.chars().count() <= 20, "multi-line chunk over bound: {c:?}");
            }
        }
        assert!(chunks.contains(&long), "oversized line kept whole");
    }

    #[test]
    fn test_counts_characters_not_bytes() {
        // Each line is 4 chars but 12 bytes.
        let text = "设备温度\n振动数据";
        let chunks = split_into_chunks(text, 9);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn test_sequence_ids_monotonic_across_documents() {
        let mut seq = ChunkSequence::new();
        let a = seq.chunk_document("a.txt", "one\ntwo", 3);
        let b = seq.chunk_document("b.md", "three", 500);
        let ids: Vec<_> = a.iter().chain(b.iter()).map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["doc_chunk_1", "doc_chunk_2", "doc_chunk_3"]);
        assert_eq!(b[0].source_description, "b.md");
        assert_eq!(seq.issued(), 3);
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha\nBeta\nGamma\nDelta";
        assert_eq!(split_into_chunks(text, 8), split_into_chunks(text, 8));
    }
}
