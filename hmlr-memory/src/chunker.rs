//! Hierarchical turn chunking
//!
//! Purely local and deterministic: a turn chunk covering the full text,
//! paragraph chunks split on blank lines, and sentence chunks split on
//! `.`, `!` or `?` followed by whitespace. Chunk ids incorporate their
//! parent id, so `turn_x_p1_s2` is the third sentence of the second
//! paragraph.

use hmlr_core::types::{Chunk, ChunkType};

/// Approximate token count: `ceil(len / 4)`
#[must_use]
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Deterministic turn → paragraph → sentence chunker
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkEngine;

impl ChunkEngine {
    /// Create a chunk engine
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Chunk a turn's text into the three-level hierarchy
    ///
    /// The turn chunk always comes first, each paragraph before its
    /// sentences.
    #[must_use]
    pub fn chunk_turn(&self, text: &str, turn_id: &str, span_id: Option<&str>) -> Vec<Chunk> {
        let turn_chunk_id = format!("{turn_id}_turn");
        let mut chunks = vec![Chunk {
            chunk_id: turn_chunk_id.clone(),
            turn_id: turn_id.to_string(),
            span_id: span_id.map(str::to_string),
            chunk_type: ChunkType::Turn,
            parent_chunk_id: None,
            text_verbatim: text.to_string(),
            token_count: estimate_tokens(text),
        }];

        for (p_index, paragraph) in split_paragraphs(text).into_iter().enumerate() {
            let paragraph_id = format!("{turn_id}_p{p_index}");
            chunks.push(Chunk {
                chunk_id: paragraph_id.clone(),
                turn_id: turn_id.to_string(),
                span_id: span_id.map(str::to_string),
                chunk_type: ChunkType::Paragraph,
                parent_chunk_id: Some(turn_chunk_id.clone()),
                text_verbatim: paragraph.clone(),
                token_count: estimate_tokens(&paragraph),
            });

            for (s_index, sentence) in split_sentences(&paragraph).into_iter().enumerate() {
                chunks.push(Chunk {
                    chunk_id: format!("{paragraph_id}_s{s_index}"),
                    turn_id: turn_id.to_string(),
                    span_id: span_id.map(str::to_string),
                    chunk_type: ChunkType::Sentence,
                    parent_chunk_id: Some(paragraph_id.clone()),
                    text_verbatim: sentence.clone(),
                    token_count: estimate_tokens(&sentence),
                });
            }
        }

        chunks
    }
}

/// Split on blank lines; empty paragraphs are dropped
fn split_paragraphs(text: &str) -> Vec<String> {
    text.split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// Split on `.`, `!`, `?` followed by whitespace
///
/// The terminator stays attached to its sentence.
pub(crate) fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let bytes = text.as_bytes();

    let mut i = 0;
    while i < bytes.len() {
        if matches!(bytes[i], b'.' | b'!' | b'?') {
            let after = i + 1;
            if after >= bytes.len() || bytes[after].is_ascii_whitespace() {
                let sentence = text[start..after].trim();
                if !sentence.is_empty() {
                    sentences.push(sentence.to_string());
                }
                start = after;
            }
        }
        i += 1;
    }

    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }

    sentences
}
