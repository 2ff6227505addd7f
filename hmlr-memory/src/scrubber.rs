//! LLM-driven fact extraction ("the Scrubber")
//!
//! Only user text is ever scrubbed; assistant responses are not a source
//! of truth. Large inputs are split into overlapping content windows so no
//! single LLM call exceeds the window budget, and facts extracted from the
//! overlap are deduplicated by `(key, value)` equality.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, warn};

use hmlr_core::ids::next_id;
use hmlr_core::types::{Chunk, ChunkType, Fact};
use hmlr_core::{LlmClient, Result};
use hmlr_storage::FactStore;

use crate::chunker::estimate_tokens;
use crate::prompts;

/// Raw fact shape the LLM is asked to produce
#[derive(Debug, Deserialize)]
struct RawFact {
    key: String,
    value: String,
    #[serde(default = "default_category")]
    category: String,
}

fn default_category() -> String {
    "general".to_string()
}

/// Windowed LLM fact extractor
pub struct FactScrubber {
    llm: Arc<dyn LlmClient>,
    facts: FactStore,
    window_tokens: usize,
    overlap_tokens: usize,
}

impl FactScrubber {
    /// Create a scrubber over the nano model and the fact store
    #[must_use]
    pub fn new(
        llm: Arc<dyn LlmClient>,
        facts: FactStore,
        window_tokens: usize,
        overlap_tokens: usize,
    ) -> Self {
        Self {
            llm,
            facts,
            window_tokens,
            overlap_tokens,
        }
    }

    /// Extract facts from a user message and persist them atomically
    ///
    /// `block_id` may be `None`; the engine back-fills it once the
    /// Governor has routed the turn. Extraction failures degrade to an
    /// empty fact list; persistence failures propagate.
    ///
    /// # Errors
    ///
    /// Returns [`hmlr_core::HmlrError::StorageWrite`] if the batch insert
    /// fails.
    pub async fn extract_and_save(
        &self,
        turn_id: &str,
        user_text: &str,
        chunks: &[Chunk],
        block_id: Option<&str>,
    ) -> Result<Vec<Fact>> {
        let windows = split_windows(user_text, self.window_tokens, self.overlap_tokens);
        debug!(
            "Scrubbing turn {turn_id}: {} window(s), ~{} tokens",
            windows.len(),
            estimate_tokens(user_text)
        );

        let mut raw_facts: Vec<RawFact> = Vec::new();
        for window in &windows {
            for raw in self.extract_window(window).await {
                let duplicate = raw_facts
                    .iter()
                    .any(|f| f.key == raw.key && f.value == raw.value);
                if !duplicate {
                    raw_facts.push(raw);
                }
            }
        }

        let now = Utc::now();
        let facts: Vec<Fact> = raw_facts
            .into_iter()
            .map(|raw| {
                let source_chunk_id = link_to_chunk(&raw.value, chunks, turn_id);
                Fact {
                    fact_id: next_id("fact"),
                    key: raw.key,
                    value: raw.value,
                    category: raw.category,
                    turn_id: turn_id.to_string(),
                    source_chunk_id,
                    source_block_id: block_id.map(str::to_string),
                    created_at: now,
                }
            })
            .collect();

        self.facts.insert_facts(&facts).await?;
        debug!("Scrubbed {} facts from turn {turn_id}", facts.len());
        Ok(facts)
    }

    /// One window: normal prompt, then a single strict retry
    async fn extract_window(&self, window: &str) -> Vec<RawFact> {
        match self.llm.complete(&prompts::scrub_prompt(window)).await {
            Ok(response) => {
                if let Some(facts) = parse_fact_array(&response) {
                    return facts;
                }
                debug!("Scrubber response unparseable, retrying with strict prompt");
            }
            Err(e) => {
                warn!("Scrubber LLM call failed: {e}");
                return Vec::new();
            }
        }

        match self
            .llm
            .complete(&prompts::scrub_prompt_strict(window))
            .await
        {
            Ok(response) => parse_fact_array(&response).unwrap_or_else(|| {
                warn!("Scrubber retry still unparseable; extracting no facts");
                Vec::new()
            }),
            Err(e) => {
                warn!("Scrubber retry failed: {e}");
                Vec::new()
            }
        }
    }
}

/// Extract the first JSON array from a response that may carry prose or
/// code fences around it
fn parse_fact_array(response: &str) -> Option<Vec<RawFact>> {
    let start = response.find('[')?;
    let end = response.rfind(']')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&response[start..=end]).ok()
}

/// Split text into content windows of at most `window_tokens` tokens with
/// `overlap_tokens` of overlap, preferring a sentence boundary within 500
/// characters of the target cut
#[must_use]
pub fn split_windows(text: &str, window_tokens: usize, overlap_tokens: usize) -> Vec<String> {
    if estimate_tokens(text) <= window_tokens {
        return vec![text.to_string()];
    }

    let window_chars = window_tokens * 4;
    let overlap_chars = overlap_tokens * 4;
    let mut windows = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let target_end = floor_char_boundary(text, (start + window_chars).min(text.len()));
        let end = if target_end == text.len() {
            target_end
        } else {
            sentence_boundary_before(text, target_end, 500).unwrap_or(target_end)
        };

        windows.push(text[start..end].to_string());
        if end == text.len() {
            break;
        }

        // Step forward keeping the overlap; guard against stalling on
        // pathological boundary placement.
        let next = floor_char_boundary(text, end.saturating_sub(overlap_chars));
        start = if next > start { next } else { end };
    }

    windows
}

/// Largest char boundary at or below `index`
fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Nearest sentence terminator at or before `target`, looking back at most
/// `lookback` characters; returns the index just past the terminator
fn sentence_boundary_before(text: &str, target: usize, lookback: usize) -> Option<usize> {
    let floor = target.saturating_sub(lookback);
    let bytes = text.as_bytes();
    let mut i = target.min(bytes.len());

    while i > floor {
        i -= 1;
        if matches!(bytes[i], b'.' | b'!' | b'?') {
            let after = i + 1;
            if after >= bytes.len() || bytes[after].is_ascii_whitespace() {
                return Some(after);
            }
        }
    }
    None
}

/// Link a fact value to the sentence chunk that best contains it
///
/// Best is the longest common substring, ties broken by the earliest match
/// position; when nothing matches, the turn chunk is used.
fn link_to_chunk(value: &str, chunks: &[Chunk], turn_id: &str) -> String {
    let value_lower = value.to_lowercase();
    let mut best: Option<(usize, usize, &str)> = None; // (lcs_len, position, chunk_id)

    for chunk in chunks
        .iter()
        .filter(|c| c.chunk_type == ChunkType::Sentence)
    {
        let (len, position) = longest_common_substring(&value_lower, &chunk.text_verbatim.to_lowercase());
        if len == 0 {
            continue;
        }
        let better = match best {
            None => true,
            Some((best_len, best_pos, _)) => {
                len > best_len || (len == best_len && position < best_pos)
            }
        };
        if better {
            best = Some((len, position, &chunk.chunk_id));
        }
    }

    best.map_or_else(
        || {
            chunks
                .iter()
                .find(|c| c.chunk_type == ChunkType::Turn)
                .map_or_else(|| format!("{turn_id}_turn"), |c| c.chunk_id.clone())
        },
        |(_, _, chunk_id)| chunk_id.to_string(),
    )
}

/// Length and earliest start position (in `haystack`) of the longest
/// common substring
fn longest_common_substring(needle: &str, haystack: &str) -> (usize, usize) {
    let n: Vec<char> = needle.chars().collect();
    let h: Vec<char> = haystack.chars().collect();
    if n.is_empty() || h.is_empty() {
        return (0, 0);
    }

    let mut best_len = 0;
    let mut best_pos = 0;
    let mut prev = vec![0_usize; h.len() + 1];

    for &nc in &n {
        let mut current = vec![0_usize; h.len() + 1];
        for (j, &hc) in h.iter().enumerate() {
            if nc == hc {
                current[j + 1] = prev[j] + 1;
                let len = current[j + 1];
                let pos = j + 1 - len;
                if len > best_len || (len == best_len && pos < best_pos) {
                    best_len = len;
                    best_pos = pos;
                }
            }
        }
        prev = current;
    }

    (best_len, best_pos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::ChunkEngine;
    use async_trait::async_trait;
    use hmlr_core::HmlrError;
    use hmlr_storage::SqliteBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedLlm {
        responses: Vec<String>,
        cursor: AtomicUsize,
    }

    impl ScriptedLlm {
        fn new(responses: Vec<&str>) -> Self {
            Self {
                responses: responses.into_iter().map(str::to_string).collect(),
                cursor: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, _prompt: &str) -> Result<String> {
            let i = self.cursor.fetch_add(1, Ordering::SeqCst);
            self.responses
                .get(i)
                .cloned()
                .ok_or_else(|| HmlrError::ApiConnection("script exhausted".into()))
        }
    }

    async fn fact_store() -> (SqliteBackend, FactStore) {
        let backend = SqliteBackend::open_in_memory().await.unwrap();
        let store = FactStore::new(backend.connection());
        (backend, store)
    }

    #[tokio::test]
    async fn test_extracts_and_links_to_sentence_chunk() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            r#"[{"key": "diet", "value": "strictly vegetarian", "category": "constraint"}]"#,
        ]));
        let (_backend, facts) = fact_store().await;
        let scrubber = FactScrubber::new(llm, facts, 10_000, 500);

        let text = "I am strictly vegetarian. I don't eat meat or fish.";
        let chunks = ChunkEngine::new().chunk_turn(text, "turn_1", None);

        let facts = scrubber
            .extract_and_save("turn_1", text, &chunks, None)
            .await
            .unwrap();

        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].key, "diet");
        assert_eq!(facts[0].category, "constraint");
        // "strictly vegetarian" lives in the first sentence
        assert_eq!(facts[0].source_chunk_id, "turn_1_p0_s0");
        assert!(facts[0].source_block_id.is_none());
    }

    #[tokio::test]
    async fn test_strict_retry_recovers_from_prose() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            "Sure! Here are the facts I found: none in JSON I'm afraid",
            r#"[{"key": "city", "value": "Lisbon"}]"#,
        ]));
        let (_backend, facts) = fact_store().await;
        let scrubber = FactScrubber::new(llm, facts, 10_000, 500);
        let chunks = ChunkEngine::new().chunk_turn("I live in Lisbon.", "turn_1", None);

        let facts = scrubber
            .extract_and_save("turn_1", "I live in Lisbon.", &chunks, None)
            .await
            .unwrap();

        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].category, "general");
    }

    #[tokio::test]
    async fn test_repeated_failure_yields_empty_not_error() {
        let llm = Arc::new(ScriptedLlm::new(vec!["not json", "still not json"]));
        let (_backend, facts) = fact_store().await;
        let scrubber = FactScrubber::new(llm, facts, 10_000, 500);
        let chunks = ChunkEngine::new().chunk_turn("Hello.", "turn_1", None);

        let facts = scrubber
            .extract_and_save("turn_1", "Hello.", &chunks, None)
            .await
            .unwrap();
        assert!(facts.is_empty());
    }

    #[tokio::test]
    async fn test_overlap_facts_deduplicated() {
        // Two windows, each reporting the same fact
        let fact_json = r#"[{"key": "diet", "value": "vegetarian", "category": "constraint"}]"#;
        let llm = Arc::new(ScriptedLlm::new(vec![fact_json, fact_json]));
        // Tiny window budget forces two windows
        let (_backend, facts) = fact_store().await;
        let scrubber = FactScrubber::new(llm, facts, 10, 2);

        let text = "I am vegetarian. I cook at home. I like beans. I avoid meat entirely.";
        let chunks = ChunkEngine::new().chunk_turn(text, "turn_1", None);

        let facts = scrubber
            .extract_and_save("turn_1", text, &chunks, None)
            .await
            .unwrap();
        assert_eq!(facts.len(), 1);
    }

    #[test]
    fn test_single_window_under_budget() {
        let windows = split_windows("short text", 10_000, 500);
        assert_eq!(windows.len(), 1);
    }

    #[test]
    fn test_two_windows_with_sentence_boundary_overlap() {
        // ~15k tokens => ~60k chars of short sentences
        let sentence = "The quick brown fox jumps over the lazy dog near the river today. ";
        let text = sentence.repeat(60_000 / sentence.len() + 1);
        assert!(estimate_tokens(&text) > 10_000);
        assert!(estimate_tokens(&text) < 20_000);

        let windows = split_windows(&text, 10_000, 500);
        assert_eq!(windows.len(), 2);

        for window in &windows {
            assert!(estimate_tokens(window) <= 10_000);
        }

        // First window ends on a sentence boundary
        let first = windows[0].trim_end();
        assert!(first.ends_with('.'));

        // Overlap of at least 500 tokens (2000 chars)
        let first_end = windows[0].len();
        let second_start = text.len() - windows[1].len();
        assert!(first_end - second_start >= 500 * 4);
    }

    #[test]
    fn test_longest_common_substring_positions() {
        let (len, pos) = longest_common_substring("vegetarian", "i am strictly vegetarian today");
        assert_eq!(len, "vegetarian".len());
        assert_eq!(pos, "i am strictly ".len());

        let (len, _) = longest_common_substring("xyz", "abc");
        assert_eq!(len, 0);
    }

    #[test]
    fn test_link_falls_back_to_turn_chunk() {
        let chunks = ChunkEngine::new().chunk_turn("Nothing relevant here.", "turn_9", None);
        // A value sharing no characters with the text beyond trivia
        let chunk_id = link_to_chunk("0123456789", &chunks, "turn_9");
        assert_eq!(chunk_id, "turn_9_turn");
    }
}
