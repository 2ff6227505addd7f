//! Large-text windowing: a ~15k-token document splits into exactly two
//! content windows with a sentence-boundary overlap and bounded overhead

mod common;

use std::sync::Arc;

use common::{build_engine, TestLlm};
use hmlr_memory::chunker::estimate_tokens;
use hmlr_memory::scrubber::split_windows;

/// ~15,000 tokens of varied sentences
fn large_document() -> String {
    let sentences = [
        "The migration plan covers the storage layer first and the retrieval layer second. ",
        "Every fact extracted from the archive must keep its original provenance intact. ",
        "We measured the ingest pipeline at roughly forty documents per second on commodity hardware. ",
        "The review flagged three places where the chunk boundaries could drift under load. ",
    ];

    let mut text = String::new();
    let mut i = 0;
    while estimate_tokens(&text) < 15_000 {
        text.push_str(sentences[i % sentences.len()]);
        i += 1;
    }
    text
}

#[test]
fn test_two_windows_bounded_overlap_and_overhead() {
    let text = large_document();
    let total_tokens = estimate_tokens(&text);
    assert!(total_tokens >= 15_000 && total_tokens < 20_000);

    let windows = split_windows(&text, 10_000, 500);
    assert_eq!(windows.len(), 2, "15k tokens must split into exactly 2 windows");

    // Each window respects the content budget.
    for window in &windows {
        assert!(estimate_tokens(window) <= 10_000);
    }

    // The cut lands on a sentence boundary.
    assert!(windows[0].trim_end().ends_with('.'));

    // Overlap of at least 500 tokens.
    let first_end = windows[0].len();
    let second_start = text.len() - windows[1].len();
    let overlap_tokens = estimate_tokens(&text[second_start..first_end]);
    assert!(overlap_tokens >= 500, "overlap was {overlap_tokens} tokens");

    // Total prompt overhead stays within 10% of the single-window
    // hypothetical.
    let window_tokens: usize = windows.iter().map(|w| estimate_tokens(w)).sum();
    assert!(
        window_tokens <= total_tokens + total_tokens / 10,
        "window tokens {window_tokens} exceed 110% of {total_tokens}"
    );
}

#[tokio::test]
async fn test_engine_scrubs_large_text_in_two_calls() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(TestLlm::new());
    // One scrub response per window.
    llm.push_scrub(r#"[{"key": "throughput", "value": "forty documents per second", "category": "general"}]"#);
    llm.push_scrub(r#"[{"key": "throughput", "value": "forty documents per second", "category": "general"}]"#);

    let (engine, stores) = build_engine(dir.path(), Arc::clone(&llm)).await;

    let text = large_document();
    engine.process_user_message(&text, "s1").await;

    // Two extraction calls, one per window.
    let scrub_prompts = llm.prompts_containing("Extract atomic facts");
    assert_eq!(scrub_prompts.len(), 2);

    // The duplicate fact from the overlap was deduplicated.
    let blocks = stores
        .ledger
        .blocks_for_day(&hmlr_core::ids::today())
        .await
        .unwrap();
    let facts = stores
        .facts
        .facts_for_block(&blocks[0].block_id)
        .await
        .unwrap();
    assert_eq!(facts.len(), 1);

    engine.shutdown().await;
}
