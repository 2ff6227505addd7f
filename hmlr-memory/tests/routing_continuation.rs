//! Routing scenarios across four turns: new topic, continuation, shift,
//! and resumption, preserving the one-active-block-per-day invariant

mod common;

use std::sync::Arc;

use common::{build_engine, RoutingScript, TestLlm};
use hmlr_core::ids::today;
use hmlr_core::types::{BlockStatus, ResponseStatus};

#[tokio::test]
async fn test_four_turn_routing_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(TestLlm::new());
    let (engine, stores) = build_engine(dir.path(), Arc::clone(&llm)).await;
    let day = today();

    // Turn 1: day starts empty; a new block is created.
    llm.push_routing(RoutingScript::New("Dinner Plans".into()));
    let response = engine.process_user_message("What should I cook tonight?", "s1").await;
    assert_eq!(response.status, ResponseStatus::Success);

    let blocks = stores.ledger.blocks_for_day(&day).await.unwrap();
    assert_eq!(blocks.len(), 1);
    let block_1 = blocks[0].block_id.clone();
    assert_eq!(blocks[0].status, BlockStatus::Active);
    assert_eq!(blocks[0].topic_label, "Dinner Plans");

    // Turn 2: same topic; no new block, the active one grows.
    llm.push_routing(RoutingScript::Match("Dinner Plans".into()));
    engine.process_user_message("Something with lentils?", "s1").await;

    let blocks = stores.ledger.blocks_for_day(&day).await.unwrap();
    assert_eq!(blocks.len(), 1, "continuation must not create a block");
    let block = stores.ledger.get_block(&block_1).await.unwrap();
    assert_eq!(block.status, BlockStatus::Active);
    assert_eq!(block.turns.len(), 2);

    // Turn 3: topic shift pauses the first block with a summary.
    llm.push_routing(RoutingScript::New("Rust Borrow Checker".into()));
    engine.process_user_message("Why does the borrow checker hate me?", "s1").await;

    let paused = stores.ledger.get_block(&block_1).await.unwrap();
    assert_eq!(paused.status, BlockStatus::Paused);
    assert!(!paused.header.summary.is_empty(), "pause generates a summary");

    let blocks = stores.ledger.blocks_for_day(&day).await.unwrap();
    assert_eq!(blocks.len(), 2);
    let block_2 = blocks
        .iter()
        .find(|b| b.block_id != block_1)
        .unwrap()
        .block_id
        .clone();
    assert_eq!(
        stores.ledger.get_block(&block_2).await.unwrap().status,
        BlockStatus::Active
    );

    // Turn 4: returning to the first topic resumes it and pauses the
    // second block.
    llm.push_routing(RoutingScript::Match("Dinner Plans".into()));
    engine.process_user_message("Back to dinner: lentil curry it is.", "s1").await;

    assert_eq!(
        stores.ledger.get_block(&block_1).await.unwrap().status,
        BlockStatus::Active
    );
    assert_eq!(
        stores.ledger.get_block(&block_2).await.unwrap().status,
        BlockStatus::Paused
    );

    // Invariant: never more than one active block for the day, and
    // sequences increase strictly along the block.
    assert_eq!(stores.ledger.active_count(&day).await.unwrap(), 1);
    let block = stores.ledger.get_block(&block_1).await.unwrap();
    assert_eq!(block.turns.len(), 3);
    for pair in block.turns.windows(2) {
        assert!(pair[0].turn_sequence < pair[1].turn_sequence);
    }

    engine.shutdown().await;
}
