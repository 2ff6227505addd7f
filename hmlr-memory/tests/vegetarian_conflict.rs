//! End-to-end: a constraint stated in one block survives gardening and a
//! window reset, and reaches the prompt of a later unrelated block

mod common;

use std::sync::Arc;

use common::{build_engine, TestLlm};
use hmlr_core::types::ResponseStatus;

const TURN_1: &str = "I am strictly vegetarian. I don't eat meat or fish.";
const TURN_2: &str =
    "I'm going to a steakhouse tonight and I'm really craving a steak. Is that a good idea for me?";

const FORBIDDEN_AFFIRMATIONS: &[&str] =
    &["go ahead", "good idea", "enjoy the steak", "great choice"];

#[tokio::test]
async fn test_vegetarian_constraint_survives_to_new_block() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(TestLlm::new());

    // Turn 1: the constraint is stated.
    llm.push_scrub(
        r#"[{"key": "dietary_preference", "value": "strictly vegetarian", "category": "constraint"}]"#,
    );
    llm.push_main("Noted — I'll remember that you are strictly vegetarian.");
    llm.push_scribe(
        r#"{"constraints": [{"description": "User is strictly vegetarian", "severity": "strict"}], "preferences": [], "notes": []}"#,
    );

    let (engine, stores) = build_engine(dir.path(), Arc::clone(&llm)).await;

    let response = engine.process_user_message(TURN_1, "session-1").await;
    assert_eq!(response.status, ResponseStatus::Success);

    // Let the Scribe land the profile update before the next turn.
    engine.wait_for_background().await;
    let profile = engine.profile_store().load().unwrap();
    assert!(
        profile
            .constraints
            .iter()
            .any(|c| c.description.to_lowercase().contains("vegetarian") && c.is_strict()),
        "profile must contain the strict vegetarian constraint"
    );

    // Garden the first block: the constraint becomes a global tag.
    let blocks = stores.ledger.blocks_for_day(&hmlr_core::ids::today()).await.unwrap();
    assert_eq!(blocks.len(), 1);
    let block_1 = blocks[0].block_id.clone();
    engine.ledger().close_block(&block_1).await.unwrap();
    let report = engine.gardener().process_block(&block_1).await.unwrap();
    assert!(!report.skipped);
    assert!(report.global_tags >= 1);

    let metadata = stores.ledger.get_metadata(&block_1).await.unwrap();
    assert!(
        metadata
            .global_tags
            .iter()
            .any(|t| t.category == "constraint" && t.value.to_lowercase().contains("vegetarian")),
        "block metadata must carry a vegetarian constraint tag"
    );

    // New topic, sliding window cleared.
    engine.window().clear().unwrap();
    llm.push_main(
        "You told me you're strictly vegetarian, so a steakhouse is a risky pick — \
         look for one with dedicated vegetarian mains instead.",
    );

    let response = engine.process_user_message(TURN_2, "session-2").await;
    assert_eq!(response.status, ResponseStatus::Success);

    // A new block was created for the steakhouse turn.
    let blocks = stores.ledger.blocks_for_day(&hmlr_core::ids::today()).await.unwrap();
    assert_eq!(blocks.len(), 2);

    // The hydrated prompt carried the vegetarian constraint.
    let main_prompts = llm.prompts_containing("You are CognitiveLattice");
    let steakhouse_prompt = main_prompts
        .iter()
        .find(|p| p.contains("steakhouse"))
        .expect("main prompt for turn 2 recorded");
    assert!(
        steakhouse_prompt.to_lowercase().contains("vegetarian"),
        "hydrated prompt must contain the vegetarian constraint"
    );
    assert!(steakhouse_prompt.contains("[IMMUTABLE]"));

    // The response mentions the constraint and avoids unqualified
    // affirmations.
    let lower = response.text.to_lowercase();
    assert!(lower.contains("vegetarian"));
    for phrase in FORBIDDEN_AFFIRMATIONS {
        assert!(
            !lower.contains(phrase),
            "response must not contain {phrase:?}"
        );
    }

    engine.shutdown().await;
}
