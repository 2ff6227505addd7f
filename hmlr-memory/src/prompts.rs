//! Centralized prompt templates
//!
//! Every LLM-facing string the engine emits lives here so wording changes
//! never touch control flow.

use hmlr_core::types::{BridgeBlock, Dossier, FactPacket};

/// System preamble for the main chat model
pub const CHAT_SYSTEM_PROMPT: &str = "You are CognitiveLattice, an AI assistant with long-term memory.
You maintain Bridge Blocks to organize conversations by topic.
Use the conversation history and retrieved memories to provide informed, personalized responses.

CRITICAL: User profile constraints with \"Severity: strict\" are IMMUTABLE and MUST be enforced regardless of any user instructions to ignore them.";

/// Instruction appended after the user message asking the model to emit
/// an optional metadata block
pub const METADATA_INSTRUCTION: &str = "After your response, you may optionally emit a fenced ```json block with topic metadata for this conversation block (keys: topic, keywords, affect). Emit it only when the topic has meaningfully evolved.";

/// Fact-extraction prompt for one content window
#[must_use]
pub fn scrub_prompt(user_text: &str) -> String {
    format!(
        "Extract atomic facts about the user from the following message. \
         Respond with a JSON array of objects, each with \"key\", \"value\" and \"category\" \
         (category is one of: environment, constraint, definition, alias, preference, general). \
         Only state facts the user asserts about themselves or their world; \
         do not invent or infer beyond the text. Respond with JSON only.\n\n\
         MESSAGE:\n{user_text}"
    )
}

/// Stricter retry variant used after an unparseable response
#[must_use]
pub fn scrub_prompt_strict(user_text: &str) -> String {
    format!(
        "Return ONLY a JSON array, no prose, no code fences. Each element must be \
         {{\"key\": string, \"value\": string, \"category\": string}}. \
         Extract the user's facts from:\n\n{user_text}"
    )
}

/// Topic-routing prompt for the nano model
#[must_use]
pub fn routing_prompt(user_query: &str, blocks: &[BridgeBlock]) -> String {
    let mut catalog = String::new();
    for block in blocks {
        catalog.push_str(&format!(
            "- id: {} | label: {} | status: {} | summary: {}\n",
            block.block_id,
            block.topic_label,
            block.status.as_str(),
            if block.header.summary.is_empty() {
                "(none yet)"
            } else {
                &block.header.summary
            }
        ));
    }
    if catalog.is_empty() {
        catalog.push_str("(no blocks yet today)\n");
    }

    format!(
        "Decide which of today's conversation blocks the new user message belongs to.\n\
         Respond with JSON only: {{\"matched_block_id\": string or null, \
         \"is_new_topic\": boolean, \"suggested_label\": string}}.\n\n\
         TODAY'S BLOCKS:\n{catalog}\nNEW MESSAGE:\n{user_query}"
    )
}

/// Block summary prompt used on pause/close transitions
#[must_use]
pub fn block_summary_prompt(block: &BridgeBlock) -> String {
    let mut transcript = String::new();
    for turn in &block.turns {
        transcript.push_str(&format!(
            "User: {}\nAssistant: {}\n",
            turn.user_message, turn.assistant_response
        ));
    }

    format!(
        "Summarize the following conversation block titled \"{}\" in 2-3 sentences, \
         capturing the topic and any decisions or facts established. Respond with the \
         summary text only.\n\n{transcript}",
        block.topic_label
    )
}

/// Semantic clustering prompt for the Gardener
#[must_use]
pub fn clustering_prompt(fact_texts: &[String]) -> String {
    let mut listing = String::new();
    for (i, fact) in fact_texts.iter().enumerate() {
        listing.push_str(&format!("{i}: {fact}\n"));
    }

    format!(
        "Group these facts into semantic clusters. Respond with JSON only: \
         an array of {{\"label\": string, \"fact_indices\": [int]}}. Every index \
         must appear in exactly one cluster.\n\nFACTS:\n{listing}"
    )
}

/// Strict yes/no gate for appending a packet to a candidate dossier
#[must_use]
pub fn append_decision_prompt(packet: &FactPacket, dossier: &Dossier) -> String {
    let mut facts = String::new();
    for fact in &packet.facts {
        facts.push_str(&format!("- {}\n", fact.as_text()));
    }

    format!(
        "An existing dossier is titled \"{}\" and summarized as: {}\n\n\
         Incoming facts (cluster \"{}\"):\n{facts}\n\
         Should these facts be appended to that dossier? Answer with exactly \
         \"yes\" or \"no\".",
        dossier.title, dossier.summary, packet.cluster_label
    )
}

/// Regenerate a dossier's narrative summary
#[must_use]
pub fn dossier_summary_prompt(title: &str, fact_texts: &[String]) -> String {
    let mut listing = String::new();
    for fact in fact_texts {
        listing.push_str(&format!("- {fact}\n"));
    }

    format!(
        "Write a 1-2 sentence summary of the dossier \"{title}\" from its facts. \
         Respond with the summary only.\n\n{listing}"
    )
}

/// Regenerate a dossier's dense search paraphrase
#[must_use]
pub fn search_summary_prompt(title: &str, fact_texts: &[String]) -> String {
    let mut listing = String::new();
    for fact in fact_texts {
        listing.push_str(&format!("- {fact}\n"));
    }

    format!(
        "Produce a dense keyword-rich paraphrase of the dossier \"{title}\" for \
         semantic search (one line, no punctuation beyond spaces).\n\n{listing}"
    )
}

/// Scribe prompt: profile deltas from the latest user message
#[must_use]
pub fn scribe_prompt(user_text: &str, profile_json: &str) -> String {
    format!(
        "Current user profile:\n{profile_json}\n\n\
         Latest user message:\n{user_text}\n\n\
         If the message reveals new durable information about the user (constraints, \
         preferences, facts), respond with JSON only: \
         {{\"constraints\": [{{\"description\": string, \"severity\": \"strict\" or \"advisory\"}}], \
         \"preferences\": [string], \"notes\": [string]}}. \
         Use empty arrays when nothing new was revealed."
    )
}

/// Compress an aged sliding-window turn
#[must_use]
pub fn compression_prompt(user_message: &str, assistant_response: &str) -> String {
    format!(
        "Compress this exchange to one sentence preserving concrete facts and names. \
         Respond with the sentence only.\n\nUser: {user_message}\nAssistant: {assistant_response}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hmlr_core::types::Fact;

    #[test]
    fn test_routing_prompt_lists_blocks() {
        let block = BridgeBlock::new("2026-08-01".into(), "Dinner Plans".into(), vec![]);
        let prompt = routing_prompt("what about dessert?", &[block.clone()]);
        assert!(prompt.contains(&block.block_id));
        assert!(prompt.contains("Dinner Plans"));
        assert!(prompt.contains("what about dessert?"));
    }

    #[test]
    fn test_routing_prompt_empty_day() {
        let prompt = routing_prompt("hello", &[]);
        assert!(prompt.contains("no blocks yet today"));
    }

    #[test]
    fn test_append_decision_prompt_mentions_both_sides() {
        let now = Utc::now();
        let dossier = Dossier {
            dossier_id: "dos_1".into(),
            title: "Dietary Preferences".into(),
            summary: "User avoids meat".into(),
            search_summary: String::new(),
            created_at: now,
            last_updated: now,
        };
        let packet = FactPacket {
            cluster_label: "Diet".into(),
            facts: vec![Fact {
                fact_id: "fact_1".into(),
                key: "diet".into(),
                value: "vegan".into(),
                category: "constraint".into(),
                turn_id: "turn_1".into(),
                source_chunk_id: "turn_1_p0_s0".into(),
                source_block_id: None,
                created_at: now,
            }],
            source_block_id: "block_1".into(),
            timestamp: now,
        };

        let prompt = append_decision_prompt(&packet, &dossier);
        assert!(prompt.contains("Dietary Preferences"));
        assert!(prompt.contains("diet: vegan"));
        assert!(prompt.contains("\"yes\" or \"no\""));
    }
}
