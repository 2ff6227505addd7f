//! Context hydration — deterministic prompt assembly
//!
//! Sections appear in a fixed order: system preamble, user profile
//! (constraints first, strict ones marked immutable), sticky tags, block
//! facts, retrieved dossiers, retrieved long-term memories grouped by
//! block, the block's prior turns (verbatim for recent, compressed for
//! older), the current user message, and the metadata-emission
//! instruction. No artefact is ever rendered twice, and a memory group's
//! global tags are emitted once per block, never per chunk.

use std::collections::{HashMap, HashSet};

use hmlr_core::types::{
    BlockMetadata, BridgeBlock, DossierHit, Fact, GlobalTag, MemoryHit,
};

use crate::chunker::split_sentences;
use crate::profile::UserProfile;
use crate::prompts;

/// Everything the hydrator needs for one prompt
pub struct HydrationInput<'a> {
    /// System preamble
    pub system_prompt: &'a str,
    /// User profile
    pub profile: &'a UserProfile,
    /// The block this turn continues in
    pub block: &'a BridgeBlock,
    /// Gardener-written sticky metadata for the block
    pub block_metadata: &'a BlockMetadata,
    /// Facts assigned to the block
    pub facts: &'a [Fact],
    /// Long-term memory hits
    pub memories: &'a [MemoryHit],
    /// Global tags of the blocks referenced by memory hits
    pub memory_block_tags: &'a HashMap<String, Vec<GlobalTag>>,
    /// Retrieved dossier candidates
    pub dossiers: &'a [DossierHit],
    /// The current user message
    pub user_message: &'a str,
    /// Whether routing opened a new topic
    pub is_new_topic: bool,
    /// How many recent turns render verbatim
    pub verbatim_depth: usize,
}

/// Deterministic prompt formatter
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextHydrator;

impl ContextHydrator {
    /// Create a hydrator
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Assemble the full prompt
    #[must_use]
    pub fn hydrate(&self, input: &HydrationInput<'_>) -> String {
        let mut prompt = String::new();
        let mut seen_facts: HashSet<&str> = HashSet::new();

        prompt.push_str(input.system_prompt);
        prompt.push_str("\n\n");

        self.render_profile(&mut prompt, input.profile);
        self.render_sticky_tags(&mut prompt, input.block_metadata);
        self.render_block_facts(&mut prompt, input.facts, &mut seen_facts);
        self.render_dossiers(&mut prompt, input.dossiers, &mut seen_facts);
        self.render_memories(&mut prompt, input);
        self.render_prior_turns(&mut prompt, input);

        prompt.push_str("## CURRENT MESSAGE\n");
        prompt.push_str(input.user_message);
        prompt.push_str("\n\n");
        prompt.push_str(prompts::METADATA_INSTRUCTION);
        prompt.push('\n');

        prompt
    }

    fn render_profile(&self, prompt: &mut String, profile: &UserProfile) {
        if profile.constraints.is_empty()
            && profile.preferences.is_empty()
            && profile.notes.is_empty()
        {
            return;
        }

        prompt.push_str("## USER PROFILE\n");
        // Constraints first; strict ones are immutable.
        for constraint in &profile.constraints {
            if constraint.is_strict() {
                prompt.push_str(&format!(
                    "- [IMMUTABLE] {} (Severity: strict)\n",
                    constraint.description
                ));
            } else {
                prompt.push_str(&format!(
                    "- {} (Severity: {})\n",
                    constraint.description, constraint.severity
                ));
            }
        }
        for preference in &profile.preferences {
            prompt.push_str(&format!("- Preference: {preference}\n"));
        }
        for note in &profile.notes {
            prompt.push_str(&format!("- Note: {note}\n"));
        }
        prompt.push('\n');
    }

    fn render_sticky_tags(&self, prompt: &mut String, metadata: &BlockMetadata) {
        if metadata.global_tags.is_empty() && metadata.section_rules.is_empty() {
            return;
        }

        prompt.push_str("## STICKY TAGS\n");
        for tag in &metadata.global_tags {
            prompt.push_str(&format!("- [{}] {}\n", tag.category, tag.value));
        }
        for rule in &metadata.section_rules {
            prompt.push_str(&format!(
                "- (turns {}..{}) {}\n",
                rule.start_turn, rule.end_turn, rule.rule
            ));
        }
        prompt.push('\n');
    }

    fn render_block_facts<'a>(
        &self,
        prompt: &mut String,
        facts: &'a [Fact],
        seen_facts: &mut HashSet<&'a str>,
    ) {
        let fresh: Vec<&Fact> = facts
            .iter()
            .filter(|f| seen_facts.insert(f.fact_id.as_str()))
            .collect();
        if fresh.is_empty() {
            return;
        }

        prompt.push_str("## KNOWN FACTS FOR THIS TOPIC\n");
        for fact in fresh {
            prompt.push_str(&format!("- {}\n", fact.as_text()));
        }
        prompt.push('\n');
    }

    fn render_dossiers<'a>(
        &self,
        prompt: &mut String,
        dossiers: &'a [DossierHit],
        seen_facts: &mut HashSet<&'a str>,
    ) {
        if dossiers.is_empty() {
            return;
        }

        prompt.push_str("## RETRIEVED DOSSIERS\n");
        let mut seen_dossiers: HashSet<&str> = HashSet::new();
        for hit in dossiers {
            if !seen_dossiers.insert(hit.dossier.dossier_id.as_str()) {
                continue;
            }
            prompt.push_str(&format!("### {}\n", hit.dossier.title));
            if !hit.dossier.summary.is_empty() {
                prompt.push_str(&format!("{}\n", hit.dossier.summary));
            }
            for fact in &hit.facts {
                if seen_facts.insert(fact.fact_id.as_str()) {
                    prompt.push_str(&format!("- {}\n", fact.fact_text));
                }
            }
        }
        prompt.push('\n');
    }

    fn render_memories(&self, prompt: &mut String, input: &HydrationInput<'_>) {
        // Skip hits from the current block (its turns render below) and
        // duplicate ids.
        let mut seen_ids: HashSet<&str> = HashSet::new();
        let mut grouped: Vec<(&str, Vec<&MemoryHit>)> = Vec::new();

        for hit in input.memories {
            if !seen_ids.insert(hit.id.as_str()) {
                continue;
            }
            let block_id = hit.block_id.as_deref().unwrap_or("(unassigned)");
            if block_id == input.block.block_id {
                continue;
            }
            match grouped.iter_mut().find(|(id, _)| *id == block_id) {
                Some((_, hits)) => hits.push(hit),
                None => grouped.push((block_id, vec![hit])),
            }
        }

        if grouped.is_empty() {
            return;
        }

        prompt.push_str("## RETRIEVED LONG-TERM MEMORIES\n");
        for (block_id, hits) in grouped {
            prompt.push_str(&format!("### From block {block_id}\n"));
            // Tags once per block, never per chunk.
            if let Some(tags) = input.memory_block_tags.get(block_id) {
                if !tags.is_empty() {
                    let rendered: Vec<String> = tags
                        .iter()
                        .map(|t| format!("[{}] {}", t.category, t.value))
                        .collect();
                    prompt.push_str(&format!("Tags: {}\n", rendered.join("; ")));
                }
            }
            for hit in hits {
                prompt.push_str(&format!("- {}\n", hit.text));
            }
        }
        prompt.push('\n');
    }

    fn render_prior_turns(&self, prompt: &mut String, input: &HydrationInput<'_>) {
        if input.is_new_topic || input.block.turns.is_empty() {
            return;
        }

        prompt.push_str("## CONVERSATION SO FAR\n");
        let cutoff = input.block.turns.len().saturating_sub(input.verbatim_depth);
        for (i, turn) in input.block.turns.iter().enumerate() {
            if i < cutoff {
                prompt.push_str(&format!(
                    "[compressed] User: {} / Assistant: {}\n",
                    first_sentence(&turn.user_message),
                    first_sentence(&turn.assistant_response)
                ));
            } else {
                prompt.push_str(&format!(
                    "User: {}\nAssistant: {}\n",
                    turn.user_message, turn.assistant_response
                ));
            }
        }
        prompt.push('\n');
    }
}

fn first_sentence(text: &str) -> String {
    split_sentences(text)
        .into_iter()
        .next()
        .unwrap_or_else(|| text.to_string())
}
