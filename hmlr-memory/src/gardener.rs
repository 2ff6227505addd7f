//! The Gardener — offline promotion of closed Bridge Blocks
//!
//! For each block: sticky facts become block metadata (global tags or
//! turn-bounded section rules), the remaining facts are clustered
//! semantically and handed to the dossier router as fact packets, and the
//! block's sentence chunks are embedded into the long-term memory index.
//! Re-running on the same block is a no-op thanks to the gardened marker.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info, warn};

use hmlr_core::types::{
    BlockMetadata, BridgeBlock, Fact, FactPacket, GlobalTag, SectionRule,
};
use hmlr_core::{LlmClient, Result};
use hmlr_storage::{FactStore, LedgerStore, TurnStore, VectorIndex};

use crate::chunker::ChunkEngine;
use crate::dossier::DossierRouter;
use crate::prompts;

/// Categories promoted to sticky tags rather than dossiers
const STICKY_CATEGORIES: &[&str] = &[
    "environment",
    "constraint",
    "definition",
    "alias",
    "preference",
];

/// Label used when semantic clustering fails
const FALLBACK_CLUSTER_LABEL: &str = "General Facts";

/// Cluster shape the LLM is asked to produce
#[derive(Debug, Deserialize)]
struct RawCluster {
    label: String,
    fact_indices: Vec<usize>,
}

/// What one gardening run did
#[derive(Debug, Default)]
pub struct GardeningReport {
    /// Block that was processed
    pub block_id: String,
    /// True when the block was already gardened
    pub skipped: bool,
    /// Global tags written
    pub global_tags: usize,
    /// Section rules written
    pub section_rules: usize,
    /// Fact packets handed to the dossier router
    pub packets: usize,
    /// Sentence chunks embedded into gardened memory
    pub embedded_chunks: usize,
}

/// Offline block promoter
pub struct Gardener {
    ledger: LedgerStore,
    turns: TurnStore,
    facts: FactStore,
    index: Arc<VectorIndex>,
    llm: Arc<dyn LlmClient>,
    router: Arc<DossierRouter>,
    chunker: ChunkEngine,
}

impl Gardener {
    /// Create a gardener over the stores and the dossier router
    #[must_use]
    pub fn new(
        ledger: LedgerStore,
        turns: TurnStore,
        facts: FactStore,
        index: Arc<VectorIndex>,
        llm: Arc<dyn LlmClient>,
        router: Arc<DossierRouter>,
    ) -> Self {
        Self {
            ledger,
            turns,
            facts,
            index,
            llm,
            router,
            chunker: ChunkEngine::new(),
        }
    }

    /// Process every closed block still pending gardening
    ///
    /// # Errors
    ///
    /// Returns the first storage error encountered.
    pub async fn process_pending(&self) -> Result<Vec<GardeningReport>> {
        let pending = self.ledger.closed_ungardened().await?;
        info!("Gardener: {} block(s) pending", pending.len());

        let mut reports = Vec::with_capacity(pending.len());
        for block in pending {
            reports.push(self.process_block(&block.block_id).await?);
        }
        Ok(reports)
    }

    /// Promote one block (idempotent)
    ///
    /// # Errors
    ///
    /// Returns storage errors; LLM failures degrade per step.
    pub async fn process_block(&self, block_id: &str) -> Result<GardeningReport> {
        let mut block = self.ledger.get_block(block_id).await?;
        if block.header.gardened {
            debug!("Block {block_id} already gardened, skipping");
            return Ok(GardeningReport {
                block_id: block_id.to_string(),
                skipped: true,
                ..GardeningReport::default()
            });
        }

        let facts = self.facts.facts_for_block(block_id).await?;
        info!(
            "Gardening block {block_id}: {} fact(s), {} turn(s)",
            facts.len(),
            block.turns.len()
        );

        // Sticky tags vs dossier-bound split.
        let (sticky, dossier_bound): (Vec<&Fact>, Vec<&Fact>) = facts
            .iter()
            .partition(|f| STICKY_CATEGORIES.contains(&f.category.as_str()));

        let metadata = build_metadata(&block, &sticky);
        let report_tags = metadata.global_tags.len();
        let report_rules = metadata.section_rules.len();
        self.ledger.put_metadata(block_id, &metadata).await?;

        // Semantic clustering of dossier-bound facts.
        let mut packets = 0;
        if !dossier_bound.is_empty() {
            let clusters = self.cluster_facts(&dossier_bound).await;
            for (label, cluster_facts) in clusters {
                let packet = FactPacket {
                    cluster_label: label,
                    facts: cluster_facts,
                    source_block_id: block_id.to_string(),
                    timestamp: Utc::now(),
                };
                self.router.route(&packet).await?;
                packets += 1;
            }
        }

        // Gardened memory: embed every sentence chunk of the block.
        let mut embedded = 0;
        for turn in &block.turns {
            let mut chunks = self.turns.chunks_for_turn(&turn.turn_id).await?;
            if chunks.is_empty() {
                // Chunk rows were not persisted for this turn; re-derive
                // them deterministically from the user message.
                chunks = self
                    .chunker
                    .chunk_turn(&turn.user_message, &turn.turn_id, None);
            }
            for chunk in chunks
                .iter()
                .filter(|c| c.chunk_type == hmlr_core::types::ChunkType::Sentence)
            {
                self.index
                    .put_memory(&chunk.chunk_id, &turn.turn_id, &chunk.text_verbatim)
                    .await?;
                embedded += 1;
            }
        }

        // Remove from the pending queue; the block itself is retained.
        block.header.gardened = true;
        self.ledger.save_block(&block).await?;

        Ok(GardeningReport {
            block_id: block_id.to_string(),
            skipped: false,
            global_tags: report_tags,
            section_rules: report_rules,
            packets,
            embedded_chunks: embedded,
        })
    }

    /// LLM clustering with a single "General Facts" fallback cluster
    async fn cluster_facts(&self, facts: &[&Fact]) -> Vec<(String, Vec<Fact>)> {
        let fact_texts: Vec<String> = facts.iter().map(|f| f.as_text()).collect();

        let raw_clusters = match self
            .llm
            .complete(&prompts::clustering_prompt(&fact_texts))
            .await
        {
            Ok(response) => parse_clusters(&response, facts.len()),
            Err(e) => {
                warn!("Clustering LLM call failed: {e}");
                None
            }
        };

        match raw_clusters {
            Some(clusters) => clusters
                .into_iter()
                .map(|c| {
                    let cluster_facts = c
                        .fact_indices
                        .iter()
                        .map(|&i| facts[i].clone())
                        .collect::<Vec<_>>();
                    (c.label, cluster_facts)
                })
                .filter(|(_, cluster_facts)| !cluster_facts.is_empty())
                .collect(),
            None => {
                warn!("Falling back to a single \"{FALLBACK_CLUSTER_LABEL}\" cluster");
                vec![(
                    FALLBACK_CLUSTER_LABEL.to_string(),
                    facts.iter().map(|f| (*f).clone()).collect(),
                )]
            }
        }
    }
}

/// Sticky-fact placement: `environment` facts become section rules bounded
/// from their source turn to the block end; everything else is a global tag
fn build_metadata(block: &BridgeBlock, sticky: &[&Fact]) -> BlockMetadata {
    let end_turn = block
        .turns
        .last()
        .map(|t| t.turn_id.clone())
        .unwrap_or_default();

    let mut metadata = BlockMetadata::default();
    for fact in sticky {
        if fact.category == "environment" {
            metadata.section_rules.push(SectionRule {
                start_turn: fact.turn_id.clone(),
                end_turn: if end_turn.is_empty() {
                    fact.turn_id.clone()
                } else {
                    end_turn.clone()
                },
                rule: fact.as_text(),
            });
        } else {
            metadata.global_tags.push(GlobalTag {
                category: fact.category.clone(),
                value: fact.as_text(),
            });
        }
    }
    metadata
}

/// Validate the LLM's clustering: every index in range, used exactly once
fn parse_clusters(response: &str, fact_count: usize) -> Option<Vec<RawCluster>> {
    let start = response.find('[')?;
    let end = response.rfind(']')?;
    if end <= start {
        return None;
    }
    let clusters: Vec<RawCluster> = serde_json::from_str(&response[start..=end]).ok()?;

    let mut seen = HashSet::new();
    for cluster in &clusters {
        for &index in &cluster.fact_indices {
            if index >= fact_count || !seen.insert(index) {
                return None;
            }
        }
    }
    if seen.len() != fact_count {
        return None;
    }
    Some(clusters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hmlr_core::types::{BlockTurn, ChunkType};

    fn fact(id: &str, key: &str, value: &str, category: &str, turn_id: &str) -> Fact {
        Fact {
            fact_id: id.into(),
            key: key.into(),
            value: value.into(),
            category: category.into(),
            turn_id: turn_id.into(),
            source_chunk_id: format!("{turn_id}_p0_s0"),
            source_block_id: Some("block_1".into()),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_build_metadata_splits_environment_from_global() {
        let mut block = BridgeBlock::new("2026-08-01".into(), "Setup".into(), vec![]);
        block.turns.push(BlockTurn {
            turn_id: "turn_1".into(),
            turn_sequence: 1,
            timestamp: Utc::now(),
            user_message: "m".into(),
            assistant_response: "r".into(),
        });
        block.turns.push(BlockTurn {
            turn_id: "turn_2".into(),
            turn_sequence: 2,
            timestamp: Utc::now(),
            user_message: "m".into(),
            assistant_response: "r".into(),
        });

        let constraint = fact("f1", "diet", "strictly vegetarian", "constraint", "turn_1");
        let environment = fact("f2", "os", "Ubuntu 24.04", "environment", "turn_1");
        let metadata = build_metadata(&block, &[&constraint, &environment]);

        assert_eq!(metadata.global_tags.len(), 1);
        assert_eq!(metadata.global_tags[0].category, "constraint");
        assert!(metadata.global_tags[0].value.contains("vegetarian"));

        assert_eq!(metadata.section_rules.len(), 1);
        assert_eq!(metadata.section_rules[0].start_turn, "turn_1");
        assert_eq!(metadata.section_rules[0].end_turn, "turn_2");
    }

    #[test]
    fn test_parse_clusters_accepts_exact_partition() {
        let response = r#"[{"label": "Diet", "fact_indices": [0, 2]},
                           {"label": "Work", "fact_indices": [1]}]"#;
        let clusters = parse_clusters(response, 3).unwrap();
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].label, "Diet");
    }

    #[test]
    fn test_parse_clusters_rejects_missing_or_duplicate_indices() {
        // Index 1 missing
        assert!(parse_clusters(r#"[{"label": "A", "fact_indices": [0]}]"#, 2).is_none());
        // Index 0 duplicated
        assert!(parse_clusters(
            r#"[{"label": "A", "fact_indices": [0]}, {"label": "B", "fact_indices": [0, 1]}]"#,
            2
        )
        .is_none());
        // Index out of range
        assert!(parse_clusters(r#"[{"label": "A", "fact_indices": [0, 5]}]"#, 2).is_none());
    }

    #[test]
    fn test_sticky_category_set() {
        for category in ["environment", "constraint", "definition", "alias", "preference"] {
            assert!(STICKY_CATEGORIES.contains(&category));
        }
        assert!(!STICKY_CATEGORIES.contains(&"general"));
    }

    #[test]
    fn test_chunk_type_filter_matches_sentences_only() {
        let chunks = ChunkEngine::new().chunk_turn("One. Two.", "turn_1", None);
        let sentences: Vec<_> = chunks
            .iter()
            .filter(|c| c.chunk_type == ChunkType::Sentence)
            .collect();
        assert_eq!(sentences.len(), 2);
    }
}
