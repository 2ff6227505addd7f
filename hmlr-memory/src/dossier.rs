//! Dossier routing — multi-vector voting
//!
//! Every dossier fact is embedded individually. A query (or each fact of
//! an incoming packet) votes for the dossiers whose facts it resembles;
//! dossiers are ranked by `(hit_count DESC, max_similarity DESC)`. The
//! write path appends to the winning dossier only after a strict yes/no
//! LLM confirmation, otherwise it creates a fresh dossier.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use hmlr_core::ids::next_id;
use hmlr_core::types::{Dossier, DossierFact, DossierHit, FactPacket, ProvenanceOp};
use hmlr_core::{HmlrError, LlmClient, Result};
use hmlr_storage::{DossierStore, FactMatch, VectorIndex};

use crate::prompts;

/// What the router did with a packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Facts appended to an existing dossier
    Appended {
        /// The receiving dossier
        dossier_id: String,
    },
    /// A new dossier was minted
    Created {
        /// The new dossier
        dossier_id: String,
    },
}

impl RouteOutcome {
    /// The dossier the packet ended up in
    #[must_use]
    pub fn dossier_id(&self) -> &str {
        match self {
            Self::Appended { dossier_id } | Self::Created { dossier_id } => dossier_id,
        }
    }
}

/// Multi-vector voting router
pub struct DossierRouter {
    store: DossierStore,
    index: Arc<VectorIndex>,
    llm: Arc<dyn LlmClient>,
    theta_dos: f32,
    h_match: usize,
    theta_match: f32,
    top_k: usize,
}

impl DossierRouter {
    /// Create a router with explicit voting thresholds
    #[must_use]
    pub fn new(
        store: DossierStore,
        index: Arc<VectorIndex>,
        llm: Arc<dyn LlmClient>,
        theta_dos: f32,
        h_match: usize,
        theta_match: f32,
        top_k: usize,
    ) -> Self {
        Self {
            store,
            index,
            llm,
            theta_dos,
            h_match,
            theta_match,
            top_k,
        }
    }

    /// Retrieve dossiers relevant to a query, hydrated with their facts
    ///
    /// Shared by the Governor's dossier task and by the write path.
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::Embedding`] or storage errors.
    pub async fn retrieve(&self, query: &str) -> Result<Vec<DossierHit>> {
        let matches = self
            .index
            .search_dossier_facts(query, self.top_k, self.theta_dos)
            .await?;
        self.hydrate_candidates(&rank_votes(&matches)).await
    }

    /// Route one fact packet: append to the best candidate or create
    ///
    /// # Errors
    ///
    /// Returns storage errors; LLM failures degrade to CREATE.
    pub async fn route(&self, packet: &FactPacket) -> Result<RouteOutcome> {
        // Each fact of the packet contributes votes.
        let mut all_matches: Vec<FactMatch> = Vec::new();
        for fact in &packet.facts {
            let matches = self
                .index
                .search_dossier_facts(&fact.as_text(), self.top_k, self.theta_dos)
                .await?;
            all_matches.extend(matches);
        }

        let ranked = rank_votes(&all_matches);
        debug!(
            "Packet \"{}\": {} candidate dossier(s)",
            packet.cluster_label,
            ranked.len()
        );

        if let Some((dossier_id, hit_count, max_similarity)) = ranked.first() {
            if *hit_count >= self.h_match && *max_similarity >= self.theta_match {
                let dossier = self.store.get_dossier(dossier_id).await?;
                if self.confirm_append(packet, &dossier).await {
                    self.append(packet, dossier_id).await?;
                    return Ok(RouteOutcome::Appended {
                        dossier_id: dossier_id.clone(),
                    });
                }
                debug!("LLM declined append to {dossier_id}; creating new dossier");
            }
        }

        let dossier_id = self.create(packet).await?;
        Ok(RouteOutcome::Created { dossier_id })
    }

    /// Merge `source` into `target`; not on the packet hot path
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn merge(&self, target_id: &str, source_id: &str) -> Result<()> {
        let source_facts = self.store.facts_for_dossier(source_id).await?;
        info!(
            "Merging dossier {source_id} ({} facts) into {target_id}",
            source_facts.len()
        );

        for fact in &source_facts {
            self.store
                .insert_fact(&DossierFact {
                    dossier_id: target_id.to_string(),
                    fact_id: fact.fact_id.clone(),
                    fact_text: fact.fact_text.clone(),
                })
                .await?;
            self.index
                .put_dossier_fact(&fact.fact_id, target_id, &fact.fact_text)
                .await?;
        }

        self.store.delete_dossier(source_id).await?;
        self.index.delete_by_dossier(source_id).await?;

        let target = self.store.get_dossier(target_id).await?;
        self.regenerate_summaries(target_id, &target.title).await?;
        self.store
            .add_provenance(
                target_id,
                ProvenanceOp::Merge,
                None,
                json!({ "merged_dossier_id": source_id, "facts_moved": source_facts.len() }),
            )
            .await?;
        Ok(())
    }

    async fn confirm_append(&self, packet: &FactPacket, dossier: &Dossier) -> bool {
        match self
            .llm
            .complete(&prompts::append_decision_prompt(packet, dossier))
            .await
        {
            Ok(answer) => {
                let normalized = answer.trim().to_lowercase();
                if normalized.starts_with("yes") {
                    true
                } else {
                    if !normalized.starts_with("no") {
                        warn!("Append gate returned non-strict answer {answer:?}; treating as no");
                    }
                    false
                }
            }
            Err(e) => {
                warn!("Append gate LLM call failed: {e}; treating as no");
                false
            }
        }
    }

    /// Append the packet's facts, re-embed, refresh summaries, log provenance
    async fn append(&self, packet: &FactPacket, dossier_id: &str) -> Result<()> {
        for fact in &packet.facts {
            let text = fact.as_text();
            self.store
                .insert_fact(&DossierFact {
                    dossier_id: dossier_id.to_string(),
                    fact_id: fact.fact_id.clone(),
                    fact_text: text.clone(),
                })
                .await?;
            self.index
                .put_dossier_fact(&fact.fact_id, dossier_id, &text)
                .await?;
        }

        let dossier = self.store.get_dossier(dossier_id).await?;
        self.regenerate_summaries(dossier_id, &dossier.title).await?;

        self.store
            .add_provenance(
                dossier_id,
                ProvenanceOp::Append,
                Some(&packet.source_block_id),
                json!({
                    "cluster_label": packet.cluster_label,
                    "facts": packet.facts.len(),
                }),
            )
            .await?;
        info!(
            "Appended {} facts to dossier {dossier_id}",
            packet.facts.len()
        );
        Ok(())
    }

    /// Mint a new dossier from the packet
    async fn create(&self, packet: &FactPacket) -> Result<String> {
        let now = Utc::now();
        let dossier = Dossier {
            dossier_id: next_id("dossier"),
            title: packet.cluster_label.clone(),
            summary: String::new(),
            search_summary: String::new(),
            created_at: now,
            last_updated: now,
        };
        let dossier_id = dossier.dossier_id.clone();
        self.store.insert_dossier(&dossier).await?;

        for fact in &packet.facts {
            let text = fact.as_text();
            self.store
                .insert_fact(&DossierFact {
                    dossier_id: dossier_id.clone(),
                    fact_id: fact.fact_id.clone(),
                    fact_text: text.clone(),
                })
                .await?;
            self.index
                .put_dossier_fact(&fact.fact_id, &dossier_id, &text)
                .await?;
        }

        self.regenerate_summaries(&dossier_id, &packet.cluster_label)
            .await?;
        self.store
            .add_provenance(
                &dossier_id,
                ProvenanceOp::Create,
                Some(&packet.source_block_id),
                json!({
                    "cluster_label": packet.cluster_label,
                    "facts": packet.facts.len(),
                }),
            )
            .await?;
        Ok(dossier_id)
    }

    /// Regenerate `summary` and `search_summary`, falling back to a
    /// deterministic rendering when the LLM is unavailable
    async fn regenerate_summaries(&self, dossier_id: &str, title: &str) -> Result<()> {
        let fact_texts: Vec<String> = self
            .store
            .facts_for_dossier(dossier_id)
            .await?
            .into_iter()
            .map(|f| f.fact_text)
            .collect();

        let summary = match self
            .llm
            .complete(&prompts::dossier_summary_prompt(title, &fact_texts))
            .await
        {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                warn!("Summary regeneration failed for {dossier_id}: {e}");
                format!("{title}: {}", fact_texts.join("; "))
            }
        };

        let search_summary = match self
            .llm
            .complete(&prompts::search_summary_prompt(title, &fact_texts))
            .await
        {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                warn!("Search-summary regeneration failed for {dossier_id}: {e}");
                format!("{title} {}", fact_texts.join(" "))
            }
        };

        self.store
            .update_summaries(dossier_id, &summary, &search_summary)
            .await?;
        self.index
            .put_dossier_search(dossier_id, &search_summary)
            .await?;
        self.store
            .add_provenance(dossier_id, ProvenanceOp::UpdateSummary, None, json!({}))
            .await?;
        Ok(())
    }

    async fn hydrate_candidates(
        &self,
        ranked: &[(String, usize, f32)],
    ) -> Result<Vec<DossierHit>> {
        let mut hits = Vec::new();
        for (dossier_id, hit_count, max_similarity) in ranked {
            let dossier = match self.store.get_dossier(dossier_id).await {
                Ok(dossier) => dossier,
                Err(HmlrError::NotFound(_)) => {
                    // Embedding row outlived its dossier; skip.
                    warn!("Vote for missing dossier {dossier_id}");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let facts = self.store.facts_for_dossier(dossier_id).await?;
            hits.push(DossierHit {
                dossier,
                facts,
                hit_count: *hit_count,
                max_similarity: *max_similarity,
            });
        }
        Ok(hits)
    }
}

/// Group fact matches by dossier and rank by `(hits DESC, max_sim DESC)`
fn rank_votes(matches: &[FactMatch]) -> Vec<(String, usize, f32)> {
    let mut votes: HashMap<&str, (usize, f32)> = HashMap::new();
    for m in matches {
        let entry = votes.entry(m.dossier_id.as_str()).or_insert((0, 0.0));
        entry.0 += 1;
        if m.score > entry.1 {
            entry.1 = m.score;
        }
    }

    let mut ranked: Vec<(String, usize, f32)> = votes
        .into_iter()
        .map(|(id, (hits, max_sim))| (id.to_string(), hits, max_sim))
        .collect();
    ranked.sort_by(|a, b| {
        b.1.cmp(&a.1).then(
            b.2.partial_cmp(&a.2)
                .unwrap_or(std::cmp::Ordering::Equal),
        )
    });
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(fact_id: &str, dossier_id: &str, score: f32) -> FactMatch {
        FactMatch {
            fact_id: fact_id.into(),
            dossier_id: dossier_id.into(),
            score,
        }
    }

    #[test]
    fn test_rank_votes_hits_beat_similarity() {
        let matches = vec![
            m("f1", "dos_a", 0.6),
            m("f2", "dos_a", 0.55),
            m("f3", "dos_b", 0.9),
        ];
        let ranked = rank_votes(&matches);
        assert_eq!(ranked[0].0, "dos_a");
        assert_eq!(ranked[0].1, 2);
        assert_eq!(ranked[1].0, "dos_b");
        assert!((ranked[1].2 - 0.9).abs() < f32::EPSILON);
    }

    #[test]
    fn test_rank_votes_similarity_breaks_hit_ties() {
        let matches = vec![m("f1", "dos_a", 0.5), m("f2", "dos_b", 0.8)];
        let ranked = rank_votes(&matches);
        assert_eq!(ranked[0].0, "dos_b");
    }

    #[test]
    fn test_rank_votes_empty() {
        assert!(rank_votes(&[]).is_empty());
    }
}
