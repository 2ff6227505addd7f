//! The Governor — per-turn parallel retrieval router
//!
//! Four sub-tasks run concurrently with a per-task deadline: topic
//! routing, long-term memory retrieval, keyword fact lookup, and dossier
//! retrieval. Memory is best-effort: a failed or timed-out task surrenders
//! an empty result and the turn proceeds. The Governor performs no writes.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, warn};

use hmlr_core::types::{Fact, GovernorOutput, MemoryHit, RoutingDecision};
use hmlr_core::{LlmClient, Result};
use hmlr_storage::{FactStore, LedgerStore, TurnStore, VectorIndex};

use crate::dossier::DossierRouter;
use crate::prompts;

/// Stopwords excluded from nano-keyword extraction
const STOPWORDS: &[&str] = &[
    "the", "and", "for", "that", "this", "with", "you", "your", "are", "was", "were", "have",
    "has", "had", "but", "not", "what", "which", "would", "could", "should", "about", "tonight",
    "really", "going", "just", "like", "them", "they", "then", "than", "there", "here", "from",
    "into", "out", "how", "why", "when", "who", "can", "will", "its", "it's", "i'm", "don't",
];

/// The per-turn retrieval router
pub struct Governor {
    llm: Arc<dyn LlmClient>,
    index: Arc<VectorIndex>,
    turns: TurnStore,
    ledger: LedgerStore,
    facts: FactStore,
    router: Arc<DossierRouter>,
    k_mem: usize,
    theta_mem: f32,
    t_gov: Duration,
}

impl Governor {
    /// Create a Governor over the read-side stores
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        llm: Arc<dyn LlmClient>,
        index: Arc<VectorIndex>,
        turns: TurnStore,
        ledger: LedgerStore,
        facts: FactStore,
        router: Arc<DossierRouter>,
        k_mem: usize,
        theta_mem: f32,
        t_gov: Duration,
    ) -> Self {
        Self {
            llm,
            index,
            turns,
            ledger,
            facts,
            router,
            k_mem,
            theta_mem,
            t_gov,
        }
    }

    /// Run the four retrieval tasks and join their results
    ///
    /// Never fails: each task degrades independently to its empty result,
    /// and routing degrades to the defensive default.
    pub async fn govern(&self, user_query: &str, day_id: &str) -> GovernorOutput {
        let (routing, memories, facts, dossiers) = tokio::join!(
            self.routing_task(user_query, day_id),
            self.memory_task(user_query),
            self.fact_task(user_query),
            self.dossier_task(user_query),
        );

        debug!(
            "Governor results: routing={:?}, memories={}, facts={}, dossiers={}",
            routing.matched_block_id,
            memories.len(),
            facts.len(),
            dossiers.len()
        );

        GovernorOutput {
            routing,
            memories,
            facts,
            dossiers,
        }
    }

    async fn routing_task(&self, user_query: &str, day_id: &str) -> RoutingDecision {
        let attempt = async {
            let blocks = self.ledger.blocks_for_day(day_id).await?;
            let response = self
                .llm
                .complete(&prompts::routing_prompt(user_query, &blocks))
                .await?;
            parse_routing(&response).ok_or_else(|| {
                hmlr_core::HmlrError::Retrieval(format!(
                    "routing response unparseable: {response:?}"
                ))
            })
        };

        match timeout(self.t_gov, attempt).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => {
                warn!("Routing task failed: {e}; using fallback decision");
                RoutingDecision::default()
            }
            Err(_) => {
                warn!("Routing task timed out; using fallback decision");
                RoutingDecision::default()
            }
        }
    }

    async fn memory_task(&self, user_query: &str) -> Vec<MemoryHit> {
        let attempt = async {
            let matches = self
                .index
                .search_memory(user_query, self.k_mem, self.theta_mem)
                .await?;

            let mut hits = Vec::with_capacity(matches.len());
            for m in matches {
                hits.push(self.hydrate_memory_hit(m).await?);
            }
            Ok::<_, hmlr_core::HmlrError>(hits)
        };

        match timeout(self.t_gov, attempt).await {
            Ok(Ok(hits)) => hits,
            Ok(Err(e)) => {
                warn!("Memory retrieval failed: {e}; proceeding without memories");
                Vec::new()
            }
            Err(_) => {
                warn!("Memory retrieval timed out; proceeding without memories");
                Vec::new()
            }
        }
    }

    async fn hydrate_memory_hit(&self, m: hmlr_storage::MemoryMatch) -> Result<MemoryHit> {
        // Chunk-level ids resolve to chunk text; turn-level ids to the
        // user message. Either way the owning block is looked up through
        // the turn's day.
        let text = if m.id == m.turn_id {
            self.turns.get_turn(&m.turn_id).await?.user_message
        } else {
            match self.turns.get_chunk(&m.id).await? {
                Some(chunk) => chunk.text_verbatim,
                None => self.turns.get_turn(&m.turn_id).await?.user_message,
            }
        };

        let block_id = match self.turns.get_turn(&m.turn_id).await {
            Ok(turn) => {
                self.ledger
                    .find_block_for_turn(&turn.day_id, &m.turn_id)
                    .await?
            }
            Err(_) => None,
        };

        Ok(MemoryHit {
            id: m.id,
            turn_id: m.turn_id,
            block_id,
            text,
            score: m.score,
        })
    }

    async fn fact_task(&self, user_query: &str) -> Vec<Fact> {
        let keywords = extract_nano_keywords(user_query);
        if keywords.is_empty() {
            return Vec::new();
        }

        let attempt = self.facts.search_keywords(&keywords, 20);
        match timeout(self.t_gov, attempt).await {
            Ok(Ok(facts)) => facts,
            Ok(Err(e)) => {
                warn!("Fact lookup failed: {e}; proceeding without facts");
                Vec::new()
            }
            Err(_) => {
                warn!("Fact lookup timed out; proceeding without facts");
                Vec::new()
            }
        }
    }

    async fn dossier_task(&self, user_query: &str) -> Vec<hmlr_core::types::DossierHit> {
        match timeout(self.t_gov, self.router.retrieve(user_query)).await {
            Ok(Ok(hits)) => hits,
            Ok(Err(e)) => {
                warn!("Dossier retrieval failed: {e}; proceeding without dossiers");
                Vec::new()
            }
            Err(_) => {
                warn!("Dossier retrieval timed out; proceeding without dossiers");
                Vec::new()
            }
        }
    }
}

/// Parse a routing response that may carry prose or code fences
fn parse_routing(response: &str) -> Option<RoutingDecision> {
    let start = response.find('{')?;
    let end = response.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&response[start..=end]).ok()
}

/// Local nano-keyword extraction: lowercased, stopword-filtered, deduped
#[must_use]
pub fn extract_nano_keywords(query: &str) -> Vec<String> {
    let mut keywords = Vec::new();
    for token in query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
    {
        let token = token.trim_matches('\'');
        if token.len() < 3 || STOPWORDS.contains(&token) {
            continue;
        }
        if !keywords.iter().any(|k| k == token) {
            keywords.push(token.to_string());
        }
    }
    keywords
}
