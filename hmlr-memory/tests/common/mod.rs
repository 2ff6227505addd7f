//! Shared fixtures: a prompt-dispatching scripted LLM, a deterministic
//! keyword-bucket embedder, and an engine builder over one database
#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use hmlr_core::{EmbeddingProvider, HmlrConfig, HmlrError, LlmClient, Result};
use hmlr_memory::ConversationEngine;
use hmlr_storage::{DossierStore, FactStore, LedgerStore, SqliteBackend, TurnStore};

/// Store handles sharing the engine's connection, for assertions
pub struct TestStores {
    pub turns: TurnStore,
    pub facts: FactStore,
    pub ledger: LedgerStore,
    pub dossiers: DossierStore,
}

/// Build an engine over an in-memory database, returning store handles on
/// the same connection for test-side inspection
pub async fn build_engine(
    dir: &Path,
    llm: Arc<TestLlm>,
) -> (ConversationEngine, TestStores) {
    let backend = SqliteBackend::open_in_memory().await.unwrap();
    let conn = backend.connection();
    let stores = TestStores {
        turns: TurnStore::new(conn.clone()),
        facts: FactStore::new(conn.clone()),
        ledger: LedgerStore::new(conn.clone()),
        dossiers: DossierStore::new(conn),
    };

    let config = HmlrConfig::for_testing(dir);
    let engine = ConversationEngine::with_backend(
        config,
        backend,
        Arc::clone(&llm) as Arc<dyn LlmClient>,
        llm as Arc<dyn LlmClient>,
        Arc::new(BucketEmbedder::new()),
    )
    .await
    .unwrap();

    (engine, stores)
}

/// How the scripted LLM should answer one routing call
#[derive(Debug, Clone)]
pub enum RoutingScript {
    /// Open a new topic with this label
    New(String),
    /// Match the existing block whose label appears in the prompt
    Match(String),
}

/// Scripted LLM that dispatches on prompt markers
///
/// Each prompt the engine can emit has a distinctive marker; responses are
/// pulled from per-kind queues with sensible defaults so a test only
/// scripts what it cares about. Every prompt is recorded for assertions.
pub struct TestLlm {
    pub prompts: Mutex<Vec<String>>,
    pub main_responses: Mutex<VecDeque<String>>,
    pub scrub_responses: Mutex<VecDeque<String>>,
    pub routing_scripts: Mutex<VecDeque<RoutingScript>>,
    pub scribe_responses: Mutex<VecDeque<String>>,
    pub append_response: String,
    pub cluster_response: Option<String>,
}

impl Default for TestLlm {
    fn default() -> Self {
        Self {
            prompts: Mutex::new(Vec::new()),
            main_responses: Mutex::new(VecDeque::new()),
            scrub_responses: Mutex::new(VecDeque::new()),
            routing_scripts: Mutex::new(VecDeque::new()),
            scribe_responses: Mutex::new(VecDeque::new()),
            append_response: "yes".to_string(),
            cluster_response: None,
        }
    }
}

impl TestLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_main(&self, response: &str) {
        self.main_responses
            .lock()
            .unwrap()
            .push_back(response.to_string());
    }

    pub fn push_scrub(&self, response: &str) {
        self.scrub_responses
            .lock()
            .unwrap()
            .push_back(response.to_string());
    }

    pub fn push_routing(&self, script: RoutingScript) {
        self.routing_scripts.lock().unwrap().push_back(script);
    }

    pub fn push_scribe(&self, response: &str) {
        self.scribe_responses
            .lock()
            .unwrap()
            .push_back(response.to_string());
    }

    /// All recorded prompts containing `marker`
    pub fn prompts_containing(&self, marker: &str) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.contains(marker))
            .cloned()
            .collect()
    }

    fn answer(&self, prompt: &str) -> String {
        if prompt.contains("You are CognitiveLattice") {
            return self
                .main_responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| "Understood.".to_string());
        }
        if prompt.contains("Extract atomic facts") || prompt.contains("Return ONLY a JSON array")
        {
            return self
                .scrub_responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| "[]".to_string());
        }
        if prompt.contains("Decide which of today's conversation blocks") {
            let script = self.routing_scripts.lock().unwrap().pop_front();
            return resolve_routing(script, prompt);
        }
        if prompt.contains("Should these facts be appended") {
            return self.append_response.clone();
        }
        if prompt.contains("Group these facts into semantic clusters") {
            return self
                .cluster_response
                .clone()
                .unwrap_or_else(|| "unparseable".to_string());
        }
        if prompt.contains("Summarize the following conversation block") {
            return "Block summary.".to_string();
        }
        if prompt.contains("Write a 1-2 sentence summary of the dossier") {
            return "Dossier summary.".to_string();
        }
        if prompt.contains("Produce a dense keyword-rich paraphrase") {
            return "dense search terms".to_string();
        }
        if prompt.contains("Current user profile") {
            return self
                .scribe_responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| {
                    r#"{"constraints": [], "preferences": [], "notes": []}"#.to_string()
                });
        }
        if prompt.contains("Compress this exchange") {
            return "Compressed exchange.".to_string();
        }
        "Understood.".to_string()
    }
}

/// Resolve a routing script against the block catalog in the prompt
fn resolve_routing(script: Option<RoutingScript>, prompt: &str) -> String {
    match script {
        Some(RoutingScript::Match(label)) => {
            if let Some(block_id) = find_block_id(prompt, &label) {
                format!(
                    r#"{{"matched_block_id": "{block_id}", "is_new_topic": false, "suggested_label": "{label}"}}"#
                )
            } else {
                format!(
                    r#"{{"matched_block_id": null, "is_new_topic": true, "suggested_label": "{label}"}}"#
                )
            }
        }
        Some(RoutingScript::New(label)) => format!(
            r#"{{"matched_block_id": null, "is_new_topic": true, "suggested_label": "{label}"}}"#
        ),
        None => r#"{"matched_block_id": null, "is_new_topic": true, "suggested_label": "General Discussion"}"#
            .to_string(),
    }
}

/// Extract the block id of the catalog line carrying `label`
fn find_block_id(prompt: &str, label: &str) -> Option<String> {
    for line in prompt.lines() {
        if line.starts_with("- id: ") && line.contains(&format!("| label: {label} |")) {
            let rest = line.trim_start_matches("- id: ");
            return rest.split(" |").next().map(str::to_string);
        }
    }
    None
}

#[async_trait]
impl LlmClient for TestLlm {
    fn name(&self) -> &str {
        "test-llm"
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        Ok(self.answer(prompt))
    }
}

/// LLM that always fails with an API connection error
pub struct DownLlm;

#[async_trait]
impl LlmClient for DownLlm {
    fn name(&self) -> &str {
        "down"
    }

    async fn complete(&self, _prompt: &str) -> Result<String> {
        Err(HmlrError::ApiConnection("provider unreachable".into()))
    }
}

/// Keyword-bucket embedder with a stable per-text residual axis
///
/// Texts sharing a semantic bucket score ~0.92 cosine; unrelated texts
/// score ~0. Identical texts encode identically, so round-trips hit 1.0.
pub struct BucketEmbedder {
    dims: usize,
}

const DIET_WORDS: &[&str] = &[
    "vegetarian",
    "vegan",
    "meat",
    "plant",
    "eggs",
    "dairy",
    "steak",
    "steakhouse",
    "protein",
    "fish",
];
const CODE_WORDS: &[&str] = &["python", "programming", "functional", "code"];
const CAR_WORDS: &[&str] = &[
    "car", "cars", "vehicle", "road", "trip", "suv", "sedan", "minivan", "drive", "wagon",
];

impl BucketEmbedder {
    pub fn new() -> Self {
        Self { dims: 16 }
    }

    fn encode(&self, text: &str) -> Vec<f32> {
        let lower = text.to_lowercase();
        let mut vector = vec![0.0_f32; self.dims];

        if DIET_WORDS.iter().any(|w| lower.contains(w)) {
            vector[0] = 1.0;
        }
        if CODE_WORDS.iter().any(|w| lower.contains(w)) {
            vector[1] = 1.0;
        }
        if CAR_WORDS.iter().any(|w| lower.contains(w)) {
            vector[2] = 1.0;
        }

        // Stable residual axis keyed by the full text, so different texts
        // in the same bucket are close but not identical.
        let hash = lower
            .bytes()
            .fold(0_u64, |acc, b| acc.wrapping_mul(131).wrapping_add(u64::from(b)));
        let residual = 3 + usize::try_from(hash % (self.dims as u64 - 3)).unwrap_or(0);
        vector[residual] += 0.3;

        vector
    }
}

impl Default for BucketEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingProvider for BucketEmbedder {
    fn name(&self) -> &str {
        "bucket-test"
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.encode(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}
