//! The conversation engine — one turn at a time
//!
//! Orchestrates a single user message through the nine-step pipeline:
//! chunk, scrub ∥ govern, route, back-fill facts, hydrate, generate,
//! update header, append + embed, fire the Scribe. Steps 3 through 8 are
//! all-or-nothing: any failure triggers a compensating rollback that
//! removes the turn's facts, header update, embeddings and turn rows, so
//! no fact can ever cite a block that never received its turn.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use dashmap::DashMap;
use regex::Regex;
use std::sync::LazyLock;
use tracing::{debug, error, info, warn};

use hmlr_core::ids::{next_id, today};
use hmlr_core::types::{
    BlockTurn, ConversationTurn, EngineResponse, GlobalTag, GovernorOutput, LlmMetadata,
    ResponseStatus,
};
use hmlr_core::{EmbeddingProvider, HmlrConfig, HmlrError, LlmClient, Result};
use hmlr_storage::{
    DossierStore, FactStore, LedgerStore, SqliteBackend, TurnStore, VectorIndex,
};

use crate::background::BackgroundTasks;
use crate::chunker::ChunkEngine;
use crate::dossier::DossierRouter;
use crate::gardener::{Gardener, GardeningReport};
use crate::governor::{extract_nano_keywords, Governor};
use crate::hydrator::{ContextHydrator, HydrationInput};
use crate::ledger::BridgeLedger;
use crate::profile::{ProfileStore, Scribe};
use crate::prompts;
use crate::scrubber::FactScrubber;
use crate::window::SlidingWindow;

static METADATA_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```json\s*(\{.*?\})\s*```").expect("metadata regex compiles")
});

/// The unified conversation processing engine
pub struct ConversationEngine {
    config: HmlrConfig,
    main_llm: Arc<dyn LlmClient>,
    nano_llm: Arc<dyn LlmClient>,
    _backend: SqliteBackend,
    turns: TurnStore,
    facts: FactStore,
    ledger_store: LedgerStore,
    ledger: Arc<BridgeLedger>,
    governor: Governor,
    scrubber: FactScrubber,
    gardener: Arc<Gardener>,
    index: Arc<VectorIndex>,
    hydrator: ContextHydrator,
    window: Arc<SlidingWindow>,
    profile_store: Arc<ProfileStore>,
    scribe: Arc<Scribe>,
    background: Arc<BackgroundTasks>,
    chunker: ChunkEngine,
    session_sequences: DashMap<String, u64>,
    session_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    previous_day: parking_lot::Mutex<Option<String>>,
}

impl ConversationEngine {
    /// Open the engine against the configured database path
    ///
    /// # Errors
    ///
    /// Returns fatal errors per the startup taxonomy: `Configuration`,
    /// `SchemaMismatch`, `State`.
    pub async fn new(
        config: HmlrConfig,
        main_llm: Arc<dyn LlmClient>,
        nano_llm: Arc<dyn LlmClient>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        let backend = SqliteBackend::open(&config.db_path).await?;
        Self::with_backend(config, backend, main_llm, nano_llm, embedder).await
    }

    /// Open the engine over an existing backend (tests, scratch runs)
    ///
    /// # Errors
    ///
    /// Returns fatal errors per the startup taxonomy.
    pub async fn with_backend(
        config: HmlrConfig,
        backend: SqliteBackend,
        main_llm: Arc<dyn LlmClient>,
        nano_llm: Arc<dyn LlmClient>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        let conn = backend.connection();
        let turns = TurnStore::new(conn.clone());
        let facts = FactStore::new(conn.clone());
        let ledger_store = LedgerStore::new(conn.clone());
        let dossier_store = DossierStore::new(conn.clone());
        let index = Arc::new(VectorIndex::new(conn, embedder).await?);

        let router = Arc::new(DossierRouter::new(
            dossier_store,
            Arc::clone(&index),
            Arc::clone(&nano_llm),
            config.theta_dos,
            config.h_match,
            config.theta_match,
            config.dossier_top_k,
        ));

        let ledger = Arc::new(BridgeLedger::new(
            ledger_store.clone(),
            Arc::clone(&nano_llm),
        ));

        let governor = Governor::new(
            Arc::clone(&nano_llm),
            Arc::clone(&index),
            turns.clone(),
            ledger_store.clone(),
            facts.clone(),
            Arc::clone(&router),
            config.k_mem,
            config.theta_mem,
            config.t_gov,
        );

        let scrubber = FactScrubber::new(
            Arc::clone(&nano_llm),
            facts.clone(),
            config.scrub_window_tokens,
            config.scrub_overlap_tokens,
        );

        let gardener = Arc::new(Gardener::new(
            ledger_store.clone(),
            turns.clone(),
            facts.clone(),
            Arc::clone(&index),
            Arc::clone(&nano_llm),
            Arc::clone(&router),
        ));

        let window = Arc::new(SlidingWindow::load(
            config.window_state_path.clone(),
            config.window_capacity,
            config.window_verbatim_depth,
        )?);

        let profile_store = Arc::new(ProfileStore::new(config.profile_path.clone()));
        let scribe = Arc::new(Scribe::new(
            Arc::clone(&nano_llm),
            Arc::clone(&profile_store),
        ));

        Ok(Self {
            config,
            main_llm,
            nano_llm,
            _backend: backend,
            turns,
            facts,
            ledger_store,
            ledger,
            governor,
            scrubber,
            gardener,
            index,
            hydrator: ContextHydrator::new(),
            window,
            profile_store,
            scribe,
            background: Arc::new(BackgroundTasks::new()),
            chunker: ChunkEngine::new(),
            session_sequences: DashMap::new(),
            session_locks: DashMap::new(),
            previous_day: parking_lot::Mutex::new(None),
        })
    }

    /// Process one user message end to end
    ///
    /// Never panics and never returns `Err`: failures surface as an
    /// `ERROR` envelope and the turn's writes are rolled back.
    pub async fn process_user_message(
        &self,
        user_query: &str,
        session_id: &str,
    ) -> EngineResponse {
        let start = Instant::now();

        // Turns are serialized per session: turn n+1 cannot start until
        // turn n has fully committed or rolled back.
        let lock = self
            .session_locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _turn_guard = lock.lock().await;

        let mut response = match self.handle_chat(user_query, session_id).await {
            Ok(text) => EngineResponse {
                text,
                status: ResponseStatus::Success,
                processing_time_ms: 0,
                error: None,
            },
            Err(HmlrError::ApiConnection(detail)) => {
                error!("Chat API connection failed: {detail}");
                EngineResponse::error(
                    "I apologize, but I'm having trouble connecting to my brain right now. \
                     Please try again in a moment.",
                    detail,
                )
            }
            Err(e) => {
                error!("Error processing message: {e}");
                EngineResponse::error("I encountered an error processing your request.", e.to_string())
            }
        };

        response.processing_time_ms =
            u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        response
    }

    /// The nine-step pipeline; returns the user-visible response text
    async fn handle_chat(&self, user_query: &str, session_id: &str) -> Result<String> {
        let day_id = today();
        self.on_day_boundary(&day_id);

        // Step 1: mint the turn id and chunk the user text.
        let turn_id = next_id("turn");
        let chunks = self.chunker.chunk_turn(user_query, &turn_id, None);
        debug!("Turn {turn_id}: {} chunks", chunks.len());

        // Step 2: fact extraction runs concurrently with the Governor.
        let (scrub_result, governor_output): (Result<_>, GovernorOutput) = tokio::join!(
            self.scrubber
                .extract_and_save(&turn_id, user_query, &chunks, None),
            self.governor.govern(user_query, &day_id),
        );

        // Step 3: apply the routing scenario.
        let keywords = extract_nano_keywords(user_query);
        let routing = self
            .ledger
            .apply_routing(&day_id, &governor_output.routing, keywords)
            .await;
        let (block_id, is_new_topic, scenario) = match routing {
            Ok(resolved) => resolved,
            Err(e) => {
                self.rollback_turn(&turn_id, None, None).await;
                return Err(e);
            }
        };
        info!("Turn {turn_id} routed to {block_id} ({scenario:?})");

        // Step 4: back-fill the extracted facts' block assignment.
        let extracted = match scrub_result {
            Ok(facts) => facts,
            Err(e) => {
                self.rollback_turn(&turn_id, Some(&block_id), None).await;
                return Err(e);
            }
        };
        if !extracted.is_empty() {
            if let Err(e) = self.facts.update_facts_block_id(&turn_id, &block_id).await {
                self.rollback_turn(&turn_id, Some(&block_id), None).await;
                return Err(e);
            }
            debug!("Linked {} facts to block {block_id}", extracted.len());
        }

        // Step 5: hydrate the prompt.
        let hydration_reads = async {
            let block = self.ledger.get_block(&block_id).await?;
            let block_metadata = self.ledger_store.get_metadata(&block_id).await?;
            let block_facts = self.facts.facts_for_block(&block_id).await?;
            let profile = self.profile_store.load()?;
            let memory_block_tags = self.load_memory_block_tags(&governor_output).await?;
            Ok::<_, HmlrError>((block, block_metadata, block_facts, profile, memory_block_tags))
        };
        let (block, block_metadata, block_facts, profile, memory_block_tags) =
            match hydration_reads.await {
                Ok(loaded) => loaded,
                Err(e) => {
                    self.rollback_turn(&turn_id, Some(&block_id), None).await;
                    return Err(e);
                }
            };
        let prior_metadata = block.header.metadata.clone();

        let prompt = self.hydrator.hydrate(&HydrationInput {
            system_prompt: prompts::CHAT_SYSTEM_PROMPT,
            profile: &profile,
            block: &block,
            block_metadata: &block_metadata,
            facts: &block_facts,
            memories: &governor_output.memories,
            memory_block_tags: &memory_block_tags,
            dossiers: &governor_output.dossiers,
            user_message: user_query,
            is_new_topic,
            verbatim_depth: self.config.window_verbatim_depth,
        });
        debug!("Hydrated prompt: {} chars", prompt.len());

        // Step 6: main generation (fail-closed).
        let raw_response = match self.main_llm.complete(&prompt).await {
            Ok(response) => response,
            Err(e) => {
                self.rollback_turn(&turn_id, Some(&block_id), None).await;
                return Err(e);
            }
        };

        // Parse and strip the optional metadata block.
        let (response_text, metadata) = parse_metadata_block(&raw_response);

        // Step 7: header update, skipped on parse error.
        match metadata {
            Some(LlmMetadata::Parsed { fields }) => {
                if let Err(e) = self.ledger.update_block_metadata(&block_id, &fields).await {
                    self.rollback_turn(&turn_id, Some(&block_id), Some(&prior_metadata))
                        .await;
                    return Err(e);
                }
            }
            Some(LlmMetadata::ParseError { raw_text }) => {
                warn!("Metadata block unparseable, skipping header update: {raw_text:?}");
            }
            None => {}
        }

        // Step 8: append the turn; this is the commit point.
        let turn_sequence = match self.next_sequence(session_id).await {
            Ok(sequence) => sequence,
            Err(e) => {
                self.rollback_turn(&turn_id, Some(&block_id), Some(&prior_metadata))
                    .await;
                return Err(e);
            }
        };
        let block_turn = BlockTurn {
            turn_id: turn_id.clone(),
            turn_sequence,
            timestamp: Utc::now(),
            user_message: user_query.to_string(),
            assistant_response: response_text.clone(),
        };

        let mut turn = ConversationTurn::new(
            session_id.to_string(),
            day_id,
            turn_sequence,
            user_query.to_string(),
            response_text.clone(),
        );
        turn.turn_id = turn_id.clone();

        let persisted = async {
            self.turns.insert_turn(&turn, &chunks).await?;
            self.ledger
                .append_turn_to_block(&block_id, block_turn)
                .await
        };
        if let Err(e) = persisted.await {
            self.rollback_turn(&turn_id, Some(&block_id), Some(&prior_metadata))
                .await;
            return Err(HmlrError::StorageWrite(format!(
                "turn persistence failed for session {session_id}: {e}"
            )));
        }

        // Committed. Window and embeddings are best-effort from here on.
        if let Err(e) = self.window.add_turn(turn) {
            warn!("Sliding window update failed: {e}");
        }
        self.embed_user_text(&turn_id, user_query, &chunks).await;

        // Step 9: fire-and-forget the Scribe and window compression.
        self.spawn_background_tasks(user_query, session_id);

        Ok(response_text)
    }

    /// Embed the user text only: the full turn plus each sentence chunk
    async fn embed_user_text(
        &self,
        turn_id: &str,
        user_query: &str,
        chunks: &[hmlr_core::types::Chunk],
    ) {
        if let Err(e) = self.index.put_memory(turn_id, turn_id, user_query).await {
            warn!("Turn embedding failed for {turn_id}: {e}");
        }
        for chunk in chunks
            .iter()
            .filter(|c| c.chunk_type == hmlr_core::types::ChunkType::Sentence)
        {
            if let Err(e) = self
                .index
                .put_memory(&chunk.chunk_id, turn_id, &chunk.text_verbatim)
                .await
            {
                warn!("Chunk embedding failed for {}: {e}", chunk.chunk_id);
            }
        }
    }

    /// Compensating rollback for an invalidated turn
    async fn rollback_turn(
        &self,
        turn_id: &str,
        block_id: Option<&str>,
        prior_metadata: Option<&serde_json::Value>,
    ) {
        warn!("Rolling back turn {turn_id}");

        if let Err(e) = self.facts.delete_facts_for_turn(turn_id).await {
            error!("Rollback: fact removal failed for {turn_id}: {e}");
        }
        if let Err(e) = self.index.delete_memory_for_turn(turn_id).await {
            error!("Rollback: embedding removal failed for {turn_id}: {e}");
        }
        if let Err(e) = self.turns.delete_turn(turn_id).await {
            error!("Rollback: turn removal failed for {turn_id}: {e}");
        }

        if let (Some(block_id), Some(prior)) = (block_id, prior_metadata) {
            match self.ledger_store.get_block(block_id).await {
                Ok(mut block) => {
                    block.header.metadata = prior.clone();
                    if let Err(e) = self.ledger_store.save_block(&block).await {
                        error!("Rollback: header restore failed for {block_id}: {e}");
                    }
                }
                Err(e) => error!("Rollback: cannot load block {block_id}: {e}"),
            }
        }
    }

    /// Global tags for every block referenced by memory hits
    async fn load_memory_block_tags(
        &self,
        output: &GovernorOutput,
    ) -> Result<HashMap<String, Vec<GlobalTag>>> {
        let mut tags = HashMap::new();
        for hit in &output.memories {
            if let Some(block_id) = &hit.block_id {
                if !tags.contains_key(block_id) {
                    let metadata = self.ledger_store.get_metadata(block_id).await?;
                    tags.insert(block_id.clone(), metadata.global_tags);
                }
            }
        }
        Ok(tags)
    }

    /// Monotonic per-session sequence, seeded from storage
    async fn next_sequence(&self, session_id: &str) -> Result<u64> {
        if !self.session_sequences.contains_key(session_id) {
            let persisted = self.turns.max_sequence(session_id).await?;
            self.session_sequences
                .entry(session_id.to_string())
                .or_insert(persisted);
        }

        let mut entry = self
            .session_sequences
            .get_mut(session_id)
            .expect("sequence entry present");
        *entry += 1;
        Ok(*entry)
    }

    fn spawn_background_tasks(&self, user_query: &str, session_id: &str) {
        let scribe = Arc::clone(&self.scribe);
        let query = user_query.to_string();
        self.background
            .spawn(&format!("scribe_{session_id}"), async move {
                if let Err(e) = scribe.update_from(&query).await {
                    warn!("Scribe task failed: {e}");
                }
            });

        let window = Arc::clone(&self.window);
        let llm = Arc::clone(&self.nano_llm);
        self.background.spawn("window_compression", async move {
            if let Err(e) = window.compress_aged(&llm).await {
                warn!("Window compression failed: {e}");
            }
        });
    }

    /// Auto-close stale paused blocks when the day rolls over
    fn on_day_boundary(&self, day_id: &str) {
        let mut previous = self.previous_day.lock();
        let changed = previous.as_deref() != Some(day_id);
        if !changed {
            return;
        }
        let last_day = previous.replace(day_id.to_string());
        drop(previous);

        if let Some(last_day) = last_day {
            info!("Day changed from {last_day} to {day_id}");
            if self.config.auto_close_paused_after_day {
                let ledger = Arc::clone(&self.ledger);
                let current = day_id.to_string();
                self.background.spawn("auto_close_paused", async move {
                    if let Err(e) = ledger.close_stale_paused(&last_day, &current).await {
                        warn!("Auto-close of paused blocks failed: {e}");
                    }
                });
            }
        }
    }

    /// Run the Gardener over every pending closed block
    ///
    /// # Errors
    ///
    /// Returns the first storage error encountered.
    pub async fn garden_now(&self) -> Result<Vec<GardeningReport>> {
        self.gardener.process_pending().await
    }

    /// The Gardener (manual promotion of specific blocks)
    #[must_use]
    pub fn gardener(&self) -> &Gardener {
        &self.gardener
    }

    /// The Bridge Block ledger
    #[must_use]
    pub fn ledger(&self) -> &BridgeLedger {
        &self.ledger
    }

    /// The sliding window
    #[must_use]
    pub fn window(&self) -> &SlidingWindow {
        &self.window
    }

    /// The user profile store
    #[must_use]
    pub fn profile_store(&self) -> &ProfileStore {
        &self.profile_store
    }

    /// Wait for in-flight background tasks (Scribe, compression) to finish
    pub async fn wait_for_background(&self) {
        self.background.wait_idle(self.config.t_drain).await;
    }

    /// Drain background tasks within the configured budget
    pub async fn shutdown(&self) {
        info!("Engine shutting down");
        self.background.drain(self.config.t_drain).await;
    }
}

/// Split a response into user-visible text and the optional metadata block
fn parse_metadata_block(response: &str) -> (String, Option<LlmMetadata>) {
    let Some(captures) = METADATA_BLOCK.captures(response) else {
        return (response.trim().to_string(), None);
    };

    let raw = captures.get(1).map_or("", |m| m.as_str());
    let stripped = METADATA_BLOCK.replace(response, "").trim().to_string();

    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(fields)) => {
            (stripped, Some(LlmMetadata::Parsed { fields }))
        }
        _ => (
            stripped,
            Some(LlmMetadata::ParseError {
                raw_text: raw.to_string(),
            }),
        ),
    }
}
