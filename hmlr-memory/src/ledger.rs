//! Bridge Block ledger — the in-flight topic state machine
//!
//! Transitions are `ACTIVE → PAUSED → CLOSED`, caused only by routing
//! (Governor results applied here) or the Gardener. All transitions for a
//! day run under that day's lock, so "at most one ACTIVE block per day"
//! holds even when two sessions target the same day.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use hmlr_core::types::{
    BlockStatus, BlockTurn, BridgeBlock, RoutingDecision, RoutingScenario,
};
use hmlr_core::{HmlrError, LlmClient, Result};
use hmlr_storage::LedgerStore;

use crate::prompts;

/// The Bridge Block state machine
pub struct BridgeLedger {
    store: LedgerStore,
    llm: Arc<dyn LlmClient>,
    day_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl BridgeLedger {
    /// Create a ledger over the store and the summary model
    #[must_use]
    pub fn new(store: LedgerStore, llm: Arc<dyn LlmClient>) -> Self {
        Self {
            store,
            llm,
            day_locks: DashMap::new(),
        }
    }

    fn day_lock(&self, day_id: &str) -> Arc<Mutex<()>> {
        self.day_locks
            .entry(day_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Fetch a block
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::NotFound`] if absent.
    pub async fn get_block(&self, block_id: &str) -> Result<BridgeBlock> {
        self.store.get_block(block_id).await
    }

    /// All blocks of a day, oldest first
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::StorageRead`] on query failure.
    pub async fn blocks_for_day(&self, day_id: &str) -> Result<Vec<BridgeBlock>> {
        self.store.blocks_for_day(day_id).await
    }

    /// Apply a routing decision, returning the block to continue in
    ///
    /// Resolves the decision to one of the five scenarios and performs
    /// the corresponding transitions under the day lock.
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::StorageWrite`] if a transition cannot be
    /// persisted.
    pub async fn apply_routing(
        &self,
        day_id: &str,
        decision: &RoutingDecision,
        keywords: Vec<String>,
    ) -> Result<(String, bool, RoutingScenario)> {
        let lock = self.day_lock(day_id);
        let _guard = lock.lock().await;

        let active = self.store.active_block(day_id).await?;

        if let Some(matched_id) = &decision.matched_block_id {
            if active.as_ref().is_some_and(|b| &b.block_id == matched_id) {
                // Continuation: no status change.
                debug!("Routing: continuation of {matched_id}");
                return Ok((matched_id.clone(), false, RoutingScenario::Continuation));
            }

            if !decision.is_new_topic {
                match self.store.get_block(matched_id).await {
                    Ok(matched) if matched.status == BlockStatus::Paused => {
                        info!("Routing: resumption of {matched_id}");
                        if let Some(previous) = active {
                            self.transition(previous, BlockStatus::Paused).await?;
                        }
                        self.set_active(matched).await?;
                        return Ok((matched_id.clone(), false, RoutingScenario::Resumption));
                    }
                    Ok(matched) => {
                        // Closed blocks never become active again; fall through.
                        warn!(
                            "Routing matched block {matched_id} in state {}, falling back",
                            matched.status.as_str()
                        );
                    }
                    Err(HmlrError::NotFound(_)) => {
                        warn!("Routing matched unknown block {matched_id}, falling back");
                    }
                    Err(e) => return Err(e),
                }

                let block_id = self
                    .create_active_locked(day_id, decision.suggested_label.clone(), keywords, active)
                    .await?;
                return Ok((block_id, true, RoutingScenario::Fallback));
            }
        }

        if decision.is_new_topic {
            let scenario = if active.is_some() {
                RoutingScenario::Shift
            } else {
                RoutingScenario::NewFirst
            };
            let block_id = self
                .create_active_locked(day_id, decision.suggested_label.clone(), keywords, active)
                .await?;
            return Ok((block_id, true, scenario));
        }

        // Indeterminate decision: no match and not flagged as new.
        warn!("Routing indeterminate, defensively creating a new block");
        let block_id = self
            .create_active_locked(day_id, decision.suggested_label.clone(), keywords, active)
            .await?;
        Ok((block_id, true, RoutingScenario::Fallback))
    }

    /// Create a new `ACTIVE` block, pausing the prior active one
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::StorageWrite`] on failure.
    pub async fn create_active_block(
        &self,
        day_id: &str,
        topic_label: String,
        keywords: Vec<String>,
    ) -> Result<String> {
        let lock = self.day_lock(day_id);
        let _guard = lock.lock().await;
        let active = self.store.active_block(day_id).await?;
        self.create_active_locked(day_id, topic_label, keywords, active)
            .await
    }

    async fn create_active_locked(
        &self,
        day_id: &str,
        topic_label: String,
        keywords: Vec<String>,
        active: Option<BridgeBlock>,
    ) -> Result<String> {
        if let Some(previous) = active {
            self.transition(previous, BlockStatus::Paused).await?;
        }

        let block = BridgeBlock::new(day_id.to_string(), topic_label, keywords);
        let block_id = block.block_id.clone();
        self.store.insert_block(&block).await?;
        info!("Routing: created active block {block_id} for {day_id}");
        Ok(block_id)
    }

    /// Append a turn to an `ACTIVE` block
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::InvalidInput`] if the block is not active or
    /// the sequence number does not increase.
    pub async fn append_turn_to_block(&self, block_id: &str, turn: BlockTurn) -> Result<()> {
        let day_id = self.store.get_block(block_id).await?.day_id;
        let lock = self.day_lock(&day_id);
        let _guard = lock.lock().await;

        let mut block = self.store.get_block(block_id).await?;

        if block.status != BlockStatus::Active {
            return Err(HmlrError::InvalidInput(format!(
                "cannot append to block {block_id} in state {}",
                block.status.as_str()
            )));
        }

        if let Some(last) = block.turns.last() {
            if turn.turn_sequence <= last.turn_sequence {
                return Err(HmlrError::InvalidInput(format!(
                    "turn_sequence {} does not increase past {}",
                    turn.turn_sequence, last.turn_sequence
                )));
            }
        }

        block.turns.push(turn);
        block.last_updated = Utc::now();
        self.store.save_block(&block).await
    }

    /// Merge metadata fields into a block's header (idempotent)
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::StorageWrite`] on failure.
    pub async fn update_block_metadata(
        &self,
        block_id: &str,
        fields: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let day_id = self.store.get_block(block_id).await?.day_id;
        let lock = self.day_lock(&day_id);
        let _guard = lock.lock().await;

        let mut block = self.store.get_block(block_id).await?;

        if let Some(existing) = block.header.metadata.as_object_mut() {
            existing.extend(fields.clone());
        } else {
            block.header.metadata = serde_json::Value::Object(fields.clone());
        }
        block.last_updated = Utc::now();
        self.store.save_block(&block).await
    }

    /// Close a block (from `ACTIVE` or `PAUSED`)
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::InvalidInput`] if the block is already closed.
    pub async fn close_block(&self, block_id: &str) -> Result<()> {
        let block = self.store.get_block(block_id).await?;
        let lock = self.day_lock(&block.day_id);
        let _guard = lock.lock().await;

        // Re-read under the lock.
        let block = self.store.get_block(block_id).await?;
        if block.status == BlockStatus::Closed {
            return Ok(());
        }
        self.transition(block, BlockStatus::Closed).await
    }

    /// Close paused blocks whose day has passed
    ///
    /// Only invoked when `auto_close_paused_after_day` is configured.
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::StorageWrite`] on failure.
    pub async fn close_stale_paused(&self, day_id: &str, current_day: &str) -> Result<usize> {
        if day_id >= current_day {
            return Ok(0);
        }

        let lock = self.day_lock(day_id);
        let _guard = lock.lock().await;

        let mut closed = 0;
        for block in self.store.blocks_for_day(day_id).await? {
            if block.status == BlockStatus::Paused {
                self.transition(block, BlockStatus::Closed).await?;
                closed += 1;
            }
        }
        Ok(closed)
    }

    /// Generate (or regenerate) a block's header summary
    ///
    /// Failure leaves the summary empty and sets the repair flag; the
    /// block keeps its state either way.
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::StorageWrite`] if the block cannot be saved.
    pub async fn generate_block_summary(&self, block_id: &str) -> Result<()> {
        let mut block = self.store.get_block(block_id).await?;
        self.fill_summary(&mut block).await;
        self.store.save_block(&block).await
    }

    /// Transition a block, generating a summary when leaving `ACTIVE`
    async fn transition(&self, mut block: BridgeBlock, to: BlockStatus) -> Result<()> {
        let from = block.status;
        block.status = to;
        block.last_updated = Utc::now();

        if from == BlockStatus::Active && block.header.summary.is_empty() {
            self.fill_summary(&mut block).await;
        }

        debug!(
            "Block {} transition {} -> {}",
            block.block_id,
            from.as_str(),
            to.as_str()
        );
        self.store.save_block(&block).await
    }

    async fn set_active(&self, mut block: BridgeBlock) -> Result<()> {
        block.status = BlockStatus::Active;
        block.last_updated = Utc::now();
        self.store.save_block(&block).await
    }

    async fn fill_summary(&self, block: &mut BridgeBlock) {
        match self
            .llm
            .complete(&prompts::block_summary_prompt(block))
            .await
        {
            Ok(summary) => {
                block.header.summary = summary.trim().to_string();
                block.header.needs_summary_repair = false;
            }
            Err(e) => {
                warn!(
                    "Summary generation failed for block {}: {e}; flagging for repair",
                    block.block_id
                );
                block.header.summary = String::new();
                block.header.needs_summary_repair = true;
            }
        }
    }
}
