//! Sliding window — the recent-turn buffer persisted between sessions
//!
//! State lives in a versioned JSON file rewritten atomically after every
//! turn. A missing file means an empty window; a version mismatch is a
//! fatal [`HmlrError::State`] and is never auto-repaired.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use hmlr_core::types::{ConversationTurn, DetailLevel};
use hmlr_core::{HmlrError, LlmClient, Result};

use crate::prompts;

/// On-disk state format version
pub const STATE_VERSION: &str = "1";

#[derive(Debug, Serialize, Deserialize)]
struct WindowState {
    version: String,
    last_updated: String,
    turn_count: usize,
    turns: Vec<ConversationTurn>,
}

/// Capacity-bounded recent-turn buffer with atomic persistence
#[derive(Debug)]
pub struct SlidingWindow {
    path: PathBuf,
    capacity: usize,
    verbatim_depth: usize,
    turns: Mutex<Vec<ConversationTurn>>,
}

impl SlidingWindow {
    /// Load the window from its state file
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::State`] when the file exists but is
    /// unreadable, unparseable or version-mismatched.
    pub fn load(path: PathBuf, capacity: usize, verbatim_depth: usize) -> Result<Self> {
        let turns = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| HmlrError::State(format!("cannot read window state: {e}")))?;
            let state: WindowState = serde_json::from_str(&text)
                .map_err(|e| HmlrError::State(format!("cannot parse window state: {e}")))?;

            if state.version != STATE_VERSION {
                return Err(HmlrError::State(format!(
                    "window state version mismatch (found={}, expected={STATE_VERSION})",
                    state.version
                )));
            }

            info!("Loaded sliding window state: {} turns", state.turns.len());
            state.turns
        } else {
            debug!("No saved window state found, starting fresh");
            Vec::new()
        };

        Ok(Self {
            path,
            capacity,
            verbatim_depth,
            turns: Mutex::new(turns),
        })
    }

    /// Append a turn, evict past capacity, persist
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::Io`] when the state file cannot be written.
    pub fn add_turn(&self, turn: ConversationTurn) -> Result<()> {
        {
            let mut turns = self.turns.lock();
            turns.push(turn);
            let len = turns.len();
            if len > self.capacity {
                turns.drain(0..len - self.capacity);
            }
        }
        self.save()
    }

    /// Current window contents, oldest first
    #[must_use]
    pub fn turns(&self) -> Vec<ConversationTurn> {
        self.turns.lock().clone()
    }

    /// Number of turns currently held
    #[must_use]
    pub fn len(&self) -> usize {
        self.turns.lock().len()
    }

    /// Whether the window is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.turns.lock().is_empty()
    }

    /// Drop all turns and remove the state file
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::Io`] if the file cannot be removed.
    pub fn clear(&self) -> Result<()> {
        self.turns.lock().clear();
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    /// Compress turns older than the verbatim depth via the nano model
    ///
    /// Failures leave the affected turn verbatim; the window is persisted
    /// when anything changed.
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::Io`] when the state file cannot be written.
    pub async fn compress_aged(&self, llm: &Arc<dyn LlmClient>) -> Result<usize> {
        let candidates: Vec<ConversationTurn> = {
            let turns = self.turns.lock();
            let cutoff = turns.len().saturating_sub(self.verbatim_depth);
            turns
                .iter()
                .take(cutoff)
                .filter(|t| t.detail_level == DetailLevel::Verbatim)
                .cloned()
                .collect()
        };

        let mut compressed = 0;
        for turn in candidates {
            match llm
                .complete(&prompts::compression_prompt(
                    &turn.user_message,
                    &turn.assistant_response,
                ))
                .await
            {
                Ok(summary) => {
                    let mut turns = self.turns.lock();
                    if let Some(stored) = turns.iter_mut().find(|t| t.turn_id == turn.turn_id) {
                        stored.detail_level = DetailLevel::Compressed;
                        stored.compressed_content = Some(summary.trim().to_string());
                        compressed += 1;
                    }
                }
                Err(e) => {
                    warn!("Compression failed for {}: {e}; keeping verbatim", turn.turn_id);
                }
            }
        }

        if compressed > 0 {
            self.save()?;
        }
        Ok(compressed)
    }

    /// Persist the window atomically (temp file, then rename)
    fn save(&self) -> Result<()> {
        let turns = self.turns.lock().clone();
        let state = WindowState {
            version: STATE_VERSION.to_string(),
            last_updated: Utc::now().to_rfc3339(),
            turn_count: turns.len(),
            turns,
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let temp = self.path.with_extension("tmp");
        std::fs::write(&temp, serde_json::to_string_pretty(&state)?)?;
        std::fs::rename(&temp, &self.path)?;
        debug!("Saved sliding window state: {} turns", state.turn_count);
        Ok(())
    }
}
