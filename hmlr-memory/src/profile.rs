//! User profile store and the Scribe
//!
//! The profile is a small JSON file rewritten atomically (temp file then
//! rename). The Scribe is a fire-and-forget background task that asks the
//! nano model for profile deltas after each turn and merges them in.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use hmlr_core::{LlmClient, Result};

use crate::prompts;

/// A durable user constraint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    /// Human-readable description
    pub description: String,
    /// `strict` constraints are rendered immutable in prompts
    #[serde(default = "default_severity")]
    pub severity: String,
}

fn default_severity() -> String {
    "advisory".to_string()
}

impl Constraint {
    /// Whether the hydrator must mark this constraint immutable
    #[must_use]
    pub fn is_strict(&self) -> bool {
        self.severity.eq_ignore_ascii_case("strict")
    }
}

/// The persistent user profile
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserProfile {
    /// Constraints, rendered first and strict-marked
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    /// Standing preferences
    #[serde(default)]
    pub preferences: Vec<String>,
    /// Free-form notes
    #[serde(default)]
    pub notes: Vec<String>,
}

impl UserProfile {
    /// Merge a delta, skipping entries already present
    pub fn merge(&mut self, delta: &UserProfile) -> usize {
        let mut added = 0;
        for constraint in &delta.constraints {
            if !self
                .constraints
                .iter()
                .any(|c| c.description == constraint.description)
            {
                self.constraints.push(constraint.clone());
                added += 1;
            }
        }
        for preference in &delta.preferences {
            if !self.preferences.contains(preference) {
                self.preferences.push(preference.clone());
                added += 1;
            }
        }
        for note in &delta.notes {
            if !self.notes.contains(note) {
                self.notes.push(note.clone());
                added += 1;
            }
        }
        added
    }
}

/// Atomic-rename JSON store for the user profile
pub struct ProfileStore {
    path: PathBuf,
}

impl ProfileStore {
    /// Create a store at `path`; the file may not exist yet
    #[must_use]
    pub const fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Load the profile; a missing file reads as the empty profile
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::Io`] or [`HmlrError::Serialization`] when the
    /// file exists but cannot be read.
    pub fn load(&self) -> Result<UserProfile> {
        if !self.path.exists() {
            return Ok(UserProfile::default());
        }
        let text = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Rewrite the profile atomically (temp file, then rename)
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::Io`] on filesystem failure.
    pub fn save(&self, profile: &UserProfile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let temp = self.path.with_extension("tmp");
        std::fs::write(&temp, serde_json::to_string_pretty(profile)?)?;
        std::fs::rename(&temp, &self.path)?;
        debug!("Profile saved to {}", self.path.display());
        Ok(())
    }
}

/// Background profile updater
pub struct Scribe {
    llm: Arc<dyn LlmClient>,
    store: Arc<ProfileStore>,
}

impl Scribe {
    /// Create a scribe over the nano model and the profile store
    #[must_use]
    pub const fn new(llm: Arc<dyn LlmClient>, store: Arc<ProfileStore>) -> Self {
        Self { llm, store }
    }

    /// Ask the model for profile deltas from `user_text` and merge them
    ///
    /// Failures are logged and swallowed; the profile on disk is only
    /// touched when a delta actually adds something.
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::Io`] only when a merged profile cannot be
    /// persisted.
    pub async fn update_from(&self, user_text: &str) -> Result<usize> {
        let profile = self.store.load()?;
        let profile_json = serde_json::to_string(&profile)?;

        let response = match self
            .llm
            .complete(&prompts::scribe_prompt(user_text, &profile_json))
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("Scribe LLM call failed: {e}");
                return Ok(0);
            }
        };

        let Some(delta) = parse_profile_delta(&response) else {
            warn!("Scribe response unparseable, skipping profile update");
            return Ok(0);
        };

        let mut merged = profile;
        let added = merged.merge(&delta);
        if added > 0 {
            self.store.save(&merged)?;
            info!("Scribe added {added} profile entr(ies)");
        }
        Ok(added)
    }
}

fn parse_profile_delta(response: &str) -> Option<UserProfile> {
    let start = response.find('{')?;
    let end = response.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&response[start..=end]).ok()
}
