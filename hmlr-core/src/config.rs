//! Runtime configuration for the HMLR engine
//!
//! Every engine tunable lives here, with environment overrides for the
//! two file locations. Construction never touches the filesystem;
//! validation happens when the paths are first used.

use std::path::PathBuf;
use std::time::Duration;

/// Environment variable overriding the database location
pub const ENV_DB_PATH: &str = "HMLR_DB_PATH";

/// Environment variable overriding the sliding-window state file
pub const ENV_WINDOW_STATE_PATH: &str = "HMLR_WINDOW_STATE_PATH";

/// Engine configuration
///
/// Defaults follow the reference deployment; tests use [`HmlrConfig::for_testing`]
/// with paths inside a temp directory.
#[derive(Debug, Clone)]
pub struct HmlrConfig {
    /// Location of the libsql database file
    pub db_path: PathBuf,

    /// Location of the sliding-window state file
    pub window_state_path: PathBuf,

    /// Location of the user-profile file
    pub profile_path: PathBuf,

    /// Memory-retrieval result budget
    pub k_mem: usize,

    /// Memory-retrieval similarity threshold
    pub theta_mem: f32,

    /// Dossier fact-vote similarity threshold
    pub theta_dos: f32,

    /// Minimum fact votes before an APPEND is considered
    pub h_match: usize,

    /// Minimum best-vote similarity before an APPEND is considered
    pub theta_match: f32,

    /// Dossier retrieval vote budget
    pub dossier_top_k: usize,

    /// Per-task deadline inside the Governor
    pub t_gov: Duration,

    /// Shutdown drain budget for background tasks
    pub t_drain: Duration,

    /// Maximum turns kept in the sliding window
    pub window_capacity: usize,

    /// Most-recent turns rendered verbatim; older ones compressed
    pub window_verbatim_depth: usize,

    /// Scrubber content-window size in tokens
    pub scrub_window_tokens: usize,

    /// Scrubber window overlap in tokens
    pub scrub_overlap_tokens: usize,

    /// Close paused blocks once their day has passed
    pub auto_close_paused_after_day: bool,
}

impl Default for HmlrConfig {
    fn default() -> Self {
        let home = dirs_home();
        Self {
            db_path: env_path(ENV_DB_PATH)
                .unwrap_or_else(|| home.join(".hmlr").join("cognitive_lattice_memory.db")),
            window_state_path: env_path(ENV_WINDOW_STATE_PATH)
                .unwrap_or_else(|| home.join(".hmlr").join("sliding_window_state.json")),
            profile_path: home.join(".hmlr").join("user_profile.json"),
            k_mem: 8,
            theta_mem: 0.35,
            theta_dos: 0.4,
            h_match: 2,
            theta_match: 0.5,
            dossier_top_k: 10,
            t_gov: Duration::from_secs(5),
            t_drain: Duration::from_secs(30),
            window_capacity: 20,
            window_verbatim_depth: 6,
            scrub_window_tokens: 10_000,
            scrub_overlap_tokens: 500,
            auto_close_paused_after_day: false,
        }
    }
}

impl HmlrConfig {
    /// Configuration rooted inside `dir` (for tests and scratch runs)
    #[must_use]
    pub fn for_testing(dir: &std::path::Path) -> Self {
        Self {
            db_path: dir.join("hmlr_test.db"),
            window_state_path: dir.join("sliding_window_state.json"),
            profile_path: dir.join("user_profile.json"),
            ..Self::default()
        }
    }

    /// Override the database path
    #[must_use]
    pub fn with_db_path(mut self, path: PathBuf) -> Self {
        self.db_path = path;
        self
    }

    /// Override the dossier voting thresholds
    #[must_use]
    pub const fn with_dossier_thresholds(
        mut self,
        theta_dos: f32,
        h_match: usize,
        theta_match: f32,
    ) -> Self {
        self.theta_dos = theta_dos;
        self.h_match = h_match;
        self.theta_match = theta_match;
        self
    }

    /// Override the Governor per-task deadline
    #[must_use]
    pub const fn with_governor_timeout(mut self, t_gov: Duration) -> Self {
        self.t_gov = t_gov;
        self
    }
}

fn env_path(var: &str) -> Option<PathBuf> {
    std::env::var_os(var).map(PathBuf::from)
}

fn dirs_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}
