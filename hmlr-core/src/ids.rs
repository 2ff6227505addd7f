//! Human-readable identifier generation
//!
//! Every persistent entity id has the shape `<prefix>_<timestamp>_<counter>`,
//! e.g. `turn_20260801_142233_007`. The counter disambiguates ids minted
//! within the same second and is monotonic for the process lifetime.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;

use chrono::Utc;

/// Monotonic id generator
///
/// Thread-safe; a single process-wide instance is exposed through
/// [`next_id`]. Tests construct their own instances to get predictable
/// counters.
#[derive(Debug, Default)]
pub struct IdGenerator {
    counter: AtomicU64,
}

impl IdGenerator {
    /// Create a generator with the counter at zero
    #[must_use]
    pub const fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }

    /// Mint the next id for `prefix`
    pub fn next(&self, prefix: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!(
            "{prefix}_{}_{:03}",
            Utc::now().format("%Y%m%d_%H%M%S"),
            n % 1000
        )
    }
}

static GLOBAL: LazyLock<IdGenerator> = LazyLock::new(IdGenerator::new);

/// Mint an id from the process-wide generator
#[must_use]
pub fn next_id(prefix: &str) -> String {
    GLOBAL.next(prefix)
}

/// Derive the `day_id` (YYYY-MM-DD, UTC) for the current moment
#[must_use]
pub fn today() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

/// Mint a session identifier
///
/// Sessions are not persistent entities, so they get a collision-free
/// UUID rather than a ledger-style id.
#[must_use]
pub fn new_session_id() -> String {
    format!("session_{}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_shape() {
        let ids = IdGenerator::new();
        let id = ids.next("turn");
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "turn");
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2].len(), 6);
        assert_eq!(parts[3], "000");
    }

    #[test]
    fn test_ids_unique_within_second() {
        let ids = IdGenerator::new();
        let a = ids.next("fact");
        let b = ids.next("fact");
        assert_ne!(a, b);
    }

    #[test]
    fn test_day_id_shape() {
        let day = today();
        assert_eq!(day.len(), 10);
        assert_eq!(&day[4..5], "-");
        assert_eq!(&day[7..8], "-");
    }
}
