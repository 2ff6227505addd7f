//! Error types for the HMLR engine

use thiserror::Error;

/// Result type alias for HMLR operations
pub type Result<T> = std::result::Result<T, HmlrError>;

/// Errors that can occur across the memory engine
#[derive(Debug, Error)]
pub enum HmlrError {
    /// LLM or embedding HTTP client failed or timed out
    #[error("API connection error: {0}")]
    ApiConnection(String),

    /// A Governor sub-task failed; retrieval is best-effort
    #[error("Retrieval error: {0}")]
    Retrieval(String),

    /// A KV write failed; the enclosing turn must not commit
    #[error("Storage write error: {0}")]
    StorageWrite(String),

    /// Storage read error
    #[error("Storage read error: {0}")]
    StorageRead(String),

    /// Invalid configuration at startup (fatal)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Vector index dimension does not match the configured model (fatal)
    #[error("Schema mismatch: index dimension {found} does not match model dimension {expected}")]
    SchemaMismatch {
        /// Dimension the configured embedding model produces
        expected: usize,
        /// Dimension found in the persisted index
        found: usize,
    },

    /// Sliding-window state file is unreadable or version-mismatched (fatal)
    #[error("State error: {0}")]
    State(String),

    /// LLM call error
    #[error("LLM call error: {0}")]
    LlmCall(String),

    /// Embedding generation error
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Entity not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HmlrError {
    /// Whether this error is fatal at startup rather than recoverable per turn
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::SchemaMismatch { .. } | Self::State(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(HmlrError::Configuration("bad path".into()).is_fatal());
        assert!(HmlrError::SchemaMismatch {
            expected: 384,
            found: 1024
        }
        .is_fatal());
        assert!(HmlrError::State("version mismatch".into()).is_fatal());
        assert!(!HmlrError::Retrieval("timeout".into()).is_fatal());
        assert!(!HmlrError::ApiConnection("refused".into()).is_fatal());
    }

    #[test]
    fn test_schema_mismatch_message() {
        let err = HmlrError::SchemaMismatch {
            expected: 384,
            found: 1024,
        };
        let msg = err.to_string();
        assert!(msg.contains("384"));
        assert!(msg.contains("1024"));
    }
}
