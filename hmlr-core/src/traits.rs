//! External-collaborator seams
//!
//! The engine treats the language model and the embedding model as opaque
//! async services behind these traits. Production implementations live
//! outside the core; tests use scripted mocks.

use async_trait::async_trait;

use crate::error::Result;

/// A language-model completion client
///
/// Implementations are expected to map transport failures and deadline
/// overruns to [`crate::HmlrError::ApiConnection`].
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Provider/model identifier, e.g. `gpt-4.1` or `gpt-4.1-nano`
    fn name(&self) -> &str;

    /// Complete a prompt, returning the raw response text
    ///
    /// # Errors
    ///
    /// Returns [`crate::HmlrError::ApiConnection`] on transport failure or
    /// deadline overrun, [`crate::HmlrError::LlmCall`] on provider-side
    /// rejection.
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// An embedding-model client producing fixed-dimension vectors
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Provider/model identifier
    fn name(&self) -> &str;

    /// Encode texts into `dimensions()`-wide float vectors, one per input
    ///
    /// # Errors
    ///
    /// Returns [`crate::HmlrError::Embedding`] if encoding fails or the
    /// provider is unavailable.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Fixed output dimension for the lifetime of the model
    fn dimensions(&self) -> usize;
}
