//! Default collaborator implementations for the console surface
//!
//! The language-model client is a deployment concern; when none is wired
//! in, [`UnconfiguredLlm`] keeps the engine honest by failing every call
//! as an API connection error, which the engine degrades per policy
//! (fallback routing, empty retrieval, an `ERROR` envelope for the main
//! generation). The embedder is a real local implementation: a hashed
//! character-trigram encoder, deterministic and dependency-free.

use async_trait::async_trait;

use hmlr_core::{EmbeddingProvider, HmlrError, LlmClient, Result};

/// Placeholder client used when no language model is configured
pub struct UnconfiguredLlm {
    role: &'static str,
}

impl UnconfiguredLlm {
    /// A main-model placeholder
    #[must_use]
    pub const fn main() -> Self {
        Self { role: "main" }
    }

    /// A nano-model placeholder
    #[must_use]
    pub const fn nano() -> Self {
        Self { role: "nano" }
    }
}

#[async_trait]
impl LlmClient for UnconfiguredLlm {
    fn name(&self) -> &str {
        self.role
    }

    async fn complete(&self, _prompt: &str) -> Result<String> {
        Err(HmlrError::ApiConnection(format!(
            "no {} model configured; set up an LlmClient for this deployment",
            self.role
        )))
    }
}

/// Hashed character-trigram embedder
///
/// Maps each lowercase trigram onto one of `D` buckets and L2-normalizes
/// the counts. Identical texts encode identically; lexically overlapping
/// texts land close. Good enough for local retrieval without a model
/// download.
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    /// Create an embedder with the small-family dimension (384)
    #[must_use]
    pub const fn new() -> Self {
        Self { dimensions: 384 }
    }

    /// Create an embedder with an explicit dimension
    #[must_use]
    pub const fn with_dimensions(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn encode(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dimensions];
        let normalized: Vec<char> = text
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect();

        for window in normalized.windows(3) {
            let mut hash = 0_u64;
            for &c in window {
                hash = hash.wrapping_mul(1_000_003).wrapping_add(c as u64);
            }
            let bucket = usize::try_from(hash % self.dimensions as u64).unwrap_or(0);
            vector[bucket] += 1.0;
        }

        let magnitude: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }
        vector
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn name(&self) -> &str {
        "hash-trigram"
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.encode(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_identical_text_identical_vector() {
        let embedder = HashEmbedder::with_dimensions(64);
        let a = embedder.embed(&["hello world".into()]).await.unwrap();
        let b = embedder.embed(&["hello world".into()]).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_vectors_are_unit_length() {
        let embedder = HashEmbedder::new();
        let vectors = embedder
            .embed(&["the quick brown fox".into()])
            .await
            .unwrap();
        let magnitude: f32 = vectors[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((magnitude - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_unconfigured_llm_fails_as_api_connection() {
        let llm = UnconfiguredLlm::main();
        let err = llm.complete("hi").await.unwrap_err();
        assert!(matches!(err, HmlrError::ApiConnection(_)));
    }
}
