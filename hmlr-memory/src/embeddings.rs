//! Embedding service wrappers
//!
//! [`EmbeddingService`] is the thin seam between memory components and an
//! [`EmbeddingProvider`]; [`CachedEmbeddingService`] adds an LRU layer
//! keyed by SHA-256 content hash, used on the write path where the
//! Gardener re-encodes overlapping fact text.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use hmlr_core::{EmbeddingProvider, HmlrError, Result};

/// Wrapper for embedding provider integration
#[derive(Clone)]
pub struct EmbeddingService {
    provider: Arc<dyn EmbeddingProvider>,
}

impl std::fmt::Debug for EmbeddingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingService")
            .field("provider", &self.provider.name())
            .finish()
    }
}

impl EmbeddingService {
    /// Create a service over a provider
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        info!(
            "Creating EmbeddingService with provider: {}, dimensions: {}",
            provider.name(),
            provider.dimensions()
        );
        Self { provider }
    }

    /// Encode a single text
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::Embedding`] if encoding fails.
    pub async fn embed_single(&self, text: &str) -> Result<Vec<f32>> {
        debug!("Generating embedding for text (length: {})", text.len());
        let mut embeddings = self.provider.embed(&[text.to_string()]).await?;
        embeddings
            .pop()
            .ok_or_else(|| HmlrError::Embedding("no embedding returned".to_string()))
    }

    /// Encode a batch of texts
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::Embedding`] if encoding fails.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.provider.embed(texts).await
    }

    /// Output dimension of the wrapped provider
    #[must_use]
    pub fn dimensions(&self) -> usize {
        self.provider.dimensions()
    }

    /// Name of the wrapped provider
    #[must_use]
    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }
}

/// Cache hit/miss counters
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Lookups served from cache
    pub hits: u64,
    /// Lookups that went to the provider
    pub misses: u64,
}

/// LRU-cached embedding service
///
/// Identical content hashes to the same key, so re-encoding the same fact
/// text during gardening costs one provider call total.
#[derive(Clone)]
pub struct CachedEmbeddingService {
    inner: Arc<EmbeddingService>,
    cache: Arc<Mutex<LruCache<String, Vec<f32>>>>,
    stats: Arc<Mutex<CacheStats>>,
}

impl CachedEmbeddingService {
    /// Wrap a service with an LRU cache of `capacity` entries
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(inner: Arc<EmbeddingService>, capacity: usize) -> Self {
        Self {
            inner,
            cache: Arc::new(Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).expect("cache capacity must be non-zero"),
            ))),
            stats: Arc::new(Mutex::new(CacheStats::default())),
        }
    }

    /// Encode a single text, consulting the cache first
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::Embedding`] if encoding fails.
    pub async fn embed_single(&self, text: &str) -> Result<Vec<f32>> {
        let key = hash_content(text);

        if let Some(embedding) = self.cache.lock().get(&key).cloned() {
            self.stats.lock().hits += 1;
            return Ok(embedding);
        }

        let embedding = self.inner.embed_single(text).await?;
        self.cache.lock().put(key, embedding.clone());
        self.stats.lock().misses += 1;
        Ok(embedding)
    }

    /// Current hit/miss counters
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        *self.stats.lock()
    }

    /// Output dimension of the wrapped provider
    #[must_use]
    pub fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }
}

fn hash_content(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for CountingProvider {
        fn name(&self) -> &str {
            "counting"
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts.iter().map(|_| vec![0.1, 0.2, 0.3]).collect())
        }

        fn dimensions(&self) -> usize {
            3
        }
    }

    #[tokio::test]
    async fn test_embed_single() {
        let service = EmbeddingService::new(Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        }));
        let embedding = service.embed_single("hello").await.unwrap();
        assert_eq!(embedding.len(), 3);
        assert_eq!(service.dimensions(), 3);
    }

    #[tokio::test]
    async fn test_cache_avoids_repeat_calls() {
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        });
        let service = Arc::new(EmbeddingService::new(
            Arc::clone(&provider) as Arc<dyn EmbeddingProvider>
        ));
        let cached = CachedEmbeddingService::new(service, 16);

        cached.embed_single("same text").await.unwrap();
        cached.embed_single("same text").await.unwrap();
        cached.embed_single("other text").await.unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        let stats = cached.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
    }
}
