//! Blob-scan vector index
//!
//! Three logical indices share one implementation: **memory** (turn and
//! sentence-chunk ids in the `embeddings` table), **dossier-fact**
//! (`dossier_fact_embeddings`) and **dossier-search**
//! (`dossier_search_embeddings`). Search is a full scan with cosine
//! ranking, which is adequate for the expected scale (≤ 10⁵ vectors).
//!
//! Writes to one index are serialized by an async mutex; reads never take
//! the lock and may observe either side of a concurrent write.
//!
//! The index supports a dual-model configuration: a heavier model for
//! writes (gardening) and a lighter one for reads, required to agree on
//! dimensions.

use std::sync::Arc;

use chrono::Utc;
use libsql::{params, Connection};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use hmlr_core::{EmbeddingProvider, HmlrError, Result};

use crate::codec::{blob_to_embedding, embedding_to_blob, read_err, ts_to_sql, write_err};

/// A memory-index hit
#[derive(Debug, Clone)]
pub struct MemoryMatch {
    /// Matched index id (turn id or sentence-chunk id)
    pub id: String,
    /// Turn owning the matched text
    pub turn_id: String,
    /// Cosine similarity
    pub score: f32,
}

/// A dossier-fact-index hit
#[derive(Debug, Clone)]
pub struct FactMatch {
    /// Matched fact id
    pub fact_id: String,
    /// Dossier owning the fact
    pub dossier_id: String,
    /// Cosine similarity
    pub score: f32,
}

/// Cosine-scan vector index over the embedding blob tables
pub struct VectorIndex {
    conn: Connection,
    write_embedder: Arc<dyn EmbeddingProvider>,
    read_embedder: Arc<dyn EmbeddingProvider>,
    dimensions: usize,
    memory_lock: Mutex<()>,
    dossier_fact_lock: Mutex<()>,
    dossier_search_lock: Mutex<()>,
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndex").finish_non_exhaustive()
    }
}

impl VectorIndex {
    /// Open the index with one model for both reads and writes
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::SchemaMismatch`] if persisted vectors have a
    /// different dimension than the model produces.
    pub async fn new(conn: Connection, embedder: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        Self::with_dual_models(conn, Arc::clone(&embedder), embedder).await
    }

    /// Open the index with distinct write and read models
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::Configuration`] if the models disagree on
    /// dimensions, [`HmlrError::SchemaMismatch`] if persisted vectors have
    /// a different dimension.
    pub async fn with_dual_models(
        conn: Connection,
        write_embedder: Arc<dyn EmbeddingProvider>,
        read_embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        let dimensions = write_embedder.dimensions();
        if read_embedder.dimensions() != dimensions {
            return Err(HmlrError::Configuration(format!(
                "write model {} produces {}-dim vectors but read model {} produces {}-dim",
                write_embedder.name(),
                dimensions,
                read_embedder.name(),
                read_embedder.dimensions()
            )));
        }

        let index = Self {
            conn,
            write_embedder,
            read_embedder,
            dimensions,
            memory_lock: Mutex::new(()),
            dossier_fact_lock: Mutex::new(()),
            dossier_search_lock: Mutex::new(()),
        };
        index.verify_dimensions().await?;
        Ok(index)
    }

    /// Fixed dimension of every vector in this database
    #[must_use]
    pub const fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Probe each embedding table and fail on a stored-width mismatch
    async fn verify_dimensions(&self) -> Result<()> {
        for table in [
            "embeddings",
            "dossier_fact_embeddings",
            "dossier_search_embeddings",
        ] {
            let mut rows = self
                .conn
                .query(&format!("SELECT embedding FROM {table} LIMIT 1"), ())
                .await
                .map_err(read_err)?;
            if let Some(row) = rows.next().await.map_err(read_err)? {
                let blob: Vec<u8> = row.get(0).map_err(read_err)?;
                let found = blob.len() / 4;
                if found != self.dimensions {
                    return Err(HmlrError::SchemaMismatch {
                        expected: self.dimensions,
                        found,
                    });
                }
            }
        }
        Ok(())
    }

    async fn encode_for_write(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.write_embedder.embed(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| HmlrError::Embedding("no embedding returned".to_string()))
    }

    async fn encode_for_read(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.read_embedder.embed(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| HmlrError::Embedding("no embedding returned".to_string()))
    }

    // --- memory index ---------------------------------------------------

    /// Encode `text` and upsert it into the memory index under `id`
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::Embedding`] or [`HmlrError::StorageWrite`].
    pub async fn put_memory(&self, id: &str, turn_id: &str, text: &str) -> Result<()> {
        let vector = self.encode_for_write(text).await?;
        let _guard = self.memory_lock.lock().await;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO embeddings (embedding_id, turn_id, embedding)
                 VALUES (?1, ?2, ?3)",
                params![id, turn_id, embedding_to_blob(&vector)],
            )
            .await
            .map_err(write_err)?;
        debug!("Embedded {id} into memory index");
        Ok(())
    }

    /// Search the memory index
    ///
    /// Results are sorted by similarity descending; ties keep insertion
    /// order (older rows first).
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::Embedding`] or [`HmlrError::StorageRead`].
    pub async fn search_memory(
        &self,
        query: &str,
        k: usize,
        threshold: f32,
    ) -> Result<Vec<MemoryMatch>> {
        let query_vector = self.encode_for_read(query).await?;

        let mut rows = self
            .conn
            .query(
                "SELECT embedding_id, turn_id, embedding FROM embeddings ORDER BY rowid",
                (),
            )
            .await
            .map_err(read_err)?;

        let mut matches = Vec::new();
        while let Some(row) = rows.next().await.map_err(read_err)? {
            let id: String = row.get(0).map_err(read_err)?;
            let turn_id: String = row.get(1).map_err(read_err)?;
            let blob: Vec<u8> = row.get(2).map_err(read_err)?;
            let score = match scored(&query_vector, &blob) {
                Ok(score) => score,
                Err(e) => {
                    warn!("Skipping undecodable embedding {id}: {e}");
                    continue;
                }
            };
            if score >= threshold {
                matches.push(MemoryMatch { id, turn_id, score });
            }
        }

        rank_and_truncate(&mut matches, k, |m| m.score);
        Ok(matches)
    }

    /// Remove an id from the memory index
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::StorageWrite`] on failure.
    pub async fn delete_memory(&self, id: &str) -> Result<()> {
        let _guard = self.memory_lock.lock().await;
        self.conn
            .execute(
                "DELETE FROM embeddings WHERE embedding_id = ?1",
                params![id],
            )
            .await
            .map_err(write_err)?;
        Ok(())
    }

    /// Remove every memory-index entry owned by a turn (rollback path)
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::StorageWrite`] on failure.
    pub async fn delete_memory_for_turn(&self, turn_id: &str) -> Result<u64> {
        let _guard = self.memory_lock.lock().await;
        self.conn
            .execute("DELETE FROM embeddings WHERE turn_id = ?1", params![turn_id])
            .await
            .map_err(write_err)
    }

    // --- dossier-fact index ---------------------------------------------

    /// Encode a fact and upsert it into the dossier-fact index
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::Embedding`] or [`HmlrError::StorageWrite`].
    pub async fn put_dossier_fact(
        &self,
        fact_id: &str,
        dossier_id: &str,
        fact_text: &str,
    ) -> Result<()> {
        let vector = self.encode_for_write(fact_text).await?;
        let _guard = self.dossier_fact_lock.lock().await;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO dossier_fact_embeddings
                     (fact_id, dossier_id, embedding, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    fact_id,
                    dossier_id,
                    embedding_to_blob(&vector),
                    ts_to_sql(Utc::now()),
                ],
            )
            .await
            .map_err(write_err)?;
        Ok(())
    }

    /// Search fact embeddings across every dossier
    ///
    /// The core primitive of multi-vector voting: callers group the
    /// returned matches by `dossier_id` and count votes.
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::Embedding`] or [`HmlrError::StorageRead`].
    pub async fn search_dossier_facts(
        &self,
        query: &str,
        k: usize,
        threshold: f32,
    ) -> Result<Vec<FactMatch>> {
        let query_vector = self.encode_for_read(query).await?;

        let mut rows = self
            .conn
            .query(
                "SELECT fact_id, dossier_id, embedding FROM dossier_fact_embeddings
                 ORDER BY rowid",
                (),
            )
            .await
            .map_err(read_err)?;

        let mut matches = Vec::new();
        while let Some(row) = rows.next().await.map_err(read_err)? {
            let fact_id: String = row.get(0).map_err(read_err)?;
            let dossier_id: String = row.get(1).map_err(read_err)?;
            let blob: Vec<u8> = row.get(2).map_err(read_err)?;
            let score = match scored(&query_vector, &blob) {
                Ok(score) => score,
                Err(e) => {
                    warn!("Skipping undecodable fact embedding {fact_id}: {e}");
                    continue;
                }
            };
            if score >= threshold {
                matches.push(FactMatch {
                    fact_id,
                    dossier_id,
                    score,
                });
            }
        }

        rank_and_truncate(&mut matches, k, |m| m.score);
        Ok(matches)
    }

    /// Remove every fact embedding belonging to a dossier
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::StorageWrite`] on failure.
    pub async fn delete_by_dossier(&self, dossier_id: &str) -> Result<u64> {
        let _guard = self.dossier_fact_lock.lock().await;
        let facts = self
            .conn
            .execute(
                "DELETE FROM dossier_fact_embeddings WHERE dossier_id = ?1",
                params![dossier_id],
            )
            .await
            .map_err(write_err)?;
        self.conn
            .execute(
                "DELETE FROM dossier_search_embeddings WHERE dossier_id = ?1",
                params![dossier_id],
            )
            .await
            .map_err(write_err)?;
        Ok(facts)
    }

    // --- dossier-search index -------------------------------------------

    /// Encode a dossier's search summary and upsert it
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::Embedding`] or [`HmlrError::StorageWrite`].
    pub async fn put_dossier_search(&self, dossier_id: &str, search_summary: &str) -> Result<()> {
        let vector = self.encode_for_write(search_summary).await?;
        let _guard = self.dossier_search_lock.lock().await;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO dossier_search_embeddings
                     (dossier_id, embedding, created_at)
                 VALUES (?1, ?2, ?3)",
                params![
                    dossier_id,
                    embedding_to_blob(&vector),
                    ts_to_sql(Utc::now()),
                ],
            )
            .await
            .map_err(write_err)?;
        Ok(())
    }

    /// Coarse search over dossier search summaries
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::Embedding`] or [`HmlrError::StorageRead`].
    pub async fn search_dossier_summaries(
        &self,
        query: &str,
        k: usize,
        threshold: f32,
    ) -> Result<Vec<(String, f32)>> {
        let query_vector = self.encode_for_read(query).await?;

        let mut rows = self
            .conn
            .query(
                "SELECT dossier_id, embedding FROM dossier_search_embeddings ORDER BY rowid",
                (),
            )
            .await
            .map_err(read_err)?;

        let mut matches = Vec::new();
        while let Some(row) = rows.next().await.map_err(read_err)? {
            let dossier_id: String = row.get(0).map_err(read_err)?;
            let blob: Vec<u8> = row.get(1).map_err(read_err)?;
            let score = match scored(&query_vector, &blob) {
                Ok(score) => score,
                Err(e) => {
                    warn!("Skipping undecodable search embedding {dossier_id}: {e}");
                    continue;
                }
            };
            if score >= threshold {
                matches.push((dossier_id, score));
            }
        }

        rank_and_truncate(&mut matches, k, |m| m.1);
        Ok(matches)
    }

    /// Cosine similarity between two vectors
    #[must_use]
    pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() {
            return 0.0;
        }

        let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        let magnitude_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let magnitude_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

        if magnitude_a == 0.0 || magnitude_b == 0.0 {
            return 0.0;
        }

        dot_product / (magnitude_a * magnitude_b)
    }
}

fn scored(query: &[f32], blob: &[u8]) -> Result<f32> {
    let stored = blob_to_embedding(blob)?;
    Ok(VectorIndex::cosine_similarity(query, &stored))
}

/// Stable sort by score descending, then truncate to `k`
///
/// Stability preserves the scan's rowid order, so equal scores keep
/// insertion order (older first).
fn rank_and_truncate<T>(matches: &mut Vec<T>, k: usize, score: impl Fn(&T) -> f32) {
    matches.sort_by(|a, b| {
        score(b)
            .partial_cmp(&score(a))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    matches.truncate(k);
}
