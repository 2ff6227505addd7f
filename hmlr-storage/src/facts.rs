//! Fact persistence
//!
//! Facts are immutable once written; the single exception is the
//! `source_block_id` back-fill after the Governor assigns a block.

use libsql::{params, Connection, Row, Value};
use tracing::debug;

use hmlr_core::types::Fact;
use hmlr_core::{HmlrError, Result};

use crate::codec::{opt_text, read_err, ts_from_sql, ts_to_sql, write_err};

/// Store for the `fact_store` table
#[derive(Clone)]
pub struct FactStore {
    conn: Connection,
}

impl FactStore {
    /// Create a store over an open connection
    #[must_use]
    pub const fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Insert a batch of facts atomically
    ///
    /// The scrubber calls this once per turn; either every extracted fact
    /// lands or none do.
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::StorageWrite`] on failure.
    pub async fn insert_facts(&self, facts: &[Fact]) -> Result<()> {
        if facts.is_empty() {
            return Ok(());
        }

        let tx = self.conn.transaction().await.map_err(write_err)?;
        for fact in facts {
            tx.execute(
                "INSERT OR REPLACE INTO fact_store
                     (fact_id, key, value, category, turn_id, source_chunk_id,
                      source_block_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    fact.fact_id.as_str(),
                    fact.key.as_str(),
                    fact.value.as_str(),
                    fact.category.as_str(),
                    fact.turn_id.as_str(),
                    fact.source_chunk_id.as_str(),
                    fact.source_block_id
                        .clone()
                        .map_or(Value::Null, Value::Text),
                    ts_to_sql(fact.created_at),
                ],
            )
            .await
            .map_err(write_err)?;
        }
        tx.commit().await.map_err(write_err)?;

        debug!("Persisted {} facts", facts.len());
        Ok(())
    }

    /// Back-fill `source_block_id` for a turn's facts
    ///
    /// Returns the number of facts updated.
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::StorageWrite`] on failure.
    pub async fn update_facts_block_id(&self, turn_id: &str, block_id: &str) -> Result<u64> {
        self.conn
            .execute(
                "UPDATE fact_store SET source_block_id = ?2 WHERE turn_id = ?1",
                params![turn_id, block_id],
            )
            .await
            .map_err(write_err)
    }

    /// All facts extracted from a turn
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::StorageRead`] on query failure.
    pub async fn facts_for_turn(&self, turn_id: &str) -> Result<Vec<Fact>> {
        self.query_facts(
            "SELECT fact_id, key, value, category, turn_id, source_chunk_id,
                    source_block_id, created_at
             FROM fact_store WHERE turn_id = ?1 ORDER BY rowid",
            params![turn_id],
        )
        .await
    }

    /// All facts assigned to a block
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::StorageRead`] on query failure.
    pub async fn facts_for_block(&self, block_id: &str) -> Result<Vec<Fact>> {
        self.query_facts(
            "SELECT fact_id, key, value, category, turn_id, source_chunk_id,
                    source_block_id, created_at
             FROM fact_store WHERE source_block_id = ?1 ORDER BY rowid",
            params![block_id],
        )
        .await
    }

    /// Keyword lookup over keys and values
    ///
    /// Used by the Governor's fact task: each keyword matches
    /// case-insensitively against `key` or `value`. Duplicate hits across
    /// keywords collapse.
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::StorageRead`] on query failure.
    pub async fn search_keywords(&self, keywords: &[String], limit: usize) -> Result<Vec<Fact>> {
        let mut facts: Vec<Fact> = Vec::new();
        for keyword in keywords {
            let pattern = format!("%{}%", keyword.to_lowercase());
            let hits = self
                .query_facts(
                    "SELECT fact_id, key, value, category, turn_id, source_chunk_id,
                            source_block_id, created_at
                     FROM fact_store
                     WHERE lower(key) LIKE ?1 OR lower(value) LIKE ?1
                     ORDER BY rowid LIMIT ?2",
                    params![pattern, i64::try_from(limit).unwrap_or(i64::MAX)],
                )
                .await?;
            for fact in hits {
                if !facts.iter().any(|f| f.fact_id == fact.fact_id) {
                    facts.push(fact);
                }
            }
            if facts.len() >= limit {
                facts.truncate(limit);
                break;
            }
        }
        Ok(facts)
    }

    /// Remove every fact extracted from a turn (rollback path)
    ///
    /// Returns the number of facts removed.
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::StorageWrite`] on failure.
    pub async fn delete_facts_for_turn(&self, turn_id: &str) -> Result<u64> {
        self.conn
            .execute("DELETE FROM fact_store WHERE turn_id = ?1", params![turn_id])
            .await
            .map_err(write_err)
    }

    /// Fetch a fact by id
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::StorageRead`] on query failure.
    pub async fn get_fact(&self, fact_id: &str) -> Result<Option<Fact>> {
        let facts = self
            .query_facts(
                "SELECT fact_id, key, value, category, turn_id, source_chunk_id,
                        source_block_id, created_at
                 FROM fact_store WHERE fact_id = ?1",
                params![fact_id],
            )
            .await?;
        Ok(facts.into_iter().next())
    }

    async fn query_facts(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Fact>> {
        let mut rows = self.conn.query(sql, params).await.map_err(read_err)?;
        let mut facts = Vec::new();
        while let Some(row) = rows.next().await.map_err(read_err)? {
            facts.push(fact_from_row(&row)?);
        }
        Ok(facts)
    }
}

fn fact_from_row(row: &Row) -> Result<Fact> {
    let ts: String = row.get(7).map_err(read_err)?;
    Ok(Fact {
        fact_id: row.get(0).map_err(read_err)?,
        key: row.get(1).map_err(read_err)?,
        value: row.get(2).map_err(read_err)?,
        category: row.get(3).map_err(read_err)?,
        turn_id: row.get(4).map_err(read_err)?,
        source_chunk_id: row.get(5).map_err(read_err)?,
        source_block_id: opt_text(row, 6)?,
        created_at: ts_from_sql(&ts)?,
    })
}
