//! Dossier persistence
//!
//! Covers the `dossiers`, `dossier_facts` and `dossier_provenance` tables.
//! The embedding side-tables are written through the vector index; deleting
//! a dossier cascades to its facts and both embedding tables via foreign
//! keys.

use chrono::Utc;
use libsql::{params, Connection, Row, Value};
use tracing::{debug, info};

use hmlr_core::ids::next_id;
use hmlr_core::types::{Dossier, DossierFact, DossierProvenance, ProvenanceOp};
use hmlr_core::{HmlrError, Result};

use crate::codec::{opt_text, read_err, ts_from_sql, ts_to_sql, write_err};

/// Store for the dossier tables
#[derive(Clone)]
pub struct DossierStore {
    conn: Connection,
}

impl DossierStore {
    /// Create a store over an open connection
    #[must_use]
    pub const fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Insert a new dossier row
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::StorageWrite`] on failure.
    pub async fn insert_dossier(&self, dossier: &Dossier) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO dossiers (dossier_id, title, summary, search_summary,
                     created_at, last_updated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    dossier.dossier_id.as_str(),
                    dossier.title.as_str(),
                    dossier.summary.as_str(),
                    dossier.search_summary.as_str(),
                    ts_to_sql(dossier.created_at),
                    ts_to_sql(dossier.last_updated),
                ],
            )
            .await
            .map_err(write_err)?;
        info!("Created dossier {} ({})", dossier.dossier_id, dossier.title);
        Ok(())
    }

    /// Fetch a dossier by id
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::NotFound`] if absent.
    pub async fn get_dossier(&self, dossier_id: &str) -> Result<Dossier> {
        let mut rows = self
            .conn
            .query(
                "SELECT dossier_id, title, summary, search_summary, created_at, last_updated
                 FROM dossiers WHERE dossier_id = ?1",
                params![dossier_id],
            )
            .await
            .map_err(read_err)?;

        match rows.next().await.map_err(read_err)? {
            Some(row) => dossier_from_row(&row),
            None => Err(HmlrError::NotFound(format!("dossier {dossier_id}"))),
        }
    }

    /// All dossiers, oldest first
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::StorageRead`] on query failure.
    pub async fn all_dossiers(&self) -> Result<Vec<Dossier>> {
        let mut rows = self
            .conn
            .query(
                "SELECT dossier_id, title, summary, search_summary, created_at, last_updated
                 FROM dossiers ORDER BY created_at",
                (),
            )
            .await
            .map_err(read_err)?;

        let mut dossiers = Vec::new();
        while let Some(row) = rows.next().await.map_err(read_err)? {
            dossiers.push(dossier_from_row(&row)?);
        }
        Ok(dossiers)
    }

    /// Rewrite a dossier's summaries after an append or merge
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::StorageWrite`] on failure.
    pub async fn update_summaries(
        &self,
        dossier_id: &str,
        summary: &str,
        search_summary: &str,
    ) -> Result<()> {
        let affected = self
            .conn
            .execute(
                "UPDATE dossiers SET summary = ?2, search_summary = ?3, last_updated = ?4
                 WHERE dossier_id = ?1",
                params![dossier_id, summary, search_summary, ts_to_sql(Utc::now())],
            )
            .await
            .map_err(write_err)?;

        if affected == 0 {
            return Err(HmlrError::NotFound(format!("dossier {dossier_id}")));
        }
        Ok(())
    }

    /// Attach a fact copy to a dossier (idempotent per `(dossier, fact)`)
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::StorageWrite`] on failure.
    pub async fn insert_fact(&self, fact: &DossierFact) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO dossier_facts (dossier_id, fact_id, fact_text)
                 VALUES (?1, ?2, ?3)",
                params![
                    fact.dossier_id.as_str(),
                    fact.fact_id.as_str(),
                    fact.fact_text.as_str(),
                ],
            )
            .await
            .map_err(write_err)?;
        Ok(())
    }

    /// All fact copies of a dossier, insertion order
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::StorageRead`] on query failure.
    pub async fn facts_for_dossier(&self, dossier_id: &str) -> Result<Vec<DossierFact>> {
        let mut rows = self
            .conn
            .query(
                "SELECT dossier_id, fact_id, fact_text FROM dossier_facts
                 WHERE dossier_id = ?1 ORDER BY rowid",
                params![dossier_id],
            )
            .await
            .map_err(read_err)?;

        let mut facts = Vec::new();
        while let Some(row) = rows.next().await.map_err(read_err)? {
            facts.push(DossierFact {
                dossier_id: row.get(0).map_err(read_err)?,
                fact_id: row.get(1).map_err(read_err)?,
                fact_text: row.get(2).map_err(read_err)?,
            });
        }
        Ok(facts)
    }

    /// Delete a dossier; facts and embeddings cascade
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::StorageWrite`] on failure.
    pub async fn delete_dossier(&self, dossier_id: &str) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM dossiers WHERE dossier_id = ?1",
                params![dossier_id],
            )
            .await
            .map_err(write_err)?;
        debug!("Deleted dossier {dossier_id} (cascade)");
        Ok(())
    }

    /// Append a provenance row
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::StorageWrite`] on failure.
    pub async fn add_provenance(
        &self,
        dossier_id: &str,
        operation: ProvenanceOp,
        source_block_id: Option<&str>,
        payload: serde_json::Value,
    ) -> Result<String> {
        let prov_id = next_id("prov");
        self.conn
            .execute(
                "INSERT INTO dossier_provenance
                     (prov_id, dossier_id, operation, source_block_id, timestamp, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    prov_id.as_str(),
                    dossier_id,
                    operation.as_str(),
                    source_block_id.map_or(Value::Null, |s| Value::Text(s.to_string())),
                    ts_to_sql(Utc::now()),
                    serde_json::to_string(&payload)?,
                ],
            )
            .await
            .map_err(write_err)?;
        Ok(prov_id)
    }

    /// Provenance history of a dossier, oldest first
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::StorageRead`] on query failure.
    pub async fn provenance_for_dossier(&self, dossier_id: &str) -> Result<Vec<DossierProvenance>> {
        let mut rows = self
            .conn
            .query(
                "SELECT prov_id, dossier_id, operation, source_block_id, timestamp, payload
                 FROM dossier_provenance WHERE dossier_id = ?1 ORDER BY rowid",
                params![dossier_id],
            )
            .await
            .map_err(read_err)?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await.map_err(read_err)? {
            entries.push(provenance_from_row(&row)?);
        }
        Ok(entries)
    }
}

fn dossier_from_row(row: &Row) -> Result<Dossier> {
    let created: String = row.get(4).map_err(read_err)?;
    let updated: String = row.get(5).map_err(read_err)?;
    Ok(Dossier {
        dossier_id: row.get(0).map_err(read_err)?,
        title: row.get(1).map_err(read_err)?,
        summary: row.get(2).map_err(read_err)?,
        search_summary: row.get(3).map_err(read_err)?,
        created_at: ts_from_sql(&created)?,
        last_updated: ts_from_sql(&updated)?,
    })
}

fn provenance_from_row(row: &Row) -> Result<DossierProvenance> {
    let op: String = row.get(2).map_err(read_err)?;
    let ts: String = row.get(4).map_err(read_err)?;
    let payload: String = row.get(5).map_err(read_err)?;
    Ok(DossierProvenance {
        prov_id: row.get(0).map_err(read_err)?,
        dossier_id: row.get(1).map_err(read_err)?,
        operation: ProvenanceOp::parse(&op)
            .ok_or_else(|| HmlrError::StorageRead(format!("unknown provenance op {op:?}")))?,
        source_block_id: opt_text(row, 3)?,
        timestamp: ts_from_sql(&ts)?,
        payload: serde_json::from_str(&payload)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteBackend;
    use serde_json::json;

    fn dossier(id: &str, title: &str) -> Dossier {
        let now = Utc::now();
        Dossier {
            dossier_id: id.into(),
            title: title.into(),
            summary: String::new(),
            search_summary: String::new(),
            created_at: now,
            last_updated: now,
        }
    }

    async fn store() -> (SqliteBackend, DossierStore) {
        let backend = SqliteBackend::open_in_memory().await.unwrap();
        let store = DossierStore::new(backend.connection());
        (backend, store)
    }

    #[tokio::test]
    async fn test_dossier_roundtrip_and_summary_update() {
        let (_backend, store) = store().await;
        store
            .insert_dossier(&dossier("dos_1", "Dietary Preferences"))
            .await
            .unwrap();

        store
            .update_summaries("dos_1", "User avoids animal products", "vegetarian vegan diet")
            .await
            .unwrap();

        let loaded = store.get_dossier("dos_1").await.unwrap();
        assert_eq!(loaded.summary, "User avoids animal products");
        assert_eq!(loaded.search_summary, "vegetarian vegan diet");
    }

    #[tokio::test]
    async fn test_facts_attach_and_cascade_delete() {
        let (_backend, store) = store().await;
        store
            .insert_dossier(&dossier("dos_1", "Diet"))
            .await
            .unwrap();
        store
            .insert_fact(&DossierFact {
                dossier_id: "dos_1".into(),
                fact_id: "fact_1".into(),
                fact_text: "diet: vegetarian".into(),
            })
            .await
            .unwrap();

        assert_eq!(store.facts_for_dossier("dos_1").await.unwrap().len(), 1);

        store.delete_dossier("dos_1").await.unwrap();
        assert!(store.facts_for_dossier("dos_1").await.unwrap().is_empty());
        assert!(matches!(
            store.get_dossier("dos_1").await.unwrap_err(),
            HmlrError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_provenance_log_is_append_only_ordered() {
        let (_backend, store) = store().await;
        store
            .insert_dossier(&dossier("dos_1", "Diet"))
            .await
            .unwrap();

        store
            .add_provenance("dos_1", ProvenanceOp::Create, Some("block_1"), json!({}))
            .await
            .unwrap();
        store
            .add_provenance(
                "dos_1",
                ProvenanceOp::Append,
                Some("block_2"),
                json!({"facts": 2}),
            )
            .await
            .unwrap();

        let log = store.provenance_for_dossier("dos_1").await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].operation, ProvenanceOp::Create);
        assert_eq!(log[1].operation, ProvenanceOp::Append);
        assert_eq!(log[1].source_block_id.as_deref(), Some("block_2"));
    }
}
