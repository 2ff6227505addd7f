//! libsql database handle and schema migrations
//!
//! One [`SqliteBackend`] per process owns the database file. Connections
//! are cheap clones of the primary handle; writes are wrapped in short
//! transactions by the individual stores.

use std::path::Path;

use libsql::{Builder, Connection, Database};
use tracing::{debug, info};

use hmlr_core::{HmlrError, Result};

/// Owned handle on the HMLR database
///
/// Opening runs the idempotent migrations and enables foreign-key
/// enforcement (dossier deletion cascades to facts and embeddings).
pub struct SqliteBackend {
    /// Kept alive for the lifetime of the connections
    _db: Database,
    conn: Connection,
}

impl SqliteBackend {
    /// Open (or create) the database at `path` and run migrations
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::Configuration`] if the parent directory cannot
    /// be created, [`HmlrError::StorageWrite`] if the schema cannot be
    /// applied.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                HmlrError::Configuration(format!(
                    "cannot create database directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        info!("Opening HMLR database at {}", path.display());
        let db = Builder::new_local(path)
            .build()
            .await
            .map_err(|e| HmlrError::Configuration(format!("cannot open database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| HmlrError::Configuration(format!("cannot connect: {e}")))?;

        let backend = Self { _db: db, conn };
        backend.enable_foreign_keys().await?;
        backend.migrate().await?;
        Ok(backend)
    }

    /// Open an in-memory database (tests and scratch runs)
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::Configuration`] if the database cannot be
    /// created, [`HmlrError::StorageWrite`] if migrations fail.
    pub async fn open_in_memory() -> Result<Self> {
        let db = Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| HmlrError::Configuration(format!("cannot open in-memory db: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| HmlrError::Configuration(format!("cannot connect: {e}")))?;

        let backend = Self { _db: db, conn };
        backend.enable_foreign_keys().await?;
        backend.migrate().await?;
        Ok(backend)
    }

    /// Clone the shared connection
    #[must_use]
    pub fn connection(&self) -> Connection {
        self.conn.clone()
    }

    async fn enable_foreign_keys(&self) -> Result<()> {
        // PRAGMA may return a result row; query and discard it.
        self.conn
            .query("PRAGMA foreign_keys = ON", ())
            .await
            .map_err(|e| HmlrError::Configuration(format!("cannot enable foreign keys: {e}")))?;
        Ok(())
    }

    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            self.conn
                .execute(statement, ())
                .await
                .map_err(|e| HmlrError::StorageWrite(format!("migration failed: {e}")))?;
        }
        debug!("Schema migrations applied ({} statements)", SCHEMA.len());
        Ok(())
    }
}

/// Idempotent schema, one statement per entry
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS turns (
        turn_id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL,
        day_id TEXT NOT NULL,
        turn_sequence INTEGER NOT NULL,
        timestamp TEXT NOT NULL,
        user_message TEXT NOT NULL,
        assistant_response TEXT NOT NULL,
        detail_level TEXT NOT NULL DEFAULT 'VERBATIM',
        compressed_content TEXT,
        keywords TEXT NOT NULL DEFAULT '[]',
        topics TEXT NOT NULL DEFAULT '[]',
        affect TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_turns_session ON turns(session_id, turn_sequence)",
    "CREATE INDEX IF NOT EXISTS idx_turns_day ON turns(day_id)",
    "CREATE TABLE IF NOT EXISTS chunks (
        chunk_id TEXT PRIMARY KEY,
        turn_id TEXT NOT NULL,
        span_id TEXT,
        chunk_type TEXT NOT NULL,
        parent_chunk_id TEXT,
        text_verbatim TEXT NOT NULL,
        token_count INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_chunks_turn ON chunks(turn_id)",
    "CREATE TABLE IF NOT EXISTS daily_ledger (
        block_id TEXT PRIMARY KEY,
        day_id TEXT NOT NULL,
        content_json TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_ledger_day ON daily_ledger(day_id, status)",
    "CREATE TABLE IF NOT EXISTS fact_store (
        fact_id TEXT PRIMARY KEY,
        key TEXT NOT NULL,
        value TEXT NOT NULL,
        category TEXT NOT NULL,
        turn_id TEXT NOT NULL,
        source_chunk_id TEXT NOT NULL,
        source_block_id TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_facts_turn ON fact_store(turn_id)",
    "CREATE INDEX IF NOT EXISTS idx_facts_block ON fact_store(source_block_id)",
    "CREATE TABLE IF NOT EXISTS block_metadata (
        block_id TEXT PRIMARY KEY,
        global_tags TEXT NOT NULL DEFAULT '[]',
        section_rules TEXT NOT NULL DEFAULT '[]'
    )",
    "CREATE TABLE IF NOT EXISTS dossiers (
        dossier_id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        summary TEXT NOT NULL DEFAULT '',
        search_summary TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL,
        last_updated TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS dossier_facts (
        dossier_id TEXT NOT NULL,
        fact_id TEXT NOT NULL,
        fact_text TEXT NOT NULL,
        PRIMARY KEY (dossier_id, fact_id),
        FOREIGN KEY (dossier_id) REFERENCES dossiers(dossier_id) ON DELETE CASCADE
    )",
    "CREATE TABLE IF NOT EXISTS dossier_fact_embeddings (
        fact_id TEXT PRIMARY KEY,
        dossier_id TEXT NOT NULL,
        embedding BLOB NOT NULL,
        created_at TEXT NOT NULL,
        FOREIGN KEY (dossier_id) REFERENCES dossiers(dossier_id) ON DELETE CASCADE
    )",
    "CREATE INDEX IF NOT EXISTS idx_dfe_dossier ON dossier_fact_embeddings(dossier_id)",
    "CREATE TABLE IF NOT EXISTS dossier_search_embeddings (
        dossier_id TEXT PRIMARY KEY,
        embedding BLOB NOT NULL,
        created_at TEXT NOT NULL,
        FOREIGN KEY (dossier_id) REFERENCES dossiers(dossier_id) ON DELETE CASCADE
    )",
    "CREATE TABLE IF NOT EXISTS dossier_provenance (
        prov_id TEXT PRIMARY KEY,
        dossier_id TEXT NOT NULL,
        operation TEXT NOT NULL,
        source_block_id TEXT,
        timestamp TEXT NOT NULL,
        payload TEXT NOT NULL DEFAULT '{}'
    )",
    "CREATE INDEX IF NOT EXISTS idx_prov_dossier ON dossier_provenance(dossier_id)",
    "CREATE TABLE IF NOT EXISTS embeddings (
        embedding_id TEXT PRIMARY KEY,
        turn_id TEXT NOT NULL,
        embedding BLOB NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_embeddings_turn ON embeddings(turn_id)",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_in_memory_and_migrate_twice() {
        let backend = SqliteBackend::open_in_memory().await.unwrap();
        // Migrations are idempotent
        backend.migrate().await.unwrap();

        let conn = backend.connection();
        let mut rows = conn
            .query(
                "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
                (),
            )
            .await
            .unwrap();

        let mut tables = Vec::new();
        while let Some(row) = rows.next().await.unwrap() {
            tables.push(row.get::<String>(0).unwrap());
        }

        for expected in [
            "turns",
            "chunks",
            "daily_ledger",
            "fact_store",
            "block_metadata",
            "dossiers",
            "dossier_facts",
            "dossier_fact_embeddings",
            "dossier_search_embeddings",
            "dossier_provenance",
            "embeddings",
        ] {
            assert!(tables.iter().any(|t| t == expected), "missing {expected}");
        }
    }

    #[tokio::test]
    async fn test_open_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("hmlr.db");
        let backend = SqliteBackend::open(&path).await.unwrap();
        drop(backend);
        assert!(path.exists());
    }
}
