//! Bridge Block persistence (`daily_ledger` + `block_metadata`)
//!
//! The block itself is stored as one JSON document in `content_json`; the
//! `day_id` and `status` columns mirror fields of that document so day
//! scans don't parse every block. [`LedgerStore::save_block`] keeps the
//! mirror columns in sync.

use libsql::{params, Connection, Row};
use tracing::debug;

use hmlr_core::types::{BlockMetadata, BlockStatus, BridgeBlock};
use hmlr_core::{HmlrError, Result};

use crate::codec::{json_from_sql, json_to_sql, read_err, ts_to_sql, write_err};

/// Store for the `daily_ledger` and `block_metadata` tables
#[derive(Clone)]
pub struct LedgerStore {
    conn: Connection,
}

impl LedgerStore {
    /// Create a store over an open connection
    #[must_use]
    pub const fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Insert a freshly created block
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::StorageWrite`] on failure.
    pub async fn insert_block(&self, block: &BridgeBlock) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO daily_ledger (block_id, day_id, content_json, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    block.block_id.as_str(),
                    block.day_id.as_str(),
                    json_to_sql(block)?,
                    block.status.as_str(),
                    ts_to_sql(block.created_at),
                ],
            )
            .await
            .map_err(write_err)?;
        debug!("Created block {} ({})", block.block_id, block.topic_label);
        Ok(())
    }

    /// Rewrite a block document, keeping the mirror columns in sync
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::StorageWrite`] on failure.
    pub async fn save_block(&self, block: &BridgeBlock) -> Result<()> {
        let affected = self
            .conn
            .execute(
                "UPDATE daily_ledger SET content_json = ?2, status = ?3, day_id = ?4
                 WHERE block_id = ?1",
                params![
                    block.block_id.as_str(),
                    json_to_sql(block)?,
                    block.status.as_str(),
                    block.day_id.as_str(),
                ],
            )
            .await
            .map_err(write_err)?;

        if affected == 0 {
            return Err(HmlrError::NotFound(format!("block {}", block.block_id)));
        }
        Ok(())
    }

    /// Fetch a block by id
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::NotFound`] if the block does not exist.
    pub async fn get_block(&self, block_id: &str) -> Result<BridgeBlock> {
        let mut rows = self
            .conn
            .query(
                "SELECT content_json FROM daily_ledger WHERE block_id = ?1",
                params![block_id],
            )
            .await
            .map_err(read_err)?;

        match rows.next().await.map_err(read_err)? {
            Some(row) => block_from_row(&row),
            None => Err(HmlrError::NotFound(format!("block {block_id}"))),
        }
    }

    /// All blocks of a day, oldest first
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::StorageRead`] on query failure.
    pub async fn blocks_for_day(&self, day_id: &str) -> Result<Vec<BridgeBlock>> {
        let mut rows = self
            .conn
            .query(
                "SELECT content_json FROM daily_ledger WHERE day_id = ?1 ORDER BY created_at",
                params![day_id],
            )
            .await
            .map_err(read_err)?;

        let mut blocks = Vec::new();
        while let Some(row) = rows.next().await.map_err(read_err)? {
            blocks.push(block_from_row(&row)?);
        }
        Ok(blocks)
    }

    /// The day's `ACTIVE` block, if one exists
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::StorageRead`] on query failure.
    pub async fn active_block(&self, day_id: &str) -> Result<Option<BridgeBlock>> {
        let mut rows = self
            .conn
            .query(
                "SELECT content_json FROM daily_ledger
                 WHERE day_id = ?1 AND status = 'ACTIVE' ORDER BY created_at",
                params![day_id],
            )
            .await
            .map_err(read_err)?;

        match rows.next().await.map_err(read_err)? {
            Some(row) => Ok(Some(block_from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// Closed blocks the Gardener has not promoted yet, oldest first
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::StorageRead`] on query failure.
    pub async fn closed_ungardened(&self) -> Result<Vec<BridgeBlock>> {
        let mut rows = self
            .conn
            .query(
                "SELECT content_json FROM daily_ledger
                 WHERE status = 'CLOSED' ORDER BY created_at",
                (),
            )
            .await
            .map_err(read_err)?;

        let mut blocks = Vec::new();
        while let Some(row) = rows.next().await.map_err(read_err)? {
            let block = block_from_row(&row)?;
            if !block.header.gardened {
                blocks.push(block);
            }
        }
        Ok(blocks)
    }

    /// Resolve which of a day's blocks contains the given turn
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::StorageRead`] on query failure.
    pub async fn find_block_for_turn(&self, day_id: &str, turn_id: &str) -> Result<Option<String>> {
        for block in self.blocks_for_day(day_id).await? {
            if block.turns.iter().any(|t| t.turn_id == turn_id) {
                return Ok(Some(block.block_id));
            }
        }
        Ok(None)
    }

    /// Gardener-written side metadata for a block
    ///
    /// Missing rows read back as empty metadata.
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::StorageRead`] on query failure.
    pub async fn get_metadata(&self, block_id: &str) -> Result<BlockMetadata> {
        let mut rows = self
            .conn
            .query(
                "SELECT global_tags, section_rules FROM block_metadata WHERE block_id = ?1",
                params![block_id],
            )
            .await
            .map_err(read_err)?;

        match rows.next().await.map_err(read_err)? {
            Some(row) => {
                let tags: String = row.get(0).map_err(read_err)?;
                let rules: String = row.get(1).map_err(read_err)?;
                Ok(BlockMetadata {
                    global_tags: json_from_sql(&tags)?,
                    section_rules: json_from_sql(&rules)?,
                })
            }
            None => Ok(BlockMetadata::default()),
        }
    }

    /// Replace a block's side metadata (idempotent)
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::StorageWrite`] on failure.
    pub async fn put_metadata(&self, block_id: &str, metadata: &BlockMetadata) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO block_metadata (block_id, global_tags, section_rules)
                 VALUES (?1, ?2, ?3)",
                params![
                    block_id,
                    json_to_sql(&metadata.global_tags)?,
                    json_to_sql(&metadata.section_rules)?,
                ],
            )
            .await
            .map_err(write_err)?;
        Ok(())
    }

    /// Count of `ACTIVE` blocks for a day (invariant check)
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::StorageRead`] on query failure.
    pub async fn active_count(&self, day_id: &str) -> Result<usize> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM daily_ledger WHERE day_id = ?1 AND status = 'ACTIVE'",
                params![day_id],
            )
            .await
            .map_err(read_err)?;

        match rows.next().await.map_err(read_err)? {
            Some(row) => {
                let count: i64 = row.get(0).map_err(read_err)?;
                Ok(usize::try_from(count).unwrap_or(0))
            }
            None => Ok(0),
        }
    }
}

fn block_from_row(row: &Row) -> Result<BridgeBlock> {
    let content: String = row.get(0).map_err(read_err)?;
    json_from_sql(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteBackend;
    use chrono::Utc;
    use hmlr_core::types::{BlockTurn, GlobalTag};

    async fn store() -> (SqliteBackend, LedgerStore) {
        let backend = SqliteBackend::open_in_memory().await.unwrap();
        let store = LedgerStore::new(backend.connection());
        (backend, store)
    }

    #[tokio::test]
    async fn test_block_roundtrip() {
        let (_backend, store) = store().await;
        let block = BridgeBlock::new("2026-08-01".into(), "Diet".into(), vec!["diet".into()]);
        store.insert_block(&block).await.unwrap();

        let loaded = store.get_block(&block.block_id).await.unwrap();
        assert_eq!(loaded.topic_label, "Diet");
        assert_eq!(loaded.status, BlockStatus::Active);
        assert_eq!(loaded.keywords, vec!["diet".to_string()]);
    }

    #[tokio::test]
    async fn test_status_mirror_column_stays_in_sync() {
        let (_backend, store) = store().await;
        let mut block = BridgeBlock::new("2026-08-01".into(), "Diet".into(), vec![]);
        store.insert_block(&block).await.unwrap();

        block.status = BlockStatus::Paused;
        store.save_block(&block).await.unwrap();

        assert!(store.active_block("2026-08-01").await.unwrap().is_none());
        assert_eq!(
            store.get_block(&block.block_id).await.unwrap().status,
            BlockStatus::Paused
        );
    }

    #[tokio::test]
    async fn test_find_block_for_turn() {
        let (_backend, store) = store().await;
        let mut block = BridgeBlock::new("2026-08-01".into(), "Diet".into(), vec![]);
        block.turns.push(BlockTurn {
            turn_id: "turn_1".into(),
            turn_sequence: 1,
            timestamp: Utc::now(),
            user_message: "hi".into(),
            assistant_response: "hello".into(),
        });
        store.insert_block(&block).await.unwrap();

        assert_eq!(
            store
                .find_block_for_turn("2026-08-01", "turn_1")
                .await
                .unwrap()
                .as_deref(),
            Some(block.block_id.as_str())
        );
        assert!(store
            .find_block_for_turn("2026-08-01", "turn_2")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_metadata_replace_is_idempotent() {
        let (_backend, store) = store().await;
        let metadata = BlockMetadata {
            global_tags: vec![GlobalTag {
                category: "constraint".into(),
                value: "strictly vegetarian".into(),
            }],
            section_rules: vec![],
        };

        store.put_metadata("block_1", &metadata).await.unwrap();
        store.put_metadata("block_1", &metadata).await.unwrap();

        let loaded = store.get_metadata("block_1").await.unwrap();
        assert_eq!(loaded.global_tags.len(), 1);
        assert_eq!(loaded.global_tags[0].value, "strictly vegetarian");
    }

    #[tokio::test]
    async fn test_closed_ungardened_filters_gardened() {
        let (_backend, store) = store().await;

        let mut closed = BridgeBlock::new("2026-08-01".into(), "A".into(), vec![]);
        closed.status = BlockStatus::Closed;
        store.insert_block(&closed).await.unwrap();

        let mut gardened = BridgeBlock::new("2026-08-01".into(), "B".into(), vec![]);
        gardened.status = BlockStatus::Closed;
        gardened.header.gardened = true;
        store.insert_block(&gardened).await.unwrap();

        let pending = store.closed_ungardened().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].block_id, closed.block_id);
    }
}
