//! Turn and chunk persistence
//!
//! A turn and its chunk hierarchy are written in one transaction; a turn
//! with half its chunks is never observable.

use libsql::{params, Connection, Row, Value};
use tracing::debug;

use hmlr_core::types::{Chunk, ChunkType, ConversationTurn, DetailLevel};
use hmlr_core::{HmlrError, Result};

use crate::codec::{json_from_sql, json_to_sql, opt_text, read_err, ts_from_sql, ts_to_sql, write_err};

/// Store for the `turns` and `chunks` tables
#[derive(Clone)]
pub struct TurnStore {
    conn: Connection,
}

impl TurnStore {
    /// Create a store over an open connection
    #[must_use]
    pub const fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Insert a turn and its chunks atomically
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::StorageWrite`] if any row fails; nothing is
    /// persisted in that case.
    pub async fn insert_turn(&self, turn: &ConversationTurn, chunks: &[Chunk]) -> Result<()> {
        let tx = self.conn.transaction().await.map_err(write_err)?;

        tx.execute(
            "INSERT INTO turns (turn_id, session_id, day_id, turn_sequence, timestamp,
                 user_message, assistant_response, detail_level, compressed_content,
                 keywords, topics, affect)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                turn.turn_id.as_str(),
                turn.session_id.as_str(),
                turn.day_id.as_str(),
                i64::try_from(turn.turn_sequence)
                    .map_err(|e| HmlrError::InvalidInput(e.to_string()))?,
                ts_to_sql(turn.timestamp),
                turn.user_message.as_str(),
                turn.assistant_response.as_str(),
                detail_level_to_sql(turn.detail_level),
                opt_value(turn.compressed_content.clone()),
                json_to_sql(&turn.keywords)?,
                json_to_sql(&turn.topics)?,
                opt_value(turn.affect.clone()),
            ],
        )
        .await
        .map_err(write_err)?;

        for chunk in chunks {
            tx.execute(
                "INSERT OR REPLACE INTO chunks (chunk_id, turn_id, span_id, chunk_type,
                     parent_chunk_id, text_verbatim, token_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    chunk.chunk_id.as_str(),
                    chunk.turn_id.as_str(),
                    opt_value(chunk.span_id.clone()),
                    chunk_type_to_sql(chunk.chunk_type),
                    opt_value(chunk.parent_chunk_id.clone()),
                    chunk.text_verbatim.as_str(),
                    i64::try_from(chunk.token_count)
                        .map_err(|e| HmlrError::InvalidInput(e.to_string()))?,
                ],
            )
            .await
            .map_err(write_err)?;
        }

        tx.commit().await.map_err(write_err)?;
        debug!(
            "Persisted turn {} with {} chunks",
            turn.turn_id,
            chunks.len()
        );
        Ok(())
    }

    /// Fetch a turn by id
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::NotFound`] if the turn does not exist.
    pub async fn get_turn(&self, turn_id: &str) -> Result<ConversationTurn> {
        let mut rows = self
            .conn
            .query(
                "SELECT turn_id, session_id, day_id, turn_sequence, timestamp,
                        user_message, assistant_response, detail_level,
                        compressed_content, keywords, topics, affect
                 FROM turns WHERE turn_id = ?1",
                params![turn_id],
            )
            .await
            .map_err(read_err)?;

        match rows.next().await.map_err(read_err)? {
            Some(row) => turn_from_row(&row),
            None => Err(HmlrError::NotFound(format!("turn {turn_id}"))),
        }
    }

    /// Most recent turns, newest first
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::StorageRead`] on query failure.
    pub async fn recent_turns(&self, limit: usize) -> Result<Vec<ConversationTurn>> {
        let mut rows = self
            .conn
            .query(
                "SELECT turn_id, session_id, day_id, turn_sequence, timestamp,
                        user_message, assistant_response, detail_level,
                        compressed_content, keywords, topics, affect
                 FROM turns ORDER BY rowid DESC LIMIT ?1",
                params![i64::try_from(limit).unwrap_or(i64::MAX)],
            )
            .await
            .map_err(read_err)?;

        let mut turns = Vec::new();
        while let Some(row) = rows.next().await.map_err(read_err)? {
            turns.push(turn_from_row(&row)?);
        }
        Ok(turns)
    }

    /// Highest `turn_sequence` recorded for a session, 0 when none
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::StorageRead`] on query failure.
    pub async fn max_sequence(&self, session_id: &str) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COALESCE(MAX(turn_sequence), 0) FROM turns WHERE session_id = ?1",
                params![session_id],
            )
            .await
            .map_err(read_err)?;

        match rows.next().await.map_err(read_err)? {
            Some(row) => {
                let max: i64 = row.get(0).map_err(read_err)?;
                Ok(u64::try_from(max).unwrap_or(0))
            }
            None => Ok(0),
        }
    }

    /// Record the compression of an aged turn
    ///
    /// The only mutation a stored turn ever receives.
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::StorageWrite`] on failure.
    pub async fn update_compression(&self, turn_id: &str, compressed_content: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE turns SET detail_level = 'COMPRESSED', compressed_content = ?2
                 WHERE turn_id = ?1",
                params![turn_id, compressed_content],
            )
            .await
            .map_err(write_err)?;
        Ok(())
    }

    /// Remove a turn and its chunks (rollback path)
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::StorageWrite`] on failure.
    pub async fn delete_turn(&self, turn_id: &str) -> Result<()> {
        let tx = self.conn.transaction().await.map_err(write_err)?;
        tx.execute("DELETE FROM chunks WHERE turn_id = ?1", params![turn_id])
            .await
            .map_err(write_err)?;
        tx.execute("DELETE FROM turns WHERE turn_id = ?1", params![turn_id])
            .await
            .map_err(write_err)?;
        tx.commit().await.map_err(write_err)?;
        Ok(())
    }

    /// All chunks of a turn, parents before children
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::StorageRead`] on query failure.
    pub async fn chunks_for_turn(&self, turn_id: &str) -> Result<Vec<Chunk>> {
        let mut rows = self
            .conn
            .query(
                "SELECT chunk_id, turn_id, span_id, chunk_type, parent_chunk_id,
                        text_verbatim, token_count
                 FROM chunks WHERE turn_id = ?1 ORDER BY rowid",
                params![turn_id],
            )
            .await
            .map_err(read_err)?;

        let mut chunks = Vec::new();
        while let Some(row) = rows.next().await.map_err(read_err)? {
            chunks.push(chunk_from_row(&row)?);
        }
        Ok(chunks)
    }

    /// Fetch a single chunk by id
    ///
    /// # Errors
    ///
    /// Returns [`HmlrError::StorageRead`] on query failure.
    pub async fn get_chunk(&self, chunk_id: &str) -> Result<Option<Chunk>> {
        let mut rows = self
            .conn
            .query(
                "SELECT chunk_id, turn_id, span_id, chunk_type, parent_chunk_id,
                        text_verbatim, token_count
                 FROM chunks WHERE chunk_id = ?1",
                params![chunk_id],
            )
            .await
            .map_err(read_err)?;

        match rows.next().await.map_err(read_err)? {
            Some(row) => Ok(Some(chunk_from_row(&row)?)),
            None => Ok(None),
        }
    }
}

const fn detail_level_to_sql(level: DetailLevel) -> &'static str {
    match level {
        DetailLevel::Verbatim => "VERBATIM",
        DetailLevel::Compressed => "COMPRESSED",
    }
}

const fn chunk_type_to_sql(kind: ChunkType) -> &'static str {
    match kind {
        ChunkType::Turn => "turn",
        ChunkType::Paragraph => "paragraph",
        ChunkType::Sentence => "sentence",
    }
}

fn opt_value(value: Option<String>) -> Value {
    value.map_or(Value::Null, Value::Text)
}

fn turn_from_row(row: &Row) -> Result<ConversationTurn> {
    let detail: String = row.get(7).map_err(read_err)?;
    let keywords: String = row.get(9).map_err(read_err)?;
    let topics: String = row.get(10).map_err(read_err)?;
    let ts: String = row.get(4).map_err(read_err)?;
    let sequence: i64 = row.get(3).map_err(read_err)?;

    Ok(ConversationTurn {
        turn_id: row.get(0).map_err(read_err)?,
        session_id: row.get(1).map_err(read_err)?,
        day_id: row.get(2).map_err(read_err)?,
        turn_sequence: u64::try_from(sequence)
            .map_err(|e| HmlrError::StorageRead(e.to_string()))?,
        timestamp: ts_from_sql(&ts)?,
        user_message: row.get(5).map_err(read_err)?,
        assistant_response: row.get(6).map_err(read_err)?,
        detail_level: if detail == "COMPRESSED" {
            DetailLevel::Compressed
        } else {
            DetailLevel::Verbatim
        },
        compressed_content: opt_text(row, 8)?,
        keywords: json_from_sql(&keywords)?,
        topics: json_from_sql(&topics)?,
        affect: opt_text(row, 11)?,
    })
}

fn chunk_from_row(row: &Row) -> Result<Chunk> {
    let kind: String = row.get(3).map_err(read_err)?;
    let tokens: i64 = row.get(6).map_err(read_err)?;

    Ok(Chunk {
        chunk_id: row.get(0).map_err(read_err)?,
        turn_id: row.get(1).map_err(read_err)?,
        span_id: opt_text(row, 2)?,
        chunk_type: match kind.as_str() {
            "paragraph" => ChunkType::Paragraph,
            "sentence" => ChunkType::Sentence,
            _ => ChunkType::Turn,
        },
        parent_chunk_id: opt_text(row, 4)?,
        text_verbatim: row.get(5).map_err(read_err)?,
        token_count: usize::try_from(tokens).map_err(|e| HmlrError::StorageRead(e.to_string()))?,
    })
}
