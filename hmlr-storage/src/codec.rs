//! Column codecs shared by the stores
//!
//! Timestamps are RFC 3339 text, structured columns are JSON text, and
//! embeddings are `float32[D]` little-endian blobs. The blob codec is
//! explicit about byte order so the on-disk format is identical on every
//! platform.

use chrono::{DateTime, Utc};
use libsql::Row;
use serde::de::DeserializeOwned;
use serde::Serialize;

use hmlr_core::{HmlrError, Result};

/// Render a timestamp for a text column
#[must_use]
pub fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

/// Parse a timestamp from a text column
///
/// # Errors
///
/// Returns [`HmlrError::StorageRead`] if the column is not RFC 3339.
pub fn ts_from_sql(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| HmlrError::StorageRead(format!("bad timestamp {text:?}: {e}")))
}

/// Serialize a structured value for a JSON text column
///
/// # Errors
///
/// Returns [`HmlrError::Serialization`] on encode failure.
pub fn json_to_sql<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Deserialize a structured value from a JSON text column
///
/// # Errors
///
/// Returns [`HmlrError::Serialization`] on decode failure.
pub fn json_from_sql<T: DeserializeOwned>(text: &str) -> Result<T> {
    Ok(serde_json::from_str(text)?)
}

/// Encode an embedding as a little-endian `float32` blob
#[must_use]
pub fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

/// Decode a little-endian `float32` blob back into an embedding
///
/// # Errors
///
/// Returns [`HmlrError::StorageRead`] if the blob length is not a
/// multiple of four bytes.
pub fn blob_to_embedding(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(HmlrError::StorageRead(format!(
            "embedding blob length {} is not a multiple of 4",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|bytes| f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        .collect())
}

/// Read a nullable text column
///
/// # Errors
///
/// Returns [`HmlrError::StorageRead`] if the column holds a non-text,
/// non-null value.
pub fn opt_text(row: &Row, index: i32) -> Result<Option<String>> {
    match row
        .get_value(index)
        .map_err(|e| HmlrError::StorageRead(format!("column {index}: {e}")))?
    {
        libsql::Value::Null => Ok(None),
        libsql::Value::Text(text) => Ok(Some(text)),
        other => Err(HmlrError::StorageRead(format!(
            "column {index}: expected text, found {other:?}"
        ))),
    }
}

/// Map a libsql read failure
#[must_use]
pub fn read_err(e: libsql::Error) -> HmlrError {
    HmlrError::StorageRead(e.to_string())
}

/// Map a libsql write failure
#[must_use]
pub fn write_err(e: libsql::Error) -> HmlrError {
    HmlrError::StorageWrite(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_blob_roundtrip() {
        let embedding = vec![0.25_f32, -1.5, 3.75, 0.0];
        let blob = embedding_to_blob(&embedding);
        assert_eq!(blob.len(), 16);
        let decoded = blob_to_embedding(&blob).unwrap();
        assert_eq!(decoded, embedding);
    }

    #[test]
    fn test_blob_is_little_endian() {
        let blob = embedding_to_blob(&[1.0_f32]);
        assert_eq!(blob, 1.0_f32.to_le_bytes().to_vec());
    }

    #[test]
    fn test_truncated_blob_rejected() {
        let err = blob_to_embedding(&[0, 0, 0]).unwrap_err();
        assert!(matches!(err, HmlrError::StorageRead(_)));
    }

    #[test]
    fn test_timestamp_roundtrip() {
        let now = Utc::now();
        let parsed = ts_from_sql(&ts_to_sql(now)).unwrap();
        assert_eq!(parsed.timestamp_micros(), now.timestamp_micros());
    }
}
