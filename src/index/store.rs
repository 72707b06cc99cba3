//! Vector index storage keyed by content hash.
//!
//! `record_id` is a stable SHA-256 of the normalized source text, so
//! re-ingesting identical content is always a no-op and the index never
//! accumulates duplicate semantic records across runs.

use std::sync::Mutex;

use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::IndexError;
use crate::db::DatabaseError;

/// One indexed record.
#[derive(Debug, Clone)]
pub struct IndexRecord {
    pub record_id: String,
    pub source_text: String,
    pub embedding: Vec<f32>,
    /// Free-form provenance carried from the ingestion source.
    pub metadata: Option<String>,
    pub ingestion_batch_id: Uuid,
}

/// Stable content hash used as the index key.
///
/// Normalization is whitespace collapse + lowercasing; no Unicode folding,
/// so visually distinct clinical terms stay distinct.
pub fn record_id(text: &str) -> String {
    let normalized = normalize_text(text);
    let digest = Sha256::digest(normalized.as_bytes());
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Vector index abstraction
pub trait VectorIndex {
    fn contains(&self, record_id: &str) -> Result<bool, IndexError>;
    fn insert(&self, record: &IndexRecord) -> Result<(), IndexError>;
    fn len(&self) -> Result<usize, IndexError>;
    fn all(&self) -> Result<Vec<IndexRecord>, IndexError>;
}

// ---------------------------------------------------------------------------
// SQLite-backed index
// ---------------------------------------------------------------------------

/// Persistent index over the `index_records` table.
///
/// Inserts are record-level atomic: a concurrent reader sees either the
/// pre- or post-upsert row for any record, never a partial one.
pub struct SqliteVectorIndex {
    conn: Connection,
}

impl SqliteVectorIndex {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }
}

impl VectorIndex for SqliteVectorIndex {
    fn contains(&self, record_id: &str) -> Result<bool, IndexError> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM index_records WHERE record_id = ?1",
                params![record_id],
                |row| row.get(0),
            )
            .map_err(DatabaseError::from)?;
        Ok(count > 0)
    }

    fn insert(&self, record: &IndexRecord) -> Result<(), IndexError> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO index_records
                     (record_id, source_text, embedding, metadata, batch_id, ingested_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.record_id,
                    record.source_text,
                    embedding_to_blob(&record.embedding),
                    record.metadata,
                    record.ingestion_batch_id.to_string(),
                    chrono::Utc::now().to_rfc3339(),
                ],
            )
            .map_err(DatabaseError::from)?;
        Ok(())
    }

    fn len(&self) -> Result<usize, IndexError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM index_records", [], |row| row.get(0))
            .map_err(DatabaseError::from)?;
        Ok(count as usize)
    }

    fn all(&self) -> Result<Vec<IndexRecord>, IndexError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT record_id, source_text, embedding, metadata, batch_id
                 FROM index_records",
            )
            .map_err(DatabaseError::from)?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(DatabaseError::from)?;

        let mut records = Vec::new();
        for row in rows {
            let (record_id, source_text, blob, metadata, batch_id) =
                row.map_err(DatabaseError::from)?;
            let ingestion_batch_id =
                Uuid::parse_str(&batch_id).map_err(|e| IndexError::CorruptRecord {
                    record_id: record_id.clone(),
                    reason: e.to_string(),
                })?;
            records.push(IndexRecord {
                record_id,
                source_text,
                embedding: blob_to_embedding(&blob),
                metadata,
                ingestion_batch_id,
            });
        }
        Ok(records)
    }
}

fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

// ---------------------------------------------------------------------------
// In-memory index
// ---------------------------------------------------------------------------

/// In-memory vector index for testing.
pub struct InMemoryVectorIndex {
    entries: Mutex<Vec<IndexRecord>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl Default for InMemoryVectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl VectorIndex for InMemoryVectorIndex {
    fn contains(&self, record_id: &str) -> Result<bool, IndexError> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .any(|r| r.record_id == record_id))
    }

    fn insert(&self, record: &IndexRecord) -> Result<(), IndexError> {
        let mut entries = self.entries.lock().unwrap();
        if !entries.iter().any(|r| r.record_id == record.record_id) {
            entries.push(record.clone());
        }
        Ok(())
    }

    fn len(&self) -> Result<usize, IndexError> {
        Ok(self.entries.lock().unwrap().len())
    }

    fn all(&self) -> Result<Vec<IndexRecord>, IndexError> {
        Ok(self.entries.lock().unwrap().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::open_memory_database;

    fn sample(text: &str) -> IndexRecord {
        IndexRecord {
            record_id: record_id(text),
            source_text: text.to_string(),
            embedding: vec![0.5, -0.25, 0.0],
            metadata: None,
            ingestion_batch_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn record_id_is_stable() {
        assert_eq!(record_id("Fever and headache"), record_id("Fever and headache"));
    }

    #[test]
    fn record_id_normalizes_whitespace_and_case() {
        assert_eq!(record_id("  Fever   and\theadache "), record_id("fever and headache"));
    }

    #[test]
    fn record_id_distinguishes_content() {
        assert_ne!(record_id("fever"), record_id("headache"));
    }

    #[test]
    fn embedding_blob_round_trip() {
        let embedding = vec![1.0f32, -0.5, 0.125, 3.25];
        let blob = embedding_to_blob(&embedding);
        assert_eq!(blob.len(), 16);
        assert_eq!(blob_to_embedding(&blob), embedding);
    }

    #[test]
    fn sqlite_index_insert_and_read_back() {
        let index = SqliteVectorIndex::new(open_memory_database().unwrap());
        let record = sample("Question: fever. Answer: rest and fluids.");

        index.insert(&record).unwrap();

        assert!(index.contains(&record.record_id).unwrap());
        assert_eq!(index.len().unwrap(), 1);

        let all = index.all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].record_id, record.record_id);
        assert_eq!(all[0].source_text, record.source_text);
        assert_eq!(all[0].embedding, record.embedding);
    }

    #[test]
    fn sqlite_index_persists_metadata() {
        let index = SqliteVectorIndex::new(open_memory_database().unwrap());
        let mut record = sample("Question: cough. Answer: lozenges.");
        record.metadata = Some("vihealthqa/42".into());

        index.insert(&record).unwrap();

        let all = index.all().unwrap();
        assert_eq!(all[0].metadata.as_deref(), Some("vihealthqa/42"));
    }

    #[test]
    fn sqlite_duplicate_insert_is_noop() {
        let index = SqliteVectorIndex::new(open_memory_database().unwrap());
        let record = sample("duplicate content");

        index.insert(&record).unwrap();
        index.insert(&record).unwrap();

        assert_eq!(index.len().unwrap(), 1);
    }

    #[test]
    fn in_memory_duplicate_insert_is_noop() {
        let index = InMemoryVectorIndex::new();
        let record = sample("duplicate content");

        index.insert(&record).unwrap();
        index.insert(&record).unwrap();

        assert_eq!(index.len().unwrap(), 1);
    }

    #[test]
    fn empty_index_has_zero_len() {
        let index = InMemoryVectorIndex::new();
        assert_eq!(index.len().unwrap(), 0);
        assert!(!index.contains("missing").unwrap());
    }
}
