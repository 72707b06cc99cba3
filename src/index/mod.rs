pub mod embedder;
pub mod ingest;
pub mod search;
pub mod store;

use thiserror::Error;

use crate::db::DatabaseError;

#[derive(Error, Debug)]
pub enum IndexError {
    /// No records have been ingested yet — distinct from a query that
    /// matches nothing, so callers can tell "nothing matched" from
    /// "nothing to search".
    #[error("Index is empty: no records have been ingested")]
    Empty,

    #[error("Embedding generation failed: {0}")]
    Embedding(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Corrupt index record {record_id}: {reason}")]
    CorruptRecord { record_id: String, reason: String },
}
