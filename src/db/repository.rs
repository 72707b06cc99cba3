//! Durable request storage keyed by `request_id`.
//!
//! The full PipelineState is persisted as a JSON snapshot after every stage
//! and at the approval suspension point, so a process restart never loses a
//! pending review.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::DatabaseError;
use crate::pipeline::state::{PipelineState, RequestStatus};

/// A request loaded back from the database.
#[derive(Debug)]
pub struct PersistedRequest {
    pub state: PipelineState,
    pub status: RequestStatus,
}

/// Insert or update the snapshot for a request.
pub fn upsert_request(
    conn: &Connection,
    state: &PipelineState,
    status: RequestStatus,
) -> Result<(), DatabaseError> {
    let state_json = serde_json::to_string(state)?;
    conn.execute(
        "INSERT INTO pipeline_requests (request_id, status, state_json, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(request_id) DO UPDATE SET
             status = excluded.status,
             state_json = excluded.state_json,
             updated_at = excluded.updated_at",
        params![
            state.request_id.to_string(),
            status.as_str(),
            state_json,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Load a request by id. Returns None when the id is unknown.
pub fn get_request(
    conn: &Connection,
    request_id: &Uuid,
) -> Result<Option<PersistedRequest>, DatabaseError> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT status, state_json FROM pipeline_requests WHERE request_id = ?1",
            params![request_id.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let Some((status_str, state_json)) = row else {
        return Ok(None);
    };

    let status = RequestStatus::parse(&status_str).ok_or_else(|| {
        DatabaseError::Corrupt(format!("unknown request status '{status_str}'"))
    })?;
    let state: PipelineState = serde_json::from_str(&state_json)?;

    Ok(Some(PersistedRequest { state, status }))
}

/// Request ids currently suspended at the approval gate, oldest first.
pub fn list_awaiting_approval(conn: &Connection) -> Result<Vec<Uuid>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT request_id FROM pipeline_requests
         WHERE status = 'awaiting_approval' ORDER BY updated_at ASC",
    )?;
    let ids = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .filter_map(|r| r.ok())
        .filter_map(|s| Uuid::parse_str(&s).ok())
        .collect();
    Ok(ids)
}
