//! Processing-status repository — the raw rows behind the status ledger.
//!
//! Functions here take a `&Connection` so the ledger can compose them inside
//! one `IMMEDIATE` transaction. Rows are keyed by
//! `(document_id, generation_id, stage)`.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::DatabaseError;

/// A raw ledger row.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusRow {
    pub document_id: String,
    pub generation_id: String,
    pub stage: String,
    pub status: String,
    pub attempt_count: u32,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub error_detail: Option<String>,
    pub output_ref: Option<String>,
    pub handed_off: bool,
    pub updated_at: String,
}

impl StatusRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            document_id: row.get("document_id")?,
            generation_id: row.get("generation_id")?,
            stage: row.get("stage")?,
            status: row.get("status")?,
            attempt_count: row.get("attempt_count")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            error_detail: row.get("error_detail")?,
            output_ref: row.get("output_ref")?,
            handed_off: row.get::<_, i64>("handed_off")? != 0,
            updated_at: row.get("updated_at")?,
        })
    }
}

pub fn find_in(
    conn: &Connection,
    document_id: &str,
    generation_id: &str,
    stage: &str,
) -> Result<Option<StatusRow>, DatabaseError> {
    Ok(conn
        .query_row(
            "SELECT * FROM processing_status
             WHERE document_id = ?1 AND generation_id = ?2 AND stage = ?3",
            params![document_id, generation_id, stage],
            StatusRow::from_row,
        )
        .optional()?)
}

/// All rows of one generation. Callers sort by pipeline order.
pub fn list_for_generation(
    conn: &Connection,
    document_id: &str,
    generation_id: &str,
) -> Result<Vec<StatusRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM processing_status WHERE document_id = ?1 AND generation_id = ?2",
    )?;
    let rows = stmt
        .query_map(params![document_id, generation_id], StatusRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Creates or re-claims a row as `in_progress`, bumping `attempt_count`.
/// Returns the new attempt count.
pub fn mark_in_progress(
    conn: &Connection,
    document_id: &str,
    generation_id: &str,
    stage: &str,
    now: &str,
) -> Result<u32, DatabaseError> {
    let attempt_count = conn.query_row(
        "INSERT INTO processing_status
             (document_id, generation_id, stage, status, attempt_count, started_at, updated_at)
         VALUES (?1, ?2, ?3, 'in_progress', 1, ?4, ?4)
         ON CONFLICT (document_id, generation_id, stage) DO UPDATE SET
             status = 'in_progress',
             attempt_count = attempt_count + 1,
             started_at = excluded.started_at,
             updated_at = excluded.updated_at
         RETURNING attempt_count",
        params![document_id, generation_id, stage, now],
        |r| r.get(0),
    )?;
    Ok(attempt_count)
}

/// Moves an `in_progress` row to `completed`. Returns `false` when the row
/// was not `in_progress`.
pub fn mark_completed(
    conn: &Connection,
    document_id: &str,
    generation_id: &str,
    stage: &str,
    completed_at: &str,
    output_ref: &str,
    now: &str,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE processing_status
         SET status = 'completed', completed_at = ?4, output_ref = ?5, error_detail = NULL,
             handed_off = 0, updated_at = ?6
         WHERE document_id = ?1 AND generation_id = ?2 AND stage = ?3 AND status = 'in_progress'",
        params![document_id, generation_id, stage, completed_at, output_ref, now],
    )?;
    Ok(changed == 1)
}

/// Records that the next stage's message was durably enqueued.
pub fn mark_handed_off(
    conn: &Connection,
    document_id: &str,
    generation_id: &str,
    stage: &str,
    now: &str,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE processing_status SET handed_off = 1, updated_at = ?4
         WHERE document_id = ?1 AND generation_id = ?2 AND stage = ?3 AND status = 'completed'",
        params![document_id, generation_id, stage, now],
    )?;
    Ok(changed == 1)
}

/// Returns an `in_progress` row to `pending` after a transient failure.
pub fn mark_pending(
    conn: &Connection,
    document_id: &str,
    generation_id: &str,
    stage: &str,
    error_detail: &str,
    now: &str,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE processing_status SET status = 'pending', error_detail = ?4, updated_at = ?5
         WHERE document_id = ?1 AND generation_id = ?2 AND stage = ?3 AND status = 'in_progress'",
        params![document_id, generation_id, stage, error_detail, now],
    )?;
    Ok(changed == 1)
}

/// Marks a row `failed`, creating it if the stage was never claimed.
/// A `completed` row is left untouched; returns `false` in that case.
pub fn mark_failed(
    conn: &Connection,
    document_id: &str,
    generation_id: &str,
    stage: &str,
    error_detail: &str,
    now: &str,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "INSERT INTO processing_status
             (document_id, generation_id, stage, status, attempt_count, error_detail, updated_at)
         VALUES (?1, ?2, ?3, 'failed', 0, ?4, ?5)
         ON CONFLICT (document_id, generation_id, stage) DO UPDATE SET
             status = 'failed',
             error_detail = excluded.error_detail,
             updated_at = excluded.updated_at
         WHERE processing_status.status != 'completed'",
        params![document_id, generation_id, stage, error_detail, now],
    )?;
    Ok(changed == 1)
}
