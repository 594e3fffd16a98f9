//! Report repository — written only by the reporting stage.
//!
//! A report is keyed by `(document_id, generation_id, report_request_id)`,
//! so regenerating with the same request id finds the existing row.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::{get_json_list, get_label, to_json_list, Database, DatabaseError};
use crate::domain::ReportStatus;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRow {
    pub report_id: String,
    pub document_id: String,
    pub generation_id: String,
    pub report_request_id: String,
    pub status: ReportStatus,
    pub obligation_ids: Vec<String>,
    pub task_ids: Vec<String>,
    pub artifact_key: Option<String>,
    pub error_detail: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

impl ReportRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            report_id: row.get("report_id")?,
            document_id: row.get("document_id")?,
            generation_id: row.get("generation_id")?,
            report_request_id: row.get("report_request_id")?,
            status: get_label(row, "status")?,
            obligation_ids: get_json_list(row, "obligation_ids")?,
            task_ids: get_json_list(row, "task_ids")?,
            artifact_key: row.get("artifact_key")?,
            error_detail: row.get("error_detail")?,
            created_at: row.get("created_at")?,
            completed_at: row.get("completed_at")?,
        })
    }
}

/// Inserts a `generating` report unless one already exists for the same
/// request. Returns the stored row and whether it was newly created.
pub fn begin(db: &Database, report: &ReportRow) -> Result<(ReportRow, bool), DatabaseError> {
    db.with_tx(|tx| {
        if let Some(existing) = find_request_in(
            tx,
            &report.document_id,
            &report.generation_id,
            &report.report_request_id,
        )? {
            return Ok((existing, false));
        }
        tx.execute(
            "INSERT INTO reports (report_id, document_id, generation_id, report_request_id,
             status, obligation_ids, task_ids, artifact_key, error_detail, created_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                report.report_id,
                report.document_id,
                report.generation_id,
                report.report_request_id,
                report.status.as_str(),
                to_json_list(&report.obligation_ids),
                to_json_list(&report.task_ids),
                report.artifact_key,
                report.error_detail,
                report.created_at,
                report.completed_at,
            ],
        )
        .map_err(|e| match DatabaseError::from(e) {
            err if err.is_duplicate() => DatabaseError::Duplicate {
                entity: "report",
                key: report.report_id.clone(),
            },
            err => err,
        })?;
        Ok((report.clone(), true))
    })
}

/// Marks a report `completed` with its artifact and compiled references.
pub fn complete(
    db: &Database,
    report_id: &str,
    artifact_key: &str,
    obligation_ids: &[String],
    task_ids: &[String],
    now: &str,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE reports SET status = 'completed', artifact_key = ?2, obligation_ids = ?3,
             task_ids = ?4, error_detail = NULL, completed_at = ?5
             WHERE report_id = ?1 AND status != 'completed'",
            params![
                report_id,
                artifact_key,
                to_json_list(obligation_ids),
                to_json_list(task_ids),
                now
            ],
        )?;
        if changed == 0 {
            return Err(DatabaseError::Conflict(format!(
                "report {} is missing or already completed",
                report_id
            )));
        }
        Ok(())
    })
}

/// Records a failed attempt. The row stays retryable under the same request.
pub fn mark_failed(db: &Database, report_id: &str, error: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE reports SET status = 'failed', error_detail = ?2
             WHERE report_id = ?1 AND status != 'completed'",
            params![report_id, error],
        )?;
        Ok(())
    })
}

/// Moves a failed report back to `generating` for another attempt.
pub fn restart(db: &Database, report_id: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE reports SET status = 'generating', error_detail = NULL
             WHERE report_id = ?1 AND status = 'failed'",
            params![report_id],
        )?;
        Ok(())
    })
}

pub fn find_by_request(
    db: &Database,
    document_id: &str,
    generation_id: &str,
    request_id: &str,
) -> Result<Option<ReportRow>, DatabaseError> {
    db.with_conn(|conn| find_request_in(conn, document_id, generation_id, request_id))
}

fn find_request_in(
    conn: &Connection,
    document_id: &str,
    generation_id: &str,
    request_id: &str,
) -> Result<Option<ReportRow>, DatabaseError> {
    Ok(conn
        .query_row(
            "SELECT * FROM reports
             WHERE document_id = ?1 AND generation_id = ?2 AND report_request_id = ?3",
            params![document_id, generation_id, request_id],
            ReportRow::from_row,
        )
        .optional()?)
}

/// Reports of one generation, oldest first.
pub fn list_for_generation(
    db: &Database,
    document_id: &str,
    generation_id: &str,
) -> Result<Vec<ReportRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM reports WHERE document_id = ?1 AND generation_id = ?2
             ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map(params![document_id, generation_id], ReportRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}
