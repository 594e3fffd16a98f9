//! Obligation repository — written only by the categorization stage.
//!
//! Obligations are immutable. A generation's set is written once in a
//! single transaction together with its `obligation_sets` marker; a retried
//! stage that finds the marker reuses the set, even an empty one, instead
//! of writing again.

use rusqlite::{params, Connection, Row};

use super::{get_json_list, get_label, to_json_list, Database, DatabaseError, WriteOutcome};
use crate::domain::{Category, DeadlineType, Severity};

#[derive(Debug, Clone, PartialEq)]
pub struct ObligationRow {
    pub obligation_id: String,
    pub document_id: String,
    pub generation_id: String,
    pub position: u32,
    pub category: Category,
    pub severity: Severity,
    pub deadline_type: DeadlineType,
    pub description: String,
    pub extracted_text: String,
    pub applicable_entities: Vec<String>,
    pub confidence_score: f64,
    pub created_at: String,
}

impl ObligationRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            obligation_id: row.get("obligation_id")?,
            document_id: row.get("document_id")?,
            generation_id: row.get("generation_id")?,
            position: row.get("position")?,
            category: get_label(row, "category")?,
            severity: get_label(row, "severity")?,
            deadline_type: get_label(row, "deadline_type")?,
            description: row.get("description")?,
            extracted_text: row.get("extracted_text")?,
            applicable_entities: get_json_list(row, "applicable_entities")?,
            confidence_score: row.get("confidence_score")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// Writes all obligations of one generation atomically.
///
/// Every row must belong to `(document_id, generation_id)`. A colliding
/// `obligation_id` is an unexpected duplicate and fails the whole write.
pub fn insert_generation(
    db: &Database,
    document_id: &str,
    generation_id: &str,
    rows: &[ObligationRow],
) -> Result<WriteOutcome<ObligationRow>, DatabaseError> {
    db.with_tx(|tx| {
        if set_recorded_in(tx, document_id, generation_id)? {
            return Ok(WriteOutcome::AlreadyPresent(list_in(tx, document_id, generation_id)?));
        }

        for row in rows {
            if row.document_id != document_id || row.generation_id != generation_id {
                return Err(DatabaseError::Conflict(format!(
                    "obligation {} belongs to {}/{}, not {}/{}",
                    row.obligation_id, row.document_id, row.generation_id, document_id, generation_id
                )));
            }
            tx.execute(
                "INSERT INTO obligations (obligation_id, document_id, generation_id, position,
                 category, severity, deadline_type, description, extracted_text,
                 applicable_entities, confidence_score, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    row.obligation_id,
                    row.document_id,
                    row.generation_id,
                    row.position,
                    row.category.as_str(),
                    row.severity.as_str(),
                    row.deadline_type.as_str(),
                    row.description,
                    row.extracted_text,
                    to_json_list(&row.applicable_entities),
                    row.confidence_score,
                    row.created_at,
                ],
            )
            .map_err(|e| match DatabaseError::from(e) {
                err if err.is_duplicate() => DatabaseError::Duplicate {
                    entity: "obligation",
                    key: row.obligation_id.clone(),
                },
                err => err,
            })?;
        }
        let created_at = rows
            .first()
            .map(|r| r.created_at.clone())
            .unwrap_or_else(|| crate::db::format_timestamp(chrono::Utc::now()));
        tx.execute(
            "INSERT INTO obligation_sets (document_id, generation_id, obligation_count, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![document_id, generation_id, rows.len() as i64, created_at],
        )?;
        Ok(WriteOutcome::Inserted(rows.to_vec()))
    })
}

/// Whether categorization already stored this generation's set, empty or not.
pub fn is_recorded(db: &Database, document_id: &str, generation_id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| set_recorded_in(conn, document_id, generation_id))
}

fn set_recorded_in(conn: &Connection, document_id: &str, generation_id: &str) -> Result<bool, DatabaseError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM obligation_sets WHERE document_id = ?1 AND generation_id = ?2",
        params![document_id, generation_id],
        |r| r.get(0),
    )?;
    Ok(count > 0)
}

/// Obligations of one generation in extraction order.
pub fn list_for_generation(
    db: &Database,
    document_id: &str,
    generation_id: &str,
) -> Result<Vec<ObligationRow>, DatabaseError> {
    db.with_conn(|conn| list_in(conn, document_id, generation_id))
}

fn list_in(
    conn: &Connection,
    document_id: &str,
    generation_id: &str,
) -> Result<Vec<ObligationRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM obligations WHERE document_id = ?1 AND generation_id = ?2
         ORDER BY position ASC",
    )?;
    let rows = stmt
        .query_map(params![document_id, generation_id], ObligationRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Number of obligations across all generations of a document.
pub fn count_for_document(db: &Database, document_id: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM obligations WHERE document_id = ?1",
            params![document_id],
            |r| r.get(0),
        )?)
    })
}
