//! Document repository — the `documents` table.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{Database, DatabaseError};

/// A raw document row from the database.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRow {
    pub document_id: String,
    pub source_key: String,
    pub owner: String,
    pub stage: String,
    pub current_generation: String,
    pub error_detail: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl DocumentRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            document_id: row.get("document_id")?,
            source_key: row.get("source_key")?,
            owner: row.get("owner")?,
            stage: row.get("stage")?,
            current_generation: row.get("current_generation")?,
            error_detail: row.get("error_detail")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Inserts a new document. Fails with `Duplicate` when the id is taken.
pub fn insert(db: &Database, doc: &DocumentRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO documents (document_id, source_key, owner, stage,
             current_generation, error_detail, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                doc.document_id,
                doc.source_key,
                doc.owner,
                doc.stage,
                doc.current_generation,
                doc.error_detail,
                doc.created_at,
                doc.updated_at,
            ],
        )?;
        if inserted == 0 {
            return Err(DatabaseError::Duplicate {
                entity: "document",
                key: doc.document_id.clone(),
            });
        }
        Ok(())
    })
}

/// Finds a document by its ID.
pub fn find_by_id(db: &Database, document_id: &str) -> Result<Option<DocumentRow>, DatabaseError> {
    db.with_conn(|conn| find_in(conn, document_id))
}

/// Same as [`find_by_id`] but on a connection or open transaction.
pub fn find_in(conn: &Connection, document_id: &str) -> Result<Option<DocumentRow>, DatabaseError> {
    Ok(conn
        .query_row(
            "SELECT * FROM documents WHERE document_id = ?1",
            params![document_id],
            DocumentRow::from_row,
        )
        .optional()?)
}

/// Sets the document stage for the given generation. Returns `false` when
/// the document has moved on to another generation.
pub fn set_stage_in(
    conn: &Connection,
    document_id: &str,
    generation_id: &str,
    stage: &str,
    error_detail: Option<&str>,
    now: &str,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE documents SET stage = ?3, error_detail = ?4, updated_at = ?5
         WHERE document_id = ?1 AND current_generation = ?2",
        params![document_id, generation_id, stage, error_detail, now],
    )?;
    Ok(changed == 1)
}

/// Starts a new generation, resetting the stage to `received`. Only succeeds
/// when the document is in one of the given terminal stages.
pub fn start_generation_in(
    conn: &Connection,
    document_id: &str,
    generation_id: &str,
    terminal_stages: &[&str],
    now: &str,
) -> Result<bool, DatabaseError> {
    let doc = match find_in(conn, document_id)? {
        Some(doc) => doc,
        None => return Ok(false),
    };
    if !terminal_stages.contains(&doc.stage.as_str()) {
        return Ok(false);
    }
    let changed = conn.execute(
        "UPDATE documents SET current_generation = ?2, stage = 'received', error_detail = NULL,
         updated_at = ?3 WHERE document_id = ?1 AND stage = ?4",
        params![document_id, generation_id, now, doc.stage],
    )?;
    Ok(changed == 1)
}

/// Lists documents currently at the given stage, oldest first.
pub fn list_by_stage(db: &Database, stage: &str) -> Result<Vec<DocumentRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT * FROM documents WHERE stage = ?1 ORDER BY created_at ASC")?;
        let rows = stmt
            .query_map(params![stage], DocumentRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}
