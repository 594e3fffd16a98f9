//! Task repository — written only by the planning stage.

use rusqlite::{params, Connection, Row};

use super::{get_label, Database, DatabaseError, WriteOutcome};
use crate::domain::{TaskPriority, TaskStatus};

#[derive(Debug, Clone, PartialEq)]
pub struct TaskRow {
    pub task_id: String,
    pub obligation_id: String,
    pub document_id: String,
    pub generation_id: String,
    pub title: String,
    pub description: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub assigned_to: Option<String>,
    /// Calendar date, `YYYY-MM-DD`.
    pub due_date: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            task_id: row.get("task_id")?,
            obligation_id: row.get("obligation_id")?,
            document_id: row.get("document_id")?,
            generation_id: row.get("generation_id")?,
            title: row.get("title")?,
            description: row.get("description")?,
            priority: get_label(row, "priority")?,
            status: get_label(row, "status")?,
            assigned_to: row.get("assigned_to")?,
            due_date: row.get("due_date")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Writes all tasks of one generation atomically. Each obligation gets at
/// most one task; a second task for the same obligation is a duplicate.
pub fn insert_generation(
    db: &Database,
    document_id: &str,
    generation_id: &str,
    rows: &[TaskRow],
) -> Result<WriteOutcome<TaskRow>, DatabaseError> {
    db.with_tx(|tx| {
        let existing = list_in(tx, document_id, generation_id)?;
        if !existing.is_empty() {
            return Ok(WriteOutcome::AlreadyPresent(existing));
        }

        for row in rows {
            if row.document_id != document_id || row.generation_id != generation_id {
                return Err(DatabaseError::Conflict(format!(
                    "task {} belongs to {}/{}, not {}/{}",
                    row.task_id, row.document_id, row.generation_id, document_id, generation_id
                )));
            }
            tx.execute(
                "INSERT INTO tasks (task_id, obligation_id, document_id, generation_id, title,
                 description, priority, status, assigned_to, due_date, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    row.task_id,
                    row.obligation_id,
                    row.document_id,
                    row.generation_id,
                    row.title,
                    row.description,
                    row.priority.as_str(),
                    row.status.as_str(),
                    row.assigned_to,
                    row.due_date,
                    row.created_at,
                    row.updated_at,
                ],
            )
            .map_err(|e| match DatabaseError::from(e) {
                err if err.is_duplicate() => DatabaseError::Duplicate {
                    entity: "task",
                    key: format!("{} (obligation {})", row.task_id, row.obligation_id),
                },
                err => err,
            })?;
        }
        Ok(WriteOutcome::Inserted(rows.to_vec()))
    })
}

/// Tasks of one generation, highest priority first, then earliest due date.
pub fn list_for_generation(
    db: &Database,
    document_id: &str,
    generation_id: &str,
) -> Result<Vec<TaskRow>, DatabaseError> {
    db.with_conn(|conn| list_in(conn, document_id, generation_id))
}

fn list_in(
    conn: &Connection,
    document_id: &str,
    generation_id: &str,
) -> Result<Vec<TaskRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM tasks WHERE document_id = ?1 AND generation_id = ?2
         ORDER BY CASE priority WHEN 'high' THEN 0 WHEN 'medium' THEN 1 ELSE 2 END,
                  due_date ASC, task_id ASC",
    )?;
    let rows = stmt
        .query_map(params![document_id, generation_id], TaskRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Number of tasks across all generations of a document.
pub fn count_for_document(db: &Database, document_id: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE document_id = ?1",
            params![document_id],
            |r| r.get(0),
        )?)
    })
}
