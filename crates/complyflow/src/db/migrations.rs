//! Database migration system.
//!
//! Schema versions applied so far are recorded in `_migrations`; each
//! pending version runs in its own transaction, in order.

use rusqlite::Connection;

use super::error::DatabaseError;

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

/// All migrations in order. Each is applied at most once.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create_documents_table",
        sql: include_str!("sql/001_create_documents.sql"),
    },
    Migration {
        version: 2,
        description: "create_processing_status_table",
        sql: include_str!("sql/002_create_processing_status.sql"),
    },
    Migration {
        version: 3,
        description: "create_obligations_table",
        sql: include_str!("sql/003_create_obligations.sql"),
    },
    Migration {
        version: 4,
        description: "create_tasks_table",
        sql: include_str!("sql/004_create_tasks.sql"),
    },
    Migration {
        version: 5,
        description: "create_reports_table",
        sql: include_str!("sql/005_create_reports.sql"),
    },
    Migration {
        version: 6,
        description: "create_queue_tables",
        sql: include_str!("sql/006_create_queue.sql"),
    },
    Migration {
        version: 7,
        description: "create_obligation_sets_table",
        sql: include_str!("sql/007_create_obligation_sets.sql"),
    },
];

/// Brings the schema on `conn` up to the latest version.
pub fn run_all(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let current_version: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |r| r.get(0),
    )?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current_version) {
        log::info!(
            "Applying schema v{} ({})",
            migration.version,
            migration.description
        );

        // Schema change and bookkeeping row land together or not at all.
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration.sql)
            .map_err(|e| DatabaseError::Migration {
                version: migration.version,
                reason: e.to_string(),
            })?;
        tx.execute(
            "INSERT INTO _migrations (version, description) VALUES (?1, ?2)",
            rusqlite::params![migration.version, migration.description],
        )?;
        tx.commit()?;
    }

    Ok(())
}
