//! Status ledger: the authoritative record of which stage of which
//! generation is pending, running, completed or failed.
//!
//! Every transition runs inside one `IMMEDIATE` transaction that also reads
//! the rows it depends on, so two workers racing on the same document see a
//! consistent ordering.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use super::stage::{DocumentStage, Stage, StageStatus};
use crate::db::status_repo::{self, StatusRow};
use crate::db::{document_repo, format_timestamp, parse_timestamp, Database, DatabaseError};
use crate::queue::StageMessage;

/// Result of trying to start work on a stage message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller owns the stage until it completes, fails or releases it.
    Acquired { attempt_count: u32 },
    /// Duplicate delivery of a stage that already finished.
    AlreadyCompleted,
    /// The stage or the whole document has failed for this generation.
    Terminal,
    /// The message belongs to a generation that is no longer current.
    Stale,
    /// A stage of this generation is running under a live lease.
    Busy { holder: Stage },
    /// The predecessor stage has not completed yet.
    OutOfOrder { waiting_on: Stage },
}

/// Typed view of one ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEntry {
    pub stage: Stage,
    pub status: StageStatus,
    pub attempt_count: u32,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub error_detail: Option<String>,
    pub output_ref: Option<String>,
    pub handed_off: bool,
}

impl StatusEntry {
    fn from_row(row: StatusRow) -> Result<Self, DatabaseError> {
        let corrupt = |reason: String| DatabaseError::Corrupt {
            entity: "processing_status",
            key: format!("{}/{}/{}", row.document_id, row.generation_id, row.stage),
            reason,
        };
        let stage = row.stage.parse::<Stage>().map_err(|e| corrupt(e.to_string()))?;
        let status = row
            .status
            .parse::<StageStatus>()
            .map_err(|e| corrupt(e.to_string()))?;
        Ok(Self {
            stage,
            status,
            attempt_count: row.attempt_count,
            started_at: row.started_at,
            completed_at: row.completed_at,
            error_detail: row.error_detail,
            output_ref: row.output_ref,
            handed_off: row.handed_off,
        })
    }
}

/// Result of recording a stage completion.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Recorded(StatusEntry),
    /// The stage was already completed by an earlier delivery.
    AlreadyCompleted(StatusEntry),
    /// The stage is not held by anyone.
    NotClaimed,
}

pub struct StatusLedger {
    db: Database,
    lease_timeout: Duration,
}

impl StatusLedger {
    pub fn new(db: Database, lease_timeout: Duration) -> Self {
        Self { db, lease_timeout }
    }

    /// Checks the idempotency, generation and ordering guards for `message`
    /// and, when they all pass, marks its stage `in_progress`.
    pub fn claim(&self, message: &StageMessage) -> Result<ClaimOutcome, DatabaseError> {
        let now = Utc::now();
        let stamp = format_timestamp(now);
        self.db.with_tx(|tx| {
            let doc = match document_repo::find_in(tx, &message.document_id)? {
                Some(doc) => doc,
                None => return Ok(ClaimOutcome::Stale),
            };
            if doc.current_generation != message.generation_id {
                return Ok(ClaimOutcome::Stale);
            }
            let doc_stage = parse_document_stage(&doc.document_id, &doc.stage)?;

            let entries = entries_in(tx, &message.document_id, &message.generation_id)?;
            match find(&entries, message.stage).map(|e| e.status) {
                Some(StageStatus::Completed) => return Ok(ClaimOutcome::AlreadyCompleted),
                Some(StageStatus::Failed) => return Ok(ClaimOutcome::Terminal),
                _ => {}
            }
            if doc_stage.is_terminal() {
                return Ok(ClaimOutcome::Terminal);
            }

            if let Some(holder) = entries
                .iter()
                .find(|e| e.status == StageStatus::InProgress && self.lease_live(e, now))
            {
                return Ok(ClaimOutcome::Busy {
                    holder: holder.stage,
                });
            }

            if let Some(previous) = message.stage.previous() {
                let done = find(&entries, previous)
                    .map_or(false, |e| e.status == StageStatus::Completed);
                if !done {
                    return Ok(ClaimOutcome::OutOfOrder {
                        waiting_on: previous,
                    });
                }
            }

            let attempt_count = status_repo::mark_in_progress(
                tx,
                &message.document_id,
                &message.generation_id,
                message.stage.as_str(),
                &stamp,
            )?;

            let started = message.stage.started_document_stage();
            if doc_stage != started && doc_stage.can_transition_to(started) {
                document_repo::set_stage_in(
                    tx,
                    &message.document_id,
                    &message.generation_id,
                    started.as_str(),
                    None,
                    &stamp,
                )?;
            }
            Ok(ClaimOutcome::Acquired { attempt_count })
        })
    }

    /// Records completion of a claimed stage with the reference to its
    /// output. The completion time never precedes the predecessor's.
    pub fn complete(&self, message: &StageMessage, output_ref: &str) -> Result<Completion, DatabaseError> {
        let stamp = format_timestamp(Utc::now());
        self.db.with_tx(|tx| {
            let entries = entries_in(tx, &message.document_id, &message.generation_id)?;
            let own = match find(&entries, message.stage) {
                Some(entry) => entry,
                None => return Ok(Completion::NotClaimed),
            };
            match own.status {
                StageStatus::Completed => return Ok(Completion::AlreadyCompleted(own.clone())),
                StageStatus::InProgress => {}
                StageStatus::Pending | StageStatus::Failed => return Ok(Completion::NotClaimed),
            }

            let completed_at = message
                .stage
                .previous()
                .and_then(|p| find(&entries, p))
                .and_then(|p| p.completed_at.clone())
                .filter(|prev| prev.as_str() > stamp.as_str())
                .unwrap_or_else(|| stamp.clone());

            let changed = status_repo::mark_completed(
                tx,
                &message.document_id,
                &message.generation_id,
                message.stage.as_str(),
                &completed_at,
                output_ref,
                &stamp,
            )?;
            if !changed {
                return Ok(Completion::NotClaimed);
            }
            document_repo::set_stage_in(
                tx,
                &message.document_id,
                &message.generation_id,
                message.stage.completed_document_stage().as_str(),
                None,
                &stamp,
            )?;

            let recorded = entry_in(tx, &message.document_id, &message.generation_id, message.stage)?;
            recorded.map(Completion::Recorded).ok_or_else(|| {
                DatabaseError::Conflict(format!(
                    "ledger row {}/{}/{} vanished during completion",
                    message.document_id, message.generation_id, message.stage
                ))
            })
        })
    }

    /// Marks the hand-off to the next stage as durable.
    pub fn mark_handed_off(&self, document_id: &str, generation_id: &str, stage: Stage) -> Result<bool, DatabaseError> {
        let stamp = format_timestamp(Utc::now());
        self.db.with_conn(|conn| {
            status_repo::mark_handed_off(conn, document_id, generation_id, stage.as_str(), &stamp)
        })
    }

    /// Gives a claimed stage back after a transient failure.
    pub fn release(&self, message: &StageMessage, error: &str) -> Result<bool, DatabaseError> {
        let stamp = format_timestamp(Utc::now());
        self.db.with_conn(|conn| {
            status_repo::mark_pending(
                conn,
                &message.document_id,
                &message.generation_id,
                message.stage.as_str(),
                error,
                &stamp,
            )
        })
    }

    /// Fails `stage` and with it the document's current generation.
    /// Returns `false` when there was nothing left to fail: the generation is
    /// no longer current, already terminal, or the stage had completed.
    pub fn fail(
        &self,
        document_id: &str,
        generation_id: &str,
        stage: Stage,
        error: &str,
    ) -> Result<bool, DatabaseError> {
        let stamp = format_timestamp(Utc::now());
        self.db.with_tx(|tx| {
            let doc = match document_repo::find_in(tx, document_id)? {
                Some(doc) if doc.current_generation == generation_id => doc,
                _ => return Ok(false),
            };
            if parse_document_stage(document_id, &doc.stage)?.is_terminal() {
                return Ok(false);
            }
            if !status_repo::mark_failed(tx, document_id, generation_id, stage.as_str(), error, &stamp)? {
                return Ok(false);
            }
            document_repo::set_stage_in(
                tx,
                document_id,
                generation_id,
                DocumentStage::Failed.as_str(),
                Some(error),
                &stamp,
            )
        })
    }

    /// Fails the document's current generation without touching any stage
    /// row, for a generation whose last completed stage can never hand off.
    pub fn fail_generation(&self, document_id: &str, generation_id: &str, error: &str) -> Result<bool, DatabaseError> {
        let stamp = format_timestamp(Utc::now());
        self.db.with_tx(|tx| {
            let doc = match document_repo::find_in(tx, document_id)? {
                Some(doc) if doc.current_generation == generation_id => doc,
                _ => return Ok(false),
            };
            if parse_document_stage(document_id, &doc.stage)?.is_terminal() {
                return Ok(false);
            }
            document_repo::set_stage_in(
                tx,
                document_id,
                generation_id,
                DocumentStage::Failed.as_str(),
                Some(error),
                &stamp,
            )
        })
    }

    /// All entries of one generation in pipeline order.
    pub fn entries(&self, document_id: &str, generation_id: &str) -> Result<Vec<StatusEntry>, DatabaseError> {
        self.db.with_conn(|conn| entries_in(conn, document_id, generation_id))
    }

    pub fn entry(
        &self,
        document_id: &str,
        generation_id: &str,
        stage: Stage,
    ) -> Result<Option<StatusEntry>, DatabaseError> {
        self.db.with_conn(|conn| entry_in(conn, document_id, generation_id, stage))
    }

    /// An `in_progress` row whose lease ran out belongs to a crashed worker.
    fn lease_live(&self, entry: &StatusEntry, now: DateTime<Utc>) -> bool {
        let started = match entry.started_at.as_deref().and_then(parse_timestamp) {
            Some(started) => started,
            None => return true,
        };
        match (now - started).to_std() {
            Ok(held) => held < self.lease_timeout,
            Err(_) => true,
        }
    }
}

fn find(entries: &[StatusEntry], stage: Stage) -> Option<&StatusEntry> {
    entries.iter().find(|e| e.stage == stage)
}

fn entries_in(conn: &Connection, document_id: &str, generation_id: &str) -> Result<Vec<StatusEntry>, DatabaseError> {
    let mut entries = status_repo::list_for_generation(conn, document_id, generation_id)?
        .into_iter()
        .map(StatusEntry::from_row)
        .collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|e| e.stage);
    Ok(entries)
}

fn entry_in(
    conn: &Connection,
    document_id: &str,
    generation_id: &str,
    stage: Stage,
) -> Result<Option<StatusEntry>, DatabaseError> {
    status_repo::find_in(conn, document_id, generation_id, stage.as_str())?
        .map(StatusEntry::from_row)
        .transpose()
}

pub(crate) fn parse_document_stage(document_id: &str, raw: &str) -> Result<DocumentStage, DatabaseError> {
    raw.parse().map_err(|e: crate::domain::InvalidLabel| DatabaseError::Corrupt {
        entity: "document",
        key: document_id.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::document_repo::DocumentRow;

    const GEN: &str = "g1";

    fn setup(lease: Duration) -> (Database, StatusLedger) {
        let db = Database::open_in_memory().unwrap();
        let now = format_timestamp(Utc::now());
        document_repo::insert(
            &db,
            &DocumentRow {
                document_id: "doc-1".to_string(),
                source_key: "uploads/doc-1.txt".to_string(),
                owner: "ops".to_string(),
                stage: "received".to_string(),
                current_generation: GEN.to_string(),
                error_detail: None,
                created_at: now.clone(),
                updated_at: now,
            },
        )
        .unwrap();
        let ledger = StatusLedger::new(db.clone(), lease);
        (db, ledger)
    }

    fn msg(stage: Stage) -> StageMessage {
        StageMessage::first("doc-1", GEN, stage, "ref")
    }

    fn doc_stage(db: &Database) -> String {
        document_repo::find_by_id(db, "doc-1").unwrap().unwrap().stage
    }

    fn run_stage(ledger: &StatusLedger, stage: Stage) {
        assert!(matches!(ledger.claim(&msg(stage)).unwrap(), ClaimOutcome::Acquired { .. }));
        assert!(matches!(ledger.complete(&msg(stage), "out").unwrap(), Completion::Recorded(_)));
    }

    #[test]
    fn test_claim_then_complete_walks_document_stage() {
        let (db, ledger) = setup(Duration::from_secs(60));
        assert_eq!(
            ledger.claim(&msg(Stage::Extraction)).unwrap(),
            ClaimOutcome::Acquired { attempt_count: 1 }
        );
        assert_eq!(doc_stage(&db), "extracting");
        ledger.complete(&msg(Stage::Extraction), "extracted/doc-1/g1.txt").unwrap();
        assert_eq!(doc_stage(&db), "extracting");
        run_stage(&ledger, Stage::Categorization);
        assert_eq!(doc_stage(&db), "extracted");
        run_stage(&ledger, Stage::Planning);
        assert_eq!(doc_stage(&db), "planned");
        run_stage(&ledger, Stage::Reporting);
        assert_eq!(doc_stage(&db), "completed");
    }

    #[test]
    fn test_duplicate_claim_after_completion() {
        let (_db, ledger) = setup(Duration::from_secs(60));
        run_stage(&ledger, Stage::Extraction);
        assert_eq!(ledger.claim(&msg(Stage::Extraction)).unwrap(), ClaimOutcome::AlreadyCompleted);
        match ledger.complete(&msg(Stage::Extraction), "other").unwrap() {
            Completion::AlreadyCompleted(entry) => assert_eq!(entry.output_ref.as_deref(), Some("out")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_out_of_order_claim() {
        let (_db, ledger) = setup(Duration::from_secs(60));
        assert_eq!(
            ledger.claim(&msg(Stage::Planning)).unwrap(),
            ClaimOutcome::OutOfOrder {
                waiting_on: Stage::Categorization
            }
        );
    }

    #[test]
    fn test_concurrent_claim_is_busy_until_lease_expires() {
        let (_db, ledger) = setup(Duration::from_secs(60));
        ledger.claim(&msg(Stage::Extraction)).unwrap();
        assert_eq!(
            ledger.claim(&msg(Stage::Extraction)).unwrap(),
            ClaimOutcome::Busy {
                holder: Stage::Extraction
            }
        );

        let (_db, expired) = setup(Duration::ZERO);
        expired.claim(&msg(Stage::Extraction)).unwrap();
        assert_eq!(
            expired.claim(&msg(Stage::Extraction)).unwrap(),
            ClaimOutcome::Acquired { attempt_count: 2 }
        );
    }

    #[test]
    fn test_release_allows_reclaim() {
        let (_db, ledger) = setup(Duration::from_secs(60));
        ledger.claim(&msg(Stage::Extraction)).unwrap();
        assert!(ledger.release(&msg(Stage::Extraction), "throttled").unwrap());
        let entry = ledger.entry("doc-1", GEN, Stage::Extraction).unwrap().unwrap();
        assert_eq!(entry.status, StageStatus::Pending);
        assert_eq!(entry.error_detail.as_deref(), Some("throttled"));
        assert_eq!(
            ledger.claim(&msg(Stage::Extraction)).unwrap(),
            ClaimOutcome::Acquired { attempt_count: 2 }
        );
    }

    #[test]
    fn test_fail_is_terminal() {
        let (db, ledger) = setup(Duration::from_secs(60));
        ledger.claim(&msg(Stage::Extraction)).unwrap();
        assert!(ledger.fail("doc-1", GEN, Stage::Extraction, "empty document").unwrap());
        assert!(!ledger.fail("doc-1", GEN, Stage::Extraction, "again").unwrap());
        assert_eq!(doc_stage(&db), "failed");
        assert_eq!(ledger.claim(&msg(Stage::Extraction)).unwrap(), ClaimOutcome::Terminal);
        assert_eq!(ledger.claim(&msg(Stage::Categorization)).unwrap(), ClaimOutcome::Terminal);
    }

    #[test]
    fn test_stale_generation() {
        let (_db, ledger) = setup(Duration::from_secs(60));
        let old = StageMessage::first("doc-1", "g0", Stage::Extraction, "ref");
        assert_eq!(ledger.claim(&old).unwrap(), ClaimOutcome::Stale);
        assert!(!ledger.fail("doc-1", "g0", Stage::Extraction, "x").unwrap());
        let unknown = StageMessage::first("doc-9", GEN, Stage::Extraction, "ref");
        assert_eq!(ledger.claim(&unknown).unwrap(), ClaimOutcome::Stale);
    }

    #[test]
    fn test_complete_without_claim() {
        let (_db, ledger) = setup(Duration::from_secs(60));
        assert_eq!(
            ledger.complete(&msg(Stage::Extraction), "out").unwrap(),
            Completion::NotClaimed
        );
    }

    #[test]
    fn test_completion_times_never_decrease() {
        let (db, ledger) = setup(Duration::from_secs(60));
        run_stage(&ledger, Stage::Extraction);
        // Push the predecessor's completion into the future to simulate skew.
        db.with_conn(|conn| {
            conn.execute(
                "UPDATE processing_status SET completed_at = '2999-01-01T00:00:00.000000Z'
                 WHERE stage = 'extraction'",
                [],
            )?;
            Ok(())
        })
        .unwrap();
        run_stage(&ledger, Stage::Categorization);
        let entries = ledger.entries("doc-1", GEN).unwrap();
        assert_eq!(entries[0].stage, Stage::Extraction);
        assert!(entries[1].completed_at >= entries[0].completed_at);
    }
}
