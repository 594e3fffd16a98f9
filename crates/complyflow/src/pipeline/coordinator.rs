//! Pipeline coordinator: owns the status ledger and decides, for every stage
//! outcome, whether the document advances, stops, or starts over.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::error::CoordinatorError;
use super::events::{PipelineEvent, PipelineEventBroadcaster, PipelineEventKind};
use super::ledger::{parse_document_stage, Completion, StatusEntry, StatusLedger};
use super::stage::{DocumentStage, Stage};
use crate::db::document_repo::{self, DocumentRow};
use crate::db::{format_timestamp, Database, DatabaseError};
use crate::queue::{StageMessage, StageQueue};
use crate::retry::Backoff;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoordinatorSettings {
    /// Attempts at each enqueue or ledger write before it is surfaced as a
    /// coordinator fault.
    pub enqueue_attempts: u32,
    pub enqueue_backoff: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            enqueue_attempts: 5,
            enqueue_backoff: Duration::from_millis(200),
        }
    }
}

/// What [`Coordinator::advance`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    /// The next stage's message is on its queue.
    Enqueued(Stage),
    /// The last stage completed; the generation is done.
    Finished,
    /// The completion and its hand-off were already recorded.
    Duplicate,
}

/// Current position of a document, as shown to operators and the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub document_id: String,
    pub generation_id: String,
    pub source_key: String,
    pub owner: String,
    pub stage: DocumentStage,
    pub entries: Vec<StatusEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub struct Coordinator {
    db: Database,
    ledger: StatusLedger,
    queue: Arc<dyn StageQueue>,
    events: PipelineEventBroadcaster,
    settings: CoordinatorSettings,
}

impl Coordinator {
    pub fn new(
        db: Database,
        queue: Arc<dyn StageQueue>,
        events: PipelineEventBroadcaster,
        lease_timeout: Duration,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            ledger: StatusLedger::new(db.clone(), lease_timeout),
            db,
            queue,
            events,
            settings,
        }
    }

    pub fn ledger(&self) -> &StatusLedger {
        &self.ledger
    }

    pub fn queue(&self) -> &Arc<dyn StageQueue> {
        &self.queue
    }

    pub fn events(&self) -> &PipelineEventBroadcaster {
        &self.events
    }

    /// Registers a new document and enqueues its first extraction.
    /// Returns the generation id.
    pub fn submit(&self, document_id: &str, source_key: &str, owner: &str) -> Result<String, CoordinatorError> {
        let generation_id = uuid::Uuid::new_v4().to_string();
        let now = format_timestamp(Utc::now());
        let row = DocumentRow {
            document_id: document_id.to_string(),
            source_key: source_key.to_string(),
            owner: owner.to_string(),
            stage: DocumentStage::Received.as_str().to_string(),
            current_generation: generation_id.clone(),
            error_detail: None,
            created_at: now.clone(),
            updated_at: now,
        };
        document_repo::insert(&self.db, &row).map_err(|e| match e {
            e if e.is_duplicate() => CoordinatorError::DocumentExists(document_id.to_string()),
            e => CoordinatorError::Ledger(e),
        })?;

        self.start_generation(document_id, &generation_id, source_key)?;
        log::info!("Submitted {} as generation {}", document_id, generation_id);
        Ok(generation_id)
    }

    /// Starts a new generation for a completed or failed document. Rows of
    /// earlier generations stay untouched but are no longer current.
    pub fn resubmit(&self, document_id: &str) -> Result<String, CoordinatorError> {
        let generation_id = uuid::Uuid::new_v4().to_string();
        let now = format_timestamp(Utc::now());
        let terminal = [DocumentStage::Completed.as_str(), DocumentStage::Failed.as_str()];

        let started = self.db.with_tx(|tx| {
            document_repo::start_generation_in(tx, document_id, &generation_id, &terminal, &now)
        })?;
        let doc = document_repo::find_by_id(&self.db, document_id)?
            .ok_or_else(|| CoordinatorError::DocumentNotFound(document_id.to_string()))?;
        if !started {
            return Err(CoordinatorError::GenerationInFlight {
                document_id: document_id.to_string(),
                stage: parse_document_stage(document_id, &doc.stage)?,
            });
        }

        self.start_generation(document_id, &generation_id, &doc.source_key)?;
        log::info!("Resubmitted {} as generation {}", document_id, generation_id);
        Ok(generation_id)
    }

    /// Records that the worker holding `message` durably stored its output
    /// under `output_ref`, then hands off to the next stage.
    ///
    /// A repeated call for an already handed-off stage is a no-op. A
    /// completed stage whose hand-off never happened is handed off from the
    /// stored output reference.
    pub fn advance(&self, message: &StageMessage, output_ref: &str) -> Result<Advance, CoordinatorError> {
        let completion = self.with_ledger_retry(|| self.ledger.complete(message, output_ref))?;
        let entry = match completion {
            Completion::Recorded(entry) => {
                log::info!(
                    "{} completed for {}/{} (attempt {})",
                    message.stage,
                    message.document_id,
                    message.generation_id,
                    entry.attempt_count
                );
                self.events.send(
                    PipelineEvent::new(
                        &message.document_id,
                        &message.generation_id,
                        message.stage,
                        PipelineEventKind::Completed,
                        entry.attempt_count,
                    )
                    .with_output(output_ref),
                );
                entry
            }
            Completion::AlreadyCompleted(entry) if entry.handed_off => {
                log::debug!(
                    "Ignoring duplicate completion of {} for {}/{}",
                    message.stage,
                    message.document_id,
                    message.generation_id
                );
                return Ok(Advance::Duplicate);
            }
            Completion::AlreadyCompleted(entry) => {
                log::info!(
                    "Resuming hand-off after {} for {}/{}",
                    message.stage,
                    message.document_id,
                    message.generation_id
                );
                entry
            }
            Completion::NotClaimed => {
                return Err(CoordinatorError::NotClaimed {
                    document_id: message.document_id.clone(),
                    stage: message.stage,
                })
            }
        };

        let stored_ref = entry.output_ref.ok_or_else(|| CoordinatorError::MissingOutput {
            document_id: message.document_id.clone(),
            stage: message.stage,
        })?;

        let advance = match message.stage.next() {
            Some(next) => {
                self.enqueue(&StageMessage::first(
                    &message.document_id,
                    &message.generation_id,
                    next,
                    &stored_ref,
                ))?;
                Advance::Enqueued(next)
            }
            None => Advance::Finished,
        };

        self.with_ledger_retry(|| {
            self.ledger
                .mark_handed_off(&message.document_id, &message.generation_id, message.stage)
        })?;
        Ok(advance)
    }

    /// Terminates the document's current generation at `stage`. Nothing is
    /// enqueued; recovery needs [`Coordinator::resubmit`]. Returns whether
    /// this call performed the transition.
    pub fn fail(
        &self,
        document_id: &str,
        generation_id: &str,
        stage: Stage,
        error: &str,
        attempt: u32,
    ) -> Result<bool, CoordinatorError> {
        let failed = self.with_ledger_retry(|| self.ledger.fail(document_id, generation_id, stage, error))?;
        if failed {
            log::error!(
                "{} failed permanently for {}/{}: {}",
                stage,
                document_id,
                generation_id,
                error
            );
            self.events.send(
                PipelineEvent::new(document_id, generation_id, stage, PipelineEventKind::Failed, attempt)
                    .with_error(error),
            );
        } else {
            log::debug!(
                "Fail of {} for {}/{} had no effect: generation already terminal or superseded",
                stage,
                document_id,
                generation_id
            );
        }
        Ok(failed)
    }

    /// Terminates the current generation after `stage` completed but its
    /// hand-off was given up on. The completed row stays as recorded.
    pub fn abandon(
        &self,
        document_id: &str,
        generation_id: &str,
        stage: Stage,
        error: &str,
        attempt: u32,
    ) -> Result<bool, CoordinatorError> {
        let failed = self.with_ledger_retry(|| self.ledger.fail_generation(document_id, generation_id, error))?;
        if failed {
            log::error!(
                "Abandoned {}/{} after {} completed without hand-off: {}",
                document_id,
                generation_id,
                stage,
                error
            );
            self.events.send(
                PipelineEvent::new(document_id, generation_id, stage, PipelineEventKind::Failed, attempt)
                    .with_error(error),
            );
        }
        Ok(failed)
    }

    /// The document's current stage, its current generation's ledger
    /// entries, and the terminal error if it failed.
    pub fn status(&self, document_id: &str) -> Result<StatusReport, CoordinatorError> {
        let doc = document_repo::find_by_id(&self.db, document_id)?
            .ok_or_else(|| CoordinatorError::DocumentNotFound(document_id.to_string()))?;
        let stage = parse_document_stage(document_id, &doc.stage)?;
        let entries = self.ledger.entries(document_id, &doc.current_generation)?;
        Ok(StatusReport {
            document_id: doc.document_id,
            generation_id: doc.current_generation,
            source_key: doc.source_key,
            owner: doc.owner,
            stage,
            entries,
            error_detail: doc.error_detail,
            created_at: doc.created_at,
            updated_at: doc.updated_at,
        })
    }

    /// Enqueues a new generation's first extraction. When the queue stays
    /// unreachable the generation is failed, so nothing is left `received`
    /// with no message behind it and a later resubmit can start over.
    fn start_generation(
        &self,
        document_id: &str,
        generation_id: &str,
        source_key: &str,
    ) -> Result<(), CoordinatorError> {
        let message = StageMessage::first(document_id, generation_id, Stage::Extraction, source_key);
        let err = match self.enqueue(&message) {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        let reason = format!("could not start generation: {}", err);
        if let Err(fail_err) = self.fail(document_id, generation_id, Stage::Extraction, &reason, 0) {
            log::error!(
                "OPERATOR ATTENTION: {} is stuck at received for generation {}: {}",
                document_id,
                generation_id,
                fail_err
            );
        }
        Err(err)
    }

    fn backoff(&self) -> Backoff {
        let base = self.settings.enqueue_backoff;
        Backoff::new(base, base.saturating_mul(16))
    }

    /// Enqueues with bounded retries; exhaustion is a coordinator fault.
    fn enqueue(&self, message: &StageMessage) -> Result<(), CoordinatorError> {
        let attempts = self.settings.enqueue_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.queue.enqueue(message, Duration::ZERO) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    let delay = self.backoff().delay(attempt);
                    log::warn!(
                        "Enqueue of {} for {} failed (attempt {}/{}), retrying in {:?}: {}",
                        message.stage,
                        message.document_id,
                        attempt,
                        attempts,
                        delay,
                        e
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => {
                    log::error!(
                        "OPERATOR ATTENTION: could not enqueue {} for {}/{}: {}",
                        message.stage,
                        message.document_id,
                        message.generation_id,
                        e
                    );
                    return Err(CoordinatorError::Enqueue {
                        document_id: message.document_id.clone(),
                        stage: message.stage,
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }
    }

    /// Retries ledger writes that failed on a busy or locked database.
    fn with_ledger_retry<T>(
        &self,
        mut op: impl FnMut() -> Result<T, DatabaseError>,
    ) -> Result<T, CoordinatorError> {
        let attempts = self.settings.enqueue_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.backoff().delay(attempt);
                    log::warn!("Ledger write failed (attempt {}/{}): {}", attempt, attempts, e);
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => {
                    log::error!("OPERATOR ATTENTION: ledger write failed: {}", e);
                    return Err(CoordinatorError::Ledger(e));
                }
            }
        }
    }
}
