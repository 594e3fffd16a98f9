//! Operator recovery for messages the queue gave up on.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::coordinator::Coordinator;
use super::error::CoordinatorError;
use super::events::{PipelineEvent, PipelineEventKind};
use super::stage::{Stage, StageStatus};
use crate::queue::{DeadLetter, QueueError, StageMessage};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterStats {
    pub total: u64,
    /// Letters nobody has acted on yet.
    pub waiting: u64,
    pub redriven: u64,
    pub by_stage: BTreeMap<String, u64>,
}

pub struct DeadLetterHandler {
    coordinator: Arc<Coordinator>,
    max_redrives: u32,
    last_announced: AtomicI64,
}

impl DeadLetterHandler {
    pub fn new(coordinator: Arc<Coordinator>, max_redrives: u32) -> Self {
        Self {
            coordinator,
            max_redrives,
            last_announced: AtomicI64::new(0),
        }
    }

    pub fn list(&self, stage: Option<Stage>) -> Result<Vec<DeadLetter>, CoordinatorError> {
        Ok(self.coordinator.queue().dead_letters(stage)?)
    }

    /// Puts a dead letter back on its stage queue. Refused when the letter's
    /// generation is no longer current or already terminal, or when the same
    /// stage has been redriven `max_redrives` times.
    pub fn redrive(&self, id: i64) -> Result<StageMessage, CoordinatorError> {
        let queue = self.coordinator.queue();
        let letter = queue
            .dead_letter(id)?
            .ok_or(QueueError::DeadLetterNotFound(id))?;
        let refuse = |reason: String| CoordinatorError::RedriveRefused { id, reason };

        if letter.redriven_at.is_some() {
            return Err(refuse("already redriven".to_string()));
        }
        let status = match self.coordinator.status(&letter.message.document_id) {
            Ok(status) => status,
            Err(CoordinatorError::DocumentNotFound(doc)) => {
                return Err(refuse(format!("document '{}' no longer exists", doc)))
            }
            Err(e) => return Err(e),
        };
        if status.generation_id != letter.message.generation_id {
            return Err(refuse(format!(
                "generation {} was superseded by {}",
                letter.message.generation_id, status.generation_id
            )));
        }
        if status.stage.is_terminal() {
            return Err(refuse(format!("document is {}", status.stage)));
        }
        let redrives = queue.redrive_count(&letter.message)?;
        if redrives >= self.max_redrives {
            return Err(refuse(format!("stage already redriven {} times", redrives)));
        }

        let message = queue.redrive(id)?;
        log::info!(
            "Redrove dead letter {} ({} for {}/{})",
            id,
            message.stage,
            message.document_id,
            message.generation_id
        );
        Ok(message)
    }

    /// Drops a dead letter. When its generation is still current and
    /// running, the document is failed so it can be resubmitted, unless the
    /// letter is a duplicate of a stage that already handed off. Returns
    /// whether the generation was failed.
    pub fn discard(&self, id: i64) -> Result<bool, CoordinatorError> {
        let queue = self.coordinator.queue();
        let letter = queue
            .dead_letter(id)?
            .ok_or(QueueError::DeadLetterNotFound(id))?;
        queue.discard(id)?;

        let message = &letter.message;
        let reason = format!(
            "discarded dead letter {}: {}",
            id,
            letter.error_detail.as_deref().unwrap_or("no error recorded")
        );
        let failed = match self.coordinator.status(&message.document_id) {
            Ok(status) if status.generation_id == message.generation_id && !status.stage.is_terminal() => {
                let entry = status.entries.iter().find(|e| e.stage == message.stage);
                match entry {
                    // A stray duplicate; the document already moved past it.
                    Some(e) if e.status == StageStatus::Completed && e.handed_off => false,
                    // Nothing downstream will ever run for this generation.
                    Some(e) if e.status == StageStatus::Completed => self.coordinator.abandon(
                        &message.document_id,
                        &message.generation_id,
                        message.stage,
                        &reason,
                        letter.attempt_count,
                    )?,
                    _ => self.coordinator.fail(
                        &message.document_id,
                        &message.generation_id,
                        message.stage,
                        &reason,
                        letter.attempt_count,
                    )?,
                }
            }
            Ok(_) | Err(CoordinatorError::DocumentNotFound(_)) => false,
            Err(e) => return Err(e),
        };
        log::info!("Discarded dead letter {} (document failed: {})", id, failed);
        Ok(failed)
    }

    pub fn statistics(&self) -> Result<DeadLetterStats, CoordinatorError> {
        let mut stats = DeadLetterStats::default();
        for letter in self.list(None)? {
            stats.total += 1;
            if letter.redriven_at.is_some() {
                stats.redriven += 1;
            } else {
                stats.waiting += 1;
            }
            *stats
                .by_stage
                .entry(letter.message.stage.as_str().to_string())
                .or_insert(0) += 1;
        }
        Ok(stats)
    }

    /// Publishes a `dead_lettered` event for every letter not announced
    /// before, and returns those letters.
    pub fn announce_new(&self) -> Result<Vec<DeadLetter>, CoordinatorError> {
        let seen = self.last_announced.load(Ordering::SeqCst);
        let fresh: Vec<DeadLetter> = self
            .list(None)?
            .into_iter()
            .filter(|l| l.id > seen && l.redriven_at.is_none())
            .collect();

        if let Some(max) = fresh.iter().map(|l| l.id).max() {
            self.last_announced.fetch_max(max, Ordering::SeqCst);
        }
        for letter in &fresh {
            log::error!(
                "OPERATOR ATTENTION: {} message for {}/{} dead-lettered after {} receives: {}",
                letter.message.stage,
                letter.message.document_id,
                letter.message.generation_id,
                letter.receive_count,
                letter.error_detail.as_deref().unwrap_or("no error recorded")
            );
            let mut event = PipelineEvent::new(
                &letter.message.document_id,
                &letter.message.generation_id,
                letter.message.stage,
                PipelineEventKind::DeadLettered,
                letter.attempt_count,
            );
            if let Some(error) = &letter.error_detail {
                event = event.with_error(error);
            }
            self.coordinator.events().send(event);
        }
        Ok(fresh)
    }
}
