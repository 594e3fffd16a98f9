//! The execution contract every stage shares:
//! dequeue, claim, run the handler, then advance, retry or fail.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::info_span;

use crate::error::{ComplyError, FailureClass};
use crate::pipeline::coordinator::{Advance, Coordinator};
use crate::pipeline::events::{PipelineEvent, PipelineEventKind};
use crate::pipeline::ledger::ClaimOutcome;
use crate::pipeline::stage::Stage;
use crate::queue::{Delivery, QueueError, Receipt, StageMessage};
use crate::retry::Backoff;
use crate::stages::StageHandler;

/// Stage-level retry budget for transient failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total stage attempts, the first one included.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::new(Duration::from_secs(2), Duration::from_secs(60)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WorkerSettings {
    pub default_retry: RetryPolicy,
    pub stage_retry: HashMap<Stage, RetryPolicy>,
    /// How long a message waits before redelivery when its stage cannot
    /// start yet.
    pub defer_delay: Duration,
}

impl WorkerSettings {
    pub fn retry_for(&self, stage: Stage) -> RetryPolicy {
        self.stage_retry.get(&stage).copied().unwrap_or(self.default_retry)
    }
}

/// What one poll did.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// No visible message on any served queue.
    Idle,
    /// The handler succeeded and the coordinator advanced the document.
    Completed(Advance),
    /// Redelivery of a completed stage; only a missing hand-off was redone.
    Duplicate(Advance),
    /// The message's generation is terminal or superseded; dropped.
    Discarded,
    /// The stage cannot start yet; the message comes back after a delay.
    Deferred(String),
    /// Transient failure, re-enqueued as `attempt`.
    Retrying { attempt: u32, delay: Duration },
    /// The document's generation failed at this stage.
    Failed { class: FailureClass, error: String },
    /// The ledger or hand-off failed. The message stays un-acked and is
    /// dead-lettered once its receive budget runs out.
    CoordinatorFault(String),
}

/// Serves one or more stage queues with a handler each.
pub struct StageWorker {
    coordinator: Arc<Coordinator>,
    handlers: Vec<Arc<dyn StageHandler>>,
    settings: WorkerSettings,
    next_queue: AtomicUsize,
}

impl StageWorker {
    pub fn new(
        coordinator: Arc<Coordinator>,
        handlers: Vec<Arc<dyn StageHandler>>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            coordinator,
            handlers,
            settings,
            next_queue: AtomicUsize::new(0),
        }
    }

    pub fn stages(&self) -> Vec<Stage> {
        self.handlers.iter().map(|h| h.stage()).collect()
    }

    /// Receives and processes at most one message. Queues are polled
    /// round-robin so one busy stage cannot starve the others.
    pub fn poll_once(&self) -> Result<(Option<StageMessage>, PollOutcome), QueueError> {
        let count = self.handlers.len();
        if count == 0 {
            return Ok((None, PollOutcome::Idle));
        }
        let start = self.next_queue.fetch_add(1, Ordering::Relaxed) % count;
        for offset in 0..count {
            let handler = &self.handlers[(start + offset) % count];
            if let Some(delivery) = self.coordinator.queue().dequeue(handler.stage())? {
                let message = delivery.message.clone();
                let outcome = self.process(handler.as_ref(), delivery);
                return Ok((Some(message), outcome));
            }
        }
        Ok((None, PollOutcome::Idle))
    }

    fn process(&self, handler: &dyn StageHandler, delivery: Delivery) -> PollOutcome {
        let Delivery { message, receipt } = delivery;
        let _span = info_span!(
            "worker.process",
            stage = %message.stage,
            document = %message.document_id,
            generation = %message.generation_id,
            attempt = message.attempt
        )
        .entered();

        let claim = match self.coordinator.ledger().claim(&message) {
            Ok(claim) => claim,
            Err(e) if e.is_transient() => {
                self.nack(receipt, self.settings.defer_delay, &e.to_string());
                return PollOutcome::Deferred(format!("ledger busy: {}", e));
            }
            Err(e) => return self.coordinator_fault(&message, receipt, e.to_string()),
        };

        match claim {
            ClaimOutcome::Acquired { attempt_count } => {
                log::debug!("Claimed {} (ledger attempt {})", message.stage, attempt_count);
                self.run(handler, &message, receipt)
            }
            ClaimOutcome::AlreadyCompleted => match self.coordinator.advance(&message, "") {
                Ok(advance) => {
                    self.ack(receipt);
                    PollOutcome::Duplicate(advance)
                }
                Err(e) => self.coordinator_fault(&message, receipt, e.to_string()),
            },
            ClaimOutcome::Terminal | ClaimOutcome::Stale => {
                log::info!(
                    "Dropping {} message for {}/{}: {:?}",
                    message.stage,
                    message.document_id,
                    message.generation_id,
                    claim
                );
                self.ack(receipt);
                PollOutcome::Discarded
            }
            ClaimOutcome::Busy { holder } => {
                let reason = format!("{} is in progress", holder);
                self.nack(receipt, self.settings.defer_delay, &reason);
                PollOutcome::Deferred(reason)
            }
            ClaimOutcome::OutOfOrder { waiting_on } => {
                let reason = format!("waiting on {}", waiting_on);
                self.nack(receipt, self.settings.defer_delay, &reason);
                PollOutcome::Deferred(reason)
            }
        }
    }

    fn run(&self, handler: &dyn StageHandler, message: &StageMessage, receipt: Receipt) -> PollOutcome {
        self.coordinator.events().send(PipelineEvent::new(
            &message.document_id,
            &message.generation_id,
            message.stage,
            PipelineEventKind::Claimed,
            message.attempt,
        ));

        match handler.handle(message) {
            Ok(output_ref) => match self.coordinator.advance(message, &output_ref) {
                Ok(advance) => {
                    self.ack(receipt);
                    PollOutcome::Completed(advance)
                }
                Err(e) => self.coordinator_fault(message, receipt, e.to_string()),
            },
            Err(e) => self.on_failure(message, receipt, e),
        }
    }

    fn on_failure(&self, message: &StageMessage, receipt: Receipt, err: ComplyError) -> PollOutcome {
        let class = err.failure_class();
        let error = err.to_string();
        let policy = self.settings.retry_for(message.stage);

        match class {
            FailureClass::Transient if message.attempt < policy.max_attempts => {
                if let Err(e) = self.coordinator.ledger().release(message, &error) {
                    return self.coordinator_fault(message, receipt, e.to_string());
                }
                let next = message.retry();
                let delay = policy.backoff.delay(message.attempt);
                if let Err(e) = self.coordinator.queue().requeue(receipt, &next, delay, &error) {
                    // The original stays on the queue and comes back after
                    // its visibility timeout.
                    log::warn!("Requeue of {} failed: {}", message.stage, e);
                }
                log::warn!(
                    "{} attempt {}/{} for {} failed, retrying in {:?}: {}",
                    message.stage,
                    message.attempt,
                    policy.max_attempts,
                    message.document_id,
                    delay,
                    error
                );
                self.coordinator.events().send(
                    PipelineEvent::new(
                        &message.document_id,
                        &message.generation_id,
                        message.stage,
                        PipelineEventKind::Retrying,
                        next.attempt,
                    )
                    .with_error(&error),
                );
                PollOutcome::Retrying {
                    attempt: next.attempt,
                    delay,
                }
            }
            FailureClass::Transient | FailureClass::Permanent => {
                let reason = if class == FailureClass::Transient {
                    format!("gave up after {} attempts: {}", message.attempt, error)
                } else {
                    error
                };
                match self.coordinator.fail(
                    &message.document_id,
                    &message.generation_id,
                    message.stage,
                    &reason,
                    message.attempt,
                ) {
                    Ok(_) => {
                        self.ack(receipt);
                        PollOutcome::Failed { class, error: reason }
                    }
                    Err(e) => self.coordinator_fault(message, receipt, e.to_string()),
                }
            }
            FailureClass::Coordinator => self.coordinator_fault(message, receipt, error),
        }
    }

    fn coordinator_fault(&self, message: &StageMessage, receipt: Receipt, error: String) -> PollOutcome {
        log::error!(
            "OPERATOR ATTENTION: coordinator fault on {} for {}/{}: {}",
            message.stage,
            message.document_id,
            message.generation_id,
            error
        );
        // Give the claim back so a redelivery is not held off by the lease.
        if let Err(e) = self.coordinator.ledger().release(message, &error) {
            log::warn!("Could not release {} after coordinator fault: {}", message.stage, e);
        }
        self.nack(receipt, self.settings.defer_delay, &error);
        PollOutcome::CoordinatorFault(error)
    }

    fn ack(&self, receipt: Receipt) {
        if let Err(e) = self.coordinator.queue().ack(receipt) {
            log::warn!("Ack of message {} failed, it will be redelivered: {}", receipt.id, e);
        }
    }

    fn nack(&self, receipt: Receipt, delay: Duration, error: &str) {
        if let Err(e) = self.coordinator.queue().nack(receipt, delay, error) {
            log::warn!("Nack of message {} failed: {}", receipt.id, e);
        }
    }
}
