//! Per-stage durable message queue with dead-letter routing.
//!
//! Delivery is at-least-once: a dequeued message stays hidden for the
//! visibility timeout and reappears unless acknowledged. A message that has
//! been received `max_receives` times without an ack is moved to the
//! dead-letter table instead of being delivered again.

pub mod sqlite;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use sqlite::SqliteQueue;

use crate::db::DatabaseError;
use crate::pipeline::stage::Stage;

/// Message handed from one stage to the next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageMessage {
    pub document_id: String,
    pub generation_id: String,
    pub stage: Stage,
    pub payload_ref: String,
    /// Stage-level attempt number, starting at 1.
    pub attempt: u32,
}

impl StageMessage {
    pub fn first(document_id: &str, generation_id: &str, stage: Stage, payload_ref: &str) -> Self {
        Self {
            document_id: document_id.to_string(),
            generation_id: generation_id.to_string(),
            stage,
            payload_ref: payload_ref.to_string(),
            attempt: 1,
        }
    }

    /// The same message for the next stage-level attempt.
    pub fn retry(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}

/// A received message plus the receipt needed to settle it.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub message: StageMessage,
    pub receipt: Receipt,
}

/// Identifies one receive of one message. Settling with a stale receipt (the
/// message was re-delivered to someone else meanwhile) has no effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    pub id: i64,
    pub receive_count: u32,
}

/// A message removed from normal processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub id: i64,
    pub message: StageMessage,
    pub attempt_count: u32,
    pub receive_count: u32,
    pub error_detail: Option<String>,
    pub dead_lettered_at: String,
    pub redriven_at: Option<String>,
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Dead letter {0} not found")]
    DeadLetterNotFound(i64),
}

pub trait StageQueue: Send + Sync {
    /// Makes `message` visible on its stage's queue after `delay`.
    fn enqueue(&self, message: &StageMessage, delay: Duration) -> Result<(), QueueError>;

    /// Receives the oldest visible message for `stage`, if any.
    fn dequeue(&self, stage: Stage) -> Result<Option<Delivery>, QueueError>;

    /// Deletes a processed message.
    fn ack(&self, receipt: Receipt) -> Result<(), QueueError>;

    /// Returns a message to the queue after `delay`, recording `error`.
    fn nack(&self, receipt: Receipt, delay: Duration, error: &str) -> Result<(), QueueError>;

    /// Atomically replaces a received message with `next`, visible after
    /// `delay`. The receive budget starts over for the new attempt.
    fn requeue(
        &self,
        receipt: Receipt,
        next: &StageMessage,
        delay: Duration,
        error: &str,
    ) -> Result<(), QueueError>;

    /// Messages on `stage`, visible or in flight.
    fn depth(&self, stage: Stage) -> Result<u64, QueueError>;

    fn dead_letters(&self, stage: Option<Stage>) -> Result<Vec<DeadLetter>, QueueError>;

    fn dead_letter(&self, id: i64) -> Result<Option<DeadLetter>, QueueError>;

    /// Number of dead letters for this `(document, generation, stage)` that
    /// have already been redriven.
    fn redrive_count(&self, message: &StageMessage) -> Result<u32, QueueError>;

    /// Re-enqueues a dead letter's message and stamps it as redriven.
    fn redrive(&self, id: i64) -> Result<StageMessage, QueueError>;

    fn discard(&self, id: i64) -> Result<(), QueueError>;
}
