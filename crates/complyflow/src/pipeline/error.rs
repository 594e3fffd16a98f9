use thiserror::Error;

use super::stage::{DocumentStage, Stage};
use crate::db::DatabaseError;
use crate::queue::QueueError;

/// Failures of the coordinator itself. Any of these leaves the ledger in a
/// state that needs operator attention or an explicit caller decision.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Status ledger write failed: {0}")]
    Ledger(#[from] DatabaseError),

    #[error("Failed to enqueue {stage} for document '{document_id}' after {attempts} attempts: {source}")]
    Enqueue {
        document_id: String,
        stage: Stage,
        attempts: u32,
        #[source]
        source: QueueError,
    },

    #[error("Dead-letter queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Document '{0}' not found")]
    DocumentNotFound(String),

    #[error("Document '{0}' already exists")]
    DocumentExists(String),

    #[error("Document '{document_id}' is {stage}; a new generation needs a completed or failed document")]
    GenerationInFlight {
        document_id: String,
        stage: DocumentStage,
    },

    #[error("Stage {stage} of document '{document_id}' is not in progress")]
    NotClaimed { document_id: String, stage: Stage },

    #[error("Stage {stage} of document '{document_id}' completed without an output reference")]
    MissingOutput { document_id: String, stage: Stage },

    #[error("Dead letter {id} cannot be redriven: {reason}")]
    RedriveRefused { id: i64, reason: String },
}
