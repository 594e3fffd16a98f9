use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ComplyError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Processing error: {0}")]
    Process(#[from] ProcessError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] crate::queue::QueueError),

    #[error("Model error: {0}")]
    Model(#[from] crate::model::InvokeError),

    #[error("Coordinator error: {0}")]
    Coordinator(#[from] crate::pipeline::CoordinatorError),

    #[error("Document '{0}' not found")]
    DocumentNotFound(String),

    #[error("Document '{document_id}' is {stage}; reports can only be regenerated for completed documents")]
    NotCompleted { document_id: String, stage: String },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },

    #[error("Failed to resolve secret '{name}': {reason}")]
    Secret { name: String, reason: String },
}

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Unsupported document format: {0}")]
    UnsupportedFormat(String),

    #[error("Document '{0}' contains no extractable text")]
    EmptyDocument(String),

    #[error("Failed to process PDF: {0}")]
    PdfProcessing(String),

    #[error("Text extraction failed: {0}")]
    TextExtraction(String),

    #[error("Obligation {index} is invalid: {reason}")]
    InvalidObligation { index: usize, reason: String },

    #[error("Unexpected payload reference '{found}' (expected '{expected}')")]
    PayloadMismatch { expected: String, found: String },
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Object '{key}' not found")]
    NotFound { key: String },

    #[error("Invalid object key '{key}': {reason}")]
    InvalidKey { key: String, reason: &'static str },

    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to move file from '{from}' to '{to}': {source}")]
    MoveFile {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    /// I/O failures may clear up; a missing object or a bad key will not.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            StorageError::NotFound { .. } | StorageError::InvalidKey { .. }
        )
    }
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Worker channel closed unexpectedly")]
    ChannelClosed,

    #[error("Failed to install signal handler: {0}")]
    SignalHandler(String),
}

/// How a failure is routed. Every error reaching a stage worker is mapped to
/// exactly one class before retry or terminal handling is decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Expected to clear up on retry (throttling, timeouts, busy store).
    Transient,
    /// Retrying the same input cannot succeed; needs a new generation.
    Permanent,
    /// The ledger or the hand-off itself failed. Needs an operator.
    Coordinator,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureClass::Transient => "transient",
            FailureClass::Permanent => "permanent",
            FailureClass::Coordinator => "coordinator",
        })
    }
}

impl ComplyError {
    pub fn failure_class(&self) -> FailureClass {
        match self {
            ComplyError::Config(_) | ComplyError::Process(_) => FailureClass::Permanent,
            ComplyError::Storage(e) if e.is_transient() => FailureClass::Transient,
            ComplyError::Storage(_) => FailureClass::Permanent,
            ComplyError::Worker(_) => FailureClass::Transient,
            ComplyError::Database(e) if e.is_transient() => FailureClass::Transient,
            ComplyError::Database(_) => FailureClass::Permanent,
            ComplyError::Queue(_) => FailureClass::Transient,
            ComplyError::Model(e) => e.failure_class(),
            ComplyError::Coordinator(_) => FailureClass::Coordinator,
            ComplyError::DocumentNotFound(_) | ComplyError::NotCompleted { .. } => {
                FailureClass::Permanent
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, ComplyError>;
