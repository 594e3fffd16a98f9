pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod processor;
pub mod queue;
pub mod retry;
pub mod secrets;
pub mod stages;
pub mod storage;
pub mod telemetry;
pub mod worker;

pub use config::{load_config, load_config_from_str, Config};
pub use db::Database;
pub use domain::{Category, DeadlineType, ReportStatus, Severity, TaskPriority, TaskStatus};
pub use error::{ComplyError, ConfigError, FailureClass, ProcessError, Result, StorageError, WorkerError};
pub use model::{InvokeError, ModelInvoker, ModelRequest, ModelTransport, TransportError};
pub use pipeline::{
    Coordinator, CoordinatorError, DeadLetterHandler, DrainReport, Pipeline, PipelineEvent,
    PipelineEventKind, Stage, StatusReport,
};
pub use queue::{DeadLetter, QueueError, StageMessage, StageQueue};
pub use secrets::{resolve_secret, resolve_secret_optional, SecretError};
pub use stages::{ReportStats, StageContext, StageHandler};
pub use storage::{FsObjectStore, ObjectStore};
pub use worker::{PollOutcome, WorkerPool};
