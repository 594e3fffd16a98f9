pub mod coordinator;
pub mod dead_letter;
pub mod error;
pub mod events;
pub mod ledger;
pub mod runner;
pub mod stage;

pub use coordinator::{Advance, Coordinator, CoordinatorSettings, StatusReport};
pub use dead_letter::{DeadLetterHandler, DeadLetterStats};
pub use error::CoordinatorError;
pub use events::{PipelineEvent, PipelineEventBroadcaster, PipelineEventKind};
pub use ledger::{ClaimOutcome, StatusEntry, StatusLedger};
pub use runner::{DrainReport, Pipeline};
pub use stage::{DocumentStage, Stage, StageStatus};
