//! The domain step of each pipeline stage.
//!
//! Handlers only read their input and write their own entities. Claiming,
//! retrying and handing off is the stage worker's job.

pub mod categorization;
pub mod extraction;
pub mod planning;
pub mod reporting;

use std::sync::Arc;

use crate::db::Database;
use crate::error::{ProcessError, Result};
use crate::model::ModelInvoker;
use crate::pipeline::stage::Stage;
use crate::processor::ProcessorRegistry;
use crate::queue::StageMessage;
use crate::storage::ObjectStore;

pub use categorization::Categorizer;
pub use extraction::Extractor;
pub use planning::Planner;
pub use reporting::{ReportStats, Reporter};

/// Shared collaborators of every stage handler.
pub struct StageContext {
    pub db: Database,
    pub store: Arc<dyn ObjectStore>,
    pub invoker: Arc<ModelInvoker>,
    pub processors: ProcessorRegistry,
    /// Let the model rewrite template task titles and descriptions.
    pub refine_tasks: bool,
}

pub trait StageHandler: Send + Sync {
    fn stage(&self) -> Stage;

    /// Runs the domain step for `message` and returns the reference to the
    /// stored output. Must be safe to run again for the same message.
    fn handle(&self, message: &StageMessage) -> Result<String>;
}

/// One handler per stage, in pipeline order.
pub fn handlers(ctx: &Arc<StageContext>) -> Vec<Arc<dyn StageHandler>> {
    vec![
        Arc::new(Extractor::new(Arc::clone(ctx))),
        Arc::new(Categorizer::new(Arc::clone(ctx))),
        Arc::new(Planner::new(Arc::clone(ctx))),
        Arc::new(Reporter::new(Arc::clone(ctx))),
    ]
}

pub fn extracted_text_key(document_id: &str, generation_id: &str) -> String {
    format!("extracted/{}/{}.txt", document_id, generation_id)
}

pub fn obligations_ref(document_id: &str, generation_id: &str) -> String {
    format!("obligations:{}:{}", document_id, generation_id)
}

pub fn tasks_ref(document_id: &str, generation_id: &str) -> String {
    format!("tasks:{}:{}", document_id, generation_id)
}

pub fn report_key(document_id: &str, generation_id: &str, report_id: &str) -> String {
    format!("reports/{}/{}/{}.md", document_id, generation_id, report_id)
}

/// Rejects a message whose payload does not point at this generation's
/// output of the previous stage.
pub(crate) fn expect_payload(message: &StageMessage, expected: String) -> std::result::Result<(), ProcessError> {
    if message.payload_ref == expected {
        Ok(())
    } else {
        Err(ProcessError::PayloadMismatch {
            expected,
            found: message.payload_ref.clone(),
        })
    }
}
