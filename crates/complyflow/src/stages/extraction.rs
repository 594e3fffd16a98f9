use std::sync::Arc;

use super::{extracted_text_key, StageContext, StageHandler};
use crate::error::Result;
use crate::pipeline::stage::Stage;
use crate::queue::StageMessage;

/// Pulls the source document from the object store and stores its text.
pub struct Extractor {
    ctx: Arc<StageContext>,
}

impl Extractor {
    pub fn new(ctx: Arc<StageContext>) -> Self {
        Self { ctx }
    }
}

impl StageHandler for Extractor {
    fn stage(&self) -> Stage {
        Stage::Extraction
    }

    fn handle(&self, message: &StageMessage) -> Result<String> {
        let _span = tracing::info_span!(
            "stage.extraction",
            document = %message.document_id,
            source = %message.payload_ref
        )
        .entered();

        let bytes = self.ctx.store.get(&message.payload_ref)?;
        let extracted = self.ctx.processors.extract(&message.payload_ref, &bytes)?;

        let key = extracted_text_key(&message.document_id, &message.generation_id);
        self.ctx.store.put(&key, extracted.text.as_bytes())?;

        log::info!(
            "Extracted {} chars from {} ({}, {} pages)",
            extracted.text.len(),
            message.payload_ref,
            extracted.format,
            extracted.page_count
        );
        Ok(key)
    }
}
