use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;

use super::{extracted_text_key, expect_payload, obligations_ref, StageContext, StageHandler};
use crate::db::obligation_repo::{self, ObligationRow};
use crate::db::{format_timestamp, WriteOutcome};
use crate::domain::{Category, DeadlineType, Severity};
use crate::error::{ProcessError, Result};
use crate::model::schema::OBLIGATIONS;
use crate::model::ModelRequest;
use crate::pipeline::stage::Stage;
use crate::queue::StageMessage;

/// Longest document excerpt sent to the model, in characters.
const MAX_PROMPT_CHARS: usize = 120_000;

const SYSTEM_PROMPT: &str = "You are an expert regulatory compliance analyst. \
You extract compliance obligations from regulatory text and answer with JSON only.";

/// One obligation as the model reports it. Labels stay strings until they
/// are validated against the enumerations.
#[derive(Debug, Clone, Deserialize)]
pub struct RawObligation {
    pub description: String,
    pub category: String,
    pub severity: String,
    pub deadline_type: String,
    #[serde(default)]
    pub applicable_entities: Vec<String>,
    #[serde(default)]
    pub extracted_text: String,
    pub confidence_score: f64,
}

#[derive(Debug, Deserialize)]
struct ObligationsResponse {
    obligations: Vec<RawObligation>,
}

/// Turns extracted text into validated obligations.
pub struct Categorizer {
    ctx: Arc<StageContext>,
}

impl Categorizer {
    pub fn new(ctx: Arc<StageContext>) -> Self {
        Self { ctx }
    }
}

impl StageHandler for Categorizer {
    fn stage(&self) -> Stage {
        Stage::Categorization
    }

    fn handle(&self, message: &StageMessage) -> Result<String> {
        let _span = tracing::info_span!("stage.categorization", document = %message.document_id).entered();
        let doc = &message.document_id;
        let generation = &message.generation_id;
        expect_payload(message, extracted_text_key(doc, generation))?;
        let output = obligations_ref(doc, generation);

        // A previous attempt may have written the set and died before the
        // hand-off; reuse it, even when empty, instead of asking the model again.
        if obligation_repo::is_recorded(&self.ctx.db, doc, generation)? {
            let existing = obligation_repo::list_for_generation(&self.ctx.db, doc, generation)?;
            log::info!("Reusing {} stored obligations for {}/{}", existing.len(), doc, generation);
            return Ok(output);
        }

        let bytes = self.ctx.store.get(&message.payload_ref)?;
        let text = String::from_utf8(bytes)
            .map_err(|e| ProcessError::TextExtraction(format!("stored text is not UTF-8: {}", e)))?;

        let request = ModelRequest::new(extraction_prompt(doc, &text)).with_system(SYSTEM_PROMPT);
        let invocation = self
            .ctx
            .invoker
            .invoke::<ObligationsResponse>(&request, OBLIGATIONS)?;

        let rows = validate_obligations(doc, generation, &invocation.value.obligations)?;
        match obligation_repo::insert_generation(&self.ctx.db, doc, generation, &rows)? {
            WriteOutcome::Inserted(rows) => log::info!(
                "Categorized {} obligations for {}/{} ({} model attempts)",
                rows.len(),
                doc,
                generation,
                invocation.attempt_count
            ),
            WriteOutcome::AlreadyPresent(rows) => log::info!(
                "Obligations for {}/{} were written concurrently ({} rows)",
                doc,
                generation,
                rows.len()
            ),
        }
        Ok(output)
    }
}

/// Checks every model-supplied obligation. A single invalid entry rejects
/// the whole set; the document never proceeds on partially valid data.
pub fn validate_obligations(
    document_id: &str,
    generation_id: &str,
    raw: &[RawObligation],
) -> std::result::Result<Vec<ObligationRow>, ProcessError> {
    let created_at = format_timestamp(Utc::now());
    raw.iter()
        .enumerate()
        .map(|(index, item)| {
            let invalid = |reason: String| ProcessError::InvalidObligation { index, reason };

            let category: Category = item.category.parse().map_err(|e| invalid(format!("{}", e)))?;
            let severity: Severity = item.severity.parse().map_err(|e| invalid(format!("{}", e)))?;
            let deadline_type: DeadlineType = item
                .deadline_type
                .parse()
                .map_err(|e| invalid(format!("{}", e)))?;
            if item.description.trim().is_empty() {
                return Err(invalid("description is empty".to_string()));
            }
            if !(0.0..=1.0).contains(&item.confidence_score) {
                return Err(invalid(format!(
                    "confidence score {} is outside [0, 1]",
                    item.confidence_score
                )));
            }

            Ok(ObligationRow {
                obligation_id: format!("{}-obl-{}", generation_id, index + 1),
                document_id: document_id.to_string(),
                generation_id: generation_id.to_string(),
                position: index as u32,
                category,
                severity,
                deadline_type,
                description: item.description.trim().to_string(),
                extracted_text: item.extracted_text.clone(),
                applicable_entities: item.applicable_entities.clone(),
                confidence_score: item.confidence_score,
                created_at: created_at.clone(),
            })
        })
        .collect()
}

fn extraction_prompt(document_id: &str, text: &str) -> String {
    let excerpt: String = if text.chars().count() > MAX_PROMPT_CHARS {
        log::warn!(
            "Document {} exceeds {} chars, sending a truncated excerpt",
            document_id,
            MAX_PROMPT_CHARS
        );
        text.chars().take(MAX_PROMPT_CHARS).collect()
    } else {
        text.to_string()
    };

    format!(
        "Extract every compliance obligation from the regulatory document below.\n\n\
         For each obligation provide:\n\
         - description: a clear, actionable statement of what must be done\n\
         - category: one of reporting, monitoring, operational, financial\n\
         - severity: one of critical, high, medium, low\n\
         - deadline_type: one of recurring, one_time, ongoing\n\
         - applicable_entities: who must comply\n\
         - extracted_text: the exact text the obligation comes from\n\
         - confidence_score: your confidence in this extraction, 0.0 to 1.0\n\n\
         Categories: reporting covers reports, filings and notifications; monitoring covers \
         tracking and measuring conditions; operational covers how equipment and processes \
         are run; financial covers payments, fees and reserves.\n\
         Severities: critical when non-compliance risks severe penalties or safety issues; \
         high for significant consequences; medium for standard requirements; low for \
         administrative ones. When uncertain, choose the higher severity.\n\
         Deadlines: recurring for regular deadlines, one_time for a single deadline or \
         event, ongoing for continuous requirements.\n\n\
         Only extract actual obligations, not background statements.\n\
         Respond with a JSON object of the form {{\"obligations\": [...]}}.\n\n\
         DOCUMENT {}:\n{}",
        document_id, excerpt
    )
}
