use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::{expect_payload, report_key, tasks_ref, StageContext, StageHandler};
use crate::db::document_repo;
use crate::db::obligation_repo::{self, ObligationRow};
use crate::db::report_repo::{self, ReportRow};
use crate::db::task_repo::{self, TaskRow};
use crate::db::{format_timestamp, DatabaseError};
use crate::domain::{ReportStatus, Severity, TaskPriority};
use crate::error::{ComplyError, Result};
use crate::model::schema::REPORT_SUMMARY;
use crate::model::ModelRequest;
use crate::pipeline::stage::{DocumentStage, Stage};
use crate::queue::StageMessage;

/// Request id of the report the pipeline itself compiles.
pub const PIPELINE_REQUEST: &str = "pipeline";

const SYSTEM_PROMPT: &str = "You are a compliance reporting specialist. \
You write concise, factual compliance summaries and answer with JSON only.";

/// Counts that appear in every report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportStats {
    pub total_obligations: u64,
    pub obligations_by_category: BTreeMap<String, u64>,
    pub obligations_by_severity: BTreeMap<String, u64>,
    pub obligations_by_deadline_type: BTreeMap<String, u64>,
    pub total_tasks: u64,
    pub tasks_by_priority: BTreeMap<String, u64>,
    pub tasks_by_status: BTreeMap<String, u64>,
    pub critical_obligations: u64,
    pub high_priority_tasks: u64,
}

impl ReportStats {
    pub fn compute(obligations: &[ObligationRow], tasks: &[TaskRow]) -> Self {
        let mut stats = Self {
            total_obligations: obligations.len() as u64,
            total_tasks: tasks.len() as u64,
            ..Self::default()
        };
        for o in obligations {
            bump(&mut stats.obligations_by_category, o.category.as_str());
            bump(&mut stats.obligations_by_severity, o.severity.as_str());
            bump(&mut stats.obligations_by_deadline_type, o.deadline_type.as_str());
            if o.severity == Severity::Critical {
                stats.critical_obligations += 1;
            }
        }
        for t in tasks {
            bump(&mut stats.tasks_by_priority, t.priority.as_str());
            bump(&mut stats.tasks_by_status, t.status.as_str());
            if t.priority == TaskPriority::High {
                stats.high_priority_tasks += 1;
            }
        }
        stats
    }
}

fn bump(counts: &mut BTreeMap<String, u64>, label: &str) {
    *counts.entry(label.to_string()).or_insert(0) += 1;
}

#[derive(Debug, Deserialize)]
struct ReportSummary {
    title: String,
    executive_summary: String,
    key_findings: Vec<String>,
    recommendations: Vec<String>,
}

/// Compiles a generation's obligations and tasks into a Markdown report.
pub struct Reporter {
    ctx: Arc<StageContext>,
}

impl Reporter {
    pub fn new(ctx: Arc<StageContext>) -> Self {
        Self { ctx }
    }

    /// Compiles the report for `request_id`, or returns the one already
    /// completed under that request. A failed earlier attempt is restarted.
    pub fn compile(&self, document_id: &str, generation_id: &str, request_id: &str) -> Result<ReportRow> {
        let draft = ReportRow {
            report_id: uuid::Uuid::new_v4().to_string(),
            document_id: document_id.to_string(),
            generation_id: generation_id.to_string(),
            report_request_id: request_id.to_string(),
            status: ReportStatus::Generating,
            obligation_ids: vec![],
            task_ids: vec![],
            artifact_key: None,
            error_detail: None,
            created_at: format_timestamp(Utc::now()),
            completed_at: None,
        };
        let (report, created) = report_repo::begin(&self.ctx.db, &draft)?;
        match report.status {
            ReportStatus::Completed => {
                log::info!("Report {} for request '{}' already completed", report.report_id, request_id);
                return Ok(report);
            }
            ReportStatus::Failed => {
                log::info!("Restarting failed report {}", report.report_id);
                report_repo::restart(&self.ctx.db, &report.report_id)?;
            }
            ReportStatus::Generating if !created => {
                log::warn!("Report {} was left generating, compiling again", report.report_id)
            }
            ReportStatus::Generating => {}
        }

        let obligations = obligation_repo::list_for_generation(&self.ctx.db, document_id, generation_id)?;
        let tasks = task_repo::list_for_generation(&self.ctx.db, document_id, generation_id)?;
        let stats = ReportStats::compute(&obligations, &tasks);

        let request = ModelRequest::new(summary_prompt(document_id, &stats, &obligations, &tasks))
            .with_system(SYSTEM_PROMPT);
        let summary = match self.ctx.invoker.invoke::<ReportSummary>(&request, REPORT_SUMMARY) {
            Ok(invocation) => invocation.value,
            Err(e) => {
                report_repo::mark_failed(&self.ctx.db, &report.report_id, &e.to_string())?;
                return Err(e.into());
            }
        };

        let key = report_key(document_id, generation_id, &report.report_id);
        let markdown = render_markdown(document_id, generation_id, &summary, &stats, &obligations, &tasks);
        if let Err(e) = self.ctx.store.put(&key, markdown.as_bytes()) {
            report_repo::mark_failed(&self.ctx.db, &report.report_id, &e.to_string())?;
            return Err(e.into());
        }

        let obligation_ids: Vec<String> = obligations.iter().map(|o| o.obligation_id.clone()).collect();
        let task_ids: Vec<String> = tasks.iter().map(|t| t.task_id.clone()).collect();
        match report_repo::complete(
            &self.ctx.db,
            &report.report_id,
            &key,
            &obligation_ids,
            &task_ids,
            &format_timestamp(Utc::now()),
        ) {
            Ok(()) => {}
            // A concurrent attempt finished first; its row wins.
            Err(DatabaseError::Conflict(detail)) => log::warn!("{}", detail),
            Err(e) => return Err(e.into()),
        }

        let stored = report_repo::find_by_request(&self.ctx.db, document_id, generation_id, request_id)?
            .ok_or_else(|| {
                DatabaseError::Conflict(format!("report for request '{}' disappeared", request_id))
            })?;
        log::info!(
            "Compiled report {} for {}/{} ({} obligations, {} tasks)",
            stored.report_id,
            document_id,
            generation_id,
            stats.total_obligations,
            stats.total_tasks
        );
        Ok(stored)
    }

    /// Compiles an additional report for a completed document's current
    /// generation without reprocessing it. Repeating a `request_id`
    /// returns the same report.
    pub fn regenerate(&self, document_id: &str, request_id: &str) -> Result<ReportRow> {
        let document = document_repo::find_by_id(&self.ctx.db, document_id)?
            .ok_or_else(|| ComplyError::DocumentNotFound(document_id.to_string()))?;
        if document.stage != DocumentStage::Completed.as_str() {
            return Err(ComplyError::NotCompleted {
                document_id: document_id.to_string(),
                stage: document.stage,
            });
        }
        self.compile(document_id, &document.current_generation, request_id)
    }
}

impl StageHandler for Reporter {
    fn stage(&self) -> Stage {
        Stage::Reporting
    }

    fn handle(&self, message: &StageMessage) -> Result<String> {
        let _span = tracing::info_span!("stage.reporting", document = %message.document_id).entered();
        expect_payload(message, tasks_ref(&message.document_id, &message.generation_id))?;
        let report = self.compile(&message.document_id, &message.generation_id, PIPELINE_REQUEST)?;
        report.artifact_key.ok_or_else(|| {
            DatabaseError::Conflict(format!("completed report {} has no artifact", report.report_id)).into()
        })
    }
}

fn summary_prompt(
    document_id: &str,
    stats: &ReportStats,
    obligations: &[ObligationRow],
    tasks: &[TaskRow],
) -> String {
    let mut prompt = format!(
        "Write an executive compliance summary for regulatory document {}.\n\n\
         Statistics: {} obligations ({} critical), {} tasks ({} high priority).\n\n\
         Obligations:\n",
        document_id,
        stats.total_obligations,
        stats.critical_obligations,
        stats.total_tasks,
        stats.high_priority_tasks
    );
    for o in obligations {
        let _ = writeln!(
            prompt,
            "- [{} / {} / {}] {}",
            o.severity, o.category, o.deadline_type, o.description
        );
    }
    prompt.push_str("\nTasks:\n");
    for t in tasks {
        let _ = writeln!(
            prompt,
            "- [{}] {} (due {})",
            t.priority,
            t.title,
            t.due_date.as_deref().unwrap_or("unscheduled")
        );
    }
    prompt.push_str(
        "\nRespond with a JSON object with the fields title, executive_summary, \
         key_findings (array of strings) and recommendations (array of strings).",
    );
    prompt
}

fn render_counts(out: &mut String, heading: &str, counts: &BTreeMap<String, u64>) {
    let _ = writeln!(out, "| {} | Count |\n|---|---|", heading);
    for (label, count) in counts {
        let _ = writeln!(out, "| {} | {} |", label, count);
    }
    out.push('\n');
}

fn render_markdown(
    document_id: &str,
    generation_id: &str,
    summary: &ReportSummary,
    stats: &ReportStats,
    obligations: &[ObligationRow],
    tasks: &[TaskRow],
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# {}\n", summary.title.trim());
    let _ = writeln!(
        out,
        "Document `{}`, generation `{}`. Generated {}.\n",
        document_id,
        generation_id,
        Utc::now().format("%Y-%m-%d %H:%M UTC")
    );

    let _ = writeln!(out, "## Executive Summary\n\n{}\n", summary.executive_summary.trim());

    let _ = writeln!(out, "## Statistics\n");
    let _ = writeln!(
        out,
        "- Obligations: {} ({} critical)\n- Tasks: {} ({} high priority)\n",
        stats.total_obligations, stats.critical_obligations, stats.total_tasks, stats.high_priority_tasks
    );
    render_counts(&mut out, "Category", &stats.obligations_by_category);
    render_counts(&mut out, "Severity", &stats.obligations_by_severity);
    render_counts(&mut out, "Deadline type", &stats.obligations_by_deadline_type);
    render_counts(&mut out, "Task priority", &stats.tasks_by_priority);

    if !summary.key_findings.is_empty() {
        let _ = writeln!(out, "## Key Findings\n");
        for finding in &summary.key_findings {
            let _ = writeln!(out, "- {}", finding);
        }
        out.push('\n');
    }

    let critical: Vec<&ObligationRow> = obligations
        .iter()
        .filter(|o| o.severity == Severity::Critical)
        .collect();
    if !critical.is_empty() {
        let _ = writeln!(out, "## Critical Obligations\n");
        for o in critical {
            let _ = writeln!(out, "- {} ({}, {})", o.description, o.category, o.deadline_type);
        }
        out.push('\n');
    }

    if !tasks.is_empty() {
        let _ = writeln!(out, "## Tasks\n\n| Priority | Title | Due | Status |\n|---|---|---|---|");
        for t in tasks {
            let _ = writeln!(
                out,
                "| {} | {} | {} | {} |",
                t.priority,
                t.title.replace('|', "\\|"),
                t.due_date.as_deref().unwrap_or("-"),
                t.status
            );
        }
        out.push('\n');
    }

    if !summary.recommendations.is_empty() {
        let _ = writeln!(out, "## Recommendations\n");
        for (i, rec) in summary.recommendations.iter().enumerate() {
            let _ = writeln!(out, "{}. {}", i + 1, rec);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::document_repo::DocumentRow;
    use crate::domain::{Category, DeadlineType};
    use crate::error::FailureClass;
    use crate::stages::planning::plan_tasks;
    use crate::stages::test_support::{harness, Harness};
    use crate::storage::ObjectStore;

    const SUMMARY: &str = r#"{"title": "Emissions Compliance Report",
        "executive_summary": "Two obligations were identified.",
        "key_findings": ["Annual filing is due"], "recommendations": ["Assign an owner"]}"#;

    fn seed(h: &Harness) {
        let obligations: Vec<ObligationRow> = [
            (Category::Reporting, Severity::Critical, DeadlineType::Recurring),
            (Category::Operational, Severity::Low, DeadlineType::Ongoing),
        ]
        .iter()
        .enumerate()
        .map(|(i, (category, severity, deadline))| ObligationRow {
            obligation_id: format!("g1-obl-{}", i + 1),
            document_id: "doc-1".to_string(),
            generation_id: "g1".to_string(),
            position: i as u32,
            category: *category,
            severity: *severity,
            deadline_type: *deadline,
            description: format!("obligation {}", i + 1),
            extracted_text: String::new(),
            applicable_entities: vec![],
            confidence_score: 0.9,
            created_at: "2026-01-01T00:00:00.000000Z".to_string(),
        })
        .collect();
        obligation_repo::insert_generation(&h.ctx.db, "doc-1", "g1", &obligations).unwrap();
        let tasks = plan_tasks(&obligations, Utc::now());
        task_repo::insert_generation(&h.ctx.db, "doc-1", "g1", &tasks).unwrap();
    }

    fn message() -> StageMessage {
        StageMessage::first("doc-1", "g1", Stage::Reporting, "tasks:doc-1:g1")
    }

    #[test]
    fn test_stats() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), vec![]);
        seed(&h);
        let obligations = obligation_repo::list_for_generation(&h.ctx.db, "doc-1", "g1").unwrap();
        let tasks = task_repo::list_for_generation(&h.ctx.db, "doc-1", "g1").unwrap();
        let stats = ReportStats::compute(&obligations, &tasks);
        assert_eq!(stats.total_obligations, 2);
        assert_eq!(stats.critical_obligations, 1);
        assert_eq!(stats.high_priority_tasks, 1);
        assert_eq!(stats.obligations_by_category.get("operational"), Some(&1));
        assert_eq!(stats.tasks_by_status.get("pending"), Some(&2));
    }

    #[test]
    fn test_handle_writes_one_report() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), vec![Ok(SUMMARY.to_string())]);
        seed(&h);

        let reporter = Reporter::new(h.ctx.clone());
        let key = reporter.handle(&message()).unwrap();
        assert!(key.starts_with("reports/doc-1/g1/"));
        let markdown = String::from_utf8(h.store.get(&key).unwrap()).unwrap();
        assert!(markdown.starts_with("# Emissions Compliance Report"));
        assert!(markdown.contains("## Critical Obligations"));

        // Redelivery returns the same artifact without another model call.
        assert_eq!(reporter.handle(&message()).unwrap(), key);
        assert_eq!(h.model.calls(), 1);
        let reports = report_repo::list_for_generation(&h.ctx.db, "doc-1", "g1").unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].task_ids.len(), 2);
        assert_eq!(reports[0].status, ReportStatus::Completed);
    }

    #[test]
    fn test_failed_report_is_restarted() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), vec![]);
        seed(&h);
        let reporter = Reporter::new(h.ctx.clone());

        let err = reporter.compile("doc-1", "g1", "audit-q1").unwrap_err();
        assert_eq!(err.failure_class(), FailureClass::Permanent);
        let failed = report_repo::find_by_request(&h.ctx.db, "doc-1", "g1", "audit-q1")
            .unwrap()
            .unwrap();
        assert_eq!(failed.status, ReportStatus::Failed);

        h.model.push(Ok(SUMMARY.to_string()));
        let report = reporter.compile("doc-1", "g1", "audit-q1").unwrap();
        assert_eq!(report.report_id, failed.report_id);
        assert_eq!(report.status, ReportStatus::Completed);
    }

    #[test]
    fn test_regenerate_requires_completed_document() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), vec![Ok(SUMMARY.to_string())]);
        seed(&h);
        let reporter = Reporter::new(h.ctx.clone());

        assert!(matches!(
            reporter.regenerate("doc-1", "r1").unwrap_err(),
            ComplyError::DocumentNotFound(_)
        ));

        let document = DocumentRow {
            document_id: "doc-1".to_string(),
            source_key: "uploads/doc-1.txt".to_string(),
            owner: "ops".to_string(),
            stage: "planned".to_string(),
            current_generation: "g1".to_string(),
            error_detail: None,
            created_at: "2026-01-01T00:00:00.000000Z".to_string(),
            updated_at: "2026-01-01T00:00:00.000000Z".to_string(),
        };
        document_repo::insert(&h.ctx.db, &document).unwrap();
        assert!(matches!(
            reporter.regenerate("doc-1", "r1").unwrap_err(),
            ComplyError::NotCompleted { .. }
        ));

        h.ctx
            .db
            .with_conn(|conn| {
                conn.execute("UPDATE documents SET stage = 'completed' WHERE document_id = 'doc-1'", [])?;
                Ok(())
            })
            .unwrap();

        let first = reporter.regenerate("doc-1", "r1").unwrap();
        let again = reporter.regenerate("doc-1", "r1").unwrap();
        assert_eq!(first.report_id, again.report_id);
        assert_eq!(h.model.calls(), 1);
    }
}
