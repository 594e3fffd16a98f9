//! Whole-pipeline runs: a document goes from submission to a compiled
//! report through every stage queue.

mod common;

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::Utc;

use common::{Route, TestHarness};
use complyflow::pipeline::{Advance, DocumentStage, StageStatus};
use complyflow::stages::{extracted_text_key, tasks_ref};
use complyflow::{
    PipelineEventKind, PollOutcome, ReportStatus, Severity, Stage, StageMessage, TaskPriority,
    TaskStatus,
};

fn two_obligations(h: &TestHarness) {
    h.model.push_obligations(&[
        ("Report capital position annually", "reporting", "high", "one_time"),
        ("Monitor transactions continuously", "monitoring", "low", "ongoing"),
    ]);
}

#[test]
fn test_document_runs_through_every_stage() {
    let h = TestHarness::new();
    two_obligations(&h);
    let mut events = h.pipeline.events().subscribe();

    let generation = h.submit("doc-1");
    let drained = h.drain();
    assert_eq!(drained.finished, 1);
    assert_eq!(drained.completed, 4);
    assert_eq!(drained.failed, 0);
    assert_eq!(h.queue_depth(), 0);

    let status = h.status("doc-1");
    assert_eq!(status.stage, DocumentStage::Completed);
    assert_eq!(status.generation_id, generation);
    assert!(status.error_detail.is_none());

    let obligations = h.obligations("doc-1", &generation);
    assert_eq!(obligations.len(), 2);
    let severities: BTreeSet<Severity> = obligations.iter().map(|o| o.severity).collect();
    assert!(severities.contains(&Severity::High) && severities.contains(&Severity::Low));

    let today = Utc::now().date_naive();
    let tasks = h.tasks("doc-1", &generation);
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].priority, TaskPriority::High);
    assert_eq!(tasks[1].priority, TaskPriority::Low);
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Pending));
    // One-time high severity is due in 30 days, ongoing low in 120.
    for (task, days) in tasks.iter().zip([30, 120]) {
        let due = task.due_date.clone().expect("task has a due date");
        let expected = [today, today - chrono::Duration::days(1)]
            .map(|base| (base + chrono::Duration::days(days)).to_string());
        assert!(expected.contains(&due), "due {} not in {:?}", due, expected);
    }

    let reports = h.reports("doc-1", &generation);
    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert_eq!(report.status, ReportStatus::Completed);
    let task_ids: BTreeSet<&String> = tasks.iter().map(|t| &t.task_id).collect();
    assert_eq!(report.task_ids.iter().collect::<BTreeSet<_>>(), task_ids);
    let artifact = h
        .pipeline
        .store()
        .get(report.artifact_key.as_deref().expect("artifact stored"))
        .unwrap();
    let markdown = String::from_utf8(artifact).unwrap();
    assert!(markdown.contains("# Capital Requirements Review"));
    assert!(markdown.contains("Report capital position annually"));

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push((event.stage, event.kind));
    }
    for stage in Stage::ORDER {
        assert!(kinds.contains(&(stage, PipelineEventKind::Claimed)));
        assert!(kinds.contains(&(stage, PipelineEventKind::Completed)));
    }
}

#[test]
fn test_stage_completions_are_ordered() {
    let h = TestHarness::new();
    two_obligations(&h);
    h.submit("doc-1");
    h.drain();

    let mut entries = h.status("doc-1").entries;
    entries.sort_by_key(|e| e.stage);
    assert_eq!(entries.len(), 4);
    assert!(entries.iter().all(|e| e.status == StageStatus::Completed && e.handed_off));
    assert!(entries.iter().all(|e| e.attempt_count == 1));

    let completed: Vec<String> = entries
        .iter()
        .map(|e| e.completed_at.clone().expect("completion time"))
        .collect();
    assert!(
        completed.windows(2).all(|pair| pair[0] <= pair[1]),
        "completion times out of order: {:?}",
        completed
    );
}

#[test]
fn test_redelivered_messages_change_nothing() {
    let h = TestHarness::new();
    two_obligations(&h);
    let generation = h.submit("doc-1");
    h.drain();
    let calls_before = h.model.total_calls();

    let queue = h.pipeline.coordinator().queue();
    let categorization = StageMessage::first(
        "doc-1",
        &generation,
        Stage::Categorization,
        &extracted_text_key("doc-1", &generation),
    );
    let reporting = StageMessage::first("doc-1", &generation, Stage::Reporting, &tasks_ref("doc-1", &generation));
    queue.enqueue(&categorization, Duration::ZERO).unwrap();
    queue.enqueue(&categorization, Duration::ZERO).unwrap();
    queue.enqueue(&reporting, Duration::ZERO).unwrap();

    let drained = h.drain();
    assert_eq!(drained.processed, 3);
    assert_eq!(drained.completed, 0);
    assert_eq!(drained.finished, 0);
    assert_eq!(h.queue_depth(), 0);

    assert_eq!(h.model.total_calls(), calls_before);
    assert_eq!(h.obligations("doc-1", &generation).len(), 2);
    assert_eq!(h.tasks("doc-1", &generation).len(), 2);
    assert_eq!(h.reports("doc-1", &generation).len(), 1);
    assert_eq!(h.status("doc-1").stage, DocumentStage::Completed);
}

#[test]
fn test_documents_progress_independently() {
    let h = TestHarness::new();
    two_obligations(&h);
    h.model.push_obligations(&[("Hold liquidity buffer", "financial", "critical", "recurring")]);

    let first = h.submit("doc-1");
    let second = h.submit("doc-2");
    h.drain();

    assert_eq!(h.status("doc-1").stage, DocumentStage::Completed);
    assert_eq!(h.status("doc-2").stage, DocumentStage::Completed);
    let total = h.tasks("doc-1", &first).len() + h.tasks("doc-2", &second).len();
    assert_eq!(total, 3);
    assert_eq!(h.model.calls(Route::Obligations), 2);
}

#[test]
fn test_regenerate_report_is_keyed_by_request() {
    let h = TestHarness::new();
    two_obligations(&h);
    let generation = h.submit("doc-1");
    h.drain();

    let reporter = h.pipeline.reporter();
    let first = reporter.regenerate("doc-1", "audit-2026-q4").unwrap();
    let again = reporter.regenerate("doc-1", "audit-2026-q4").unwrap();
    assert_eq!(first.report_id, again.report_id);
    assert_eq!(first.generation_id, generation);

    // The pipeline's own report plus the regenerated one.
    assert_eq!(h.reports("doc-1", &generation).len(), 2);
    assert_eq!(h.status("doc-1").generation_id, generation);
}

#[test]
fn test_zero_obligations_complete_with_empty_plan() {
    let h = TestHarness::new();
    h.model.push_obligations(&[]);
    let generation = h.submit("doc-1");
    h.drain();

    assert_eq!(h.status("doc-1").stage, DocumentStage::Completed);
    assert!(h.tasks("doc-1", &generation).is_empty());
    let reports = h.reports("doc-1", &generation);
    assert_eq!(reports.len(), 1);
    assert!(reports[0].task_ids.is_empty());
}

#[test]
fn test_worker_pool_runs_documents_to_completion() {
    let h = TestHarness::new();
    two_obligations(&h);
    let generation = h.submit("doc-1");

    let pool = h.pipeline.start_workers().unwrap();
    assert_eq!(pool.thread_count(), 3);

    let deadline = std::time::Instant::now() + Duration::from_secs(20);
    let mut finished = false;
    while !finished && std::time::Instant::now() < deadline {
        if let Some(report) = pool.recv_report_timeout(Duration::from_millis(200)).unwrap() {
            finished = report.outcome == PollOutcome::Completed(Advance::Finished);
        }
    }
    pool.wait();

    assert!(finished, "document did not finish in time");
    assert_eq!(h.status("doc-1").stage, DocumentStage::Completed);
    assert_eq!(h.reports("doc-1", &generation).len(), 1);
}
