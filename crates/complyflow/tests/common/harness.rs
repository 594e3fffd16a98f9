//! Isolated pipeline for integration tests: objects under a temp dir, an
//! in-memory database and a scripted model.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;

use complyflow::db::report_repo::{self, ReportRow};
use complyflow::db::task_repo::{self, TaskRow};
use complyflow::db::obligation_repo::{self, ObligationRow};
use complyflow::{
    load_config_from_str, Config, Database, DrainReport, FsObjectStore, ObjectStore, Pipeline,
    StatusReport,
};

use super::transport::ScriptedTransport;

/// Config tuned for tests: millisecond backoffs and no deferral delay.
pub fn test_config(storage_root: &str) -> Value {
    json!({
        "version": "1.0",
        "storage_root": storage_root,
        "workers": {
            "extractor": 1,
            "planner": 1,
            "reporter": 1,
            "poll_interval_ms": 10,
            "defer_delay_ms": 0
        },
        "queue": { "visibility_timeout_secs": 30, "max_receives": 5, "max_redrives": 2 },
        "coordinator": { "enqueue_attempts": 2, "enqueue_backoff_ms": 1 },
        "retry": { "max_attempts": 3, "base_delay_ms": 1, "max_delay_ms": 5 },
        "model": {
            "api_key_env_var": null,
            "max_retries": 3,
            "base_delay_ms": 1,
            "max_delay_ms": 5,
            "max_total_wait_secs": 5,
            "breaker_threshold": 50
        }
    })
}

pub struct TestHarness {
    temp_dir: TempDir,
    pub pipeline: Pipeline,
    pub model: Arc<ScriptedTransport>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Builds a harness after letting `tweak` edit the test config JSON.
    pub fn with_config(tweak: impl FnOnce(&mut Value)) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let root = temp_dir.path().join("objects");
        let mut raw = test_config(root.to_str().expect("temp path is UTF-8"));
        tweak(&mut raw);
        let config: Config = load_config_from_str(&raw.to_string()).expect("test config is valid");

        let model = Arc::new(ScriptedTransport::new());
        let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(&root));
        let pipeline = Pipeline::with_parts(
            config,
            Database::open_in_memory().expect("in-memory database"),
            store,
            model.clone(),
        )
        .expect("pipeline builds");

        Self {
            temp_dir,
            pipeline,
            model,
        }
    }

    pub fn upload(&self, key: &str, text: &str) {
        self.pipeline
            .store()
            .put(key, text.as_bytes())
            .expect("upload source document");
    }

    /// Uploads a regulation excerpt and submits it. Returns the generation.
    pub fn submit(&self, document_id: &str) -> String {
        let key = format!("uploads/{}.txt", document_id);
        self.upload(
            &key,
            "Article 12. Institutions shall report their capital position annually.\n\
             Article 14. Institutions shall monitor transactions on an ongoing basis.",
        );
        self.pipeline
            .coordinator()
            .submit(document_id, &key, "compliance-team")
            .expect("submit document")
    }

    pub fn drain(&self) -> DrainReport {
        let report = self
            .pipeline
            .drain(Duration::from_secs(20))
            .expect("drain succeeds");
        assert!(!report.timed_out, "drain timed out: {:?}", report);
        report
    }

    pub fn status(&self, document_id: &str) -> StatusReport {
        self.pipeline
            .coordinator()
            .status(document_id)
            .expect("document status")
    }

    pub fn obligations(&self, document_id: &str, generation_id: &str) -> Vec<ObligationRow> {
        obligation_repo::list_for_generation(self.pipeline.database(), document_id, generation_id)
            .expect("list obligations")
    }

    pub fn tasks(&self, document_id: &str, generation_id: &str) -> Vec<TaskRow> {
        task_repo::list_for_generation(self.pipeline.database(), document_id, generation_id)
            .expect("list tasks")
    }

    pub fn reports(&self, document_id: &str, generation_id: &str) -> Vec<ReportRow> {
        report_repo::list_for_generation(self.pipeline.database(), document_id, generation_id)
            .expect("list reports")
    }

    pub fn queue_depth(&self) -> u64 {
        self.pipeline.queue_depth().expect("queue depth")
    }
}
