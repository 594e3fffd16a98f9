//! Loading config files from disk and building a pipeline from them.

mod common;

use std::io::Write;
use std::time::Duration;

use tempfile::{NamedTempFile, TempDir};

use common::test_config;
use complyflow::pipeline::DocumentStage;
use complyflow::{load_config, ConfigError, Pipeline, Stage};

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_config_file() {
    let file = write_config(
        r#"{
            "version": "1.0",
            "storage_root": "/var/lib/complyflow/objects",
            "retry": { "max_attempts": 5, "stages": { "planning": { "max_attempts": 1 } } }
        }"#,
    );
    let config = load_config(file.path()).unwrap();
    assert_eq!(config.retry.default.max_attempts, 5);
    assert_eq!(config.retry.stages["planning"].max_attempts, 1);
    assert_eq!(config.model.max_retries, 4);
}

#[test]
fn test_missing_file() {
    let err = load_config("/nonexistent/complyflow/config.json").unwrap_err();
    assert!(matches!(err, ConfigError::ReadFile { .. }));
}

#[test]
fn test_unknown_field_rejected() {
    let file = write_config(r#"{"version": "1.0", "storage_root": "/srv", "workerz": {}}"#);
    let err = load_config(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::SchemaValidation { .. }));
}

#[test]
fn test_pipeline_from_config_file() {
    let dir = TempDir::new().unwrap();
    let mut raw = test_config(dir.path().join("objects").to_str().unwrap());
    raw["database_path"] = dir.path().join("db").join("complyflow.db").to_str().unwrap().into();
    raw["retry"]["stages"] = serde_json::json!({ "reporting": { "max_attempts": 1 } });
    let file = write_config(&raw.to_string());

    let config = load_config(file.path()).unwrap();
    let pipeline = Pipeline::from_config(config).unwrap();
    assert!(dir.path().join("db").join("complyflow.db").exists());

    let settings = pipeline.worker_settings().unwrap();
    assert_eq!(settings.retry_for(Stage::Reporting).max_attempts, 1);
    assert_eq!(settings.retry_for(Stage::Planning).max_attempts, 3);
    assert_eq!(settings.defer_delay, Duration::ZERO);

    pipeline
        .store()
        .put("uploads/doc-1.txt", b"Article 1. Report annually.")
        .unwrap();
    pipeline
        .coordinator()
        .submit("doc-1", "uploads/doc-1.txt", "compliance-team")
        .unwrap();
    assert_eq!(
        pipeline.coordinator().status("doc-1").unwrap().stage,
        DocumentStage::Received
    );
    assert_eq!(pipeline.queue_depth().unwrap(), 1);
}
