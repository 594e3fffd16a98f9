use std::path::Path;

use crate::config::schema::{Config, RetryConfig};
use crate::error::ConfigError;
use crate::pipeline::stage::Stage;

const SCHEMA_JSON: &str = include_str!("../../../../schema/config-v1.json");

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn invalid(message: String) -> ConfigError {
    ConfigError::Validation { message }
}

fn validate_retry(name: &str, retry: &RetryConfig) -> Result<(), ConfigError> {
    if retry.max_attempts == 0 {
        return Err(invalid(format!("{}: max_attempts must be at least 1", name)));
    }
    if retry.base_delay_ms > retry.max_delay_ms {
        return Err(invalid(format!(
            "{}: base_delay_ms ({}) exceeds max_delay_ms ({})",
            name, retry.base_delay_ms, retry.max_delay_ms
        )));
    }
    Ok(())
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(invalid(format!("Unsupported config version: {}", config.version)));
    }

    let workers = &config.workers;
    for (name, count) in [
        ("extractor", workers.extractor),
        ("planner", workers.planner),
        ("reporter", workers.reporter),
    ] {
        if count == 0 {
            return Err(invalid(format!("workers.{} must be at least 1", name)));
        }
    }
    if workers.poll_interval_ms == 0 {
        return Err(invalid("workers.poll_interval_ms must be positive".to_string()));
    }

    if config.queue.max_receives == 0 {
        return Err(invalid("queue.max_receives must be at least 1".to_string()));
    }
    if config.coordinator.enqueue_attempts == 0 {
        return Err(invalid("coordinator.enqueue_attempts must be at least 1".to_string()));
    }

    validate_retry("retry", &config.retry.default)?;
    for (stage, retry) in &config.retry.stages {
        stage
            .parse::<Stage>()
            .map_err(|e| invalid(format!("retry.stages: {}", e)))?;
        validate_retry(&format!("retry.stages.{}", stage), retry)?;
    }

    let model = &config.model;
    if model.max_retries == 0 {
        return Err(invalid("model.max_retries must be at least 1".to_string()));
    }
    if model.breaker_threshold == 0 {
        return Err(invalid("model.breaker_threshold must be at least 1".to_string()));
    }
    if model.base_delay_ms > model.max_delay_ms {
        return Err(invalid(format!(
            "model: base_delay_ms ({}) exceeds max_delay_ms ({})",
            model.base_delay_ms, model.max_delay_ms
        )));
    }

    Ok(())
}
