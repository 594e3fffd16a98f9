//! Named JSON Schemas that model responses are validated against.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

pub const OBLIGATIONS: &str = "obligations";
pub const TASK_REFINEMENT: &str = "task_refinement";
pub const REPORT_SUMMARY: &str = "report_summary";

const OBLIGATIONS_SCHEMA: &str = r#"{
  "type": "object",
  "required": ["obligations"],
  "properties": {
    "obligations": {
      "type": "array",
      "items": {
        "type": "object",
        "required": ["description", "category", "severity", "deadline_type", "confidence_score"],
        "properties": {
          "description": { "type": "string", "minLength": 1 },
          "category": { "enum": ["reporting", "monitoring", "operational", "financial"] },
          "severity": { "enum": ["critical", "high", "medium", "low"] },
          "deadline_type": { "enum": ["recurring", "one_time", "ongoing"] },
          "applicable_entities": { "type": "array", "items": { "type": "string" } },
          "extracted_text": { "type": "string" },
          "confidence_score": { "type": "number", "minimum": 0.0, "maximum": 1.0 }
        }
      }
    }
  }
}"#;

const TASK_REFINEMENT_SCHEMA: &str = r#"{
  "type": "object",
  "required": ["tasks"],
  "properties": {
    "tasks": {
      "type": "array",
      "items": {
        "type": "object",
        "required": ["obligation_id", "title", "description"],
        "properties": {
          "obligation_id": { "type": "string" },
          "title": { "type": "string", "minLength": 1, "maxLength": 200 },
          "description": { "type": "string", "minLength": 1 }
        }
      }
    }
  }
}"#;

const REPORT_SUMMARY_SCHEMA: &str = r#"{
  "type": "object",
  "required": ["title", "executive_summary", "key_findings", "recommendations"],
  "properties": {
    "title": { "type": "string", "minLength": 1 },
    "executive_summary": { "type": "string", "minLength": 1 },
    "key_findings": { "type": "array", "items": { "type": "string" } },
    "recommendations": { "type": "array", "items": { "type": "string" } }
  }
}"#;

/// A compiled schema plus its source, which corrective prompts quote.
pub struct ResponseSchema {
    source: Value,
    validator: jsonschema::Validator,
}

impl ResponseSchema {
    pub fn compile(source: Value) -> Result<Self, String> {
        let validator = jsonschema::validator_for(&source).map_err(|e| e.to_string())?;
        Ok(Self { source, validator })
    }

    pub fn source(&self) -> &Value {
        &self.source
    }

    /// All violations, joined; `Ok` when the instance conforms.
    pub fn check(&self, instance: &Value) -> Result<(), String> {
        let errors: Vec<String> = self
            .validator
            .iter_errors(instance)
            .map(|e| e.to_string())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }
}

pub struct SchemaRegistry {
    schemas: HashMap<String, ResponseSchema>,
}

impl SchemaRegistry {
    pub fn empty() -> Self {
        Self {
            schemas: HashMap::new(),
        }
    }

    /// Registry with the pipeline's built-in response schemas.
    pub fn builtin() -> Result<Self, String> {
        let mut registry = Self::empty();
        for (name, raw) in [
            (OBLIGATIONS, OBLIGATIONS_SCHEMA),
            (TASK_REFINEMENT, TASK_REFINEMENT_SCHEMA),
            (REPORT_SUMMARY, REPORT_SUMMARY_SCHEMA),
        ] {
            let source: Value = serde_json::from_str(raw)
                .map_err(|e| format!("schema '{}' is not valid JSON: {}", name, e))?;
            registry.register(name, source)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, name: &str, source: Value) -> Result<(), String> {
        let schema = ResponseSchema::compile(source)
            .map_err(|e| format!("schema '{}' does not compile: {}", name, e))?;
        self.schemas.insert(name.to_string(), schema);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ResponseSchema> {
        self.schemas.get(name)
    }
}

static RE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?i:json)?[ \t]*\r?\n(.*?)```").unwrap());

/// Pulls the JSON payload out of free-form model text: the first fenced
/// block that parses, otherwise the widest `{...}` or `[...]` span.
pub fn extract_json(text: &str) -> Option<Value> {
    for block in RE_FENCE.captures_iter(text) {
        if let Ok(value) = serde_json::from_str(block[1].trim()) {
            return Some(value);
        }
    }

    if let Ok(value) = serde_json::from_str::<Value>(text.trim()) {
        return Some(value);
    }

    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (text.find(open), text.rfind(close)) {
            if start < end {
                if let Ok(value) = serde_json::from_str(&text[start..=end]) {
                    return Some(value);
                }
            }
        }
    }
    None
}
