//! Stage transition events for live status streaming.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::stage::Stage;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PipelineEventKind {
    Claimed,
    Completed,
    Retrying,
    Failed,
    DeadLettered,
}

impl std::fmt::Display for PipelineEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineEventKind::Claimed => write!(f, "Claimed"),
            PipelineEventKind::Completed => write!(f, "Completed"),
            PipelineEventKind::Retrying => write!(f, "Retrying"),
            PipelineEventKind::Failed => write!(f, "Failed"),
            PipelineEventKind::DeadLettered => write!(f, "Dead-lettered"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineEvent {
    pub document_id: String,
    pub generation_id: String,
    pub stage: Stage,
    pub kind: PipelineEventKind,
    /// Stage-level attempt the event refers to.
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
    /// Output reference (set on completion).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_ref: Option<String>,
    /// Error message (set on retry, failure and dead-lettering).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PipelineEvent {
    pub fn new(
        document_id: &str,
        generation_id: &str,
        stage: Stage,
        kind: PipelineEventKind,
        attempt: u32,
    ) -> Self {
        Self {
            document_id: document_id.to_string(),
            generation_id: generation_id.to_string(),
            stage,
            kind,
            attempt,
            timestamp: Utc::now(),
            output_ref: None,
            error: None,
        }
    }

    pub fn with_output(mut self, output_ref: &str) -> Self {
        self.output_ref = Some(output_ref.to_string());
        self
    }

    pub fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Broadcasts pipeline events to any number of subscribers.
#[derive(Clone)]
pub struct PipelineEventBroadcaster {
    sender: Arc<broadcast::Sender<PipelineEvent>>,
}

impl PipelineEventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn send(&self, event: PipelineEvent) {
        // No active receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for PipelineEventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}
