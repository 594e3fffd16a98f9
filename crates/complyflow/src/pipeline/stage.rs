//! Pipeline stages and the per-document state machine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::InvalidLabel;

/// One fixed-order phase of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extraction,
    Categorization,
    Planning,
    Reporting,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ORDER: [Stage; 4] = [
        Stage::Extraction,
        Stage::Categorization,
        Stage::Planning,
        Stage::Reporting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extraction => "extraction",
            Stage::Categorization => "categorization",
            Stage::Planning => "planning",
            Stage::Reporting => "reporting",
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Stage::Extraction => 0,
            Stage::Categorization => 1,
            Stage::Planning => 2,
            Stage::Reporting => 3,
        }
    }

    pub fn next(&self) -> Option<Stage> {
        Stage::ORDER.get(self.index() + 1).copied()
    }

    pub fn previous(&self) -> Option<Stage> {
        self.index().checked_sub(1).map(|i| Stage::ORDER[i])
    }

    /// Document stage recorded when a worker claims this stage.
    pub fn started_document_stage(&self) -> DocumentStage {
        match self {
            Stage::Extraction | Stage::Categorization => DocumentStage::Extracting,
            Stage::Planning => DocumentStage::Planning,
            Stage::Reporting => DocumentStage::Reporting,
        }
    }

    /// Document stage recorded when this stage completes.
    pub fn completed_document_stage(&self) -> DocumentStage {
        match self {
            Stage::Extraction => DocumentStage::Extracting,
            Stage::Categorization => DocumentStage::Extracted,
            Stage::Planning => DocumentStage::Planned,
            Stage::Reporting => DocumentStage::Completed,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = InvalidLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "extraction" => Ok(Stage::Extraction),
            "categorization" => Ok(Stage::Categorization),
            "planning" => Ok(Stage::Planning),
            "reporting" => Ok(Stage::Reporting),
            other => Err(InvalidLabel {
                kind: "stage",
                value: other.to_string(),
                expected: "extraction categorization planning reporting",
            }),
        }
    }
}

/// Coarse document position in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStage {
    Received,
    Extracting,
    Extracted,
    Planning,
    Planned,
    Reporting,
    Completed,
    Failed,
}

impl DocumentStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStage::Received => "received",
            DocumentStage::Extracting => "extracting",
            DocumentStage::Extracted => "extracted",
            DocumentStage::Planning => "planning",
            DocumentStage::Planned => "planned",
            DocumentStage::Reporting => "reporting",
            DocumentStage::Completed => "completed",
            DocumentStage::Failed => "failed",
        }
    }

    /// `completed` and `failed` are absorbing for a generation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DocumentStage::Completed | DocumentStage::Failed)
    }

    fn rank(&self) -> Option<u8> {
        match self {
            DocumentStage::Received => Some(0),
            DocumentStage::Extracting => Some(1),
            DocumentStage::Extracted => Some(2),
            DocumentStage::Planning => Some(3),
            DocumentStage::Planned => Some(4),
            DocumentStage::Reporting => Some(5),
            DocumentStage::Completed => Some(6),
            DocumentStage::Failed => None,
        }
    }

    /// Whether moving from `self` to `to` is allowed inside one generation:
    /// forward without skipping more than the stage mapping allows, or into
    /// `failed` from any non-terminal stage.
    pub fn can_transition_to(&self, to: DocumentStage) -> bool {
        if self.is_terminal() {
            return false;
        }
        if to == DocumentStage::Failed {
            return true;
        }
        match (self.rank(), to.rank()) {
            (Some(from), Some(to)) => to == from || to == from + 1,
            _ => false,
        }
    }
}

impl fmt::Display for DocumentStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStage {
    type Err = InvalidLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(DocumentStage::Received),
            "extracting" => Ok(DocumentStage::Extracting),
            "extracted" => Ok(DocumentStage::Extracted),
            "planning" => Ok(DocumentStage::Planning),
            "planned" => Ok(DocumentStage::Planned),
            "reporting" => Ok(DocumentStage::Reporting),
            "completed" => Ok(DocumentStage::Completed),
            "failed" => Ok(DocumentStage::Failed),
            other => Err(InvalidLabel {
                kind: "document stage",
                value: other.to_string(),
                expected: "received extracting extracted planning planned reporting completed failed",
            }),
        }
    }
}

/// Ledger status of one `(document, generation, stage)` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::InProgress => "in_progress",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageStatus {
    type Err = InvalidLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StageStatus::Pending),
            "in_progress" => Ok(StageStatus::InProgress),
            "completed" => Ok(StageStatus::Completed),
            "failed" => Ok(StageStatus::Failed),
            other => Err(InvalidLabel {
                kind: "stage status",
                value: other.to_string(),
                expected: "pending in_progress completed failed",
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_and_neighbours() {
        assert_eq!(Stage::Extraction.next(), Some(Stage::Categorization));
        assert_eq!(Stage::Categorization.next(), Some(Stage::Planning));
        assert_eq!(Stage::Planning.next(), Some(Stage::Reporting));
        assert_eq!(Stage::Reporting.next(), None);
        assert_eq!(Stage::Extraction.previous(), None);
        assert_eq!(Stage::Reporting.previous(), Some(Stage::Planning));
    }

    #[test]
    fn test_stage_round_trips_through_str() {
        for stage in Stage::ORDER {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
        assert!("archiving".parse::<Stage>().is_err());
    }

    #[test]
    fn test_document_stage_walks_forward_only() {
        let mut current = DocumentStage::Received;
        for stage in Stage::ORDER {
            let started = stage.started_document_stage();
            assert!(current.can_transition_to(started), "{} -> {}", current, started);
            current = started;
            let done = stage.completed_document_stage();
            assert!(current.can_transition_to(done), "{} -> {}", current, done);
            current = done;
        }
        assert_eq!(current, DocumentStage::Completed);
    }

    #[test]
    fn test_no_skipping_or_going_back() {
        assert!(!DocumentStage::Received.can_transition_to(DocumentStage::Planning));
        assert!(!DocumentStage::Planned.can_transition_to(DocumentStage::Extracting));
    }

    #[test]
    fn test_failed_is_absorbing() {
        assert!(DocumentStage::Planning.can_transition_to(DocumentStage::Failed));
        assert!(!DocumentStage::Failed.can_transition_to(DocumentStage::Received));
        assert!(!DocumentStage::Completed.can_transition_to(DocumentStage::Failed));
        assert!(DocumentStage::Failed.is_terminal());
    }
}
