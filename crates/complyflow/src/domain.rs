//! Enumerations shared by the obligation, task and report entities.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error returned when a stored or model-supplied label is not one of the
/// enumerated values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} '{value}' (expected one of: {expected})")]
pub struct InvalidLabel {
    pub kind: &'static str,
    pub value: String,
    pub expected: &'static str,
}

macro_rules! labelled_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $kind:literal { $($variant:ident => $label:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = InvalidLabel;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($label => Ok($name::$variant),)+
                    _ => Err(InvalidLabel {
                        kind: $kind,
                        value: s.to_string(),
                        expected: concat!($($label, " "),+),
                    }),
                }
            }
        }
    };
}

labelled_enum! {
    /// What kind of action an obligation demands.
    Category, "category" {
        Reporting => "reporting",
        Monitoring => "monitoring",
        Operational => "operational",
        Financial => "financial",
    }
}

labelled_enum! {
    /// Obligation severity. Declaration order is most to least severe.
    Severity, "severity" {
        Critical => "critical",
        High => "high",
        Medium => "medium",
        Low => "low",
    }
}

labelled_enum! {
    DeadlineType, "deadline type" {
        Recurring => "recurring",
        OneTime => "one_time",
        Ongoing => "ongoing",
    }
}

labelled_enum! {
    TaskPriority, "task priority" {
        High => "high",
        Medium => "medium",
        Low => "low",
    }
}

labelled_enum! {
    TaskStatus, "task status" {
        Pending => "pending",
        InProgress => "in_progress",
        Completed => "completed",
        Overdue => "overdue",
    }
}

labelled_enum! {
    ReportStatus, "report status" {
        Generating => "generating",
        Completed => "completed",
        Failed => "failed",
    }
}

impl Severity {
    /// Numeric rank, higher is more severe.
    pub fn rank(&self) -> u8 {
        match self {
            Severity::Critical => 4,
            Severity::High => 3,
            Severity::Medium => 2,
            Severity::Low => 1,
        }
    }
}

impl PartialOrd for Severity {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Severity {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl TaskPriority {
    pub fn rank(&self) -> u8 {
        match self {
            TaskPriority::High => 3,
            TaskPriority::Medium => 2,
            TaskPriority::Low => 1,
        }
    }

    /// Priority of the task derived from an obligation of the given severity.
    pub fn for_severity(severity: Severity) -> Self {
        match severity {
            Severity::Critical | Severity::High => TaskPriority::High,
            Severity::Medium => TaskPriority::Medium,
            Severity::Low => TaskPriority::Low,
        }
    }
}
