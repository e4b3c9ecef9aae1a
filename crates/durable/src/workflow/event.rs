//! Workflow events for persistence

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ActivityOptions, WorkflowError};
use crate::activity::ActivityError;

/// Events stored in a workflow's history
///
/// These events form the append-only log for a workflow. They are used for:
/// - Persisting workflow progress
/// - Replaying workflows after recovery
/// - Auditing and debugging
///
/// Events are immutable once written. The workflow state is reconstructed
/// by replaying all events in sequence order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    // =========================================================================
    // Workflow Lifecycle Events
    // =========================================================================
    /// Workflow was started with the given input
    WorkflowStarted {
        /// The input provided when starting the workflow
        input: serde_json::Value,
    },

    /// Workflow completed successfully
    WorkflowCompleted {
        /// The result value
        result: serde_json::Value,
    },

    /// Workflow failed with an error
    WorkflowFailed {
        /// Error details
        error: WorkflowError,
    },

    /// Workflow was cancelled between steps
    WorkflowCancelled {
        /// Reason for cancellation
        reason: String,
    },

    // =========================================================================
    // Activity Lifecycle Events
    // =========================================================================
    /// Activity was scheduled for execution
    ActivityScheduled {
        /// Unique activity identifier within the workflow
        activity_id: String,

        /// Type of activity to execute
        activity_type: String,

        /// Input for the activity
        input: serde_json::Value,

        /// Execution options
        options: ActivityOptions,
    },

    /// Activity attempt started (claimed by a worker)
    ActivityStarted {
        /// Activity identifier
        activity_id: String,

        /// Current attempt number (1-based)
        attempt: u32,

        /// ID of the worker executing the activity
        worker_id: String,
    },

    /// Activity completed successfully
    ActivityCompleted {
        /// Activity identifier
        activity_id: String,

        /// Attempt that produced the result
        attempt: u32,

        /// Result returned by the activity
        result: serde_json::Value,
    },

    /// Activity attempt failed (may or may not retry)
    ActivityFailed {
        /// Activity identifier
        activity_id: String,

        /// Attempt that failed
        attempt: u32,

        /// Error details
        error: ActivityError,

        /// Whether the activity will be retried
        will_retry: bool,
    },
}

/// Outcome of a step as seen in the history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    /// Scheduled or running, no outcome yet
    Pending,

    /// Completed with a result
    Succeeded,

    /// Attempt failed, another attempt will follow
    FailedRetryable,

    /// Failed for good (terminal classification or retries exhausted)
    FailedTerminal,
}

impl WorkflowEvent {
    /// Get the activity_id if this is an activity-related event
    pub fn activity_id(&self) -> Option<&str> {
        match self {
            Self::ActivityScheduled { activity_id, .. }
            | Self::ActivityStarted { activity_id, .. }
            | Self::ActivityCompleted { activity_id, .. }
            | Self::ActivityFailed { activity_id, .. } => Some(activity_id),
            _ => None,
        }
    }

    /// Get the attempt number for events that record one
    pub fn attempt(&self) -> Option<u32> {
        match self {
            Self::ActivityStarted { attempt, .. }
            | Self::ActivityCompleted { attempt, .. }
            | Self::ActivityFailed { attempt, .. } => Some(*attempt),
            _ => None,
        }
    }

    /// Step status carried by an activity event
    pub fn step_status(&self) -> Option<StepStatus> {
        match self {
            Self::ActivityScheduled { .. } | Self::ActivityStarted { .. } => {
                Some(StepStatus::Pending)
            }
            Self::ActivityCompleted { .. } => Some(StepStatus::Succeeded),
            Self::ActivityFailed { will_retry, .. } => Some(if *will_retry {
                StepStatus::FailedRetryable
            } else {
                StepStatus::FailedTerminal
            }),
            _ => None,
        }
    }

    /// Check if this event settles its activity (no further outcome expected)
    pub fn resolves_activity(&self) -> bool {
        matches!(
            self.step_status(),
            Some(StepStatus::Succeeded | StepStatus::FailedTerminal)
        )
    }

    /// Check if this is a terminal workflow event
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowCompleted { .. }
                | Self::WorkflowFailed { .. }
                | Self::WorkflowCancelled { .. }
        )
    }

    /// Short event name, used for logging and the `event_type` column
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "workflow_started",
            Self::WorkflowCompleted { .. } => "workflow_completed",
            Self::WorkflowFailed { .. } => "workflow_failed",
            Self::WorkflowCancelled { .. } => "workflow_cancelled",
            Self::ActivityScheduled { .. } => "activity_scheduled",
            Self::ActivityStarted { .. } => "activity_started",
            Self::ActivityCompleted { .. } => "activity_completed",
            Self::ActivityFailed { .. } => "activity_failed",
        }
    }
}

/// One record in an instance's durability log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    /// Position in the instance's log (0-based, gap-free)
    pub sequence: i32,

    /// The recorded event
    pub event: WorkflowEvent,

    /// When the event was appended
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_workflow_event_serialization() {
        let event = WorkflowEvent::WorkflowStarted {
            input: json!({"route": "a-b"}),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"workflow_started\""));

        let parsed: WorkflowEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, parsed);
    }

    #[test]
    fn test_activity_id_extraction() {
        let event = WorkflowEvent::ActivityStarted {
            activity_id: "my-activity".to_string(),
            attempt: 1,
            worker_id: "worker-1".to_string(),
        };

        assert_eq!(event.activity_id(), Some("my-activity"));
        assert_eq!(event.attempt(), Some(1));

        let start_event = WorkflowEvent::WorkflowStarted { input: json!({}) };
        assert_eq!(start_event.activity_id(), None);
        assert_eq!(start_event.attempt(), None);
    }

    #[test]
    fn test_step_status_projection() {
        let scheduled = WorkflowEvent::ActivityScheduled {
            activity_id: "fetch_traffic".to_string(),
            activity_type: "fetch_traffic".to_string(),
            input: json!({}),
            options: ActivityOptions::default(),
        };
        let completed = WorkflowEvent::ActivityCompleted {
            activity_id: "fetch_traffic".to_string(),
            attempt: 2,
            result: json!({}),
        };
        let retrying = WorkflowEvent::ActivityFailed {
            activity_id: "fetch_traffic".to_string(),
            attempt: 1,
            error: ActivityError::retryable("timeout"),
            will_retry: true,
        };
        let terminal = WorkflowEvent::ActivityFailed {
            activity_id: "fetch_traffic".to_string(),
            attempt: 3,
            error: ActivityError::retryable("timeout"),
            will_retry: false,
        };

        assert_eq!(scheduled.step_status(), Some(StepStatus::Pending));
        assert_eq!(completed.step_status(), Some(StepStatus::Succeeded));
        assert_eq!(retrying.step_status(), Some(StepStatus::FailedRetryable));
        assert_eq!(terminal.step_status(), Some(StepStatus::FailedTerminal));

        assert!(!scheduled.resolves_activity());
        assert!(!retrying.resolves_activity());
        assert!(completed.resolves_activity());
        assert!(terminal.resolves_activity());
    }

    #[test]
    fn test_step_status_wire_names() {
        let json = serde_json::to_string(&StepStatus::FailedRetryable).unwrap();
        assert_eq!(json, "\"failed-retryable\"");
    }

    #[test]
    fn test_is_terminal() {
        assert!(WorkflowEvent::WorkflowCompleted { result: json!({}) }.is_terminal());
        assert!(WorkflowEvent::WorkflowFailed {
            error: WorkflowError::new("error")
        }
        .is_terminal());
        assert!(WorkflowEvent::WorkflowCancelled {
            reason: "cancelled".to_string()
        }
        .is_terminal());

        assert!(!WorkflowEvent::WorkflowStarted { input: json!({}) }.is_terminal());
        assert!(!WorkflowEvent::ActivityCompleted {
            activity_id: "x".to_string(),
            attempt: 1,
            result: json!({})
        }
        .is_terminal());
    }
}
