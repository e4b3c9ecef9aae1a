//! WorkflowEventStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::activity::ActivityError;
use crate::workflow::{ActivityOptions, HistoryEntry, WorkflowError, WorkflowEvent};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Workflow not found
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    /// A workflow with this id already exists
    #[error("workflow already exists: {0}")]
    WorkflowAlreadyExists(Uuid),

    /// Workflow already reached a terminal status
    #[error("workflow {workflow_id} is already {status}")]
    WorkflowTerminal {
        workflow_id: Uuid,
        status: WorkflowStatus,
    },

    /// Task not found
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    /// The caller no longer holds the claim on this task attempt
    #[error("task {task_id} attempt {attempt} is no longer claimed by {worker_id}")]
    StaleClaim {
        task_id: Uuid,
        worker_id: String,
        attempt: u32,
    },

    /// Concurrency conflict (optimistic locking failed)
    #[error("concurrency conflict: expected sequence {expected}, got {actual}")]
    ConcurrencyConflict { expected: i32, actual: i32 },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Workflow status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Workflow created but not started
    Pending,

    /// Workflow is running
    Running,

    /// Workflow completed successfully
    Completed,

    /// Workflow failed
    Failed,

    /// Workflow was cancelled
    Cancelled,
}

impl WorkflowStatus {
    /// Whether no further transitions are possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Parse the textual form used in the database
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Task status in the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Claimed,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether the task still occupies its workflow/activity slot
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Pending | Self::Claimed)
    }
}

/// Definition of a task to be enqueued
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    pub workflow_id: Uuid,
    pub activity_id: String,
    pub activity_type: String,
    pub task_queue: String,
    pub input: serde_json::Value,
    pub options: ActivityOptions,
}

/// A task that has been claimed by a worker
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub activity_id: String,
    pub activity_type: String,
    pub input: serde_json::Value,
    pub options: ActivityOptions,
    pub attempt: u32,
    pub max_attempts: u32,
}

/// Outcome of failing a task
#[derive(Debug, Clone, PartialEq)]
pub enum TaskFailureOutcome {
    /// Task returns to the queue and becomes visible after `delay`
    WillRetry { next_attempt: u32, delay: Duration },

    /// Retry budget spent, task is settled as failed
    Exhausted,

    /// Error classified as terminal, task is settled as failed
    NonRetryable,
}

impl TaskFailureOutcome {
    /// Whether another attempt will run
    pub fn will_retry(&self) -> bool {
        matches!(self, Self::WillRetry { .. })
    }
}

/// Workflow information stored in the database
#[derive(Debug, Clone)]
pub struct WorkflowInfo {
    pub id: Uuid,
    pub workflow_type: String,
    pub status: WorkflowStatus,
    pub input: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<WorkflowError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Store for workflow events and task queue
///
/// This trait defines the interface for persisting workflow state.
/// Implementations must be thread-safe and support concurrent access.
#[async_trait]
pub trait WorkflowEventStore: Send + Sync + 'static {
    // =========================================================================
    // Workflow Operations
    // =========================================================================

    /// Create a new workflow instance
    ///
    /// Fails with [`StoreError::WorkflowAlreadyExists`] if the id is taken.
    async fn create_workflow(
        &self,
        workflow_id: Uuid,
        workflow_type: &str,
        input: serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Get workflow status
    async fn get_workflow_status(&self, workflow_id: Uuid) -> Result<WorkflowStatus, StoreError>;

    /// Get full workflow info
    async fn get_workflow_info(&self, workflow_id: Uuid) -> Result<WorkflowInfo, StoreError>;

    /// List workflow ids whose status is one of `statuses`, oldest first
    async fn list_workflows(&self, statuses: &[WorkflowStatus]) -> Result<Vec<Uuid>, StoreError>;

    /// Append events to a workflow (with optimistic concurrency)
    ///
    /// `expected_sequence` is the number of events already in the history.
    /// Returns the new sequence number after appending.
    async fn append_events(
        &self,
        workflow_id: Uuid,
        expected_sequence: i32,
        events: Vec<WorkflowEvent>,
    ) -> Result<i32, StoreError>;

    /// Load all events for a workflow (for replay), in append order
    async fn load_events(&self, workflow_id: Uuid) -> Result<Vec<HistoryEntry>, StoreError>;

    /// Update workflow status
    ///
    /// Fails with [`StoreError::WorkflowTerminal`] once the workflow is terminal.
    async fn update_workflow_status(
        &self,
        workflow_id: Uuid,
        status: WorkflowStatus,
        result: Option<serde_json::Value>,
        error: Option<WorkflowError>,
    ) -> Result<(), StoreError>;

    // =========================================================================
    // Task Queue Operations
    // =========================================================================

    /// Enqueue an activity task
    ///
    /// Idempotent: if a live task already exists for the same workflow and
    /// activity id, its id is returned and nothing is inserted.
    async fn enqueue_task(&self, task: TaskDefinition) -> Result<Uuid, StoreError>;

    /// Claim visible tasks on `task_queue` for execution
    ///
    /// Claimed tasks are invisible to other workers until settled or reclaimed.
    async fn claim_task(
        &self,
        worker_id: &str,
        task_queue: &str,
        activity_types: &[String],
        max_tasks: usize,
    ) -> Result<Vec<ClaimedTask>, StoreError>;

    /// Complete a task successfully
    ///
    /// Only the worker holding the claim on `attempt` may settle the task;
    /// anyone else gets [`StoreError::StaleClaim`] and the task is untouched.
    async fn complete_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        attempt: u32,
        result: serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Fail the current attempt of a task
    ///
    /// Retryable errors with attempts remaining put the task back on the
    /// queue, hidden until the policy's backoff delay has elapsed. The
    /// returned outcome is the authoritative retry decision. Fenced like
    /// [`complete_task`](Self::complete_task).
    async fn fail_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        attempt: u32,
        error: &ActivityError,
    ) -> Result<TaskFailureOutcome, StoreError>;

    /// Cancel all live tasks of a workflow, returning how many were cancelled
    async fn cancel_tasks(&self, workflow_id: Uuid) -> Result<usize, StoreError>;

    /// Return tasks claimed longer than `stale_threshold` ago to the queue
    async fn reclaim_stale_tasks(&self, stale_threshold: Duration)
        -> Result<Vec<Uuid>, StoreError>;
}
