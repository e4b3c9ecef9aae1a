//! Activity execution context

use uuid::Uuid;

use crate::persistence::ClaimedTask;

/// Context provided to activities during execution
///
/// Describes the single attempt being executed. Nothing in the context
/// outlives the attempt.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    /// Unique execution attempt ID
    pub attempt_id: Uuid,

    /// Current attempt number (1-based)
    pub attempt: u32,

    /// Maximum attempts allowed
    pub max_attempts: u32,

    /// Workflow instance ID that owns this activity
    pub workflow_id: Uuid,

    /// Activity ID within the workflow
    pub activity_id: String,

    /// ID of the worker running this attempt
    pub worker_id: String,
}

impl ActivityContext {
    /// Create a new activity context
    pub fn new(workflow_id: Uuid, activity_id: String, attempt: u32, max_attempts: u32) -> Self {
        Self {
            attempt_id: Uuid::now_v7(),
            attempt,
            max_attempts,
            workflow_id,
            activity_id,
            worker_id: String::new(),
        }
    }

    /// Build the context for a task claimed by a worker
    pub fn for_task(task: &ClaimedTask, worker_id: &str) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            ..Self::new(
                task.workflow_id,
                task.activity_id.clone(),
                task.attempt,
                task.max_attempts,
            )
        }
    }

    /// Key that is stable across every attempt of this activity
    ///
    /// Side-effecting collaborators deduplicate on this key, which makes a
    /// repeated attempt after a crash safe.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.workflow_id, self.activity_id)
    }

    /// Check if this is the last retry attempt
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}
