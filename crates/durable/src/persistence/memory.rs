//! In-memory implementation of WorkflowEventStore for testing

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::time::Instant;
use uuid::Uuid;

use super::store::*;
use crate::activity::ActivityError;
use crate::reliability::RetryDecision;
use crate::workflow::{HistoryEntry, WorkflowError, WorkflowEvent};

/// Internal workflow state
struct WorkflowState {
    workflow_type: String,
    status: WorkflowStatus,
    input: serde_json::Value,
    result: Option<serde_json::Value>,
    error: Option<WorkflowError>,
    events: Vec<HistoryEntry>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// Internal task state
struct TaskState {
    definition: TaskDefinition,
    status: TaskStatus,
    attempt: u32,
    claimed_by: Option<String>,
    claimed_at: Option<Instant>,
    available_at: Instant,
    last_error: Option<ActivityError>,
}

impl TaskState {
    /// Whether `worker_id` still holds the claim on `attempt`
    fn held_by(&self, worker_id: &str, attempt: u32) -> bool {
        matches!(self.status, TaskStatus::Claimed | TaskStatus::Cancelled)
            && self.claimed_by.as_deref() == Some(worker_id)
            && self.attempt == attempt
    }
}

/// Tasks in enqueue order
#[derive(Default)]
struct TaskTable {
    order: Vec<Uuid>,
    by_id: HashMap<Uuid, TaskState>,
}

/// In-memory implementation of WorkflowEventStore
///
/// This is primarily for testing. It stores all data in memory and
/// provides the same semantics as the PostgreSQL implementation. Retry
/// visibility and stale-claim detection use `tokio::time::Instant`, so
/// tests running with paused time observe backoff deterministically.
///
/// # Example
///
/// ```
/// use delaywatch_durable::InMemoryWorkflowEventStore;
///
/// let store = InMemoryWorkflowEventStore::new();
/// assert_eq!(store.workflow_count(), 0);
/// ```
pub struct InMemoryWorkflowEventStore {
    workflows: RwLock<HashMap<Uuid, WorkflowState>>,
    tasks: RwLock<TaskTable>,
}

impl InMemoryWorkflowEventStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
            tasks: RwLock::new(TaskTable::default()),
        }
    }

    /// Get the number of workflows
    pub fn workflow_count(&self) -> usize {
        self.workflows.read().len()
    }

    /// Get the number of pending tasks (visible or waiting out a backoff)
    pub fn pending_task_count(&self) -> usize {
        self.tasks
            .read()
            .by_id
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .count()
    }

    /// Get the status of a task
    pub fn task_status(&self, task_id: Uuid) -> Option<TaskStatus> {
        self.tasks.read().by_id.get(&task_id).map(|t| t.status)
    }

    /// Last recorded error of a task
    pub fn task_last_error(&self, task_id: Uuid) -> Option<ActivityError> {
        self.tasks
            .read()
            .by_id
            .get(&task_id)
            .and_then(|t| t.last_error.clone())
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.workflows.write().clear();
        let mut tasks = self.tasks.write();
        tasks.order.clear();
        tasks.by_id.clear();
    }
}

impl Default for InMemoryWorkflowEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowEventStore for InMemoryWorkflowEventStore {
    async fn create_workflow(
        &self,
        workflow_id: Uuid,
        workflow_type: &str,
        input: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        if workflows.contains_key(&workflow_id) {
            return Err(StoreError::WorkflowAlreadyExists(workflow_id));
        }

        let now = Utc::now();
        workflows.insert(
            workflow_id,
            WorkflowState {
                workflow_type: workflow_type.to_string(),
                status: WorkflowStatus::Pending,
                input,
                result: None,
                error: None,
                events: vec![],
                created_at: now,
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn get_workflow_status(&self, workflow_id: Uuid) -> Result<WorkflowStatus, StoreError> {
        let workflows = self.workflows.read();
        workflows
            .get(&workflow_id)
            .map(|w| w.status)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))
    }

    async fn get_workflow_info(&self, workflow_id: Uuid) -> Result<WorkflowInfo, StoreError> {
        let workflows = self.workflows.read();
        let workflow = workflows
            .get(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        Ok(WorkflowInfo {
            id: workflow_id,
            workflow_type: workflow.workflow_type.clone(),
            status: workflow.status,
            input: workflow.input.clone(),
            result: workflow.result.clone(),
            error: workflow.error.clone(),
            created_at: workflow.created_at,
            updated_at: workflow.updated_at,
        })
    }

    async fn list_workflows(&self, statuses: &[WorkflowStatus]) -> Result<Vec<Uuid>, StoreError> {
        let workflows = self.workflows.read();
        let mut matching: Vec<_> = workflows
            .iter()
            .filter(|(_, w)| statuses.contains(&w.status))
            .map(|(id, w)| (w.created_at, *id))
            .collect();
        matching.sort();
        Ok(matching.into_iter().map(|(_, id)| id).collect())
    }

    async fn append_events(
        &self,
        workflow_id: Uuid,
        expected_sequence: i32,
        events: Vec<WorkflowEvent>,
    ) -> Result<i32, StoreError> {
        let mut workflows = self.workflows.write();
        let workflow = workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        let current_sequence = workflow.events.len() as i32;
        if current_sequence != expected_sequence {
            return Err(StoreError::ConcurrencyConflict {
                expected: expected_sequence,
                actual: current_sequence,
            });
        }

        let recorded_at = Utc::now();
        for (offset, event) in events.into_iter().enumerate() {
            workflow.events.push(HistoryEntry {
                sequence: current_sequence + offset as i32,
                event,
                recorded_at,
            });
        }
        workflow.updated_at = recorded_at;
        Ok(workflow.events.len() as i32)
    }

    async fn load_events(&self, workflow_id: Uuid) -> Result<Vec<HistoryEntry>, StoreError> {
        let workflows = self.workflows.read();
        let workflow = workflows
            .get(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        Ok(workflow.events.clone())
    }

    async fn update_workflow_status(
        &self,
        workflow_id: Uuid,
        status: WorkflowStatus,
        result: Option<serde_json::Value>,
        error: Option<WorkflowError>,
    ) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        let workflow = workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        if workflow.status.is_terminal() {
            return Err(StoreError::WorkflowTerminal {
                workflow_id,
                status: workflow.status,
            });
        }

        workflow.status = status;
        workflow.result = result;
        workflow.error = error;
        workflow.updated_at = Utc::now();
        Ok(())
    }

    async fn enqueue_task(&self, task: TaskDefinition) -> Result<Uuid, StoreError> {
        let mut tasks = self.tasks.write();

        let existing = tasks.order.iter().find(|id| {
            tasks.by_id.get(*id).is_some_and(|t| {
                t.status.is_live()
                    && t.definition.workflow_id == task.workflow_id
                    && t.definition.activity_id == task.activity_id
            })
        });
        if let Some(task_id) = existing {
            return Ok(*task_id);
        }

        let task_id = Uuid::now_v7();
        tasks.order.push(task_id);
        tasks.by_id.insert(
            task_id,
            TaskState {
                definition: task,
                status: TaskStatus::Pending,
                attempt: 0,
                claimed_by: None,
                claimed_at: None,
                available_at: Instant::now(),
                last_error: None,
            },
        );
        Ok(task_id)
    }

    async fn claim_task(
        &self,
        worker_id: &str,
        task_queue: &str,
        activity_types: &[String],
        max_tasks: usize,
    ) -> Result<Vec<ClaimedTask>, StoreError> {
        let mut tasks = self.tasks.write();
        let TaskTable { order, by_id } = &mut *tasks;
        let now = Instant::now();
        let mut claimed = vec![];

        for task_id in order.iter() {
            if claimed.len() >= max_tasks {
                break;
            }

            let Some(task) = by_id.get_mut(task_id) else {
                continue;
            };

            if task.status == TaskStatus::Pending
                && task.available_at <= now
                && task.definition.task_queue == task_queue
                && activity_types.contains(&task.definition.activity_type)
            {
                task.status = TaskStatus::Claimed;
                task.claimed_by = Some(worker_id.to_string());
                task.claimed_at = Some(now);
                task.attempt += 1;

                claimed.push(ClaimedTask {
                    id: *task_id,
                    workflow_id: task.definition.workflow_id,
                    activity_id: task.definition.activity_id.clone(),
                    activity_type: task.definition.activity_type.clone(),
                    input: task.definition.input.clone(),
                    options: task.definition.options.clone(),
                    attempt: task.attempt,
                    max_attempts: task.definition.options.retry_policy.max_attempts,
                });
            }
        }

        Ok(claimed)
    }

    async fn complete_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        attempt: u32,
        _result: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .by_id
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        if !task.held_by(worker_id, attempt) {
            return Err(stale_claim(task_id, worker_id, attempt));
        }

        if task.status != TaskStatus::Cancelled {
            task.status = TaskStatus::Completed;
        }
        task.claimed_by = None;
        task.claimed_at = None;
        Ok(())
    }

    async fn fail_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        attempt: u32,
        error: &ActivityError,
    ) -> Result<TaskFailureOutcome, StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .by_id
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        if !task.held_by(worker_id, attempt) {
            return Err(stale_claim(task_id, worker_id, attempt));
        }

        task.last_error = Some(error.clone());
        task.claimed_by = None;
        task.claimed_at = None;

        // A task cancelled while its attempt was running stays cancelled
        if task.status == TaskStatus::Cancelled {
            return Ok(TaskFailureOutcome::NonRetryable);
        }

        match task
            .definition
            .options
            .retry_policy
            .decide(task.attempt, error)
        {
            RetryDecision::Retry {
                next_attempt,
                delay,
            } => {
                task.status = TaskStatus::Pending;
                task.available_at = Instant::now() + delay;
                Ok(TaskFailureOutcome::WillRetry {
                    next_attempt,
                    delay,
                })
            }
            RetryDecision::NonRetryable => {
                task.status = TaskStatus::Failed;
                Ok(TaskFailureOutcome::NonRetryable)
            }
            RetryDecision::Exhausted { .. } => {
                task.status = TaskStatus::Failed;
                Ok(TaskFailureOutcome::Exhausted)
            }
        }
    }

    async fn cancel_tasks(&self, workflow_id: Uuid) -> Result<usize, StoreError> {
        let mut tasks = self.tasks.write();
        let mut cancelled = 0;
        for task in tasks.by_id.values_mut() {
            if task.definition.workflow_id == workflow_id && task.status.is_live() {
                task.status = TaskStatus::Cancelled;
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn reclaim_stale_tasks(
        &self,
        stale_threshold: Duration,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut tasks = self.tasks.write();
        let now = Instant::now();
        let mut reclaimed = vec![];

        for (task_id, task) in tasks.by_id.iter_mut() {
            let stale = task.status == TaskStatus::Claimed
                && task
                    .claimed_at
                    .is_some_and(|at| now.duration_since(at) >= stale_threshold);
            if stale {
                task.status = TaskStatus::Pending;
                task.claimed_by = None;
                task.claimed_at = None;
                task.available_at = now;
                reclaimed.push(*task_id);
            }
        }

        Ok(reclaimed)
    }
}

fn stale_claim(task_id: Uuid, worker_id: &str, attempt: u32) -> StoreError {
    StoreError::StaleClaim {
        task_id,
        worker_id: worker_id.to_string(),
        attempt,
    }
}
