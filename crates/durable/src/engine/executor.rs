//! Workflow executor with replay support
//!
//! The `WorkflowExecutor` is responsible for:
//! - Starting new workflows
//! - Replaying workflows from event history
//! - Applying the actions replay produces that history does not yet reflect
//! - Recording activity outcomes reported by workers
//! - Cancellation and crash recovery

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::activity::ActivityError;
use crate::persistence::{
    ClaimedTask, StoreError, TaskDefinition, WorkflowEventStore, WorkflowInfo, WorkflowStatus,
};
use crate::worker::ActivityReporter;
use crate::workflow::{
    HistoryEntry, StepStatus, Workflow, WorkflowAction, WorkflowError, WorkflowEvent,
};

use super::registry::{AnyWorkflow, RegistryError, WorkflowRegistry};

/// Configuration for the workflow executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum events per workflow (for safety)
    pub max_events_per_workflow: usize,

    /// Maximum number of workflow decisions evaluated at the same time
    pub max_concurrent_decisions: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_events_per_workflow: 10_000,
            max_concurrent_decisions: 10,
        }
    }
}

/// Errors from executor operations
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Workflow already reached a terminal status
    #[error("workflow {workflow_id} already {status}")]
    AlreadyTerminal {
        workflow_id: Uuid,
        status: WorkflowStatus,
    },

    /// History is malformed
    #[error("replay error: {0}")]
    ReplayError(String),

    /// Replaying the workflow does not reproduce its recorded history
    #[error("non-deterministic workflow {workflow_id}: {detail}")]
    Nondeterminism { workflow_id: Uuid, detail: String },

    /// Too many events
    #[error("workflow {0} has too many events ({1} > {2})")]
    TooManyEvents(Uuid, usize, usize),

    /// The decision semaphore was closed
    #[error("executor is shutting down")]
    ShuttingDown,

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result of driving a workflow
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessResult {
    /// Workflow status after processing
    pub status: WorkflowStatus,

    /// Number of new events written
    pub events_written: usize,

    /// Number of tasks enqueued
    pub tasks_enqueued: usize,
}

impl ProcessResult {
    fn unchanged(status: WorkflowStatus) -> Self {
        Self {
            status,
            events_written: 0,
            tasks_enqueued: 0,
        }
    }

    /// Whether the workflow is in a terminal status
    pub fn completed(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Progress of one step as reconstructed from history
#[derive(Debug, Clone, PartialEq)]
pub struct StepState {
    pub activity_id: String,
    pub activity_type: String,
    pub status: StepStatus,
    /// Highest attempt number seen in history
    pub attempts: u32,
}

/// Side-effect-free view of a workflow rebuilt from its history
#[derive(Debug, Clone)]
pub struct ReplayState {
    pub workflow_id: Uuid,
    pub workflow_type: String,
    pub status: WorkflowStatus,
    /// Number of events in history
    pub sequence: i32,
    /// Steps in the order they were scheduled
    pub steps: Vec<StepState>,
    /// Actions replay produced that are not yet reflected in history
    pub pending_actions: Vec<WorkflowAction>,
    pub is_completed: bool,
    pub result: Option<Value>,
    pub error: Option<WorkflowError>,
}

impl ReplayState {
    /// Look up a step by activity id
    pub fn step(&self, activity_id: &str) -> Option<&StepState> {
        self.steps.iter().find(|s| s.activity_id == activity_id)
    }
}

/// Summary of a [`WorkflowExecutor::recover`] pass
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Workflows driven successfully
    pub recovered: usize,

    /// Outstanding activity tasks ensured on the queue
    pub tasks_enqueued: usize,

    /// Workflows that could not be driven, with the error
    pub failed: Vec<(Uuid, String)>,
}

/// Output of replaying a history through a fresh workflow
struct Replayed {
    workflow: Box<dyn AnyWorkflow>,
    steps: Vec<StepState>,
    new_actions: Vec<WorkflowAction>,
    terminal: Option<WorkflowEvent>,
}

/// Workflow executor
///
/// The executor drives workflow state machines by replaying events and
/// processing actions. Decisions for one workflow are serialized by a
/// per-workflow lock; the store's sequence check guards against writers in
/// other processes.
///
/// # Example
///
/// ```ignore
/// use delaywatch_durable::prelude::*;
///
/// let store = InMemoryWorkflowEventStore::new();
/// let mut executor = WorkflowExecutor::new(store);
/// executor.register::<MyWorkflow>();
///
/// let workflow_id = executor
///     .start_workflow::<MyWorkflow>(Uuid::now_v7(), input)
///     .await?;
/// ```
pub struct WorkflowExecutor<S: WorkflowEventStore> {
    store: Arc<S>,
    registry: WorkflowRegistry,
    config: ExecutorConfig,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
    decisions: Semaphore,
}

impl<S: WorkflowEventStore> WorkflowExecutor<S> {
    /// Create a new executor with the given store
    pub fn new(store: S) -> Self {
        Self::with_config(Arc::new(store), ExecutorConfig::default())
    }

    /// Create an executor over a store shared with workers and clients
    pub fn from_shared(store: Arc<S>) -> Self {
        Self::with_config(store, ExecutorConfig::default())
    }

    /// Create a new executor with custom config
    pub fn with_config(store: Arc<S>, config: ExecutorConfig) -> Self {
        let decisions = Semaphore::new(config.max_concurrent_decisions.max(1));
        Self {
            store,
            registry: WorkflowRegistry::new(),
            config,
            locks: DashMap::new(),
            decisions,
        }
    }

    /// Register a workflow type
    pub fn register<W: Workflow>(&mut self) {
        self.registry.register::<W>();
        info!(workflow_type = W::TYPE, "registered workflow type");
    }

    /// Get a reference to the store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Get a shared handle to the store
    pub fn shared_store(&self) -> Arc<S> {
        Arc::clone(&self.store)
    }

    /// Start a new workflow
    ///
    /// Creates the workflow instance, persists the start event, and
    /// applies the initial actions.
    #[instrument(skip(self, input), fields(workflow_type = W::TYPE))]
    pub async fn start_workflow<W: Workflow>(
        &self,
        workflow_id: Uuid,
        input: W::Input,
    ) -> Result<Uuid, ExecutorError> {
        if !self.registry.contains(W::TYPE) {
            return Err(RegistryError::UnknownWorkflowType(W::TYPE.to_string()).into());
        }

        let input_json = serde_json::to_value(&input)?;

        info!(%workflow_id, "starting new workflow");

        self.store
            .create_workflow(workflow_id, W::TYPE, input_json)
            .await?;

        let _guard = self.lock_instance(workflow_id).await;
        self.drive_locked(workflow_id).await?;

        Ok(workflow_id)
    }

    /// Drive a workflow from its recorded history
    ///
    /// Replays every event through a fresh workflow instance, then applies
    /// only the actions that are not yet reflected in history. Calling this
    /// repeatedly without new outcomes writes nothing.
    #[instrument(skip(self))]
    pub async fn process_workflow(
        &self,
        workflow_id: Uuid,
    ) -> Result<ProcessResult, ExecutorError> {
        let _guard = self.lock_instance(workflow_id).await;
        self.drive_locked(workflow_id).await
    }

    /// Record that a worker started an attempt
    #[instrument(skip(self))]
    pub async fn on_activity_started(
        &self,
        workflow_id: Uuid,
        activity_id: &str,
        attempt: u32,
        worker_id: &str,
    ) -> Result<(), ExecutorError> {
        let _guard = self.lock_instance(workflow_id).await;

        let events = self.store.load_events(workflow_id).await?;
        if !is_unresolved(&events, activity_id) {
            debug!(%workflow_id, activity_id, "ignoring start of settled activity");
            return Ok(());
        }

        let event = WorkflowEvent::ActivityStarted {
            activity_id: activity_id.to_string(),
            attempt,
            worker_id: worker_id.to_string(),
        };
        self.store
            .append_events(workflow_id, events.len() as i32, vec![event])
            .await?;
        Ok(())
    }

    /// Handle activity completion
    ///
    /// Called by the worker pool when an activity completes successfully.
    /// A completion for an activity that is already settled is ignored.
    #[instrument(skip(self, result))]
    pub async fn on_activity_completed(
        &self,
        workflow_id: Uuid,
        activity_id: &str,
        attempt: u32,
        result: Value,
    ) -> Result<ProcessResult, ExecutorError> {
        let _guard = self.lock_instance(workflow_id).await;

        let events = self.store.load_events(workflow_id).await?;
        if !is_unresolved(&events, activity_id) {
            warn!(%workflow_id, activity_id, attempt, "ignoring duplicate or unknown completion");
            let status = self.store.get_workflow_status(workflow_id).await?;
            return Ok(ProcessResult::unchanged(status));
        }

        let event = WorkflowEvent::ActivityCompleted {
            activity_id: activity_id.to_string(),
            attempt,
            result,
        };
        self.store
            .append_events(workflow_id, events.len() as i32, vec![event])
            .await?;

        let mut result = self.drive_locked(workflow_id).await?;
        result.events_written += 1;
        Ok(result)
    }

    /// Handle activity failure
    ///
    /// Every failed attempt is recorded. The workflow only observes the
    /// failure once no further attempt will be made.
    #[instrument(skip(self, error))]
    pub async fn on_activity_failed(
        &self,
        workflow_id: Uuid,
        activity_id: &str,
        attempt: u32,
        error: ActivityError,
        will_retry: bool,
    ) -> Result<ProcessResult, ExecutorError> {
        let _guard = self.lock_instance(workflow_id).await;

        let events = self.store.load_events(workflow_id).await?;
        if !is_unresolved(&events, activity_id) {
            warn!(%workflow_id, activity_id, attempt, "ignoring failure of settled activity");
            let status = self.store.get_workflow_status(workflow_id).await?;
            return Ok(ProcessResult::unchanged(status));
        }

        let event = WorkflowEvent::ActivityFailed {
            activity_id: activity_id.to_string(),
            attempt,
            error,
            will_retry,
        };
        self.store
            .append_events(workflow_id, events.len() as i32, vec![event])
            .await?;

        if will_retry {
            let status = self.store.get_workflow_status(workflow_id).await?;
            return Ok(ProcessResult {
                status,
                events_written: 1,
                tasks_enqueued: 0,
            });
        }

        let mut result = self.drive_locked(workflow_id).await?;
        result.events_written += 1;
        Ok(result)
    }

    /// Cancel a workflow
    ///
    /// Records the cancellation, marks the workflow cancelled and withdraws
    /// its queued tasks. Outcomes that arrive afterwards are recorded but
    /// cause no transitions.
    #[instrument(skip(self))]
    pub async fn cancel_workflow(
        &self,
        workflow_id: Uuid,
        reason: &str,
    ) -> Result<(), ExecutorError> {
        let _guard = self.lock_instance(workflow_id).await;

        let status = self.store.get_workflow_status(workflow_id).await?;
        if status.is_terminal() {
            return Err(ExecutorError::AlreadyTerminal {
                workflow_id,
                status,
            });
        }

        let events = self.store.load_events(workflow_id).await?;
        self.store
            .append_events(
                workflow_id,
                events.len() as i32,
                vec![WorkflowEvent::WorkflowCancelled {
                    reason: reason.to_string(),
                }],
            )
            .await?;
        self.store
            .update_workflow_status(workflow_id, WorkflowStatus::Cancelled, None, None)
            .await?;
        let withdrawn = self.store.cancel_tasks(workflow_id).await?;

        info!(%workflow_id, reason, withdrawn, "workflow cancelled");
        Ok(())
    }

    /// Resume every non-terminal workflow after a restart
    ///
    /// Each workflow is driven from its history and every scheduled but
    /// unsettled activity is put back on the queue. Enqueueing is
    /// idempotent, so tasks that survived the restart are not duplicated.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<RecoveryReport, ExecutorError> {
        let workflow_ids = self
            .store
            .list_workflows(&[WorkflowStatus::Pending, WorkflowStatus::Running])
            .await?;

        let mut report = RecoveryReport::default();
        for workflow_id in workflow_ids {
            match self.recover_workflow(workflow_id).await {
                Ok(enqueued) => {
                    report.recovered += 1;
                    report.tasks_enqueued += enqueued;
                }
                Err(e) => {
                    warn!(%workflow_id, error = %e, "failed to recover workflow");
                    report.failed.push((workflow_id, e.to_string()));
                }
            }
        }

        info!(
            recovered = report.recovered,
            tasks_enqueued = report.tasks_enqueued,
            failed = report.failed.len(),
            "recovery pass finished"
        );
        Ok(report)
    }

    /// Rebuild a workflow's decision state without writing anything
    #[instrument(skip(self))]
    pub async fn replay(&self, workflow_id: Uuid) -> Result<ReplayState, ExecutorError> {
        let info = self.store.get_workflow_info(workflow_id).await?;
        let events = self.store.load_events(workflow_id).await?;
        let replayed = self.replay_history(workflow_id, &info, &events)?;

        Ok(ReplayState {
            workflow_id,
            workflow_type: info.workflow_type,
            status: info.status,
            sequence: events.len() as i32,
            steps: replayed.steps,
            pending_actions: replayed.new_actions,
            is_completed: replayed.workflow.is_completed(),
            result: replayed.workflow.result_json()?,
            error: replayed.workflow.error(),
        })
    }

    // =========================================================================
    // Internal Methods
    // =========================================================================

    /// Serialize work on one instance; the map entry lives only while held or awaited
    async fn lock_instance(&self, workflow_id: Uuid) -> InstanceGuard<'_> {
        let lock = self.locks.entry(workflow_id).or_default().clone();
        InstanceGuard {
            locks: &self.locks,
            workflow_id,
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn tracked_instances(&self) -> usize {
        self.locks.len()
    }

    async fn recover_workflow(&self, workflow_id: Uuid) -> Result<usize, ExecutorError> {
        let _guard = self.lock_instance(workflow_id).await;

        let result = self.drive_locked(workflow_id).await?;
        if result.completed() {
            return Ok(0);
        }

        let events = self.store.load_events(workflow_id).await?;
        let mut enqueued = 0;
        for entry in &events {
            if let WorkflowEvent::ActivityScheduled {
                activity_id,
                activity_type,
                input,
                options,
            } = &entry.event
            {
                if !is_unresolved(&events, activity_id) {
                    continue;
                }
                let task_id = self
                    .store
                    .enqueue_task(TaskDefinition {
                        workflow_id,
                        activity_id: activity_id.clone(),
                        activity_type: activity_type.clone(),
                        task_queue: options.task_queue.clone(),
                        input: input.clone(),
                        options: options.clone(),
                    })
                    .await?;
                debug!(%workflow_id, %activity_id, %task_id, "ensured outstanding task");
                enqueued += 1;
            }
        }

        Ok(enqueued)
    }

    /// Drive a workflow; the caller holds its instance lock
    async fn drive_locked(&self, workflow_id: Uuid) -> Result<ProcessResult, ExecutorError> {
        let _permit = self
            .decisions
            .acquire()
            .await
            .map_err(|_| ExecutorError::ShuttingDown)?;

        let info = self.store.get_workflow_info(workflow_id).await?;
        if info.status.is_terminal() {
            debug!(%workflow_id, status = %info.status, "workflow already in terminal state");
            return Ok(ProcessResult::unchanged(info.status));
        }

        let mut events = self.store.load_events(workflow_id).await?;
        let mut events_written = 0;
        if events.is_empty() {
            // Instance created but its start event never made it to history
            self.store
                .append_events(
                    workflow_id,
                    0,
                    vec![WorkflowEvent::WorkflowStarted {
                        input: info.input.clone(),
                    }],
                )
                .await?;
            events = self.store.load_events(workflow_id).await?;
            events_written += 1;
        }

        let sequence = events.len() as i32;
        let replayed = match self.replay_history(workflow_id, &info, &events) {
            Ok(replayed) => replayed,
            Err(err @ ExecutorError::Nondeterminism { .. }) => {
                self.fail_nondeterministic(workflow_id, sequence, &err)
                    .await?;
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        debug!(%workflow_id, sequence, new_actions = replayed.new_actions.len(), "replayed events");

        if let Some(terminal) = replayed.terminal {
            // Terminal event recorded but status update was lost
            let status = self.settle_from_event(workflow_id, terminal).await?;
            return Ok(ProcessResult {
                status,
                events_written,
                tasks_enqueued: 0,
            });
        }

        let mut result = self
            .apply_actions(workflow_id, sequence, info.status, replayed.new_actions)
            .await?;
        result.events_written += events_written;
        Ok(result)
    }

    /// Replay a history through a fresh workflow instance
    fn replay_history(
        &self,
        workflow_id: Uuid,
        info: &WorkflowInfo,
        events: &[HistoryEntry],
    ) -> Result<Replayed, ExecutorError> {
        match events.first().map(|e| &e.event) {
            Some(WorkflowEvent::WorkflowStarted { .. }) => {}
            Some(_) => {
                return Err(ExecutorError::ReplayError(
                    "first event must be WorkflowStarted".to_string(),
                ))
            }
            None => {
                return Err(ExecutorError::ReplayError(format!(
                    "workflow {workflow_id} has no history"
                )))
            }
        }

        if events.len() > self.config.max_events_per_workflow {
            return Err(ExecutorError::TooManyEvents(
                workflow_id,
                events.len(),
                self.config.max_events_per_workflow,
            ));
        }

        let mut workflow = self
            .registry
            .create(&info.workflow_type, info.input.clone())?;

        let mut steps: Vec<StepState> = Vec::new();
        let mut delivered: HashSet<&str> = HashSet::new();
        let mut terminal: Option<WorkflowEvent> = None;
        let history_closed = events.iter().any(|e| e.event.is_terminal());
        let mut produced = workflow.on_start();

        for entry in &events[1..] {
            let event = &entry.event;

            if let WorkflowEvent::ActivityScheduled {
                activity_id,
                activity_type,
                ..
            } = event
            {
                if !steps.iter().any(|s| &s.activity_id == activity_id) {
                    steps.push(StepState {
                        activity_id: activity_id.clone(),
                        activity_type: activity_type.clone(),
                        status: StepStatus::Pending,
                        attempts: 0,
                    });
                }
            }

            if let (Some(activity_id), Some(status)) = (event.activity_id(), event.step_status()) {
                if let Some(step) = steps.iter_mut().find(|s| s.activity_id == activity_id) {
                    // A settled step keeps its outcome
                    if !matches!(step.status, StepStatus::Succeeded | StepStatus::FailedTerminal) {
                        step.status = status;
                    }
                    step.attempts = step.attempts.max(event.attempt().unwrap_or(0));
                }
            }

            if event.is_terminal() {
                terminal.get_or_insert_with(|| event.clone());
                continue;
            }

            // Outcomes after a terminal event cause no transitions
            if terminal.is_some() {
                continue;
            }

            match event {
                WorkflowEvent::ActivityCompleted {
                    activity_id,
                    result,
                    ..
                } => {
                    if steps.iter().any(|s| &s.activity_id == activity_id)
                        && delivered.insert(activity_id)
                    {
                        match workflow.on_step_completed(activity_id, result.clone()) {
                            Ok(actions) => produced.extend(actions),
                            // The instance already ended over this result
                            Err(_) if history_closed => {}
                            Err(e) => {
                                return Err(ExecutorError::Nondeterminism {
                                    workflow_id,
                                    detail: e.to_string(),
                                })
                            }
                        }
                    }
                }
                WorkflowEvent::ActivityFailed {
                    activity_id,
                    error,
                    will_retry: false,
                    ..
                } => {
                    if steps.iter().any(|s| &s.activity_id == activity_id)
                        && delivered.insert(activity_id)
                    {
                        produced.extend(workflow.on_step_failed(activity_id, error));
                    }
                }
                _ => {}
            }
        }

        let new_actions = filter_new_actions(workflow_id, &steps, terminal.is_some(), produced)?;

        Ok(Replayed {
            workflow,
            steps,
            new_actions,
            terminal,
        })
    }

    /// Persist and apply new actions
    async fn apply_actions(
        &self,
        workflow_id: Uuid,
        sequence: i32,
        current_status: WorkflowStatus,
        actions: Vec<WorkflowAction>,
    ) -> Result<ProcessResult, ExecutorError> {
        let mut new_events = Vec::with_capacity(actions.len());
        let mut tasks = Vec::new();
        let mut outcome: Option<(WorkflowStatus, Option<Value>, Option<WorkflowError>)> = None;

        for action in actions {
            match action {
                WorkflowAction::ScheduleActivity {
                    activity_id,
                    activity_type,
                    input,
                    options,
                } => {
                    debug!(%workflow_id, %activity_id, %activity_type, "scheduling activity");

                    tasks.push(TaskDefinition {
                        workflow_id,
                        activity_id: activity_id.clone(),
                        activity_type: activity_type.clone(),
                        task_queue: options.task_queue.clone(),
                        input: input.clone(),
                        options: options.clone(),
                    });
                    new_events.push(WorkflowEvent::ActivityScheduled {
                        activity_id,
                        activity_type,
                        input,
                        options,
                    });
                }

                WorkflowAction::CompleteWorkflow { result } => {
                    info!(%workflow_id, "completing workflow");
                    new_events.push(WorkflowEvent::WorkflowCompleted {
                        result: result.clone(),
                    });
                    outcome = Some((WorkflowStatus::Completed, Some(result), None));
                }

                WorkflowAction::FailWorkflow { error } => {
                    warn!(%workflow_id, error = %error.message, "failing workflow");
                    new_events.push(WorkflowEvent::WorkflowFailed {
                        error: error.clone(),
                    });
                    outcome = Some((WorkflowStatus::Failed, None, Some(error)));
                }
            }
        }

        let events_written = new_events.len();
        if !new_events.is_empty() {
            // History first: a crash after this point is repaired by recover()
            self.store
                .append_events(workflow_id, sequence, new_events)
                .await?;
        }

        let tasks_enqueued = tasks.len();
        for task in tasks {
            self.store.enqueue_task(task).await?;
        }

        let status = match outcome {
            Some((status, result, error)) => {
                self.store
                    .update_workflow_status(workflow_id, status, result, error)
                    .await?;
                status
            }
            None if current_status == WorkflowStatus::Pending => {
                self.store
                    .update_workflow_status(workflow_id, WorkflowStatus::Running, None, None)
                    .await?;
                WorkflowStatus::Running
            }
            None => current_status,
        };

        Ok(ProcessResult {
            status,
            events_written,
            tasks_enqueued,
        })
    }

    async fn settle_from_event(
        &self,
        workflow_id: Uuid,
        terminal: WorkflowEvent,
    ) -> Result<WorkflowStatus, ExecutorError> {
        let (status, result, error) = match terminal {
            WorkflowEvent::WorkflowCompleted { result } => {
                (WorkflowStatus::Completed, Some(result), None)
            }
            WorkflowEvent::WorkflowFailed { error } => (WorkflowStatus::Failed, None, Some(error)),
            _ => (WorkflowStatus::Cancelled, None, None),
        };

        info!(%workflow_id, %status, "restoring terminal status from history");
        self.store
            .update_workflow_status(workflow_id, status, result, error)
            .await?;
        Ok(status)
    }

    async fn fail_nondeterministic(
        &self,
        workflow_id: Uuid,
        sequence: i32,
        err: &ExecutorError,
    ) -> Result<(), ExecutorError> {
        error!(%workflow_id, error = %err, "replay diverged from recorded history");

        let error = WorkflowError::new(err.to_string()).with_code("NONDETERMINISM");
        self.store
            .append_events(
                workflow_id,
                sequence,
                vec![WorkflowEvent::WorkflowFailed {
                    error: error.clone(),
                }],
            )
            .await?;
        self.store
            .update_workflow_status(workflow_id, WorkflowStatus::Failed, None, Some(error))
            .await?;
        self.store.cancel_tasks(workflow_id).await?;
        Ok(())
    }
}

struct InstanceGuard<'a> {
    locks: &'a DashMap<Uuid, Arc<Mutex<()>>>,
    workflow_id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for InstanceGuard<'_> {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        let lock = Arc::clone(OwnedMutexGuard::mutex(&guard));
        drop(guard);
        // One reference in the map and one here means nobody is waiting
        self.locks.remove_if(&self.workflow_id, |_, held| {
            Arc::ptr_eq(held, &lock) && Arc::strong_count(held) <= 2
        });
    }
}

/// Keep only actions history does not reflect yet, checking replayed
/// schedules against recorded ones
fn filter_new_actions(
    workflow_id: Uuid,
    steps: &[StepState],
    terminal_recorded: bool,
    produced: Vec<WorkflowAction>,
) -> Result<Vec<WorkflowAction>, ExecutorError> {
    let recorded: HashMap<&str, &str> = steps
        .iter()
        .map(|s| (s.activity_id.as_str(), s.activity_type.as_str()))
        .collect();

    let mut seen: HashSet<String> = HashSet::new();
    let mut terminal_seen = terminal_recorded;
    let mut new_actions = Vec::new();

    for action in produced {
        match &action {
            WorkflowAction::ScheduleActivity {
                activity_id,
                activity_type,
                ..
            } => {
                if !seen.insert(activity_id.clone()) {
                    continue;
                }
                match recorded.get(activity_id.as_str()) {
                    Some(recorded_type) if *recorded_type != activity_type.as_str() => {
                        return Err(ExecutorError::Nondeterminism {
                            workflow_id,
                            detail: format!(
                                "activity {activity_id} was recorded as {recorded_type} but replay scheduled {activity_type}"
                            ),
                        });
                    }
                    Some(_) => {}
                    None if !terminal_seen => new_actions.push(action),
                    None => {}
                }
            }
            WorkflowAction::CompleteWorkflow { .. } | WorkflowAction::FailWorkflow { .. } => {
                if !terminal_seen {
                    terminal_seen = true;
                    new_actions.push(action);
                }
            }
        }
    }

    if let Some(missing) = steps.iter().find(|s| !seen.contains(&s.activity_id)) {
        return Err(ExecutorError::Nondeterminism {
            workflow_id,
            detail: format!(
                "recorded activity {} was not scheduled on replay",
                missing.activity_id
            ),
        });
    }

    Ok(new_actions)
}

/// Whether `activity_id` was scheduled and has no settling outcome yet
fn is_unresolved(events: &[HistoryEntry], activity_id: &str) -> bool {
    let mut scheduled = false;
    for entry in events {
        if entry.event.activity_id() != Some(activity_id) {
            continue;
        }
        if entry.event.resolves_activity() {
            return false;
        }
        if matches!(entry.event, WorkflowEvent::ActivityScheduled { .. }) {
            scheduled = true;
        }
    }
    scheduled
}

#[async_trait]
impl<S: WorkflowEventStore> ActivityReporter for WorkflowExecutor<S> {
    async fn activity_started(&self, task: &ClaimedTask, worker_id: &str) -> anyhow::Result<()> {
        self.on_activity_started(task.workflow_id, &task.activity_id, task.attempt, worker_id)
            .await?;
        Ok(())
    }

    async fn activity_completed(&self, task: &ClaimedTask, result: Value) -> anyhow::Result<()> {
        self.on_activity_completed(task.workflow_id, &task.activity_id, task.attempt, result)
            .await?;
        Ok(())
    }

    async fn activity_failed(
        &self,
        task: &ClaimedTask,
        error: &ActivityError,
        will_retry: bool,
    ) -> anyhow::Result<()> {
        self.on_activity_failed(
            task.workflow_id,
            &task.activity_id,
            task.attempt,
            error.clone(),
            will_retry,
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{InMemoryWorkflowEventStore, TaskStatus};
    use crate::workflow::{decode_step_result, StepDecodeError};
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    // Runs `steps` activities one after another, then completes
    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct ChainInput {
        steps: u32,
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct ChainOutput {
        completed_steps: u32,
    }

    struct ChainWorkflow {
        steps: u32,
        done: u32,
        error: Option<WorkflowError>,
    }

    impl ChainWorkflow {
        fn next(&mut self) -> Vec<WorkflowAction> {
            if self.done >= self.steps {
                vec![WorkflowAction::complete(
                    json!({ "completed_steps": self.done }),
                )]
            } else {
                vec![WorkflowAction::schedule_activity(
                    format!("step-{}", self.done),
                    "chain_step",
                    json!({ "index": self.done }),
                )]
            }
        }
    }

    impl Workflow for ChainWorkflow {
        const TYPE: &'static str = "chain_workflow";
        type Input = ChainInput;
        type Output = ChainOutput;
        type Step = serde_json::Map<String, Value>;

        fn new(input: Self::Input) -> Self {
            Self {
                steps: input.steps,
                done: 0,
                error: None,
            }
        }

        fn on_start(&mut self) -> Vec<WorkflowAction> {
            self.next()
        }

        fn decode_step(activity_id: &str, result: Value) -> Result<Self::Step, StepDecodeError> {
            decode_step_result(activity_id, result)
        }

        fn on_step_completed(
            &mut self,
            _activity_id: &str,
            _step: Self::Step,
        ) -> Vec<WorkflowAction> {
            self.done += 1;
            self.next()
        }

        fn on_step_failed(
            &mut self,
            _activity_id: &str,
            error: &ActivityError,
        ) -> Vec<WorkflowAction> {
            let error = WorkflowError::new(&error.message);
            self.error = Some(error.clone());
            vec![WorkflowAction::fail(error)]
        }

        fn is_completed(&self) -> bool {
            self.done >= self.steps || self.error.is_some()
        }

        fn result(&self) -> Option<Self::Output> {
            (self.error.is_none() && self.done >= self.steps).then_some(ChainOutput {
                completed_steps: self.done,
            })
        }

        fn error(&self) -> Option<WorkflowError> {
            self.error.clone()
        }
    }

    fn executor() -> WorkflowExecutor<InMemoryWorkflowEventStore> {
        let mut executor = WorkflowExecutor::new(InMemoryWorkflowEventStore::new());
        executor.register::<ChainWorkflow>();
        executor
    }

    async fn start(executor: &WorkflowExecutor<InMemoryWorkflowEventStore>, steps: u32) -> Uuid {
        executor
            .start_workflow::<ChainWorkflow>(Uuid::now_v7(), ChainInput { steps })
            .await
            .expect("should start workflow")
    }

    #[tokio::test]
    async fn test_start_workflow() {
        let executor = executor();
        let workflow_id = start(&executor, 3).await;

        let status = executor.store().get_workflow_status(workflow_id).await.unwrap();
        assert_eq!(status, WorkflowStatus::Running);

        let events = executor.store().load_events(workflow_id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0].event, WorkflowEvent::WorkflowStarted { .. }));
        assert!(matches!(
            events[1].event,
            WorkflowEvent::ActivityScheduled { .. }
        ));
        assert_eq!(executor.store().pending_task_count(), 1);
    }

    #[tokio::test]
    async fn test_start_rejects_duplicate_id() {
        let executor = executor();
        let workflow_id = start(&executor, 1).await;

        let result = executor
            .start_workflow::<ChainWorkflow>(workflow_id, ChainInput { steps: 1 })
            .await;
        assert!(matches!(
            result,
            Err(ExecutorError::Store(StoreError::WorkflowAlreadyExists(_)))
        ));
    }

    #[tokio::test]
    async fn test_immediate_completion() {
        let executor = executor();
        let workflow_id = start(&executor, 0).await;

        let info = executor.store().get_workflow_info(workflow_id).await.unwrap();
        assert_eq!(info.status, WorkflowStatus::Completed);
        assert_eq!(info.result, Some(json!({ "completed_steps": 0 })));
    }

    #[tokio::test]
    async fn test_activity_completion_drives_to_completion() {
        let executor = executor();
        let workflow_id = start(&executor, 2).await;

        let result = executor
            .on_activity_completed(workflow_id, "step-0", 1, json!({}))
            .await
            .unwrap();
        assert!(!result.completed());
        assert_eq!(result.tasks_enqueued, 1);

        let result = executor
            .on_activity_completed(workflow_id, "step-1", 1, json!({}))
            .await
            .unwrap();
        assert!(result.completed());
        assert_eq!(result.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn test_process_workflow_is_idempotent() {
        let executor = executor();
        let workflow_id = start(&executor, 2).await;
        executor
            .on_activity_completed(workflow_id, "step-0", 1, json!({}))
            .await
            .unwrap();

        let before = executor.store().load_events(workflow_id).await.unwrap();
        for _ in 0..3 {
            let result = executor.process_workflow(workflow_id).await.unwrap();
            assert_eq!(result.events_written, 0);
            assert_eq!(result.tasks_enqueued, 0);
        }
        let after = executor.store().load_events(workflow_id).await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_duplicate_completion_is_ignored() {
        let executor = executor();
        let workflow_id = start(&executor, 2).await;

        executor
            .on_activity_completed(workflow_id, "step-0", 1, json!({}))
            .await
            .unwrap();
        let len = executor.store().load_events(workflow_id).await.unwrap().len();

        let result = executor
            .on_activity_completed(workflow_id, "step-0", 1, json!({}))
            .await
            .unwrap();
        assert_eq!(result.events_written, 0);
        assert_eq!(
            executor.store().load_events(workflow_id).await.unwrap().len(),
            len
        );
    }

    #[tokio::test]
    async fn test_retryable_failure_does_not_reach_workflow() {
        let executor = executor();
        let workflow_id = start(&executor, 1).await;

        let result = executor
            .on_activity_failed(
                workflow_id,
                "step-0",
                1,
                ActivityError::retryable("flaky"),
                true,
            )
            .await
            .unwrap();
        assert_eq!(result.status, WorkflowStatus::Running);

        let state = executor.replay(workflow_id).await.unwrap();
        let step = state.step("step-0").unwrap();
        assert_eq!(step.status, StepStatus::FailedRetryable);
        assert_eq!(step.attempts, 1);

        let result = executor
            .on_activity_completed(workflow_id, "step-0", 2, json!({}))
            .await
            .unwrap();
        assert_eq!(result.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn test_terminal_failure_fails_workflow() {
        let executor = executor();
        let workflow_id = start(&executor, 5).await;

        let error = ActivityError::non_retryable("step failed").with_code("STEP_ERROR");
        let result = executor
            .on_activity_failed(workflow_id, "step-0", 1, error, false)
            .await
            .unwrap();
        assert!(result.completed());

        let info = executor.store().get_workflow_info(workflow_id).await.unwrap();
        assert_eq!(info.status, WorkflowStatus::Failed);
        assert_eq!(info.error.map(|e| e.message), Some("step failed".to_string()));
    }

    #[tokio::test]
    async fn test_cancel_stops_transitions() {
        let executor = executor();
        let workflow_id = start(&executor, 2).await;

        executor
            .cancel_workflow(workflow_id, "customer withdrew")
            .await
            .unwrap();
        assert_eq!(executor.store().pending_task_count(), 0);

        // A late outcome is recorded but nothing else happens
        let result = executor
            .on_activity_completed(workflow_id, "step-0", 1, json!({}))
            .await
            .unwrap();
        assert_eq!(result.status, WorkflowStatus::Cancelled);
        assert_eq!(result.tasks_enqueued, 0);

        let events = executor.store().load_events(workflow_id).await.unwrap();
        assert!(!events
            .iter()
            .any(|e| e.event.activity_id() == Some("step-1")));

        let again = executor.cancel_workflow(workflow_id, "again").await;
        assert!(matches!(again, Err(ExecutorError::AlreadyTerminal { .. })));
    }

    #[tokio::test]
    async fn test_recover_resumes_unstarted_workflow() {
        let executor = executor();
        let workflow_id = Uuid::now_v7();

        // Simulates a crash right after the instance row was written
        executor
            .store()
            .create_workflow(workflow_id, ChainWorkflow::TYPE, json!({ "steps": 1 }))
            .await
            .unwrap();

        let report = executor.recover().await.unwrap();
        assert_eq!(report.recovered, 1);
        assert!(report.failed.is_empty());

        let events = executor.store().load_events(workflow_id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(executor.store().pending_task_count(), 1);
    }

    #[tokio::test]
    async fn test_recover_reenqueues_lost_tasks() {
        let executor = executor();
        let workflow_id = start(&executor, 2).await;

        // Lose the queued task
        executor.store().cancel_tasks(workflow_id).await.unwrap();
        assert_eq!(executor.store().pending_task_count(), 0);

        let report = executor.recover().await.unwrap();
        assert_eq!(report.tasks_enqueued, 1);
        assert_eq!(executor.store().pending_task_count(), 1);

        // A second pass does not duplicate it
        executor.recover().await.unwrap();
        assert_eq!(executor.store().pending_task_count(), 1);
    }

    #[tokio::test]
    async fn test_recover_restores_status_from_terminal_event() {
        let executor = executor();
        let workflow_id = start(&executor, 1).await;

        // Terminal event written, status update lost
        let events = executor.store().load_events(workflow_id).await.unwrap();
        executor
            .store()
            .append_events(
                workflow_id,
                events.len() as i32,
                vec![WorkflowEvent::ActivityCompleted {
                    activity_id: "step-0".to_string(),
                    attempt: 1,
                    result: json!({}),
                }, WorkflowEvent::WorkflowCompleted {
                    result: json!({ "completed_steps": 1 }),
                }],
            )
            .await
            .unwrap();

        executor.recover().await.unwrap();

        let info = executor.store().get_workflow_info(workflow_id).await.unwrap();
        assert_eq!(info.status, WorkflowStatus::Completed);
        assert_eq!(info.result, Some(json!({ "completed_steps": 1 })));
    }

    #[tokio::test]
    async fn test_nondeterminism_is_detected() {
        let executor = executor();
        let workflow_id = Uuid::now_v7();
        let store = executor.store();

        store
            .create_workflow(workflow_id, ChainWorkflow::TYPE, json!({ "steps": 1 }))
            .await
            .unwrap();
        store
            .append_events(
                workflow_id,
                0,
                vec![
                    WorkflowEvent::WorkflowStarted {
                        input: json!({ "steps": 1 }),
                    },
                    WorkflowEvent::ActivityScheduled {
                        activity_id: "step-0".to_string(),
                        activity_type: "something_else".to_string(),
                        input: json!({}),
                        options: Default::default(),
                    },
                ],
            )
            .await
            .unwrap();

        let result = executor.process_workflow(workflow_id).await;
        assert!(matches!(result, Err(ExecutorError::Nondeterminism { .. })));

        let info = store.get_workflow_info(workflow_id).await.unwrap();
        assert_eq!(info.status, WorkflowStatus::Failed);
        assert_eq!(info.error.and_then(|e| e.code), Some("NONDETERMINISM".to_string()));
    }

    #[tokio::test]
    async fn test_undecodable_step_result_is_nondeterminism() {
        let executor = executor();
        let workflow_id = start(&executor, 2).await;

        let result = executor
            .on_activity_completed(workflow_id, "step-0", 1, json!("not an object"))
            .await;
        assert!(matches!(result, Err(ExecutorError::Nondeterminism { .. })));

        let info = executor.store().get_workflow_info(workflow_id).await.unwrap();
        assert_eq!(info.status, WorkflowStatus::Failed);
        assert_eq!(info.error.and_then(|e| e.code), Some("NONDETERMINISM".to_string()));
        assert_eq!(executor.store().pending_task_count(), 0);

        // The failure stands on later passes
        let events = executor.store().load_events(workflow_id).await.unwrap().len();
        let again = executor.process_workflow(workflow_id).await.unwrap();
        assert_eq!(again.status, WorkflowStatus::Failed);
        assert_eq!(executor.store().load_events(workflow_id).await.unwrap().len(), events);
    }

    #[tokio::test]
    async fn test_replay_reports_steps_without_writing() {
        let executor = executor();
        let workflow_id = start(&executor, 2).await;
        executor
            .on_activity_started(workflow_id, "step-0", 1, "worker-1")
            .await
            .unwrap();
        executor
            .on_activity_completed(workflow_id, "step-0", 1, json!({}))
            .await
            .unwrap();

        let len = executor.store().load_events(workflow_id).await.unwrap().len();
        let state = executor.replay(workflow_id).await.unwrap();

        assert_eq!(state.sequence as usize, len);
        assert_eq!(state.steps.len(), 2);
        assert_eq!(state.step("step-0").unwrap().status, StepStatus::Succeeded);
        assert_eq!(state.step("step-1").unwrap().status, StepStatus::Pending);
        assert!(state.pending_actions.is_empty());
        assert!(!state.is_completed);
        assert_eq!(
            executor.store().load_events(workflow_id).await.unwrap().len(),
            len
        );
    }

    #[tokio::test]
    async fn test_concurrent_workflows_complete_independently() {
        let executor = Arc::new(executor());
        let mut ids = vec![];
        for _ in 0..8 {
            ids.push(start(&executor, 1).await);
        }

        let handles: Vec<_> = ids
            .iter()
            .map(|id| {
                let executor = Arc::clone(&executor);
                let id = *id;
                tokio::spawn(async move {
                    executor
                        .on_activity_completed(id, "step-0", 1, json!({}))
                        .await
                })
            })
            .collect();

        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            assert_eq!(result.status, WorkflowStatus::Completed);
        }
    }

    #[tokio::test]
    async fn test_instance_locks_are_dropped_after_use() {
        let executor = executor();

        let running = start(&executor, 2).await;
        let cancelled = start(&executor, 2).await;
        executor
            .cancel_workflow(cancelled, "customer withdrew")
            .await
            .unwrap();
        executor
            .on_activity_completed(cancelled, "step-0", 1, json!({}))
            .await
            .unwrap();
        executor
            .on_activity_failed(
                cancelled,
                "step-0",
                2,
                ActivityError::non_retryable("gone"),
                false,
            )
            .await
            .unwrap();

        let diverged = Uuid::now_v7();
        let store = executor.store();
        store
            .create_workflow(diverged, ChainWorkflow::TYPE, json!({ "steps": 1 }))
            .await
            .unwrap();
        store
            .append_events(
                diverged,
                0,
                vec![
                    WorkflowEvent::WorkflowStarted {
                        input: json!({ "steps": 1 }),
                    },
                    WorkflowEvent::ActivityScheduled {
                        activity_id: "step-0".to_string(),
                        activity_type: "something_else".to_string(),
                        input: json!({}),
                        options: Default::default(),
                    },
                ],
            )
            .await
            .unwrap();
        let result = executor.process_workflow(diverged).await;
        assert!(matches!(result, Err(ExecutorError::Nondeterminism { .. })));

        let unknown = executor
            .on_activity_completed(Uuid::now_v7(), "step-0", 1, json!({}))
            .await;
        assert!(unknown.is_err());
        executor
            .on_activity_started(Uuid::now_v7(), "step-0", 1, "worker-1")
            .await
            .ok();

        let status = executor.store().get_workflow_status(running).await.unwrap();
        assert_eq!(status, WorkflowStatus::Running);
        assert_eq!(executor.tracked_instances(), 0);
    }

    #[tokio::test]
    async fn test_reporter_marks_task_attempt() {
        let executor = executor();
        let workflow_id = start(&executor, 1).await;

        let task = executor
            .store()
            .claim_task("worker-1", "default", &["chain_step".to_string()], 1)
            .await
            .unwrap()
            .remove(0);

        executor.activity_started(&task, "worker-1").await.unwrap();
        executor
            .activity_completed(&task, json!({ "ok": true }))
            .await
            .unwrap();
        executor
            .store()
            .complete_task(task.id, "worker-1", task.attempt, json!({ "ok": true }))
            .await
            .unwrap();

        assert_eq!(
            executor.store().task_status(task.id),
            Some(TaskStatus::Completed)
        );
        assert_eq!(
            executor.store().get_workflow_status(workflow_id).await.unwrap(),
            WorkflowStatus::Completed
        );
    }
}
