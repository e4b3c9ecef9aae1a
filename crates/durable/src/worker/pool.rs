//! Worker pool for task execution
//!
//! Manages concurrent task execution with backpressure and graceful shutdown.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::backpressure::{BackpressureConfig, BackpressureState};
use super::poller::{PollerConfig, PollerError, TaskPoller};
use super::reporter::ActivityReporter;
use crate::activity::{Activity, ActivityContext, ActivityError};
use crate::persistence::{ClaimedTask, StoreError, TaskFailureOutcome, WorkflowEventStore};
use crate::workflow::DEFAULT_TASK_QUEUE;

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerPoolConfig {
    /// Unique worker ID (generated if not provided)
    pub worker_id: String,

    /// Task queue this worker claims from
    pub task_queue: String,

    /// Maximum concurrent task executions
    pub max_concurrency: usize,

    /// Backpressure configuration
    pub backpressure: BackpressureConfig,

    /// Poller configuration
    pub poller: PollerConfig,

    /// Stale task reclamation interval
    #[serde(with = "crate::serde_util::duration_millis")]
    pub stale_reclaim_interval: Duration,

    /// How long a claim may go unsettled before the task is reclaimed
    #[serde(with = "crate::serde_util::duration_millis")]
    pub stale_threshold: Duration,

    /// Graceful shutdown timeout
    #[serde(with = "crate::serde_util::duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            task_queue: DEFAULT_TASK_QUEUE.to_string(),
            max_concurrency: 10,
            backpressure: BackpressureConfig::default(),
            poller: PollerConfig::default(),
            stale_reclaim_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(120),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    /// Create a configuration for the given task queue
    pub fn new(task_queue: impl Into<String>) -> Self {
        Self {
            task_queue: task_queue.into(),
            ..Default::default()
        }
    }

    /// Set the worker ID
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    /// Set maximum concurrency
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Set backpressure configuration
    pub fn with_backpressure(mut self, config: BackpressureConfig) -> Self {
        self.backpressure = config;
        self
    }

    /// Set poller configuration
    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    /// Set how often stale claims are looked for, and how old they must be
    pub fn with_stale_reclaim(mut self, interval: Duration, threshold: Duration) -> Self {
        self.stale_reclaim_interval = interval;
        self.stale_threshold = threshold;
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    /// Worker is running and accepting tasks
    Running,
    /// Worker is draining (completing current tasks, not accepting new ones)
    Draining,
    /// Worker has stopped
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Poller error
    #[error("poller error: {0}")]
    Poller(#[from] PollerError),

    /// Worker already running
    #[error("worker pool is already running")]
    AlreadyRunning,

    /// Nothing to run
    #[error("no activities registered on worker pool")]
    NoActivities,

    /// Shutdown timeout
    #[error("graceful shutdown timed out with {0} tasks still running")]
    ShutdownTimeout(usize),
}

/// Outcome of one attempt as produced by a handler
pub type ActivityResult = Result<Value, ActivityError>;

/// Type-erased activity handler
pub type ActivityHandler =
    Arc<dyn Fn(ActivityContext, Value) -> BoxFuture<'static, ActivityResult> + Send + Sync>;

/// Worker pool for executing activities
///
/// # Example
///
/// ```ignore
/// use delaywatch_durable::worker::{WorkerPool, WorkerPoolConfig};
///
/// let config = WorkerPoolConfig::new("notifications").with_max_concurrency(10);
///
/// let pool = WorkerPool::new(store, executor, config);
/// pool.register_activity(SendEmailActivity::new(mailer));
///
/// pool.start()?;
///
/// // ... later, graceful shutdown
/// pool.shutdown().await?;
/// ```
pub struct WorkerPool<S: WorkflowEventStore> {
    store: Arc<S>,
    reporter: Arc<dyn ActivityReporter>,
    config: WorkerPoolConfig,
    backpressure: Arc<BackpressureState>,
    handlers: RwLock<HashMap<String, ActivityHandler>>,
    shutdown_tx: watch::Sender<bool>,
    status: RwLock<WorkerPoolStatus>,
    active_tasks: Arc<Semaphore>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
    reclaim_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<S: WorkflowEventStore> WorkerPool<S> {
    /// Create a new worker pool
    pub fn new(
        store: Arc<S>,
        reporter: Arc<dyn ActivityReporter>,
        config: WorkerPoolConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let backpressure = Arc::new(BackpressureState::new(
            config.backpressure.clone(),
            config.max_concurrency,
        ));
        let active_tasks = Arc::new(Semaphore::new(config.max_concurrency));

        Self {
            store,
            reporter,
            config,
            backpressure,
            handlers: RwLock::new(HashMap::new()),
            shutdown_tx,
            status: RwLock::new(WorkerPoolStatus::Stopped),
            active_tasks,
            poll_handle: Mutex::new(None),
            reclaim_handle: Mutex::new(None),
        }
    }

    /// Register a typed activity
    ///
    /// Input that does not deserialize into `A::Input` fails the attempt
    /// without retry.
    pub fn register_activity<A: Activity>(&self, activity: A) -> &Self {
        let activity = Arc::new(activity);
        self.register_handler(A::TYPE, move |ctx, input| {
            let activity = Arc::clone(&activity);
            async move {
                let input: A::Input =
                    serde_json::from_value(input).map_err(|e| ActivityError::invalid_input(&e))?;
                let output = activity.execute(&ctx, input).await?;
                serde_json::to_value(output).map_err(|e| ActivityError::invalid_output(&e))
            }
        })
    }

    /// Register a raw handler for an activity type
    pub fn register_handler<F, Fut>(&self, activity_type: &str, handler: F) -> &Self
    where
        F: Fn(ActivityContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActivityResult> + Send + 'static,
    {
        let handler: ActivityHandler = Arc::new(move |ctx, input| Box::pin(handler(ctx, input)));
        self.handlers
            .write()
            .insert(activity_type.to_string(), handler);
        self
    }

    /// Activity types with a registered handler, sorted
    pub fn activity_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.read().keys().cloned().collect();
        types.sort();
        types
    }

    /// Start the background poll and reclaim loops
    ///
    /// Must be called from within a tokio runtime.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub fn start(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status != WorkerPoolStatus::Stopped {
                return Err(WorkerPoolError::AlreadyRunning);
            }
            if self.handlers.read().is_empty() {
                return Err(WorkerPoolError::NoActivities);
            }
            *status = WorkerPoolStatus::Running;
        }

        self.shutdown_tx.send_replace(false);

        info!(
            worker_id = %self.config.worker_id,
            task_queue = %self.config.task_queue,
            activity_types = ?self.activity_types(),
            max_concurrency = self.config.max_concurrency,
            "Starting worker pool"
        );

        self.start_poll_loop();
        self.start_reclaim_loop();

        Ok(())
    }

    /// Shutdown the worker pool gracefully
    ///
    /// Stops claiming, then waits up to the shutdown timeout for running
    /// attempts to finish. Attempts still running after that are left
    /// claimed and get reclaimed by another worker.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status == WorkerPoolStatus::Stopped {
                return Ok(());
            }
            *status = WorkerPoolStatus::Draining;
        }

        info!(worker_id = %self.config.worker_id, "Initiating graceful shutdown");
        self.shutdown_tx.send_replace(true);

        let poll_handle = self.poll_handle.lock().take();
        if let Some(handle) = poll_handle {
            if let Err(e) = handle.await {
                error!("Poll loop ended abnormally: {}", e);
            }
        }
        let reclaim_handle = self.reclaim_handle.lock().take();
        if let Some(handle) = reclaim_handle {
            if let Err(e) = handle.await {
                error!("Reclaim loop ended abnormally: {}", e);
            }
        }

        // All permits free means no attempt is running
        let all_permits = self.config.max_concurrency as u32;
        let drained = tokio::time::timeout(
            self.config.shutdown_timeout,
            self.active_tasks.acquire_many(all_permits),
        )
        .await;

        *self.status.write() = WorkerPoolStatus::Stopped;

        match drained {
            Ok(_permits) => {
                info!(worker_id = %self.config.worker_id, "Worker pool stopped");
                Ok(())
            }
            Err(_) => {
                let remaining = self.backpressure.current_load();
                warn!(remaining_tasks = remaining, "Shutdown timeout reached");
                Err(WorkerPoolError::ShutdownTimeout(remaining))
            }
        }
    }

    /// Claim and run every task that is visible right now, then return
    ///
    /// Runs on the caller's task instead of the background loop. Returns how
    /// many attempts were executed.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn run_once(&self) -> Result<usize, WorkerPoolError> {
        let handlers = self.handlers.read().clone();
        let activity_types = self.activity_types();
        let mut executed = 0;

        loop {
            let tasks = self
                .store
                .claim_task(
                    &self.config.worker_id,
                    &self.config.task_queue,
                    &activity_types,
                    self.config.max_concurrency,
                )
                .await?;
            if tasks.is_empty() {
                break;
            }

            executed += tasks.len();
            let runs = tasks.into_iter().map(|task| {
                let handler = handlers.get(&task.activity_type).cloned();
                let load = self.backpressure.task_started();
                let store = Arc::clone(&self.store);
                let reporter = Arc::clone(&self.reporter);
                let worker_id = self.config.worker_id.clone();
                async move {
                    execute_task(store, reporter, handler, task, worker_id).await;
                    drop(load);
                }
            });
            join_all(runs).await;
        }

        Ok(executed)
    }

    /// Get current status
    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    /// Get current load
    pub fn current_load(&self) -> usize {
        self.backpressure.current_load()
    }

    /// Get the worker ID
    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Get the pool configuration
    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Check if accepting tasks
    pub fn is_accepting(&self) -> bool {
        self.backpressure.is_accepting() && self.status() == WorkerPoolStatus::Running
    }

    /// Start the polling loop
    fn start_poll_loop(&self) {
        let store = Arc::clone(&self.store);
        let reporter = Arc::clone(&self.reporter);
        let config = self.config.clone();
        let backpressure = Arc::clone(&self.backpressure);
        let handlers = self.handlers.read().clone();
        let active_tasks = Arc::clone(&self.active_tasks);
        let shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut poller = TaskPoller::new(
                Arc::clone(&store),
                config.worker_id.clone(),
                config.task_queue.clone(),
                handlers.keys().cloned().collect(),
                config.poller.clone(),
                shutdown_rx,
            );

            loop {
                if poller.is_shutdown() {
                    debug!("Poll loop: shutdown requested");
                    break;
                }

                if !backpressure.should_accept() {
                    debug!("Poll loop: under backpressure, waiting");
                    if poller.wait().await {
                        break;
                    }
                    continue;
                }

                let available_slots = backpressure
                    .available_slots()
                    .min(active_tasks.available_permits());
                if available_slots == 0 {
                    if poller.wait().await {
                        break;
                    }
                    continue;
                }

                let claimed = match poller.poll(available_slots).await {
                    Ok(tasks) => tasks,
                    Err(PollerError::Shutdown) => break,
                    Err(e) => {
                        error!("Poll error: {}", e);
                        Vec::new()
                    }
                };
                let found_work = !claimed.is_empty();

                for task in claimed {
                    // Every claimed task gets a slot; claims never exceed free permits
                    let permit = match Arc::clone(&active_tasks).acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    let load = backpressure.task_started();
                    let handler = handlers.get(&task.activity_type).cloned();
                    let store = Arc::clone(&store);
                    let reporter = Arc::clone(&reporter);
                    let worker_id = config.worker_id.clone();

                    tokio::spawn(async move {
                        execute_task(store, reporter, handler, task, worker_id).await;
                        drop(load);
                        drop(permit);
                    });
                }

                // Keep draining while the queue has work
                if !found_work && poller.wait().await {
                    break;
                }
            }

            debug!("Poll loop exited");
        });

        *self.poll_handle.lock() = Some(handle);
    }

    /// Start the stale task reclamation loop
    fn start_reclaim_loop(&self) {
        let store = Arc::clone(&self.store);
        let interval = self.config.stale_reclaim_interval;
        let threshold = self.config.stale_threshold;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match store.reclaim_stale_tasks(threshold).await {
                            Ok(reclaimed) => {
                                if !reclaimed.is_empty() {
                                    info!(count = reclaimed.len(), "Reclaimed stale tasks");
                                }
                            }
                            Err(e) => {
                                error!("Stale task reclamation failed: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Reclaim loop: shutdown requested");
                        break;
                    }
                }
            }

            debug!("Reclaim loop exited");
        });

        *self.reclaim_handle.lock() = Some(handle);
    }
}

/// Run one attempt of a claimed task and settle it
///
/// A success is reported before the task is settled, so a failed report leaves
/// the task claimed for stale reclamation to run again. A failure is settled
/// first and the store's retry decision is what gets reported. Settling is
/// fenced on `(worker_id, attempt)`; once another worker has reclaimed the
/// task, this attempt's outcome is dropped.
async fn execute_task<S: WorkflowEventStore>(
    store: Arc<S>,
    reporter: Arc<dyn ActivityReporter>,
    handler: Option<ActivityHandler>,
    task: ClaimedTask,
    worker_id: String,
) {
    let task_id = task.id;

    if let Err(e) = reporter.activity_started(&task, &worker_id).await {
        warn!(%task_id, "Failed to record attempt start: {:#}", e);
    }

    let outcome = match handler {
        Some(handler) => {
            let ctx = ActivityContext::for_task(&task, &worker_id);
            let timeout = task.options.start_to_close_timeout;
            match tokio::time::timeout(timeout, handler(ctx, task.input.clone())).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ActivityError::timed_out(timeout)),
            }
        }
        None => Err(ActivityError::no_handler(&task.activity_type)),
    };

    match outcome {
        Ok(output) => {
            debug!(
                %task_id,
                activity_id = %task.activity_id,
                attempt = task.attempt,
                "Activity attempt succeeded"
            );
            if let Err(e) = reporter.activity_completed(&task, output.clone()).await {
                error!(%task_id, "Failed to record activity completion: {:#}", e);
                return;
            }
            match store
                .complete_task(task_id, &worker_id, task.attempt, output)
                .await
            {
                Ok(()) => {}
                Err(StoreError::StaleClaim { .. }) => {
                    debug!(
                        %task_id,
                        attempt = task.attempt,
                        "Claim lost before completion settled"
                    );
                }
                Err(e) => error!(%task_id, "Failed to complete task: {}", e),
            }
        }
        Err(activity_error) => {
            let settled = store
                .fail_task(task_id, &worker_id, task.attempt, &activity_error)
                .await;
            let failure = match settled {
                Ok(failure) => failure,
                Err(StoreError::StaleClaim { .. }) => {
                    debug!(
                        %task_id,
                        attempt = task.attempt,
                        error = %activity_error,
                        "Claim lost, dropping failed attempt"
                    );
                    return;
                }
                Err(e) => {
                    error!(%task_id, "Failed to fail task: {}", e);
                    return;
                }
            };

            let will_retry = failure.will_retry();
            warn!(
                %task_id,
                activity_id = %task.activity_id,
                attempt = task.attempt,
                will_retry,
                error = %activity_error,
                "Activity attempt failed"
            );
            if let TaskFailureOutcome::WillRetry {
                next_attempt,
                delay,
            } = failure
            {
                debug!(
                    %task_id,
                    next_attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduled retry"
                );
            }
            if let Err(e) = reporter
                .activity_failed(&task, &activity_error, will_retry)
                .await
            {
                error!(%task_id, "Failed to record activity failure: {:#}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{InMemoryWorkflowEventStore, TaskDefinition, TaskStatus};
    use crate::reliability::RetryPolicy;
    use crate::workflow::ActivityOptions;
    use crate::worker::NoopReporter;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Notify;

    struct EchoActivity;

    #[derive(Default)]
    struct RecordingReporter {
        completed: AtomicU32,
        failures: Mutex<Vec<(u32, bool)>>,
    }

    #[async_trait]
    impl ActivityReporter for RecordingReporter {
        async fn activity_started(
            &self,
            _task: &ClaimedTask,
            _worker_id: &str,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        async fn activity_completed(
            &self,
            _task: &ClaimedTask,
            _result: Value,
        ) -> anyhow::Result<()> {
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn activity_failed(
            &self,
            task: &ClaimedTask,
            _error: &ActivityError,
            will_retry: bool,
        ) -> anyhow::Result<()> {
            self.failures.lock().push((task.attempt, will_retry));
            Ok(())
        }
    }

    /// Registers `blocking` on `pool`: signals `started`, then fails once `release` fires
    fn register_blocking_failure(
        pool: &WorkerPool<InMemoryWorkflowEventStore>,
        started: Arc<Notify>,
        release: Arc<Notify>,
    ) {
        pool.register_handler("blocking", move |_ctx, _input| {
            let started = Arc::clone(&started);
            let release = Arc::clone(&release);
            async move {
                started.notify_one();
                release.notified().await;
                Err(ActivityError::retryable("traffic provider unavailable"))
            }
        });
    }

    #[async_trait]
    impl Activity for EchoActivity {
        const TYPE: &'static str = "echo";
        type Input = String;
        type Output = String;

        async fn execute(
            &self,
            ctx: &ActivityContext,
            input: Self::Input,
        ) -> Result<Self::Output, ActivityError> {
            Ok(format!("{input}#{}", ctx.attempt))
        }
    }

    fn pool(store: Arc<InMemoryWorkflowEventStore>) -> WorkerPool<InMemoryWorkflowEventStore> {
        WorkerPool::new(
            store,
            Arc::new(NoopReporter),
            WorkerPoolConfig::new("q").with_worker_id("test-worker"),
        )
    }

    async fn enqueue(
        store: &InMemoryWorkflowEventStore,
        activity_type: &str,
        input: Value,
        options: ActivityOptions,
    ) -> Uuid {
        store
            .enqueue_task(TaskDefinition {
                workflow_id: Uuid::now_v7(),
                activity_id: "a-1".to_string(),
                activity_type: activity_type.to_string(),
                task_queue: "q".to_string(),
                input,
                options: options.with_task_queue("q"),
            })
            .await
            .unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = WorkerPoolConfig::default();
        assert!(config.worker_id.starts_with("worker-"));
        assert_eq!(config.task_queue, DEFAULT_TASK_QUEUE);
        assert_eq!(config.max_concurrency, 10);
    }

    #[test]
    fn test_config_builder() {
        let config = WorkerPoolConfig::new("notifications")
            .with_worker_id("test-worker")
            .with_max_concurrency(0)
            .with_stale_reclaim(Duration::from_secs(5), Duration::from_secs(20));

        assert_eq!(config.task_queue, "notifications");
        assert_eq!(config.worker_id, "test-worker");
        assert_eq!(config.max_concurrency, 1);
        assert_eq!(config.stale_threshold, Duration::from_secs(20));
    }

    #[tokio::test]
    async fn test_run_once_executes_typed_activity() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let pool = pool(Arc::clone(&store));
        pool.register_activity(EchoActivity);

        let task_id = enqueue(&store, "echo", serde_json::json!("hi"), Default::default()).await;

        assert_eq!(pool.run_once().await.unwrap(), 1);
        assert_eq!(store.task_status(task_id), Some(TaskStatus::Completed));
        assert_eq!(pool.current_load(), 0);
    }

    #[tokio::test]
    async fn test_invalid_input_is_not_retried() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let pool = pool(Arc::clone(&store));
        pool.register_activity(EchoActivity);

        let task_id = enqueue(&store, "echo", serde_json::json!(42), Default::default()).await;

        assert_eq!(pool.run_once().await.unwrap(), 1);
        assert_eq!(store.task_status(task_id), Some(TaskStatus::Failed));
        let error = store.task_last_error(task_id).unwrap();
        assert_eq!(error.code.as_deref(), Some("INVALID_INPUT"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retryable_failure() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let pool = pool(Arc::clone(&store));
        pool.register_handler("slow", |_ctx, _input| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(Value::Null)
        });

        let options = ActivityOptions::default()
            .with_start_to_close_timeout(Duration::from_secs(1))
            .with_retry(RetryPolicy::fixed(Duration::from_secs(5), 2));
        let task_id = enqueue(&store, "slow", Value::Null, options).await;

        assert_eq!(pool.run_once().await.unwrap(), 1);
        assert_eq!(store.task_status(task_id), Some(TaskStatus::Pending));
        let error = store.task_last_error(task_id).unwrap();
        assert_eq!(error.code.as_deref(), Some("TIMEOUT"));
        assert!(error.retryable);

        // Hidden until the backoff has elapsed
        assert_eq!(pool.run_once().await.unwrap(), 0);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(pool.run_once().await.unwrap(), 1);
        assert_eq!(store.task_status(task_id), Some(TaskStatus::Failed));
    }

    #[tokio::test]
    async fn test_start_requires_activities() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let pool = pool(store);
        assert!(matches!(pool.start(), Err(WorkerPoolError::NoActivities)));
        assert_eq!(pool.status(), WorkerPoolStatus::Stopped);
    }

    #[tokio::test]
    async fn test_background_loop_runs_and_shuts_down() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let pool = pool(Arc::clone(&store));
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);
        pool.register_handler("count", move |_ctx, _input| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        });

        pool.start().unwrap();
        assert!(matches!(pool.start(), Err(WorkerPoolError::AlreadyRunning)));
        assert!(pool.is_accepting());

        let task_id = enqueue(&store, "count", Value::Null, Default::default()).await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while store.task_status(task_id) != Some(TaskStatus::Completed) {
            assert!(tokio::time::Instant::now() < deadline, "task never completed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        pool.shutdown().await.unwrap();
        assert_eq!(pool.status(), WorkerPoolStatus::Stopped);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_late_failure_after_reclaim_is_dropped() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let reporter = Arc::new(RecordingReporter::default());
        let pool = WorkerPool::new(
            Arc::clone(&store),
            reporter.clone(),
            WorkerPoolConfig::new("q").with_worker_id("worker-a"),
        );
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        register_blocking_failure(&pool, Arc::clone(&started), Arc::clone(&release));

        let options =
            ActivityOptions::default().with_retry(RetryPolicy::fixed(Duration::from_secs(1), 3));
        let task_id = enqueue(&store, "blocking", Value::Null, options).await;

        // worker-a is presumed dead and worker-b takes over while a is still running
        let takeover = async {
            started.notified().await;
            store.reclaim_stale_tasks(Duration::ZERO).await.unwrap();
            let claimed = store
                .claim_task("worker-b", "q", &["blocking".to_string()], 1)
                .await
                .unwrap();
            release.notify_one();
            claimed
        };
        let (ran, claimed) = tokio::join!(pool.run_once(), takeover);

        assert_eq!(ran.unwrap(), 1);
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attempt, 2);
        assert_eq!(store.task_status(task_id), Some(TaskStatus::Claimed));
        assert!(store.task_last_error(task_id).is_none());
        assert!(reporter.failures.lock().is_empty());

        // Nobody else can pick up worker-b's attempt
        let third = store
            .claim_task("worker-c", "q", &["blocking".to_string()], 1)
            .await
            .unwrap();
        assert!(third.is_empty());

        store
            .complete_task(task_id, "worker-b", 2, Value::Null)
            .await
            .unwrap();
        assert_eq!(store.task_status(task_id), Some(TaskStatus::Completed));
    }

    #[tokio::test]
    async fn test_reported_retry_follows_store_decision() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let reporter = Arc::new(RecordingReporter::default());
        let pool = WorkerPool::new(
            Arc::clone(&store),
            reporter.clone(),
            WorkerPoolConfig::new("q").with_worker_id("worker-a"),
        );
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        register_blocking_failure(&pool, Arc::clone(&started), Arc::clone(&release));

        let workflow_id = Uuid::now_v7();
        let task_id = store
            .enqueue_task(TaskDefinition {
                workflow_id,
                activity_id: "fetch-traffic".to_string(),
                activity_type: "blocking".to_string(),
                task_queue: "q".to_string(),
                input: Value::Null,
                options: ActivityOptions::default()
                    .with_retry(RetryPolicy::fixed(Duration::from_secs(1), 5))
                    .with_task_queue("q"),
            })
            .await
            .unwrap();

        // The policy alone would retry; the instance is cancelled mid-attempt
        let cancel = async {
            started.notified().await;
            let cancelled = store.cancel_tasks(workflow_id).await.unwrap();
            release.notify_one();
            cancelled
        };
        let (ran, cancelled) = tokio::join!(pool.run_once(), cancel);

        assert_eq!(ran.unwrap(), 1);
        assert_eq!(cancelled, 1);
        assert_eq!(store.task_status(task_id), Some(TaskStatus::Cancelled));
        assert_eq!(*reporter.failures.lock(), vec![(1, false)]);
        assert_eq!(reporter.completed.load(Ordering::SeqCst), 0);
    }
}
