//! Wiring of executor, worker pool and client

use std::sync::Arc;

use delaywatch_durable::worker::ActivityReporter;
use delaywatch_durable::{
    ExecutorConfig, ExecutorError, RecoveryReport, WorkerPool, WorkerPoolConfig,
    WorkerPoolError, WorkflowEventStore, WorkflowExecutor,
};
use tracing::info;

use crate::activities::{
    ComposeMessageActivity, FetchTrafficActivity, SendFallbackActivity, SendPrimaryActivity,
};
use crate::client::NotifierClient;
use crate::collaborators::{MessageComposer, NotificationChannel, TrafficSource};
use crate::config::NotifierConfig;
use crate::workflow::DelayNotificationWorkflow;

/// The outside-world dependencies of the workflow's steps
#[derive(Clone)]
pub struct Collaborators {
    pub traffic: Arc<dyn TrafficSource>,
    pub composer: Arc<dyn MessageComposer>,
    pub primary: Arc<dyn NotificationChannel>,
    pub fallback: Arc<dyn NotificationChannel>,
}

/// A running delay notifier over one history store
pub struct NotifierService<S: WorkflowEventStore> {
    executor: Arc<WorkflowExecutor<S>>,
    pool: WorkerPool<S>,
    client: NotifierClient<S>,
}

impl<S: WorkflowEventStore> NotifierService<S> {
    pub fn new(store: Arc<S>, config: &NotifierConfig, collaborators: Collaborators) -> Self {
        let mut executor = WorkflowExecutor::with_config(
            Arc::clone(&store),
            ExecutorConfig {
                max_concurrent_decisions: config.max_concurrent_decisions,
                ..Default::default()
            },
        );
        executor.register::<DelayNotificationWorkflow>();
        let executor = Arc::new(executor);

        let reporter: Arc<dyn ActivityReporter> = executor.clone();
        let pool = WorkerPool::new(
            store,
            reporter,
            WorkerPoolConfig::new(config.qualified_task_queue())
                .with_worker_id(config.worker_id.clone())
                .with_max_concurrency(config.max_concurrent_activities),
        );
        pool.register_activity(FetchTrafficActivity::new(collaborators.traffic))
            .register_activity(ComposeMessageActivity::new(collaborators.composer))
            .register_activity(SendPrimaryActivity::new(collaborators.primary))
            .register_activity(SendFallbackActivity::new(collaborators.fallback));

        let client = NotifierClient::new(executor.clone(), config.dispatch());

        Self {
            executor,
            pool,
            client,
        }
    }

    /// Resume unfinished instances, then start the worker loops
    pub async fn start(&self) -> Result<RecoveryReport, ServiceError> {
        let report = self.recover().await?;
        self.pool.start()?;
        info!(
            worker_id = self.pool.worker_id(),
            task_queue = %self.pool.config().task_queue,
            "delay notifier started"
        );
        Ok(report)
    }

    /// Stop the worker loops, waiting for in-flight attempts
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        self.pool.shutdown().await?;
        info!("delay notifier stopped");
        Ok(())
    }

    /// Re-drive every unfinished instance from its history
    pub async fn recover(&self) -> Result<RecoveryReport, ServiceError> {
        Ok(self.executor.recover().await?)
    }

    /// Run every visible step on the calling task
    pub async fn run_once(&self) -> Result<usize, ServiceError> {
        Ok(self.pool.run_once().await?)
    }

    pub fn client(&self) -> &NotifierClient<S> {
        &self.client
    }

    pub fn executor(&self) -> &Arc<WorkflowExecutor<S>> {
        &self.executor
    }

    pub fn pool(&self) -> &WorkerPool<S> {
        &self.pool
    }
}

/// Errors from service lifecycle operations
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Pool(#[from] WorkerPoolError),
}
