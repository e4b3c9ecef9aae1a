//! Submission and result lookup for delay checks

use std::sync::Arc;
use std::time::Duration;

use delaywatch_durable::{
    ExecutorError, StoreError, WorkflowEventStore, WorkflowExecutor, WorkflowStatus,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::{Route, TerminalResult};
use crate::workflow::{DelayCheckInput, DelayNotificationWorkflow, DispatchOptions};

/// Errors from client operations
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("cannot decode result of {workflow_id}: {source}")]
    Decode {
        workflow_id: Uuid,
        #[source]
        source: serde_json::Error,
    },

    #[error("workflow {0} completed without a result")]
    MissingResult(Uuid),

    #[error("no result within {0:?}")]
    Timeout(Duration),
}

/// Starts delay checks and hands out handles to them
pub struct NotifierClient<S: WorkflowEventStore> {
    executor: Arc<WorkflowExecutor<S>>,
    dispatch: DispatchOptions,
    poll_interval: Duration,
}

impl<S: WorkflowEventStore> NotifierClient<S> {
    /// `executor` must have [`DelayNotificationWorkflow`] registered
    pub fn new(executor: Arc<WorkflowExecutor<S>>, dispatch: DispatchOptions) -> Self {
        Self {
            executor,
            dispatch,
            poll_interval: Duration::from_millis(100),
        }
    }

    /// How often [`DelayCheckHandle::await_result`] looks at the store
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Start a delay check under a fresh id
    pub async fn submit(
        &self,
        route: Route,
        customer_contact: impl Into<String>,
        delay_threshold_minutes: u32,
    ) -> Result<DelayCheckHandle<S>, ClientError> {
        self.submit_with_id(
            Uuid::now_v7(),
            route,
            customer_contact,
            delay_threshold_minutes,
        )
        .await
    }

    /// Start a delay check under a caller-chosen id
    ///
    /// Fails with [`StoreError::WorkflowAlreadyExists`] if the id was used
    /// before; use [`handle`](Self::handle) to attach to it instead.
    pub async fn submit_with_id(
        &self,
        instance_id: Uuid,
        route: Route,
        customer_contact: impl Into<String>,
        delay_threshold_minutes: u32,
    ) -> Result<DelayCheckHandle<S>, ClientError> {
        let input = DelayCheckInput::new(route, customer_contact, delay_threshold_minutes)
            .with_dispatch(self.dispatch.clone());

        self.executor
            .start_workflow::<DelayNotificationWorkflow>(instance_id, input)
            .await?;

        info!(%instance_id, "delay check submitted");
        Ok(self.handle(instance_id))
    }

    /// Handle to an existing instance
    pub fn handle(&self, instance_id: Uuid) -> DelayCheckHandle<S> {
        DelayCheckHandle {
            id: instance_id,
            executor: self.executor.clone(),
            poll_interval: self.poll_interval,
        }
    }
}

/// A submitted delay check
pub struct DelayCheckHandle<S: WorkflowEventStore> {
    id: Uuid,
    executor: Arc<WorkflowExecutor<S>>,
    poll_interval: Duration,
}

impl<S: WorkflowEventStore> Clone for DelayCheckHandle<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            executor: self.executor.clone(),
            poll_interval: self.poll_interval,
        }
    }
}

impl<S: WorkflowEventStore> DelayCheckHandle<S> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current engine status
    pub async fn status(&self) -> Result<WorkflowStatus, ClientError> {
        Ok(self.executor.store().get_workflow_status(self.id).await?)
    }

    /// Stop the instance; no further steps are scheduled
    pub async fn cancel(&self, reason: &str) -> Result<(), ClientError> {
        Ok(self.executor.cancel_workflow(self.id, reason).await?)
    }

    /// Result if the instance has finished, `None` while it is still running
    pub async fn try_result(&self) -> Result<Option<TerminalResult>, ClientError> {
        let info = self.executor.store().get_workflow_info(self.id).await?;
        let result = match info.status {
            WorkflowStatus::Pending | WorkflowStatus::Running => return Ok(None),
            WorkflowStatus::Completed => {
                let value = info.result.ok_or(ClientError::MissingResult(self.id))?;
                serde_json::from_value(value).map_err(|source| ClientError::Decode {
                    workflow_id: self.id,
                    source,
                })?
            }
            WorkflowStatus::Failed => TerminalResult::errored(
                info.error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "workflow failed".to_string()),
            ),
            WorkflowStatus::Cancelled => TerminalResult::errored("workflow cancelled"),
        };
        Ok(Some(result))
    }

    /// Wait until the instance finishes
    ///
    /// Waits indefinitely; an instance stuck on an infrastructure failure
    /// stays running until it is recovered.
    pub async fn await_result(&self) -> Result<TerminalResult, ClientError> {
        loop {
            if let Some(result) = self.try_result().await? {
                return Ok(result);
            }
            debug!(instance_id = %self.id, "waiting for delay check");
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// [`await_result`](Self::await_result) with an upper bound
    pub async fn await_result_within(
        &self,
        timeout: Duration,
    ) -> Result<TerminalResult, ClientError> {
        tokio::time::timeout(timeout, self.await_result())
            .await
            .map_err(|_| ClientError::Timeout(timeout))?
    }
}
