//! Activity outcome reporting

use async_trait::async_trait;
use serde_json::Value;

use crate::activity::ActivityError;
use crate::persistence::ClaimedTask;

/// Receives the outcome of every attempt a worker runs
///
/// The [`WorkflowExecutor`](crate::WorkflowExecutor) implements this to
/// record attempts in the workflow history and advance the workflow. A success
/// is reported before the task is settled, so a crash in between leaves the
/// task claimed and it is reclaimed and run again. A failure is reported after
/// the store has settled it, with the store's retry decision.
#[async_trait]
pub trait ActivityReporter: Send + Sync + 'static {
    /// An attempt was picked up by `worker_id`
    async fn activity_started(&self, task: &ClaimedTask, worker_id: &str) -> anyhow::Result<()>;

    /// The attempt produced `result`
    async fn activity_completed(&self, task: &ClaimedTask, result: Value) -> anyhow::Result<()>;

    /// The attempt failed; `will_retry` says whether another attempt follows
    async fn activity_failed(
        &self,
        task: &ClaimedTask,
        error: &ActivityError,
        will_retry: bool,
    ) -> anyhow::Result<()>;
}

/// Reporter that records nothing
///
/// Useful for workers whose tasks are not owned by a workflow.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

#[async_trait]
impl ActivityReporter for NoopReporter {
    async fn activity_started(&self, _task: &ClaimedTask, _worker_id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn activity_completed(&self, _task: &ClaimedTask, _result: Value) -> anyhow::Result<()> {
        Ok(())
    }

    async fn activity_failed(
        &self,
        _task: &ClaimedTask,
        _error: &ActivityError,
        _will_retry: bool,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}
