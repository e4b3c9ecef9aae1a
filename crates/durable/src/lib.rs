//! # Durable Execution Engine
//!
//! An event-sourced workflow orchestration engine for reliable task execution,
//! backed by PostgreSQL or an in-memory store.
//!
//! ## Features
//!
//! - **Event-sourced workflows**: Every decision is appended to a per-instance history, enabling replay and recovery
//! - **Automatic retries**: Configurable retry policies with exponential backoff
//! - **Task queue**: Named queues with idempotent enqueue, retry visibility delays and stale-claim reclamation
//! - **Worker pools**: Concurrent attempts with backpressure, start-to-close timeouts and graceful shutdown
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowExecutor                        │
//! │  (drives workflow state machines, handles event replay)     │
//! └─────────────────────────────────────────────────────────────┘
//!                     │                       ▲
//!                     ▼                       │ ActivityReporter
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   WorkflowEventStore                         │
//! │  (PostgreSQL: durable_workflow_instances, events, tasks)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkerPool                              │
//! │  (claims tasks, executes activities, reports outcomes)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use delaywatch_durable::prelude::*;
//!
//! struct RouteWatch {
//!     route: Route,
//! }
//!
//! impl Workflow for RouteWatch {
//!     const TYPE: &'static str = "route_watch";
//!     type Input = Route;
//!     type Output = Report;
//!     type Step = TrafficReading;
//!
//!     fn new(route: Route) -> Self {
//!         Self { route }
//!     }
//!
//!     fn on_start(&mut self) -> Vec<WorkflowAction> {
//!         vec![WorkflowAction::schedule_activity("read", "read_traffic", json!(self.route))]
//!     }
//!
//!     fn decode_step(step: &str, result: Value) -> Result<TrafficReading, StepDecodeError> {
//!         decode_step_result(step, result)
//!     }
//!
//!     // on_step_completed, on_step_failed, is_completed, result
//! }
//! ```

pub mod activity;
pub mod engine;
pub mod persistence;
pub mod reliability;
pub mod worker;
pub mod workflow;

mod serde_util;

/// Prelude for common imports
pub mod prelude {
    pub use crate::activity::{Activity, ActivityContext, ActivityError};
    pub use crate::engine::{
        ExecutorConfig, ExecutorError, ProcessResult, ReplayState, WorkflowExecutor,
        WorkflowRegistry,
    };
    pub use crate::persistence::{
        ClaimedTask, InMemoryWorkflowEventStore, PostgresWorkflowEventStore, StoreError,
        TaskDefinition, WorkflowEventStore, WorkflowStatus,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::worker::{ActivityReporter, WorkerPool, WorkerPoolConfig, WorkerPoolError};
    pub use crate::workflow::{
        decode_step_result, ActivityOptions, StepDecodeError, StepStatus, Workflow,
        WorkflowAction, WorkflowError, WorkflowEvent,
    };
    pub use async_trait::async_trait;
}

// Re-export key types at crate root
pub use activity::{Activity, ActivityContext, ActivityError};
pub use engine::{
    ExecutorConfig, ExecutorError, ProcessResult, RecoveryReport, ReplayState, StepState,
    WorkflowExecutor, WorkflowRegistry,
};
pub use persistence::{
    InMemoryWorkflowEventStore, PostgresWorkflowEventStore, StoreError, WorkflowEventStore,
    WorkflowInfo, WorkflowStatus,
};
pub use reliability::{RetryDecision, RetryPolicy};
pub use worker::{ActivityReporter, WorkerPool, WorkerPoolConfig, WorkerPoolError};
pub use workflow::{
    decode_step_result, ActivityOptions, HistoryEntry, StepDecodeError, StepStatus, Workflow,
    WorkflowAction, WorkflowError, WorkflowEvent,
};
