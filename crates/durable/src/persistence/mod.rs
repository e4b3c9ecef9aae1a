//! Persistence layer for durable execution
//!
//! This module provides:
//! - [`WorkflowEventStore`] trait for workflow history and the task queue
//! - [`InMemoryWorkflowEventStore`] for tests and demos
//! - [`PostgresWorkflowEventStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryWorkflowEventStore;
pub use postgres::{PostgresWorkflowEventStore, MIGRATOR};
pub use store::{
    ClaimedTask, StoreError, TaskDefinition, TaskFailureOutcome, TaskStatus, WorkflowEventStore,
    WorkflowInfo, WorkflowStatus,
};
