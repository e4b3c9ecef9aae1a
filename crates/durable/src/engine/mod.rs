//! Workflow execution engine
//!
//! The engine module provides the `WorkflowExecutor` which drives workflow
//! state machines by replaying their history and applying the actions they
//! return.

mod executor;
mod registry;

pub use executor::{
    ExecutorConfig, ExecutorError, ProcessResult, RecoveryReport, ReplayState, StepState,
    WorkflowExecutor,
};
pub use registry::{AnyWorkflow, RegistryError, WorkflowFactory, WorkflowRegistry};
