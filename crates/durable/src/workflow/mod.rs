//! Workflow abstractions and types
//!
//! This module contains the core workflow primitives:
//! - [`Workflow`] trait for defining workflow state machines, with
//!   [`StepDecodeError`] for step results that do not fit it
//! - [`WorkflowAction`] enum for workflow commands
//! - [`WorkflowEvent`] enum for persisted history events
//! - [`HistoryEntry`] and [`StepStatus`] for inspecting an instance's log

mod action;
mod definition;
mod event;

pub use action::{ActivityOptions, WorkflowAction, DEFAULT_TASK_QUEUE};
pub use definition::{decode_step_result, StepDecodeError, Workflow, WorkflowError};
pub use event::{HistoryEntry, StepStatus, WorkflowEvent};
