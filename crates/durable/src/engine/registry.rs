//! Rebuilding workflows from what an instance row stores
//!
//! An instance row only carries its workflow type and JSON input. The
//! registry maps the type back to a constructor and hides the concrete
//! workflow behind [`AnyWorkflow`], which also decodes step results on the
//! way in.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

use crate::activity::ActivityError;
use crate::workflow::{StepDecodeError, Workflow, WorkflowAction, WorkflowError};

/// A rebuilt workflow instance, driven with JSON
pub trait AnyWorkflow: Send + Sync {
    fn workflow_type(&self) -> &'static str;

    fn on_start(&mut self) -> Vec<WorkflowAction>;

    /// Decode a recorded result and hand it to the workflow
    fn on_step_completed(
        &mut self,
        activity_id: &str,
        result: Value,
    ) -> Result<Vec<WorkflowAction>, StepDecodeError>;

    fn on_step_failed(&mut self, activity_id: &str, error: &ActivityError) -> Vec<WorkflowAction>;

    fn is_completed(&self) -> bool;

    fn result_json(&self) -> Result<Option<Value>, serde_json::Error>;

    fn error(&self) -> Option<WorkflowError>;
}

struct Instance<W>(W);

impl<W: Workflow> AnyWorkflow for Instance<W> {
    fn workflow_type(&self) -> &'static str {
        W::TYPE
    }

    fn on_start(&mut self) -> Vec<WorkflowAction> {
        self.0.on_start()
    }

    fn on_step_completed(
        &mut self,
        activity_id: &str,
        result: Value,
    ) -> Result<Vec<WorkflowAction>, StepDecodeError> {
        let step = W::decode_step(activity_id, result)?;
        Ok(self.0.on_step_completed(activity_id, step))
    }

    fn on_step_failed(
        &mut self,
        activity_id: &str,
        error: &ActivityError,
    ) -> Vec<WorkflowAction> {
        self.0.on_step_failed(activity_id, error)
    }

    fn is_completed(&self) -> bool {
        self.0.is_completed()
    }

    fn result_json(&self) -> Result<Option<Value>, serde_json::Error> {
        self.0.result().map(serde_json::to_value).transpose()
    }

    fn error(&self) -> Option<WorkflowError> {
        self.0.error()
    }
}

/// Builds a workflow of one type from its stored input
pub type WorkflowFactory = fn(Value) -> Result<Box<dyn AnyWorkflow>, serde_json::Error>;

fn build<W: Workflow>(input: Value) -> Result<Box<dyn AnyWorkflow>, serde_json::Error> {
    let input: W::Input = serde_json::from_value(input)?;
    let workflow: Box<dyn AnyWorkflow> = Box::new(Instance(W::new(input)));
    Ok(workflow)
}

/// Workflow types this process can run, keyed by [`Workflow::TYPE`]
#[derive(Default)]
pub struct WorkflowRegistry {
    factories: BTreeMap<&'static str, WorkflowFactory>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `W`; a second registration of the same type is a no-op
    pub fn register<W: Workflow>(&mut self) -> &mut Self {
        self.factories.entry(W::TYPE).or_insert(build::<W>);
        self
    }

    pub fn contains(&self, workflow_type: &str) -> bool {
        self.factories.contains_key(workflow_type)
    }

    /// Registered workflow types, sorted
    pub fn types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.factories.keys().copied()
    }

    /// Rebuild a workflow from an instance's stored type and input
    pub fn create(
        &self,
        workflow_type: &str,
        input: Value,
    ) -> Result<Box<dyn AnyWorkflow>, RegistryError> {
        let factory = self
            .factories
            .get(workflow_type)
            .ok_or_else(|| RegistryError::UnknownWorkflowType(workflow_type.to_string()))?;

        factory(input).map_err(|source| RegistryError::InvalidInput {
            workflow_type: workflow_type.to_string(),
            source,
        })
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.types()).finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    #[error("stored input does not fit workflow {workflow_type}: {source}")]
    InvalidInput {
        workflow_type: String,
        #[source]
        source: serde_json::Error,
    },
}
