//! The workflow contract: a replayable decision function over step outcomes

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use super::WorkflowAction;
use crate::activity::ActivityError;

/// Why an instance ended in error, as written to history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl WorkflowError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for WorkflowError {}

/// A recorded step result the workflow cannot accept
///
/// History that no longer decodes was written by different workflow code,
/// so the executor treats this as nondeterminism.
#[derive(Debug, thiserror::Error)]
pub enum StepDecodeError {
    #[error("unknown step {0:?}")]
    UnknownStep(String),

    #[error("malformed {step} result: {source}")]
    Malformed {
        step: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Decode the recorded result of `step` into `T`
pub fn decode_step_result<T: DeserializeOwned>(
    step: &str,
    result: Value,
) -> Result<T, StepDecodeError> {
    serde_json::from_value(result).map_err(|source| StepDecodeError::Malformed {
        step: step.to_string(),
        source,
    })
}

/// A deterministic state machine over step outcomes
///
/// The executor rebuilds an instance with [`Workflow::new`] and feeds it
/// every outcome in its history, in order, each time something new happens.
/// Given the same history it must ask for the same actions, so anything
/// that varies between runs (clocks, randomness, I/O) happens inside a step
/// whose result is recorded.
///
/// Step results reach the workflow already decoded into [`Workflow::Step`].
/// A result that does not decode fails the instance as nondeterministic
/// before the workflow sees it.
///
/// ```ignore
/// use delaywatch_durable::prelude::*;
///
/// struct EtaCheck {
///     leg: Leg,
///     eta: Option<u32>,
/// }
///
/// impl Workflow for EtaCheck {
///     const TYPE: &'static str = "eta_check";
///     type Input = Leg;
///     type Output = u32;
///     type Step = u32;
///
///     fn new(leg: Leg) -> Self {
///         Self { leg, eta: None }
///     }
///
///     fn on_start(&mut self) -> Vec<WorkflowAction> {
///         vec![WorkflowAction::schedule_activity("lookup_eta", "lookup_eta", json!(self.leg))]
///     }
///
///     fn decode_step(step: &str, result: Value) -> Result<u32, StepDecodeError> {
///         decode_step_result(step, result)
///     }
///
///     fn on_step_completed(&mut self, _step: &str, eta: u32) -> Vec<WorkflowAction> {
///         self.eta = Some(eta);
///         vec![WorkflowAction::complete(json!(eta))]
///     }
///
///     fn on_step_failed(&mut self, step: &str, error: &ActivityError) -> Vec<WorkflowAction> {
///         vec![WorkflowAction::fail(WorkflowError::new(format!("{step}: {error}")))]
///     }
///
///     fn is_completed(&self) -> bool {
///         self.eta.is_some()
///     }
///
///     fn result(&self) -> Option<u32> {
///         self.eta
///     }
/// }
/// ```
pub trait Workflow: Send + Sync + 'static {
    /// Workflow type, stored with each instance and used to rebuild it
    const TYPE: &'static str;

    type Input: Serialize + DeserializeOwned + Send + Clone;

    type Output: Serialize + DeserializeOwned + Send;

    /// Decoded result of any of this workflow's steps
    type Step: Send;

    fn new(input: Self::Input) -> Self;

    fn on_start(&mut self) -> Vec<WorkflowAction>;

    /// Decode the recorded result of the step with id `activity_id`
    fn decode_step(activity_id: &str, result: Value) -> Result<Self::Step, StepDecodeError>;

    fn on_step_completed(&mut self, activity_id: &str, step: Self::Step) -> Vec<WorkflowAction>;

    /// A step failed and no further attempt will be made
    fn on_step_failed(&mut self, activity_id: &str, error: &ActivityError)
        -> Vec<WorkflowAction>;

    fn is_completed(&self) -> bool;

    fn result(&self) -> Option<Self::Output>;

    fn error(&self) -> Option<WorkflowError> {
        None
    }
}
