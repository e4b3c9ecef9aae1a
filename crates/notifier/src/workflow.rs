//! The delay notification workflow
//!
//! An explicit state machine driven only by recorded step results:
//!
//! ```text
//! Started → FetchingTraffic → EvaluatingThreshold ─┬─→ NoActionNeeded
//!                                                  └─→ ComposingMessage → SendingPrimary ─┬─→ Completed
//!                                                                                         └─→ SendingFallback ─┬─→ Completed
//!                                                                                                              └─→ Failed
//! (any state) → Errored
//! ```
//!
//! `NoActionNeeded`, `Completed` and `Failed` finish the engine workflow with
//! a [`TerminalResult`]; `Errored` fails it with a [`WorkflowError`].

use std::fmt;

use delaywatch_durable::{
    decode_step_result, Activity, ActivityError, ActivityOptions, RetryPolicy, StepDecodeError,
    Workflow, WorkflowAction, WorkflowError,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::activities::{
    ComposeMessageActivity, FetchTrafficActivity, SendFallbackActivity, SendPrimaryActivity,
};
use crate::types::{
    subject_for, ComposedMessage, CompositionContext, InputError, Notification,
    NotificationOutcome, Route, TerminalResult, TrafficSnapshot,
};

/// Task queue the notifier uses unless configured otherwise
pub const DEFAULT_NOTIFIER_QUEUE: &str = "delay-notifications";

/// Error code for a history the workflow cannot make sense of
pub const NONDETERMINISM: &str = "NONDETERMINISM";

/// Submission for one delay check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelayCheckInput {
    pub route: Route,
    pub customer_contact: String,
    pub delay_threshold_minutes: u32,
    /// Where and how the steps run; recorded with the input so replay sees
    /// the same options
    #[serde(default)]
    pub dispatch: DispatchOptions,
}

impl DelayCheckInput {
    pub fn new(
        route: Route,
        customer_contact: impl Into<String>,
        delay_threshold_minutes: u32,
    ) -> Self {
        Self {
            route,
            customer_contact: customer_contact.into(),
            delay_threshold_minutes,
            dispatch: DispatchOptions::default(),
        }
    }

    pub fn with_dispatch(mut self, dispatch: DispatchOptions) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn validate(&self) -> Result<(), InputError> {
        self.route.validate()?;
        let contact = self.customer_contact.trim();
        if contact.is_empty() || contact.chars().any(char::is_control) {
            return Err(InputError::MalformedContact(self.customer_contact.clone()));
        }
        Ok(())
    }
}

/// Queue and retry settings applied to every scheduled step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DispatchOptions {
    pub task_queue: String,
    pub retry: StepRetryPolicies,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            task_queue: DEFAULT_NOTIFIER_QUEUE.to_string(),
            retry: StepRetryPolicies::default(),
        }
    }
}

/// Retry policy per step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StepRetryPolicies {
    pub fetch_traffic: RetryPolicy,
    pub compose_message: RetryPolicy,
    pub send_primary: RetryPolicy,
    pub send_fallback: RetryPolicy,
}

impl Default for StepRetryPolicies {
    fn default() -> Self {
        Self::uniform(RetryPolicy::exponential())
    }
}

impl StepRetryPolicies {
    /// Same policy for every step
    pub fn uniform(policy: RetryPolicy) -> Self {
        Self {
            fetch_traffic: policy.clone(),
            compose_message: policy.clone(),
            send_primary: policy.clone(),
            send_fallback: policy,
        }
    }

    /// Policy for a step, by activity type
    pub fn for_step(&self, step: &str) -> Option<&RetryPolicy> {
        match step {
            FetchTrafficActivity::TYPE => Some(&self.fetch_traffic),
            ComposeMessageActivity::TYPE => Some(&self.compose_message),
            SendPrimaryActivity::TYPE => Some(&self.send_primary),
            SendFallbackActivity::TYPE => Some(&self.send_fallback),
            _ => None,
        }
    }

    pub(crate) fn for_step_mut(&mut self, step: &str) -> Option<&mut RetryPolicy> {
        match step {
            FetchTrafficActivity::TYPE => Some(&mut self.fetch_traffic),
            ComposeMessageActivity::TYPE => Some(&mut self.compose_message),
            SendPrimaryActivity::TYPE => Some(&mut self.send_primary),
            SendFallbackActivity::TYPE => Some(&mut self.send_fallback),
            _ => None,
        }
    }
}

/// Typed result of a step, keyed by the step's activity id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", content = "result", rename_all = "snake_case")]
pub enum StepResult {
    FetchTraffic(TrafficSnapshot),
    ComposeMessage(ComposedMessage),
    SendPrimary(NotificationOutcome),
    SendFallback(NotificationOutcome),
}

impl StepResult {
    /// Decode a recorded activity result
    pub fn decode(activity_id: &str, result: Value) -> Result<Self, StepDecodeError> {
        match activity_id {
            FetchTrafficActivity::TYPE => {
                decode_step_result(activity_id, result).map(Self::FetchTraffic)
            }
            ComposeMessageActivity::TYPE => {
                decode_step_result(activity_id, result).map(Self::ComposeMessage)
            }
            SendPrimaryActivity::TYPE => {
                decode_step_result(activity_id, result).map(Self::SendPrimary)
            }
            SendFallbackActivity::TYPE => {
                decode_step_result(activity_id, result).map(Self::SendFallback)
            }
            other => Err(StepDecodeError::UnknownStep(other.to_string())),
        }
    }

    pub fn step(&self) -> &'static str {
        match self {
            Self::FetchTraffic(_) => FetchTrafficActivity::TYPE,
            Self::ComposeMessage(_) => ComposeMessageActivity::TYPE,
            Self::SendPrimary(_) => SendPrimaryActivity::TYPE,
            Self::SendFallback(_) => SendFallbackActivity::TYPE,
        }
    }
}

/// Where a delay check is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayCheckState {
    Started,
    FetchingTraffic,
    EvaluatingThreshold,
    NoActionNeeded,
    ComposingMessage,
    SendingPrimary,
    SendingFallback,
    Completed,
    Failed,
    Errored,
}

impl DelayCheckState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::NoActionNeeded | Self::Completed | Self::Failed | Self::Errored
        )
    }
}

impl fmt::Display for DelayCheckState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Started => "started",
            Self::FetchingTraffic => "fetching_traffic",
            Self::EvaluatingThreshold => "evaluating_threshold",
            Self::NoActionNeeded => "no_action_needed",
            Self::ComposingMessage => "composing_message",
            Self::SendingPrimary => "sending_primary",
            Self::SendingFallback => "sending_fallback",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// Notifies a customer when their route's delay exceeds the threshold
///
/// Holds no clock, randomness or configuration of its own: everything it
/// decides on comes from the input or from recorded step results.
#[derive(Debug)]
pub struct DelayNotificationWorkflow {
    input: DelayCheckInput,
    state: DelayCheckState,
    snapshot: Option<TrafficSnapshot>,
    notification: Option<Notification>,
    primary_failure: Option<String>,
    result: Option<TerminalResult>,
    error: Option<WorkflowError>,
}

impl DelayNotificationWorkflow {
    pub fn state(&self) -> DelayCheckState {
        self.state
    }

    pub fn snapshot(&self) -> Option<&TrafficSnapshot> {
        self.snapshot.as_ref()
    }

    fn delay_minutes(&self) -> u32 {
        self.snapshot
            .as_ref()
            .map(|s| s.estimated_delay_minutes)
            .unwrap_or_default()
    }

    fn schedule<T: Serialize>(&mut self, step: &'static str, input: &T) -> Vec<WorkflowAction> {
        let input = match serde_json::to_value(input) {
            Ok(input) => input,
            Err(e) => {
                return self.errored(WorkflowError::new(format!(
                    "could not encode {step} input: {e}"
                )))
            }
        };
        let dispatch = &self.input.dispatch;
        let mut options = ActivityOptions::default().with_task_queue(dispatch.task_queue.clone());
        if let Some(policy) = dispatch.retry.for_step(step) {
            options = options.with_retry(policy.clone());
        }
        vec![WorkflowAction::schedule_activity(step, step, input).with_options(options)]
    }

    fn finish(&mut self, state: DelayCheckState, result: TerminalResult) -> Vec<WorkflowAction> {
        match serde_json::to_value(&result) {
            Ok(value) => {
                self.state = state;
                self.result = Some(result);
                vec![WorkflowAction::complete(value)]
            }
            Err(e) => self.errored(WorkflowError::new(format!("could not encode result: {e}"))),
        }
    }

    fn errored(&mut self, error: WorkflowError) -> Vec<WorkflowAction> {
        self.state = DelayCheckState::Errored;
        self.error = Some(error.clone());
        vec![WorkflowAction::fail(error)]
    }

    fn unexpected(&mut self, what: String) -> Vec<WorkflowAction> {
        let message = format!("{what} while {}", self.state);
        self.errored(WorkflowError::new(message).with_code(NONDETERMINISM))
    }

    fn evaluate(&mut self, snapshot: TrafficSnapshot) -> Vec<WorkflowAction> {
        self.state = DelayCheckState::EvaluatingThreshold;
        let delay = snapshot.estimated_delay_minutes;
        let context = CompositionContext {
            delay_minutes: delay,
            route: snapshot.route.clone(),
            condition: snapshot.condition,
        };
        self.snapshot = Some(snapshot);

        if delay > self.input.delay_threshold_minutes {
            self.state = DelayCheckState::ComposingMessage;
            self.schedule(ComposeMessageActivity::TYPE, &context)
        } else {
            self.finish(
                DelayCheckState::NoActionNeeded,
                TerminalResult::no_action(delay),
            )
        }
    }

    fn send_primary(&mut self, text: String) -> Vec<WorkflowAction> {
        let delay = self.delay_minutes();
        let notification = Notification {
            contact: self.input.customer_contact.clone(),
            subject: subject_for(delay),
            text,
            delay_minutes: delay,
        };
        self.state = DelayCheckState::SendingPrimary;
        let actions = self.schedule(SendPrimaryActivity::TYPE, &notification);
        self.notification = Some(notification);
        actions
    }

    fn on_primary_outcome(&mut self, outcome: NotificationOutcome) -> Vec<WorkflowAction> {
        let Some(notification) = self.notification.clone() else {
            return self.unexpected("primary outcome without a notification".to_string());
        };
        if outcome.success {
            return self.finish(
                DelayCheckState::Completed,
                TerminalResult::sent(notification.delay_minutes, notification.text, false),
            );
        }

        self.primary_failure = Some(outcome.reason().to_string());
        self.state = DelayCheckState::SendingFallback;
        self.schedule(SendFallbackActivity::TYPE, &notification)
    }

    fn on_fallback_outcome(&mut self, outcome: NotificationOutcome) -> Vec<WorkflowAction> {
        let Some(notification) = self.notification.clone() else {
            return self.unexpected("fallback outcome without a notification".to_string());
        };
        let primary = self
            .primary_failure
            .clone()
            .unwrap_or_else(|| "unknown reason".to_string());

        if outcome.success {
            let message = format!(
                "{}\n\n(Sent via fallback channel; primary channel failed: {})",
                notification.text, primary
            );
            self.finish(
                DelayCheckState::Completed,
                TerminalResult::sent(notification.delay_minutes, message, true),
            )
        } else {
            let error = format!("primary: {}; fallback: {}", primary, outcome.reason());
            self.finish(
                DelayCheckState::Failed,
                TerminalResult::undelivered(notification.delay_minutes, error),
            )
        }
    }
}

impl Workflow for DelayNotificationWorkflow {
    const TYPE: &'static str = "delay_notification";
    type Input = DelayCheckInput;
    type Output = TerminalResult;
    type Step = StepResult;

    fn new(input: Self::Input) -> Self {
        Self {
            input,
            state: DelayCheckState::Started,
            snapshot: None,
            notification: None,
            primary_failure: None,
            result: None,
            error: None,
        }
    }

    fn on_start(&mut self) -> Vec<WorkflowAction> {
        if let Err(e) = self.input.validate() {
            return self.errored(WorkflowError::new(e.to_string()).with_code("INVALID_INPUT"));
        }

        self.state = DelayCheckState::FetchingTraffic;
        let route = self.input.route.clone();
        self.schedule(FetchTrafficActivity::TYPE, &route)
    }

    fn decode_step(activity_id: &str, result: Value) -> Result<StepResult, StepDecodeError> {
        StepResult::decode(activity_id, result)
    }

    fn on_step_completed(&mut self, _activity_id: &str, step: StepResult) -> Vec<WorkflowAction> {
        match (self.state, step) {
            (DelayCheckState::FetchingTraffic, StepResult::FetchTraffic(snapshot)) => {
                self.evaluate(snapshot)
            }
            (DelayCheckState::ComposingMessage, StepResult::ComposeMessage(message)) => {
                self.send_primary(message.text)
            }
            (DelayCheckState::SendingPrimary, StepResult::SendPrimary(outcome)) => {
                self.on_primary_outcome(outcome)
            }
            (DelayCheckState::SendingFallback, StepResult::SendFallback(outcome)) => {
                self.on_fallback_outcome(outcome)
            }
            (_, step) => self.unexpected(format!("unexpected {} result", step.step())),
        }
    }

    fn on_step_failed(&mut self, activity_id: &str, error: &ActivityError) -> Vec<WorkflowAction> {
        if activity_id == ComposeMessageActivity::TYPE
            && self.state == DelayCheckState::ComposingMessage
        {
            // Composition never ends the workflow
            let template = self.snapshot.as_ref().map(|s| CompositionContext {
                delay_minutes: s.estimated_delay_minutes,
                route: s.route.clone(),
                condition: s.condition,
            });
            return match template {
                Some(context) => self.send_primary(context.template_message()),
                None => self.unexpected("compose failure before traffic".to_string()),
            };
        }

        let code = error
            .code
            .clone()
            .unwrap_or_else(|| "STEP_FAILED".to_string());
        self.errored(
            WorkflowError::new(format!("{activity_id} failed: {}", error.message)).with_code(code),
        )
    }

    fn is_completed(&self) -> bool {
        self.state.is_terminal()
    }

    fn result(&self) -> Option<Self::Output> {
        self.result.clone()
    }

    fn error(&self) -> Option<WorkflowError> {
        self.error.clone()
    }
}
