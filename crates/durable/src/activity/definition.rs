//! Step contract and the failure recorded for a failed attempt

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::ActivityContext;

/// Failure codes the engine itself assigns
pub mod codes {
    /// The attempt ran past its start-to-close timeout
    pub const TIMEOUT: &str = "TIMEOUT";
    /// The recorded input does not decode into the step's input type
    pub const INVALID_INPUT: &str = "INVALID_INPUT";
    /// The step's output could not be encoded for history
    pub const INVALID_OUTPUT: &str = "INVALID_OUTPUT";
    /// No worker on this queue knows the step's type
    pub const HANDLER_NOT_FOUND: &str = "HANDLER_NOT_FOUND";
}

/// A failed attempt, as written to history
///
/// `retryable` is the step's own verdict. The retry policy has the final word
/// and can also refuse to retry particular `code`s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub retryable: bool,
}

impl ActivityError {
    /// A transient failure; another attempt may succeed
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: true,
        }
    }

    /// A permanent failure; the step fails on this attempt
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: false,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn timed_out(limit: Duration) -> Self {
        Self::retryable(format!(
            "attempt exceeded start-to-close timeout of {}ms",
            limit.as_millis()
        ))
        .with_code(codes::TIMEOUT)
    }

    pub fn invalid_input(err: &serde_json::Error) -> Self {
        Self::non_retryable(format!("invalid input: {err}")).with_code(codes::INVALID_INPUT)
    }

    pub fn invalid_output(err: &serde_json::Error) -> Self {
        Self::non_retryable(format!("unserializable output: {err}"))
            .with_code(codes::INVALID_OUTPUT)
    }

    pub fn no_handler(activity_type: &str) -> Self {
        Self::non_retryable(format!(
            "no handler registered for activity type {activity_type}"
        ))
        .with_code(codes::HANDLER_NOT_FOUND)
    }

    pub fn has_code(&self, code: &str) -> bool {
        self.code.as_deref() == Some(code)
    }
}

impl fmt::Display for ActivityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{code}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ActivityError {}

/// One named step of a workflow, run by workers
///
/// Each call to [`Activity::execute`] is a single attempt. Retries and
/// their backoff belong to the engine, so an implementation reports the
/// failure and returns. A step may run again after a crash even though its
/// side effect already happened; steps that talk to the outside world
/// forward [`ActivityContext::idempotency_key`] so the far side can
/// deduplicate.
///
/// ```ignore
/// use delaywatch_durable::prelude::*;
///
/// struct LookupEta {
///     maps: Arc<dyn MapsClient>,
/// }
///
/// #[async_trait]
/// impl Activity for LookupEta {
///     const TYPE: &'static str = "lookup_eta";
///     type Input = Leg;
///     type Output = EtaMinutes;
///
///     async fn execute(
///         &self,
///         _ctx: &ActivityContext,
///         leg: Leg,
///     ) -> Result<EtaMinutes, ActivityError> {
///         let eta = self.maps.eta(&leg).await;
///         eta.map_err(|e| ActivityError::retryable(e.to_string()).with_code("MAPS_UNAVAILABLE"))
///     }
/// }
/// ```
#[async_trait]
pub trait Activity: Send + Sync + 'static {
    /// Activity type; claimed tasks are routed to the handler registered under it
    const TYPE: &'static str;

    type Input: Serialize + DeserializeOwned + Send;

    type Output: Serialize + DeserializeOwned + Send;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError>;
}
