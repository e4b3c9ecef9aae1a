//! Interfaces to the outside world
//!
//! The workflow never talks to these directly. Each one is wrapped by an
//! activity, and its errors are translated into retryable or terminal
//! [`ActivityError`]s there.

use async_trait::async_trait;
use delaywatch_durable::ActivityError;

use crate::types::{CompositionContext, Notification, NotificationOutcome, Route, TrafficSnapshot};

/// Source of live traffic data
#[async_trait]
pub trait TrafficSource: Send + Sync {
    async fn fetch_traffic(&self, route: &Route) -> Result<TrafficSnapshot, TrafficError>;
}

/// Traffic lookup failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrafficError {
    /// No data right now; worth retrying
    #[error("traffic data unavailable: {0}")]
    Unavailable(String),

    /// The route cannot be resolved
    #[error("invalid route: {0}")]
    InvalidRoute(String),
}

impl From<TrafficError> for ActivityError {
    fn from(err: TrafficError) -> Self {
        match &err {
            TrafficError::Unavailable(_) => {
                ActivityError::retryable(err.to_string()).with_code("TRAFFIC_UNAVAILABLE")
            }
            TrafficError::InvalidRoute(_) => {
                ActivityError::non_retryable(err.to_string()).with_code("INVALID_ROUTE")
            }
        }
    }
}

/// Writes the customer-facing message
#[async_trait]
pub trait MessageComposer: Send + Sync {
    async fn compose_message(&self, context: &CompositionContext) -> Result<String, ComposeError>;
}

/// Composition failure; always absorbed by the compose step
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("message composition failed: {0}")]
pub struct ComposeError(pub String);

/// A delivery channel such as email or SMS
///
/// `idempotency_key` is identical for every attempt of the same send, and
/// implementations must not deliver twice for one key.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Channel name used in logs
    fn name(&self) -> &str;

    /// Deliver `notification`
    ///
    /// A rejection by the provider is a successful call returning
    /// [`NotificationOutcome::rejected`]; `Err` is reserved for transport
    /// failures that may succeed on retry.
    async fn send(
        &self,
        notification: &Notification,
        idempotency_key: &str,
    ) -> Result<NotificationOutcome, ChannelError>;
}

/// Transport-level delivery failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("channel transport error: {0}")]
    Transport(String),

    #[error("channel timed out")]
    Timeout,
}

impl From<ChannelError> for ActivityError {
    fn from(err: ChannelError) -> Self {
        let code = match err {
            ChannelError::Transport(_) => "CHANNEL_TRANSPORT",
            ChannelError::Timeout => "CHANNEL_TIMEOUT",
        };
        ActivityError::retryable(err.to_string()).with_code(code)
    }
}
