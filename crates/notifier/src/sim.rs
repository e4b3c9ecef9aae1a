//! Simulated collaborators
//!
//! Stand-ins for the traffic API, the message composer and the delivery
//! channels, used by the `delaywatch` binary and handy in tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use crate::collaborators::{
    ChannelError, ComposeError, MessageComposer, NotificationChannel, TrafficError, TrafficSource,
};
use crate::types::{CompositionContext, Notification, NotificationOutcome, Route, TrafficSnapshot};

/// Reports the same travel times for every route
#[derive(Debug, Clone)]
pub struct SimulatedTrafficSource {
    normal_duration_minutes: u32,
    delay_minutes: u32,
}

impl SimulatedTrafficSource {
    pub fn new(normal_duration_minutes: u32, delay_minutes: u32) -> Self {
        Self {
            normal_duration_minutes,
            delay_minutes,
        }
    }
}

#[async_trait]
impl TrafficSource for SimulatedTrafficSource {
    async fn fetch_traffic(&self, route: &Route) -> Result<TrafficSnapshot, TrafficError> {
        route
            .validate()
            .map_err(|e| TrafficError::InvalidRoute(e.to_string()))?;

        let current = self
            .normal_duration_minutes
            .saturating_add(self.delay_minutes);
        TrafficSnapshot::new(route.clone(), self.normal_duration_minutes, current)
            .map_err(|e| TrafficError::InvalidRoute(e.to_string()))
    }
}

/// Fills in the fixed delay template
#[derive(Debug, Clone, Default)]
pub struct TemplateComposer;

#[async_trait]
impl MessageComposer for TemplateComposer {
    async fn compose_message(&self, context: &CompositionContext) -> Result<String, ComposeError> {
        Ok(context.template_message())
    }
}

/// Writes notifications to the log instead of delivering them
///
/// Remembers the outcome per idempotency key, so a repeated send returns the
/// first outcome without logging a second delivery.
#[derive(Debug)]
pub struct LoggingChannel {
    name: String,
    reject_with: Option<String>,
    outcomes: Mutex<HashMap<String, NotificationOutcome>>,
    deliveries: AtomicUsize,
}

impl LoggingChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reject_with: None,
            outcomes: Mutex::new(HashMap::new()),
            deliveries: AtomicUsize::new(0),
        }
    }

    /// Reject every notification with `reason`
    pub fn rejecting(mut self, reason: impl Into<String>) -> Self {
        self.reject_with = Some(reason.into());
        self
    }

    /// Number of distinct notifications handled
    pub fn deliveries(&self) -> usize {
        self.deliveries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationChannel for LoggingChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(
        &self,
        notification: &Notification,
        idempotency_key: &str,
    ) -> Result<NotificationOutcome, ChannelError> {
        let mut outcomes = self.outcomes.lock();
        if let Some(outcome) = outcomes.get(idempotency_key) {
            return Ok(outcome.clone());
        }

        let n = self.deliveries.fetch_add(1, Ordering::SeqCst) + 1;
        let outcome = match &self.reject_with {
            Some(reason) => NotificationOutcome::rejected(reason.clone()),
            None => NotificationOutcome::delivered(format!("{}-{}", self.name, n)),
        };

        info!(
            channel = %self.name,
            contact = %notification.contact,
            subject = %notification.subject,
            success = outcome.success,
            "notification: {}",
            notification.text
        );

        outcomes.insert(idempotency_key.to_string(), outcome.clone());
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{subject_for, TrafficCondition};

    fn notification() -> Notification {
        Notification {
            contact: "ops@example.com".to_string(),
            subject: subject_for(40),
            text: "Running late".to_string(),
            delay_minutes: 40,
        }
    }

    #[tokio::test]
    async fn test_simulated_traffic() {
        let source = SimulatedTrafficSource::new(95, 40);
        let snapshot = source
            .fetch_traffic(&Route::new("A", "B"))
            .await
            .unwrap();
        assert_eq!(snapshot.estimated_delay_minutes, 40);
        assert_eq!(snapshot.current_duration_minutes, 135);
        assert_eq!(snapshot.condition, TrafficCondition::Heavy);

        let err = source.fetch_traffic(&Route::new("", "B")).await.unwrap_err();
        assert!(matches!(err, TrafficError::InvalidRoute(_)));
    }

    #[tokio::test]
    async fn test_logging_channel_deduplicates_by_key() {
        let channel = LoggingChannel::new("email");
        let first = channel.send(&notification(), "wf:send_primary").await.unwrap();
        let again = channel.send(&notification(), "wf:send_primary").await.unwrap();
        assert_eq!(first, again);
        assert_eq!(first.delivery_id.as_deref(), Some("email-1"));
        assert_eq!(channel.deliveries(), 1);

        channel.send(&notification(), "other:send_primary").await.unwrap();
        assert_eq!(channel.deliveries(), 2);
    }

    #[tokio::test]
    async fn test_rejecting_channel() {
        let channel = LoggingChannel::new("sms").rejecting("number disconnected");
        let outcome = channel.send(&notification(), "wf:send_fallback").await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.reason(), "number disconnected");
    }
}
