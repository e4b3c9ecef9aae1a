//! Activities for the delay notification workflow
//!
//! One activity per step. Each is constructed with the collaborator it wraps
//! and runs exactly one attempt per call.

use std::sync::Arc;

use async_trait::async_trait;
use delaywatch_durable::{Activity, ActivityContext, ActivityError};
use tracing::{debug, info, warn};

use crate::collaborators::{MessageComposer, NotificationChannel, TrafficSource};
use crate::types::{
    ComposedMessage, CompositionContext, Notification, NotificationOutcome, Route,
    TrafficSnapshot,
};

/// Fetches and checks the traffic snapshot for a route
pub struct FetchTrafficActivity {
    source: Arc<dyn TrafficSource>,
}

impl FetchTrafficActivity {
    pub fn new(source: Arc<dyn TrafficSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl Activity for FetchTrafficActivity {
    const TYPE: &'static str = "fetch_traffic";
    type Input = Route;
    type Output = TrafficSnapshot;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        route: Route,
    ) -> Result<TrafficSnapshot, ActivityError> {
        let snapshot = self.source.fetch_traffic(&route).await?;

        snapshot.validate().map_err(|e| {
            ActivityError::non_retryable(format!("traffic source returned bad snapshot: {e}"))
                .with_code("INVALID_SNAPSHOT")
        })?;

        debug!(
            workflow_id = %ctx.workflow_id,
            attempt = ctx.attempt,
            delay_minutes = snapshot.estimated_delay_minutes,
            condition = %snapshot.condition,
            "fetched traffic"
        );
        Ok(snapshot)
    }
}

/// Composes the notification text, degrading to a template on any failure
pub struct ComposeMessageActivity {
    composer: Arc<dyn MessageComposer>,
}

impl ComposeMessageActivity {
    pub fn new(composer: Arc<dyn MessageComposer>) -> Self {
        Self { composer }
    }
}

#[async_trait]
impl Activity for ComposeMessageActivity {
    const TYPE: &'static str = "compose_message";
    type Input = CompositionContext;
    type Output = ComposedMessage;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        context: CompositionContext,
    ) -> Result<ComposedMessage, ActivityError> {
        match self.composer.compose_message(&context).await {
            Ok(text) if !text.trim().is_empty() => Ok(ComposedMessage {
                text,
                degraded: false,
            }),
            Ok(_) => {
                warn!(
                    workflow_id = %ctx.workflow_id,
                    "composer returned empty text, using template"
                );
                Ok(degraded(&context))
            }
            Err(e) => {
                warn!(
                    workflow_id = %ctx.workflow_id,
                    error = %e,
                    "composer failed, using template"
                );
                Ok(degraded(&context))
            }
        }
    }
}

fn degraded(context: &CompositionContext) -> ComposedMessage {
    ComposedMessage {
        text: context.template_message(),
        degraded: true,
    }
}

/// Sends on one channel; used for both the primary and the fallback step
async fn send_on(
    channel: &dyn NotificationChannel,
    ctx: &ActivityContext,
    notification: &Notification,
) -> Result<NotificationOutcome, ActivityError> {
    let outcome = channel.send(notification, &ctx.idempotency_key()).await?;

    if !outcome.is_well_formed() {
        return Err(ActivityError::non_retryable(format!(
            "channel {} returned a malformed outcome",
            channel.name()
        ))
        .with_code("INVALID_OUTCOME"));
    }

    if outcome.success {
        info!(
            workflow_id = %ctx.workflow_id,
            channel = channel.name(),
            delivery_id = outcome.delivery_id.as_deref().unwrap_or_default(),
            "notification delivered"
        );
    } else {
        warn!(
            workflow_id = %ctx.workflow_id,
            channel = channel.name(),
            reason = outcome.reason(),
            "notification rejected"
        );
    }
    Ok(outcome)
}

/// Sends the notification on the primary channel
pub struct SendPrimaryActivity {
    channel: Arc<dyn NotificationChannel>,
}

impl SendPrimaryActivity {
    pub fn new(channel: Arc<dyn NotificationChannel>) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl Activity for SendPrimaryActivity {
    const TYPE: &'static str = "send_primary";
    type Input = Notification;
    type Output = NotificationOutcome;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        notification: Notification,
    ) -> Result<NotificationOutcome, ActivityError> {
        send_on(self.channel.as_ref(), ctx, &notification).await
    }
}

/// Sends the notification on the fallback channel
pub struct SendFallbackActivity {
    channel: Arc<dyn NotificationChannel>,
}

impl SendFallbackActivity {
    pub fn new(channel: Arc<dyn NotificationChannel>) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl Activity for SendFallbackActivity {
    const TYPE: &'static str = "send_fallback";
    type Input = Notification;
    type Output = NotificationOutcome;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        notification: Notification,
    ) -> Result<NotificationOutcome, ActivityError> {
        send_on(self.channel.as_ref(), ctx, &notification).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{ChannelError, ComposeError, TrafficError};
    use crate::types::{subject_for, TrafficCondition};
    use parking_lot::Mutex;
    use uuid::Uuid;

    fn ctx(activity_id: &str) -> ActivityContext {
        ActivityContext::new(Uuid::now_v7(), activity_id.to_string(), 1, 3)
    }

    fn route() -> Route {
        Route::new("New York, NY", "Philadelphia, PA")
    }

    struct FixedTraffic(Result<TrafficSnapshot, TrafficError>);

    #[async_trait]
    impl TrafficSource for FixedTraffic {
        async fn fetch_traffic(&self, _route: &Route) -> Result<TrafficSnapshot, TrafficError> {
            self.0.clone()
        }
    }

    struct FixedComposer(Result<String, ComposeError>);

    #[async_trait]
    impl MessageComposer for FixedComposer {
        async fn compose_message(&self, _ctx: &CompositionContext) -> Result<String, ComposeError> {
            self.0.clone()
        }
    }

    struct RecordingChannel {
        keys: Mutex<Vec<String>>,
        reply: Result<NotificationOutcome, ChannelError>,
    }

    #[async_trait]
    impl NotificationChannel for RecordingChannel {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send(
            &self,
            _notification: &Notification,
            idempotency_key: &str,
        ) -> Result<NotificationOutcome, ChannelError> {
            self.keys.lock().push(idempotency_key.to_string());
            self.reply.clone()
        }
    }

    fn context() -> CompositionContext {
        CompositionContext {
            delay_minutes: 45,
            route: route(),
            condition: TrafficCondition::Severe,
        }
    }

    fn notification() -> Notification {
        Notification {
            contact: "ops@example.com".to_string(),
            subject: subject_for(45),
            text: "Running late".to_string(),
            delay_minutes: 45,
        }
    }

    #[tokio::test]
    async fn test_fetch_traffic_passes_valid_snapshot() {
        let snapshot = TrafficSnapshot::new(route(), 95, 140).unwrap();
        let activity = FetchTrafficActivity::new(Arc::new(FixedTraffic(Ok(snapshot.clone()))));

        let fetched = activity.execute(&ctx("fetch_traffic"), route()).await.unwrap();
        assert_eq!(fetched, snapshot);
    }

    #[tokio::test]
    async fn test_fetch_traffic_rejects_inconsistent_snapshot() {
        let mut snapshot = TrafficSnapshot::new(route(), 95, 140).unwrap();
        snapshot.condition = TrafficCondition::Light;
        let activity = FetchTrafficActivity::new(Arc::new(FixedTraffic(Ok(snapshot))));

        let err = activity
            .execute(&ctx("fetch_traffic"), route())
            .await
            .unwrap_err();
        assert!(!err.retryable);
        assert_eq!(err.code.as_deref(), Some("INVALID_SNAPSHOT"));
    }

    #[tokio::test]
    async fn test_fetch_traffic_maps_unavailable_to_retryable() {
        let activity = FetchTrafficActivity::new(Arc::new(FixedTraffic(Err(
            TrafficError::Unavailable("timeout".into()),
        ))));

        let err = activity
            .execute(&ctx("fetch_traffic"), route())
            .await
            .unwrap_err();
        assert!(err.retryable);
    }

    #[tokio::test]
    async fn test_compose_never_fails() {
        let composed = ComposeMessageActivity::new(Arc::new(FixedComposer(Ok("Hello".into()))))
            .execute(&ctx("compose_message"), context())
            .await
            .unwrap();
        assert_eq!(composed.text, "Hello");
        assert!(!composed.degraded);

        let failed = ComposeMessageActivity::new(Arc::new(FixedComposer(Err(ComposeError(
            "model overloaded".into(),
        )))))
        .execute(&ctx("compose_message"), context())
        .await
        .unwrap();
        assert!(failed.degraded);
        assert_eq!(failed.text, context().template_message());

        let blank = ComposeMessageActivity::new(Arc::new(FixedComposer(Ok("  ".into()))))
            .execute(&ctx("compose_message"), context())
            .await
            .unwrap();
        assert!(blank.degraded);
    }

    #[tokio::test]
    async fn test_send_uses_stable_idempotency_key() {
        let channel = Arc::new(RecordingChannel {
            keys: Mutex::new(Vec::new()),
            reply: Ok(NotificationOutcome::delivered("d-1")),
        });
        let activity = SendPrimaryActivity::new(channel.clone());
        let workflow_id = Uuid::now_v7();

        for attempt in 1..=2 {
            let ctx = ActivityContext::new(workflow_id, "send_primary".to_string(), attempt, 3);
            let outcome = activity.execute(&ctx, notification()).await.unwrap();
            assert!(outcome.success);
        }

        let keys = channel.keys.lock().clone();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0], keys[1]);
        assert_eq!(keys[0], format!("{workflow_id}:send_primary"));
    }

    #[tokio::test]
    async fn test_send_rejection_is_data_not_error() {
        let channel = Arc::new(RecordingChannel {
            keys: Mutex::new(Vec::new()),
            reply: Ok(NotificationOutcome::rejected("bounced")),
        });
        let outcome = SendFallbackActivity::new(channel)
            .execute(&ctx("send_fallback"), notification())
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.reason(), "bounced");
    }

    #[tokio::test]
    async fn test_send_malformed_outcome_is_terminal() {
        let channel = Arc::new(RecordingChannel {
            keys: Mutex::new(Vec::new()),
            reply: Ok(NotificationOutcome {
                success: true,
                delivery_id: None,
                failure_reason: None,
            }),
        });
        let err = SendPrimaryActivity::new(channel)
            .execute(&ctx("send_primary"), notification())
            .await
            .unwrap_err();
        assert!(!err.retryable);
        assert_eq!(err.code.as_deref(), Some("INVALID_OUTCOME"));
    }
}
