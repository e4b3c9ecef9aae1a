//! Domain types for delay notification
//!
//! Everything here is plain data that crosses the workflow boundary as JSON,
//! so field names are camelCase on the wire.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A delivery route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub origin: String,
    pub destination: String,
    #[serde(default)]
    pub waypoints: Vec<String>,
}

impl Route {
    pub fn new(origin: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            destination: destination.into(),
            waypoints: Vec::new(),
        }
    }

    pub fn with_waypoint(mut self, waypoint: impl Into<String>) -> Self {
        self.waypoints.push(waypoint.into());
        self
    }

    /// Reject routes a traffic source could never resolve
    pub fn validate(&self) -> Result<(), InputError> {
        if self.origin.trim().is_empty() {
            return Err(InputError::MissingOrigin);
        }
        if self.destination.trim().is_empty() {
            return Err(InputError::MissingDestination);
        }
        if self.waypoints.iter().any(|w| w.trim().is_empty()) {
            return Err(InputError::BlankWaypoint);
        }
        Ok(())
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.origin)?;
        for waypoint in &self.waypoints {
            write!(f, " -> {}", waypoint)?;
        }
        write!(f, " -> {}", self.destination)
    }
}

/// Malformed submission
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InputError {
    #[error("invalid route: origin is empty")]
    MissingOrigin,

    #[error("invalid route: destination is empty")]
    MissingDestination,

    #[error("invalid route: waypoint is empty")]
    BlankWaypoint,

    #[error("malformed contact: {0:?}")]
    MalformedContact(String),
}

/// Severity of traffic on a route, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficCondition {
    Light,
    Moderate,
    Heavy,
    Severe,
}

impl TrafficCondition {
    /// Classify an estimated delay in minutes
    ///
    /// `<15` light, `15..=29` moderate, `30..=44` heavy, `>=45` severe.
    pub fn classify(delay_minutes: u32) -> Self {
        match delay_minutes {
            0..=14 => Self::Light,
            15..=29 => Self::Moderate,
            30..=44 => Self::Heavy,
            _ => Self::Severe,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Moderate => "moderate",
            Self::Heavy => "heavy",
            Self::Severe => "severe",
        }
    }
}

impl fmt::Display for TrafficCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Traffic on a route at the time it was fetched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficSnapshot {
    pub route: Route,
    pub estimated_delay_minutes: u32,
    pub normal_duration_minutes: u32,
    pub current_duration_minutes: u32,
    pub condition: TrafficCondition,
}

impl TrafficSnapshot {
    /// Build a snapshot from travel times, deriving the delay and condition
    pub fn new(
        route: Route,
        normal_duration_minutes: u32,
        current_duration_minutes: u32,
    ) -> Result<Self, SnapshotError> {
        if normal_duration_minutes == 0 || current_duration_minutes == 0 {
            return Err(SnapshotError::ZeroDuration);
        }
        let estimated_delay_minutes =
            current_duration_minutes.saturating_sub(normal_duration_minutes);
        Ok(Self {
            route,
            estimated_delay_minutes,
            normal_duration_minutes,
            current_duration_minutes,
            condition: TrafficCondition::classify(estimated_delay_minutes),
        })
    }

    /// Check a snapshot that was built elsewhere
    pub fn validate(&self) -> Result<(), SnapshotError> {
        if self.normal_duration_minutes == 0 || self.current_duration_minutes == 0 {
            return Err(SnapshotError::ZeroDuration);
        }
        let derived = self
            .current_duration_minutes
            .saturating_sub(self.normal_duration_minutes);
        if derived != self.estimated_delay_minutes {
            return Err(SnapshotError::DelayMismatch {
                reported: self.estimated_delay_minutes,
                derived,
            });
        }
        let expected = TrafficCondition::classify(self.estimated_delay_minutes);
        if expected != self.condition {
            return Err(SnapshotError::ConditionMismatch {
                reported: self.condition,
                expected,
            });
        }
        Ok(())
    }
}

/// A traffic snapshot that breaks its own invariants
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    #[error("travel durations must be positive")]
    ZeroDuration,

    #[error("reported delay {reported}m does not match travel times ({derived}m)")]
    DelayMismatch { reported: u32, derived: u32 },

    #[error("condition {reported} does not match delay (expected {expected})")]
    ConditionMismatch {
        reported: TrafficCondition,
        expected: TrafficCondition,
    },
}

/// What the message composer is told about a delay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositionContext {
    pub delay_minutes: u32,
    pub route: Route,
    pub condition: TrafficCondition,
}

impl CompositionContext {
    /// Deterministic message used when no composed text is available
    pub fn template_message(&self) -> String {
        format!(
            "Your delivery from {} to {} is expected to be delayed by about {} minutes due to {} traffic. We apologize for the inconvenience and will keep you updated.",
            self.route.origin, self.route.destination, self.delay_minutes, self.condition
        )
    }
}

/// Output of the compose step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComposedMessage {
    pub text: String,
    /// The fallback template was used instead of composed text
    pub degraded: bool,
}

/// Subject line for a delay of `delay_minutes`
pub fn subject_for(delay_minutes: u32) -> String {
    format!("Delivery Delay Alert: {} minute delay expected", delay_minutes)
}

/// A message to deliver on one channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub contact: String,
    pub subject: String,
    pub text: String,
    pub delay_minutes: u32,
}

/// Result of one delivery attempt on one channel
///
/// `delivery_id` is set exactly when `success` is true and `failure_reason`
/// exactly when it is false.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl NotificationOutcome {
    pub fn delivered(delivery_id: impl Into<String>) -> Self {
        Self {
            success: true,
            delivery_id: Some(delivery_id.into()),
            failure_reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            delivery_id: None,
            failure_reason: Some(reason.into()),
        }
    }

    /// Whether the fields agree with `success`
    pub fn is_well_formed(&self) -> bool {
        if self.success {
            self.delivery_id.is_some() && self.failure_reason.is_none()
        } else {
            self.delivery_id.is_none() && self.failure_reason.is_some()
        }
    }

    /// Failure reason, or a placeholder for a malformed rejection
    pub fn reason(&self) -> &str {
        self.failure_reason.as_deref().unwrap_or("unknown reason")
    }
}

/// Final answer for one delay check
///
/// Every terminal instance, including errored ones, is reported in this shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalResult {
    pub delay_detected: bool,
    pub delay_minutes: u32,
    pub notification_sent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub fallback_used: bool,
}

impl TerminalResult {
    /// Delay within the threshold, nothing sent
    pub fn no_action(delay_minutes: u32) -> Self {
        Self {
            delay_detected: false,
            delay_minutes,
            notification_sent: false,
            message: None,
            error: None,
            fallback_used: false,
        }
    }

    /// A notification went out on one of the channels
    pub fn sent(delay_minutes: u32, message: String, fallback_used: bool) -> Self {
        Self {
            delay_detected: true,
            delay_minutes,
            notification_sent: true,
            message: Some(message),
            error: None,
            fallback_used,
        }
    }

    /// Both channels rejected the notification
    pub fn undelivered(delay_minutes: u32, error: String) -> Self {
        Self {
            delay_detected: true,
            delay_minutes,
            notification_sent: false,
            message: None,
            error: Some(error),
            fallback_used: true,
        }
    }

    /// The instance ended on an engine-level failure
    pub fn errored(error: impl Into<String>) -> Self {
        Self {
            delay_detected: false,
            delay_minutes: 0,
            notification_sent: false,
            message: None,
            error: Some(error.into()),
            fallback_used: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn route() -> Route {
        Route::new("New York, NY", "Philadelphia, PA")
    }

    #[test]
    fn test_classification_boundaries() {
        let cases = [
            (0, TrafficCondition::Light),
            (14, TrafficCondition::Light),
            (15, TrafficCondition::Moderate),
            (29, TrafficCondition::Moderate),
            (30, TrafficCondition::Heavy),
            (44, TrafficCondition::Heavy),
            (45, TrafficCondition::Severe),
            (600, TrafficCondition::Severe),
        ];
        for (delay, expected) in cases {
            assert_eq!(TrafficCondition::classify(delay), expected, "delay {delay}");
        }
    }

    #[test]
    fn test_condition_ordering() {
        assert!(TrafficCondition::Light < TrafficCondition::Moderate);
        assert!(TrafficCondition::Moderate < TrafficCondition::Heavy);
        assert!(TrafficCondition::Heavy < TrafficCondition::Severe);
        assert_eq!(json!(TrafficCondition::Severe), json!("severe"));
    }

    #[test]
    fn test_snapshot_derives_delay_and_condition() {
        let snapshot = TrafficSnapshot::new(route(), 95, 140).unwrap();
        assert_eq!(snapshot.estimated_delay_minutes, 45);
        assert_eq!(snapshot.condition, TrafficCondition::Severe);
        assert!(snapshot.validate().is_ok());

        // Faster than usual is no delay
        let early = TrafficSnapshot::new(route(), 95, 80).unwrap();
        assert_eq!(early.estimated_delay_minutes, 0);
        assert_eq!(early.condition, TrafficCondition::Light);

        assert_eq!(
            TrafficSnapshot::new(route(), 0, 10),
            Err(SnapshotError::ZeroDuration)
        );
    }

    #[test]
    fn test_snapshot_validation_catches_inconsistency() {
        let mut snapshot = TrafficSnapshot::new(route(), 60, 90).unwrap();
        snapshot.condition = TrafficCondition::Light;
        assert!(matches!(
            snapshot.validate(),
            Err(SnapshotError::ConditionMismatch { .. })
        ));

        let mut snapshot = TrafficSnapshot::new(route(), 60, 90).unwrap();
        snapshot.estimated_delay_minutes = 45;
        assert!(matches!(
            snapshot.validate(),
            Err(SnapshotError::DelayMismatch {
                reported: 45,
                derived: 30
            })
        ));
    }

    #[test]
    fn test_snapshot_wire_format() {
        let snapshot = TrafficSnapshot::new(route(), 95, 140).unwrap();
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["estimatedDelayMinutes"], json!(45));
        assert_eq!(value["condition"], json!("severe"));
        assert_eq!(value["route"]["origin"], json!("New York, NY"));
    }

    #[test]
    fn test_route_validation() {
        assert!(route().validate().is_ok());
        assert_eq!(
            Route::new(" ", "Philadelphia, PA").validate(),
            Err(InputError::MissingOrigin)
        );
        assert_eq!(
            Route::new("New York, NY", "").validate(),
            Err(InputError::MissingDestination)
        );
        assert_eq!(
            route().with_waypoint("").validate(),
            Err(InputError::BlankWaypoint)
        );
        assert_eq!(
            route().with_waypoint("Trenton, NJ").to_string(),
            "New York, NY -> Trenton, NJ -> Philadelphia, PA"
        );
    }

    #[test]
    fn test_notification_outcome_shape() {
        let ok = NotificationOutcome::delivered("msg-1");
        assert!(ok.is_well_formed());
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"success": true, "deliveryId": "msg-1"})
        );

        let rejected = NotificationOutcome::rejected("mailbox full");
        assert!(rejected.is_well_formed());
        assert_eq!(rejected.reason(), "mailbox full");

        let malformed = NotificationOutcome {
            success: true,
            delivery_id: None,
            failure_reason: None,
        };
        assert!(!malformed.is_well_formed());
    }

    #[test]
    fn test_subject_and_template_are_deterministic() {
        assert_eq!(
            subject_for(45),
            "Delivery Delay Alert: 45 minute delay expected"
        );
        let ctx = CompositionContext {
            delay_minutes: 45,
            route: route(),
            condition: TrafficCondition::Severe,
        };
        assert_eq!(ctx.template_message(), ctx.template_message());
        assert!(ctx.template_message().contains("45 minutes"));
        assert!(ctx.template_message().contains("severe"));
    }

    #[test]
    fn test_terminal_result_wire_format() {
        let result = TerminalResult::no_action(12);
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({
                "delayDetected": false,
                "delayMinutes": 12,
                "notificationSent": false,
                "fallbackUsed": false
            })
        );

        let errored = TerminalResult::errored("fetch_traffic failed");
        assert_eq!(errored.delay_minutes, 0);
        assert!(!errored.delay_detected);
        assert_eq!(errored.error.as_deref(), Some("fetch_traffic failed"));
    }
}
