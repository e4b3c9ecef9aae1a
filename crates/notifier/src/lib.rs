//! # Delivery Delay Notifier
//!
//! Checks live traffic on a delivery route and, when the delay exceeds a
//! threshold, composes a message and notifies the customer on a primary
//! channel with a fallback. Runs as a durable workflow on
//! [`delaywatch_durable`], so every step outcome is recorded and an
//! interrupted check resumes from its history.
//!
//! ```text
//! NotifierClient ──submit──▶ WorkflowExecutor ◀──report── WorkerPool
//!                                  │                         │
//!                                  ▼                         ▼
//!                          DelayNotificationWorkflow    fetch_traffic
//!                                                       compose_message
//!                                                       send_primary
//!                                                       send_fallback
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use delaywatch_notifier::{Collaborators, NotifierConfig, NotifierService, Route};
//!
//! let service = NotifierService::new(store, &NotifierConfig::from_env()?, collaborators);
//! service.start().await?;
//! let handle = service
//!     .client()
//!     .submit(Route::new("New York, NY", "Philadelphia, PA"), "ops@example.com", 30)
//!     .await?;
//! let result = handle.await_result().await?;
//! ```

pub mod activities;
pub mod client;
pub mod collaborators;
pub mod config;
pub mod service;
pub mod sim;
pub mod telemetry;
pub mod types;
pub mod workflow;

pub use activities::{
    ComposeMessageActivity, FetchTrafficActivity, SendFallbackActivity, SendPrimaryActivity,
};
pub use client::{ClientError, DelayCheckHandle, NotifierClient};
pub use collaborators::{
    ChannelError, ComposeError, MessageComposer, NotificationChannel, TrafficError,
    TrafficSource,
};
pub use config::{ConfigError, NotifierConfig};
pub use service::{Collaborators, NotifierService, ServiceError};
pub use types::{
    ComposedMessage, CompositionContext, Notification, NotificationOutcome, Route,
    TerminalResult, TrafficCondition, TrafficSnapshot,
};
pub use workflow::{
    DelayCheckInput, DelayCheckState, DelayNotificationWorkflow, DispatchOptions, StepResult,
    StepRetryPolicies,
};
