//! Notifier configuration
//!
//! Read from `DELAYWATCH_*` environment variables. Parsing goes through a
//! lookup closure so tests can supply values without touching the process
//! environment.

use std::str::FromStr;
use std::time::Duration;

use delaywatch_durable::RetryPolicy;

use crate::workflow::{DispatchOptions, StepRetryPolicies, DEFAULT_NOTIFIER_QUEUE};

const STEPS: [(&str, &str); 4] = [
    ("fetch_traffic", "FETCH_TRAFFIC"),
    ("compose_message", "COMPOSE_MESSAGE"),
    ("send_primary", "SEND_PRIMARY"),
    ("send_fallback", "SEND_FALLBACK"),
];

/// Invalid configuration value
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key}: cannot parse {value:?}")]
    Invalid { key: String, value: String },

    #[error("{key}: {reason}")]
    OutOfRange { key: String, reason: String },
}

/// Configuration for the notifier service
#[derive(Debug, Clone, PartialEq)]
pub struct NotifierConfig {
    /// Queue the notifier's steps are dispatched on
    pub task_queue: String,
    /// Namespace that qualifies the task queue
    pub namespace: String,
    /// PostgreSQL URL; in-memory history when unset
    pub database_url: Option<String>,
    pub default_delay_threshold_minutes: u32,
    pub worker_id: String,
    pub max_concurrent_activities: usize,
    pub max_concurrent_decisions: usize,
    pub retry: StepRetryPolicies,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            task_queue: DEFAULT_NOTIFIER_QUEUE.to_string(),
            namespace: "default".to_string(),
            database_url: None,
            default_delay_threshold_minutes: 30,
            worker_id: format!("delaywatch-{}", uuid::Uuid::now_v7()),
            max_concurrent_activities: 10,
            max_concurrent_decisions: 10,
            retry: StepRetryPolicies::default(),
        }
    }
}

impl NotifierConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let base = retry_policy(&get, "DELAYWATCH_RETRY", RetryPolicy::exponential())?;
        let mut retry = StepRetryPolicies::uniform(base.clone());
        for (step, env) in STEPS {
            let policy = retry_policy(&get, &format!("DELAYWATCH_RETRY_{env}"), base.clone())?;
            if let Some(slot) = retry.for_step_mut(step) {
                *slot = policy;
            }
        }

        let config = Self {
            task_queue: get("DELAYWATCH_TASK_QUEUE").unwrap_or(defaults.task_queue),
            namespace: get("DELAYWATCH_NAMESPACE").unwrap_or(defaults.namespace),
            database_url: get("DATABASE_URL"),
            default_delay_threshold_minutes: parse_or(
                &get,
                "DELAYWATCH_DEFAULT_DELAY_THRESHOLD_MINUTES",
                defaults.default_delay_threshold_minutes,
            )?,
            worker_id: get("DELAYWATCH_WORKER_ID").unwrap_or(defaults.worker_id),
            max_concurrent_activities: parse_or(
                &get,
                "DELAYWATCH_MAX_CONCURRENT_ACTIVITIES",
                defaults.max_concurrent_activities,
            )?,
            max_concurrent_decisions: parse_or(
                &get,
                "DELAYWATCH_MAX_CONCURRENT_DECISIONS",
                defaults.max_concurrent_decisions,
            )?,
            retry,
        };

        for (key, value) in [
            (
                "DELAYWATCH_MAX_CONCURRENT_ACTIVITIES",
                config.max_concurrent_activities,
            ),
            (
                "DELAYWATCH_MAX_CONCURRENT_DECISIONS",
                config.max_concurrent_decisions,
            ),
        ] {
            if value == 0 {
                return Err(ConfigError::OutOfRange {
                    key: key.to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
        }

        Ok(config)
    }

    /// Task queue name including the namespace
    pub fn qualified_task_queue(&self) -> String {
        if self.namespace.is_empty() || self.namespace == "default" {
            self.task_queue.clone()
        } else {
            format!("{}/{}", self.namespace, self.task_queue)
        }
    }

    /// Dispatch options recorded into every submitted instance
    pub fn dispatch(&self) -> DispatchOptions {
        DispatchOptions {
            task_queue: self.qualified_task_queue(),
            retry: self.retry.clone(),
        }
    }
}

fn parse_or<G, T>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    G: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match get(key) {
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value,
        }),
        None => Ok(default),
    }
}

fn retry_policy<G>(get: &G, prefix: &str, base: RetryPolicy) -> Result<RetryPolicy, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let initial_key = format!("{prefix}_INITIAL_INTERVAL_MS");
    let max_key = format!("{prefix}_MAX_INTERVAL_MS");
    let coefficient_key = format!("{prefix}_BACKOFF_COEFFICIENT");
    let attempts_key = format!("{prefix}_MAX_ATTEMPTS");

    let initial_ms = parse_or(get, &initial_key, base.initial_interval.as_millis() as u64)?;
    let max_ms = parse_or(get, &max_key, base.max_interval.as_millis() as u64)?;
    let coefficient: f64 = parse_or(get, &coefficient_key, base.backoff_coefficient)?;
    let max_attempts: u32 = parse_or(get, &attempts_key, base.max_attempts)?;

    if max_attempts == 0 {
        return Err(ConfigError::OutOfRange {
            key: attempts_key,
            reason: "must be at least 1".to_string(),
        });
    }
    if !coefficient.is_finite() || coefficient < 1.0 {
        return Err(ConfigError::OutOfRange {
            key: coefficient_key,
            reason: "must be a finite number >= 1.0".to_string(),
        });
    }
    if max_ms < initial_ms {
        return Err(ConfigError::OutOfRange {
            key: max_key,
            reason: format!("must not be below the initial interval ({initial_ms}ms)"),
        });
    }

    Ok(base
        .with_initial_interval(Duration::from_millis(initial_ms))
        .with_max_interval(Duration::from_millis(max_ms))
        .with_backoff_coefficient(coefficient)
        .with_max_attempts(max_attempts))
}
