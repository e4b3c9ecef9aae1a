//! Backpressure management for worker pools
//!
//! Load-aware task acceptance with high/low watermark hysteresis.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Backpressure configuration
///
/// Controls when a worker stops claiming new tasks based on load.
///
/// # Example
///
/// ```
/// use delaywatch_durable::worker::BackpressureConfig;
///
/// let config = BackpressureConfig::default()
///     .with_high_watermark(0.85)
///     .with_low_watermark(0.65);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackpressureConfig {
    /// Stop claiming when load reaches this ratio of max concurrency
    pub high_watermark: f64,

    /// Resume claiming when load drops to this ratio
    pub low_watermark: f64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            high_watermark: 0.9,
            low_watermark: 0.7,
        }
    }
}

impl BackpressureConfig {
    /// Set the high watermark (when to stop accepting tasks)
    pub fn with_high_watermark(mut self, watermark: f64) -> Self {
        self.high_watermark = watermark.clamp(0.0, 1.0);
        self
    }

    /// Set the low watermark (when to resume accepting tasks)
    pub fn with_low_watermark(mut self, watermark: f64) -> Self {
        self.low_watermark = watermark.clamp(0.0, 1.0);
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), BackpressureError> {
        if self.low_watermark >= self.high_watermark {
            return Err(BackpressureError::InvalidConfig(
                "low_watermark must be less than high_watermark".into(),
            ));
        }
        Ok(())
    }
}

/// Backpressure-related errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackpressureError {
    /// Invalid configuration
    #[error("invalid backpressure configuration: {0}")]
    InvalidConfig(String),
}

/// Backpressure state for a worker
///
/// Tracks in-flight attempts and decides whether to claim more.
pub struct BackpressureState {
    config: BackpressureConfig,
    current_load: AtomicUsize,
    max_concurrency: usize,
    accepting_tasks: AtomicBool,
    reason: RwLock<Option<String>>,
}

impl BackpressureState {
    /// Create a new backpressure state
    pub fn new(config: BackpressureConfig, max_concurrency: usize) -> Self {
        Self {
            config,
            current_load: AtomicUsize::new(0),
            max_concurrency: max_concurrency.max(1),
            accepting_tasks: AtomicBool::new(true),
            reason: RwLock::new(None),
        }
    }

    /// Check if the worker should accept new tasks
    ///
    /// Once the high watermark is hit, acceptance resumes only at the low one.
    pub fn should_accept(&self) -> bool {
        let load_ratio = self.load_ratio();

        if self.accepting_tasks.load(Ordering::Acquire) {
            if load_ratio >= self.config.high_watermark {
                self.accepting_tasks.store(false, Ordering::Release);
                *self.reason.write() = Some(format!(
                    "load ratio {:.1}% exceeds high watermark",
                    load_ratio * 100.0
                ));
                return false;
            }
            true
        } else {
            if load_ratio <= self.config.low_watermark {
                self.accepting_tasks.store(true, Ordering::Release);
                *self.reason.write() = None;
                return true;
            }
            false
        }
    }

    /// Get the current load
    pub fn current_load(&self) -> usize {
        self.current_load.load(Ordering::Acquire)
    }

    /// Get the load ratio (current_load / max_concurrency)
    pub fn load_ratio(&self) -> f64 {
        self.current_load() as f64 / self.max_concurrency as f64
    }

    /// Check if currently accepting tasks
    pub fn is_accepting(&self) -> bool {
        self.accepting_tasks.load(Ordering::Acquire)
    }

    /// Why the worker stopped accepting, if it did
    pub fn reason(&self) -> Option<String> {
        self.reason.read().clone()
    }

    /// Number of tasks that can still be claimed
    pub fn available_slots(&self) -> usize {
        self.max_concurrency.saturating_sub(self.current_load())
    }

    /// Record a started task; the load drops again when the guard is dropped
    pub fn task_started(self: &Arc<Self>) -> LoadGuard {
        self.current_load.fetch_add(1, Ordering::AcqRel);
        LoadGuard {
            state: Arc::clone(self),
        }
    }
}

/// Counts one in-flight task against a [`BackpressureState`]
pub struct LoadGuard {
    state: Arc<BackpressureState>,
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.state.current_load.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BackpressureConfig::default();
        assert_eq!(config.high_watermark, 0.9);
        assert_eq!(config.low_watermark, 0.7);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_watermarks() {
        let config = BackpressureConfig::default()
            .with_high_watermark(0.5)
            .with_low_watermark(0.8);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_hysteresis() {
        let state = Arc::new(BackpressureState::new(BackpressureConfig::default(), 10));

        let mut guards: Vec<_> = (0..9).map(|_| state.task_started()).collect();
        assert!(!state.should_accept());
        assert!(state.reason().is_some());

        // Between the watermarks the worker stays paused
        guards.truncate(8);
        assert!(!state.should_accept());

        guards.truncate(7);
        assert!(state.should_accept());
        assert!(state.reason().is_none());
        assert_eq!(state.available_slots(), 3);
    }

    #[test]
    fn test_guard_releases_load() {
        let state = Arc::new(BackpressureState::new(BackpressureConfig::default(), 2));
        {
            let _guard = state.task_started();
            assert_eq!(state.current_load(), 1);
        }
        assert_eq!(state.current_load(), 0);
        assert_eq!(state.load_ratio(), 0.0);
    }
}
