//! Reliability patterns for durable execution
//!
//! This module provides:
//! - [`RetryPolicy`] - Configurable retry with exponential backoff
//! - [`RetryDecision`] - The outcome of classifying a failed attempt

mod retry;

pub use retry::{RetryDecision, RetryPolicy};
