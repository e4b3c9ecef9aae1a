//! Worker pool for task execution
//!
//! This module provides:
//! - [`WorkerPool`] - Claims tasks from one queue and runs them concurrently
//! - [`ActivityReporter`] - Where attempt outcomes are recorded
//! - [`BackpressureConfig`] - Load-aware task acceptance configuration
//! - [`PollerConfig`] - Task polling with exponential backoff
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkerPool                             │
//! │  ┌─────────────┐                   ┌─────────────────────┐  │
//! │  │ TaskPoller  │                   │  Stale Reclaimer    │  │
//! │  │  (polling)  │                   │     (30s)           │  │
//! │  └──────┬──────┘                   └─────────────────────┘  │
//! │         │                                                    │
//! │         ▼                                                    │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │              BackpressureState                       │    │
//! │  │  (high/low watermarks, load tracking)               │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! │         │                                                    │
//! │         ▼                                                    │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │   Attempts (Semaphore-limited, start-to-close)      │    │
//! │  │  [Task 1] [Task 2] [Task 3] ... [Task N]            │    │
//! │  └──────────────────────────┬──────────────────────────┘    │
//! │                             ▼                                │
//! │                      ActivityReporter                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use delaywatch_durable::worker::{WorkerPool, WorkerPoolConfig};
//!
//! let executor = Arc::new(executor);
//! let config = WorkerPoolConfig::new("notifications")
//!     .with_worker_id("notify-worker-1")
//!     .with_max_concurrency(20);
//!
//! let pool = WorkerPool::new(executor.shared_store(), executor.clone(), config);
//! pool.register_activity(SendEmailActivity::new(mailer));
//! pool.start()?;
//!
//! // Graceful shutdown
//! pool.shutdown().await?;
//! ```

mod backpressure;
mod poller;
mod pool;
mod reporter;

pub use backpressure::{BackpressureConfig, BackpressureError, BackpressureState, LoadGuard};
pub use poller::{PollerConfig, PollerError, TaskPoller};
pub use pool::{
    ActivityHandler, ActivityResult, WorkerPool, WorkerPoolConfig, WorkerPoolError,
    WorkerPoolStatus,
};
pub use reporter::{ActivityReporter, NoopReporter};
