//! Activity abstractions
//!
//! Activities are units of work that are executed by workers. They:
//! - Run exactly one attempt per invocation
//! - May fail and be retried according to the retry policy
//! - Receive an idempotency key for at-least-once side effects

mod context;
mod definition;

pub use context::ActivityContext;
pub use definition::{codes, Activity, ActivityError};
