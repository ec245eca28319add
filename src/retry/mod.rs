//! Generic retry engine
//!
//! Runs an operation under a [`RetryPolicy`], classifying failures through
//! [`ErrorClass`](crate::error::ErrorClass) and backing off exponentially with
//! jitter between attempts. The engine holds no state of its own.

mod engine;
mod policy;

pub use engine::{RetryEngine, RetryOutcome};
pub use policy::{Recovery, RetryPolicy, DEFAULT_RETRYABLE};
