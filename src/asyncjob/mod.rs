//! # Async Jobs
//!
//! [`Job`] wraps a fallible async handler with a retry schedule and an
//! explicit state machine. [`Group`] runs several jobs in parallel, with
//! panics contained per job, or sequentially with short-circuit on the
//! first job that exhausts its retries.

mod group;
mod job;

pub use group::{Group, Mode};
pub use job::{Job, JobState, DEFAULT_RETRY_DURATIONS};
