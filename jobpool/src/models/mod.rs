//! Data models for jobpool entities.

mod job;

pub use job::{Job, JobId, JobOutcome};
