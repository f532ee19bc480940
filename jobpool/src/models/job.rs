//! Job model representing one submitted unit of work.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::debug;
use uuid::Uuid;

use crate::error::PoolError;
use crate::pool::{JobHandle, SubmitOptions};

/// Unique identifier for a job (`UUIDv7`, ordered by submission time).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a job settles with.
pub type JobOutcome = Result<Value, PoolError>;

/// A job owned by the pool from submission until it settles.
///
/// Settling consumes the job, so it resolves exactly once. The timeout timer
/// and cancellation listener are background tasks tied to the job; they are
/// aborted when it settles (or is dropped).
pub struct Job {
    /// Unique identifier for the job.
    pub id: JobId,
    /// Payload handed to the unit. Taken when the job is dispatched.
    pub payload: Value,
    /// Per-job timeout override.
    pub timeout: Option<Duration>,
    /// Caller's cancellation token.
    pub cancel: Option<CancellationToken>,
    /// When the job was submitted.
    pub created_at: DateTime<Utc>,
    reply: oneshot::Sender<JobOutcome>,
    timer: Option<AbortOnDropHandle<()>>,
    cancel_listener: Option<AbortOnDropHandle<()>>,
}

impl Job {
    /// Create a job and the handle its caller awaits.
    pub fn new(payload: Value, options: SubmitOptions) -> (Self, JobHandle) {
        let (reply, result_rx) = oneshot::channel();
        let id = JobId::new();
        let job = Self {
            id,
            payload,
            timeout: options.timeout,
            cancel: options.cancel,
            created_at: Utc::now(),
            reply,
            timer: None,
            cancel_listener: None,
        };
        (job, JobHandle::new(id, result_rx))
    }

    /// The job's own timeout, else `default`. Zero means no timeout.
    pub fn effective_timeout(&self, default: Option<Duration>) -> Option<Duration> {
        self.timeout.or(default).filter(|t| !t.is_zero())
    }

    /// Whether the caller has already cancelled the job.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    /// Run `notify` once the caller cancels. No-op without a token.
    pub(crate) fn on_cancel<F>(&mut self, notify: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(token) = self.cancel.clone() else {
            return;
        };
        self.cancel_listener = Some(AbortOnDropHandle::new(tokio::spawn(async move {
            token.cancelled().await;
            notify();
        })));
    }

    /// Run `notify` after `after` unless the job settles first.
    pub(crate) fn arm_timer<F>(&mut self, after: Duration, notify: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.timer = Some(AbortOnDropHandle::new(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            notify();
        })));
    }

    /// Resolve the caller's handle.
    pub fn settle(self, outcome: JobOutcome) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        if let Some(listener) = self.cancel_listener {
            listener.abort();
        }

        let elapsed_ms = (Utc::now() - self.created_at).num_milliseconds();
        match &outcome {
            Ok(_) => debug!(job = %self.id, elapsed_ms, "job completed"),
            Err(err) => debug!(job = %self.id, elapsed_ms, error = %err, "job rejected"),
        }

        if self.reply.send(outcome).is_err() {
            debug!(job = %self.id, "caller dropped the job handle");
        }
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("timeout", &self.timeout)
            .field("cancelled", &self.is_cancelled())
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}
