//! Error types surfaced to callers of the pool.

use std::time::Duration;

use crate::protocol::ErrorInfo;
use crate::unit::UnitId;

/// Why a job's future was rejected.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PoolError {
    /// The handler itself returned an error. The unit stays in service.
    #[error("job failed: {0}")]
    Job(ErrorInfo),

    /// The unit sent something that is not a valid response envelope.
    #[error("unit {unit} broke protocol: {detail}")]
    Protocol { unit: UnitId, detail: String },

    /// The unit's process or thread reported an error.
    #[error("unit {unit} transport error: {detail}")]
    Transport { unit: UnitId, detail: String },

    /// The unit exited before responding.
    #[error("unit {unit} exited before responding (code {code:?})")]
    Exit { unit: UnitId, code: Option<i32> },

    /// No response within the effective timeout.
    #[error("job timed out after {}ms", .timeout.as_millis())]
    Timeout { timeout: Duration },

    /// The caller's cancellation token fired.
    #[error("job aborted")]
    Aborted,

    /// The pool is shutting down or has shut down.
    #[error("pool is shutting down: {reason}")]
    ShuttingDown { reason: String },

    /// The job was still queued when the queue was drained.
    #[error("queue drained: {reason}")]
    Drained { reason: String },

    /// No execution unit could be started for the job.
    #[error("failed to spawn execution unit: {0}")]
    Spawn(String),
}

impl PoolError {
    /// Short machine-readable name of the error kind.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Job(_) => "job",
            Self::Protocol { .. } => "protocol",
            Self::Transport { .. } => "transport",
            Self::Exit { .. } => "exit",
            Self::Timeout { .. } => "timeout",
            Self::Aborted => "aborted",
            Self::ShuttingDown { .. } => "shutting_down",
            Self::Drained { .. } => "drained",
            Self::Spawn(_) => "spawn",
        }
    }

    /// Whether this kind of error retires the unit running the job.
    ///
    /// `Aborted` only does so when the job had already been dispatched.
    pub const fn is_unit_failure(&self) -> bool {
        matches!(
            self,
            Self::Protocol { .. }
                | Self::Transport { .. }
                | Self::Exit { .. }
                | Self::Timeout { .. }
                | Self::Aborted
        )
    }
}

/// Reason an execution unit was retired.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnitFailure {
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("exited with code {0:?}")]
    Exited(Option<i32>),

    #[error("job timed out after {}ms", .0.as_millis())]
    TimedOut(Duration),

    #[error("job aborted by caller")]
    Aborted,
}

impl UnitFailure {
    /// The error delivered to the job bound to the failed unit, if any.
    pub fn into_job_error(self, unit: UnitId) -> PoolError {
        match self {
            Self::Protocol(detail) => PoolError::Protocol { unit, detail },
            Self::Transport(detail) => PoolError::Transport { unit, detail },
            Self::Exited(code) => PoolError::Exit { unit, code },
            Self::TimedOut(timeout) => PoolError::Timeout { timeout },
            Self::Aborted => PoolError::Aborted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_mapping() {
        assert_eq!(
            UnitFailure::Exited(Some(3)).into_job_error(7),
            PoolError::Exit {
                unit: 7,
                code: Some(3)
            }
        );
        assert_eq!(
            UnitFailure::TimedOut(Duration::from_millis(50)).into_job_error(1),
            PoolError::Timeout {
                timeout: Duration::from_millis(50)
            }
        );
        assert_eq!(UnitFailure::Aborted.into_job_error(1), PoolError::Aborted);
    }

    #[test]
    fn test_display() {
        let err = PoolError::Timeout {
            timeout: Duration::from_millis(250),
        };
        assert_eq!(err.to_string(), "job timed out after 250ms");

        let err = PoolError::Job(ErrorInfo::new("TypeError", "bad"));
        assert_eq!(err.to_string(), "job failed: TypeError: bad");
    }

    #[test]
    fn test_unit_failure_classification() {
        assert!(!PoolError::Job(ErrorInfo::new("E", "m")).is_unit_failure());
        assert!(!PoolError::Drained { reason: "x".into() }.is_unit_failure());
        assert!(PoolError::Aborted.is_unit_failure());
        assert!(PoolError::Exit { unit: 0, code: None }.is_unit_failure());
        assert_eq!(PoolError::Spawn("x".into()).kind(), "spawn");
    }
}
