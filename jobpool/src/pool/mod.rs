//! Job-execution pool.
//!
//! A [`Pool`] accepts JSON payloads, runs each one on an isolated execution
//! unit and hands the outcome back through a [`JobHandle`]. All scheduling
//! happens in a single supervisor task, see [`supervisor`].

mod queue;
mod restart;
mod stats;
mod supervisor;

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::models::{Job, JobId, JobOutcome};
use crate::unit::UnitBackend;

pub use queue::JobQueue;
pub use restart::RestartLimiter;
pub use stats::PoolStats;
use supervisor::{Command, Supervisor};

/// Per-job options.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Overrides the pool's default timeout. Zero disables the timeout.
    pub timeout: Option<Duration>,
    /// Cancels the job: removes it from the queue, or kills its unit once
    /// dispatched.
    pub cancel: Option<CancellationToken>,
}

impl SubmitOptions {
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// The caller's side of a submitted job.
///
/// Resolves exactly once with the job's outcome. Dropping the handle does
/// not cancel the job; use a cancellation token for that.
#[derive(Debug)]
pub struct JobHandle {
    id: JobId,
    result_rx: oneshot::Receiver<JobOutcome>,
}

impl JobHandle {
    pub(crate) const fn new(id: JobId, result_rx: oneshot::Receiver<JobOutcome>) -> Self {
        Self { id, result_rx }
    }

    pub const fn id(&self) -> JobId {
        self.id
    }

    /// Wait for the job to settle.
    pub async fn wait(self) -> JobOutcome {
        self.await
    }
}

impl Future for JobHandle {
    type Output = JobOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.result_rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(PoolError::ShuttingDown {
                    reason: "pool supervisor stopped".to_string(),
                })
            })
        })
    }
}

/// A pool of execution units.
///
/// # Example
///
/// ```rust,no_run
/// use jobpool::{Pool, PoolConfig, SubmitOptions, ThreadBackend};
/// use serde_json::json;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let backend = ThreadBackend::new(|payload, _ctx| Ok(json!({ "echo": payload })));
///     let pool = Pool::new(PoolConfig::persistent(4), backend);
///
///     let job = pool.submit(json!("hello"), SubmitOptions::default());
///     println!("{}", job.await?);
///
///     pool.shutdown("done").await;
///     Ok(())
/// }
/// ```
pub struct Pool {
    commands: mpsc::UnboundedSender<Command>,
    stats: watch::Receiver<PoolStats>,
    closed: Arc<OnceLock<String>>,
}

impl Pool {
    /// Start a pool. Must be called from within a tokio runtime.
    ///
    /// Persistent pools start all their units right away.
    pub fn new<B>(mut config: PoolConfig, backend: B) -> Self
    where
        B: UnitBackend + 'static,
    {
        config.size = config.size.max(1);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (stats_tx, stats_rx) = watch::channel(PoolStats::initial(&config));
        let closed = Arc::new(OnceLock::new());

        let supervisor = Supervisor::new(
            config,
            Arc::new(backend),
            commands_rx,
            stats_tx,
            Arc::clone(&closed),
        );
        tokio::spawn(supervisor.run());

        Self {
            commands: commands_tx,
            stats: stats_rx,
            closed,
        }
    }

    /// Submit a job. Returns immediately.
    ///
    /// After shutdown the handle is already rejected with
    /// [`PoolError::ShuttingDown`].
    pub fn submit(&self, payload: Value, options: SubmitOptions) -> JobHandle {
        let (job, handle) = Job::new(payload, options);

        if let Some(reason) = self.closed.get() {
            job.settle(Err(PoolError::ShuttingDown {
                reason: reason.clone(),
            }));
            return handle;
        }

        if let Err(mpsc::error::SendError(Command::Submit(job))) =
            self.commands.send(Command::Submit(job))
        {
            job.settle(Err(PoolError::ShuttingDown {
                reason: "pool supervisor stopped".to_string(),
            }));
        }
        handle
    }

    /// Snapshot of the pool's state.
    pub fn stats(&self) -> PoolStats {
        self.stats.borrow().clone()
    }

    /// Receiver that sees every new stats snapshot.
    pub fn watch_stats(&self) -> watch::Receiver<PoolStats> {
        self.stats.clone()
    }

    /// Reject every queued job with [`PoolError::Drained`]. Running jobs are
    /// left alone. Returns how many jobs were drained.
    pub async fn drain_queue(&self, reason: impl Into<String>) -> usize {
        let (reply, done) = oneshot::channel();
        let command = Command::Drain {
            reason: reason.into(),
            reply,
        };
        if self.commands.send(command).is_err() {
            return 0;
        }
        done.await.unwrap_or(0)
    }

    /// Shut the pool down: reject queued and running jobs, stop every unit
    /// and refuse further submissions. Idempotent.
    pub async fn shutdown(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let _ = self.closed.set(reason.clone());

        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reason, reply }).is_ok() {
            let _ = done.await;
        }
    }

    /// Whether shutdown has begun.
    pub fn is_closed(&self) -> bool {
        self.closed.get().is_some()
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("stats", &*self.stats.borrow())
            .field("closed", &self.is_closed())
            .finish()
    }
}
