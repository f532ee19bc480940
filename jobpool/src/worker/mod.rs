//! Worker-side runtime.
//!
//! A worker is the code that runs inside an execution unit. Process workers
//! call [`serve`] with their handler; it reads request envelopes from stdin
//! and writes one response envelope per request to stdout. Thread workers are
//! driven by [`crate::unit::ThreadBackend`] and never call `serve`.
//!
//! [`is_worker_context`] and [`is_main_context`] let one binary act as both
//! the launcher and the worker:
//!
//! ```rust,no_run
//! use jobpool::worker;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     if worker::is_worker_context() {
//!         return worker::serve(|payload, _ctx| Ok(payload)).await;
//!     }
//!     // launcher: build a pool with ProcessOptions::current_exe()
//!     Ok(())
//! }
//! ```
//!
//! Worker stdout is the protocol channel. Handlers must log to stderr.

use std::cell::RefCell;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::protocol::{Request, Response};
use crate::unit::UnitId;

/// Set to `1` in the environment of worker processes.
pub const WORKER_ENV: &str = "JOBPOOL_WORKER";

/// JSON-encoded init data for worker processes.
pub const INIT_DATA_ENV: &str = "JOBPOOL_INIT_DATA";

/// Unit id of a worker process.
pub const UNIT_ID_ENV: &str = "JOBPOOL_UNIT_ID";

thread_local! {
    static THREAD_INIT_DATA: RefCell<Option<Value>> = const { RefCell::new(None) };
}

/// Mark the current thread as a worker thread holding `init_data`.
pub(crate) fn enter_thread_context(init_data: Value) {
    THREAD_INIT_DATA.with(|slot| *slot.borrow_mut() = Some(init_data));
}

/// True inside a worker process or a worker thread.
pub fn is_worker_context() -> bool {
    THREAD_INIT_DATA.with(|slot| slot.borrow().is_some()) || std::env::var_os(WORKER_ENV).is_some()
}

/// True when not running as a worker.
pub fn is_main_context() -> bool {
    !is_worker_context()
}

/// Init data handed to this worker by the pool, if running as one.
pub fn init_data() -> Option<Value> {
    if let Some(data) = THREAD_INIT_DATA.with(|slot| slot.borrow().clone()) {
        return Some(data);
    }
    let raw = std::env::var(INIT_DATA_ENV).ok()?;
    serde_json::from_str(&raw).ok()
}

/// Where a worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    Process,
    Thread,
}

/// What a handler knows about the unit it runs on.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    unit: UnitId,
    init_data: Value,
    kind: ContextKind,
    cancel: CancellationToken,
}

impl WorkerContext {
    pub(crate) const fn for_thread(unit: UnitId, init_data: Value, cancel: CancellationToken) -> Self {
        Self {
            unit,
            init_data,
            kind: ContextKind::Thread,
            cancel,
        }
    }

    /// Build the context of a worker process from its environment.
    pub fn from_env() -> Result<Self> {
        let unit = match std::env::var(UNIT_ID_ENV) {
            Ok(raw) => raw
                .parse()
                .with_context(|| format!("Invalid {UNIT_ID_ENV}: {raw}"))?,
            Err(_) => 0,
        };
        let init_data = match std::env::var(INIT_DATA_ENV) {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("Invalid JSON in {INIT_DATA_ENV}"))?,
            Err(_) => Value::Null,
        };

        Ok(Self {
            unit,
            init_data,
            kind: ContextKind::Process,
            cancel: CancellationToken::new(),
        })
    }

    pub const fn unit_id(&self) -> UnitId {
        self.unit
    }

    pub const fn init_data(&self) -> &Value {
        &self.init_data
    }

    pub const fn kind(&self) -> ContextKind {
        self.kind
    }

    /// Set once the pool has given up on this unit.
    ///
    /// Thread workers cannot be killed, so long-running handlers should poll
    /// this and return early. Process workers are killed instead and never
    /// see it set.
    pub fn is_terminating(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Serve jobs on stdin/stdout until stdin closes.
///
/// Each request runs on the blocking pool, one at a time. A malformed request
/// or a panicking handler ends the worker with an error, which the pool sees
/// as the unit exiting.
pub async fn serve<F>(handler: F) -> Result<()>
where
    F: Fn(Value, &WorkerContext) -> Result<Value> + Send + Sync + 'static,
{
    let handler = Arc::new(handler);
    let ctx = Arc::new(WorkerContext::from_env()?);
    debug!(unit = ctx.unit_id(), "worker ready");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines
        .next_line()
        .await
        .context("Failed to read request from stdin")?
    {
        if line.trim().is_empty() {
            continue;
        }
        let request = Request::from_line(&line)?;

        let outcome = {
            let handler = Arc::clone(&handler);
            let ctx = Arc::clone(&ctx);
            tokio::task::spawn_blocking(move || handler(request.payload, &ctx))
                .await
                .context("Job handler panicked")?
        };

        let mut reply = Response::from_outcome(outcome).encode().to_string();
        reply.push('\n');
        stdout
            .write_all(reply.as_bytes())
            .await
            .context("Failed to write response to stdout")?;
        stdout.flush().await.context("Failed to flush stdout")?;
    }

    debug!(unit = ctx.unit_id(), "stdin closed, worker exiting");
    Ok(())
}
