//! jobpool - run JSON jobs on a supervised pool of isolated workers.
//!
//! A [`Pool`] owns a set of execution units (child processes or threads),
//! feeds them one job at a time over a line-delimited JSON protocol and
//! resolves each submitted job exactly once: with the handler's result, the
//! handler's error, or a pool-level error such as a timeout or a crashed
//! unit.
//!
//! Two modes:
//! - **persistent**: a fixed set of long-lived units, crashed units are
//!   replaced within a restart budget,
//! - **ephemeral**: a fresh unit per job, bounded by a concurrency cap.
//!
//! Architecture:
//! - [`pool`] holds the public handle and the supervisor task
//! - [`unit`] abstracts over process and thread workers
//! - [`worker`] is the runtime used inside a worker
//! - [`protocol`] defines the request/response envelopes

pub mod config;
pub mod error;
pub mod models;
pub mod pool;
pub mod protocol;
pub mod unit;
pub mod worker;

pub use config::{PoolConfig, PoolMode, RestartPolicy};
pub use error::PoolError;
pub use models::JobId;
pub use pool::{JobHandle, Pool, PoolStats, SubmitOptions};
pub use protocol::ErrorInfo;
pub use unit::{ProcessBackend, ProcessOptions, ThreadBackend};
pub use worker::WorkerContext;
