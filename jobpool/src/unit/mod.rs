//! Execution units: the isolated workers jobs run on.
//!
//! The pool is written against two small traits:
//! - [`UnitBackend`] spawns units,
//! - [`UnitHandle`] sends requests to one unit and terminates it.
//!
//! Everything a unit reports back (responses, errors, exit) arrives as a
//! [`UnitEvent`] on a single channel owned by the pool supervisor.
//!
//! Two backends ship with the crate: [`ProcessBackend`] runs each unit as a
//! child process, [`ThreadBackend`] as a thread inside this process.

mod process;
#[cfg(test)]
pub(crate) mod testing;
mod thread;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::UnitFailure;
use crate::protocol::Request;

pub use process::{ProcessBackend, ProcessOptions};
pub use thread::{Handler, ThreadBackend};

/// Identifier of an execution unit, unique within one pool.
pub type UnitId = u64;

/// Sender half of the pool's unit event channel.
pub type EventSender = mpsc::UnboundedSender<UnitEvent>;

/// Something that happened to an execution unit.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitEvent {
    /// The unit it happened to.
    pub unit: UnitId,
    /// What happened.
    pub kind: UnitEventKind,
}

/// Kinds of unit events.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitEventKind {
    /// A message from the unit (expected to be a response envelope).
    Message(Value),
    /// The transport failed or the unit broke protocol.
    Failure(UnitFailure),
    /// The unit exited, with its exit code when one is known.
    Exited(Option<i32>),
}

impl UnitEvent {
    pub const fn message(unit: UnitId, value: Value) -> Self {
        Self {
            unit,
            kind: UnitEventKind::Message(value),
        }
    }

    pub const fn failure(unit: UnitId, failure: UnitFailure) -> Self {
        Self {
            unit,
            kind: UnitEventKind::Failure(failure),
        }
    }

    pub const fn exited(unit: UnitId, code: Option<i32>) -> Self {
        Self {
            unit,
            kind: UnitEventKind::Exited(code),
        }
    }
}

/// Spawns execution units.
pub trait UnitBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Start a unit. `init_data` is made available to the worker before it
    /// receives any job; every event about the unit goes to `events`.
    ///
    /// Called from inside the pool's tokio runtime.
    fn spawn(
        &self,
        id: UnitId,
        init_data: &Value,
        events: EventSender,
    ) -> anyhow::Result<Box<dyn UnitHandle>>;
}

/// Pool-side handle to one running unit.
pub trait UnitHandle: Send {
    /// Deliver a request. Never blocks.
    fn send(&mut self, request: &Request) -> Result<(), UnitFailure>;

    /// Stop the unit. Best effort and idempotent; events the unit emits
    /// afterwards may still arrive and are ignored by the pool.
    fn terminate(&mut self);
}
