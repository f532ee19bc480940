//! Scripted in-memory backend for pool tests.
//!
//! Units answer according to the payload they receive:
//! - `{"ok": v}` replies with a success envelope carrying `v`
//! - `{"err": "msg"}` replies with a failure envelope
//! - `{"raw": v}` sends `v` verbatim (for protocol violations)
//! - `{"exit": code}` reports the unit as exited
//! - `{"hang": true}` never answers
//!
//! Adding `"delay_ms": n` defers the answer. Every spawn, send and terminate
//! is recorded in a shared log. [`ScriptedBackend::stray_reply`] makes unit 0
//! answer once right after it starts, before any job is bound.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use super::{EventSender, UnitBackend, UnitEvent, UnitHandle, UnitId};
use crate::error::UnitFailure;
use crate::protocol::Request;

#[derive(Clone, Default)]
pub(crate) struct ScriptedBackend {
    log: Arc<Mutex<Vec<String>>>,
    busy: Arc<Mutex<HashSet<UnitId>>>,
    fail_spawn: bool,
    stray_reply: bool,
}

impl ScriptedBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn failing() -> Self {
        Self {
            fail_spawn: true,
            ..Self::default()
        }
    }

    pub(crate) fn stray_reply() -> Self {
        Self {
            stray_reply: true,
            ..Self::default()
        }
    }

    pub(crate) fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Position of the first log line equal to `line`.
    pub(crate) fn position(&self, line: &str) -> Option<usize> {
        self.log().iter().position(|l| l == line)
    }

    /// Payloads sent to units, in order, as `"<unit> <payload>"`.
    pub(crate) fn sends(&self) -> Vec<String> {
        self.log()
            .into_iter()
            .filter_map(|l| l.strip_prefix("send ").map(ToString::to_string))
            .collect()
    }

    fn record(&self, line: String) {
        self.log.lock().unwrap().push(line);
    }
}

impl UnitBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn spawn(
        &self,
        id: UnitId,
        _init_data: &Value,
        events: EventSender,
    ) -> anyhow::Result<Box<dyn UnitHandle>> {
        if self.fail_spawn {
            anyhow::bail!("scripted spawn failure");
        }
        self.record(format!("spawn {id}"));
        if self.stray_reply && id == 0 {
            let _ = events.send(UnitEvent::message(
                id,
                json!({"ok": true, "result": "stray"}),
            ));
        }
        Ok(Box::new(ScriptedUnit {
            id,
            backend: self.clone(),
            events,
        }))
    }
}

struct ScriptedUnit {
    id: UnitId,
    backend: ScriptedBackend,
    events: EventSender,
}

impl ScriptedUnit {
    fn answer(&self, payload: &Value) -> Option<UnitEvent> {
        let id = self.id;
        if let Some(result) = payload.get("ok") {
            return Some(UnitEvent::message(id, json!({"ok": true, "result": result})));
        }
        if let Some(message) = payload.get("err") {
            return Some(UnitEvent::message(
                id,
                json!({"ok": false, "error": {"name": "TestError", "message": message}}),
            ));
        }
        if let Some(raw) = payload.get("raw") {
            return Some(UnitEvent::message(id, raw.clone()));
        }
        if let Some(code) = payload.get("exit") {
            let code = code.as_i64().and_then(|c| i32::try_from(c).ok());
            return Some(UnitEvent::exited(id, code));
        }
        None
    }
}

impl UnitHandle for ScriptedUnit {
    fn send(&mut self, request: &Request) -> Result<(), UnitFailure> {
        let id = self.id;
        self.backend
            .record(format!("send {id} {}", request.payload));

        if !self.backend.busy.lock().unwrap().insert(id) {
            self.backend.record(format!("overlap {id}"));
        }

        let Some(event) = self.answer(&request.payload) else {
            return Ok(());
        };

        let busy = Arc::clone(&self.backend.busy);
        let events = self.events.clone();
        let delay = request.payload.get("delay_ms").and_then(Value::as_u64);
        match delay {
            Some(ms) => {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    busy.lock().unwrap().remove(&id);
                    let _ = events.send(event);
                });
            }
            None => {
                busy.lock().unwrap().remove(&id);
                let _ = events.send(event);
            }
        }
        Ok(())
    }

    fn terminate(&mut self) {
        self.backend.busy.lock().unwrap().remove(&self.id);
        self.backend.record(format!("terminate {}", self.id));
    }
}
