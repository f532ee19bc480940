//! In-process execution units backed by OS threads.
//!
//! Each unit is a dedicated thread running the registered handler. Requests
//! reach it over a channel and responses go out as regular unit events, so
//! the pool cannot tell a thread unit from a process unit.
//!
//! A thread cannot be killed. Terminating a unit closes its request channel
//! and cancels its [`WorkerContext`]; a handler that is still running
//! finishes in the background and its result is discarded.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{EventSender, UnitBackend, UnitEvent, UnitHandle, UnitId};
use crate::error::UnitFailure;
use crate::protocol::{Request, Response};
use crate::worker::{self, WorkerContext};

/// Job handler run by thread units.
pub type Handler = Arc<dyn Fn(Value, &WorkerContext) -> Result<Value> + Send + Sync>;

/// Backend running every unit as a thread of this process.
///
/// Terminating a unit whose handler is stuck does not stop its thread: the
/// thread lives on until the handler returns. Timeouts and aborts on handlers
/// that never return therefore leak one OS thread each. Handlers that may
/// block should poll [`WorkerContext::is_terminating`], and
/// [`ThreadBackend::live_threads`] shows how many unit threads still run.
#[derive(Clone)]
pub struct ThreadBackend {
    handler: Handler,
    live: Arc<AtomicUsize>,
}

impl ThreadBackend {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(Value, &WorkerContext) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Unit threads still running, including threads of terminated units
    /// whose handler has not returned yet.
    pub fn live_threads(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ThreadBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadBackend")
            .field("live_threads", &self.live_threads())
            .finish_non_exhaustive()
    }
}

impl UnitBackend for ThreadBackend {
    fn name(&self) -> &'static str {
        "thread"
    }

    fn spawn(
        &self,
        id: UnitId,
        init_data: &Value,
        events: EventSender,
    ) -> Result<Box<dyn UnitHandle>> {
        let (request_tx, request_rx) = std_mpsc::channel();
        let cancel = CancellationToken::new();
        let ctx = WorkerContext::for_thread(id, init_data.clone(), cancel.clone());
        let handler = Arc::clone(&self.handler);
        let live = Arc::clone(&self.live);

        // The thread's exit guard takes this count back down.
        self.live.fetch_add(1, Ordering::SeqCst);
        let spawned = thread::Builder::new()
            .name(format!("jobpool-unit-{id}"))
            .spawn(move || run_unit(&ctx, &handler, &request_rx, events, live));
        if let Err(err) = spawned {
            self.live.fetch_sub(1, Ordering::SeqCst);
            return Err(err).context("Failed to spawn worker thread");
        }

        debug!(unit = id, "spawned worker thread");

        Ok(Box::new(ThreadUnit {
            requests: Some(request_tx),
            cancel,
        }))
    }
}

fn run_unit(
    ctx: &WorkerContext,
    handler: &Handler,
    requests: &std_mpsc::Receiver<Request>,
    events: EventSender,
    live: Arc<AtomicUsize>,
) {
    let exit = ExitNotice {
        unit: ctx.unit_id(),
        events,
        live,
    };
    worker::enter_thread_context(ctx.init_data().clone());

    while let Ok(request) = requests.recv() {
        let response = Response::from_outcome(handler(request.payload, ctx));
        if ctx.is_terminating() {
            break;
        }
        let reply = UnitEvent::message(ctx.unit_id(), response.encode());
        if exit.events.send(reply).is_err() {
            break;
        }
    }
}

/// Reports the end of a unit thread, including by panic.
struct ExitNotice {
    unit: UnitId,
    events: EventSender,
    live: Arc<AtomicUsize>,
}

impl Drop for ExitNotice {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        let event = if thread::panicking() {
            UnitEvent::failure(
                self.unit,
                UnitFailure::Transport("worker thread panicked".to_string()),
            )
        } else {
            UnitEvent::exited(self.unit, None)
        };
        let _ = self.events.send(event);
    }
}

/// Pool-side handle to a worker thread.
struct ThreadUnit {
    requests: Option<std_mpsc::Sender<Request>>,
    cancel: CancellationToken,
}

impl UnitHandle for ThreadUnit {
    fn send(&mut self, request: &Request) -> Result<(), UnitFailure> {
        self.requests
            .as_ref()
            .ok_or_else(|| UnitFailure::Transport("unit is terminating".to_string()))?
            .send(request.clone())
            .map_err(|_| UnitFailure::Transport("worker thread has stopped".to_string()))
    }

    fn terminate(&mut self) {
        self.requests.take();
        self.cancel.cancel();
    }
}

impl Drop for ThreadUnit {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::UnitEventKind;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<UnitEvent>) -> UnitEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for unit event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_handler_sees_init_data_and_context() {
        let backend = ThreadBackend::new(|payload, ctx| {
            Ok(json!({
                "payload": payload,
                "init": ctx.init_data(),
                "worker": worker::is_worker_context(),
                "thread_init": worker::init_data(),
            }))
        });
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut unit = backend.spawn(2, &json!({"k": 1}), tx).unwrap();
        unit.send(&Request::new(json!("x"))).unwrap();

        let event = next_event(&mut rx).await;
        assert_eq!(event.unit, 2);
        assert_eq!(
            event.kind,
            UnitEventKind::Message(json!({
                "ok": true,
                "result": {"payload": "x", "init": {"k": 1}, "worker": true, "thread_init": {"k": 1}}
            }))
        );
    }

    #[tokio::test]
    async fn test_handler_error_becomes_failure_envelope() {
        let backend = ThreadBackend::new(|_, _| anyhow::bail!("no good"));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut unit = backend.spawn(0, &Value::Null, tx).unwrap();
        unit.send(&Request::new(Value::Null)).unwrap();

        let UnitEventKind::Message(value) = next_event(&mut rx).await.kind else {
            panic!("expected message");
        };
        let Response::Failure(info) = Response::decode(value).unwrap() else {
            panic!("expected failure envelope");
        };
        assert_eq!(info.message, "no good");
    }

    #[tokio::test]
    async fn test_panic_reports_transport_failure() {
        let backend = ThreadBackend::new(|_, _| panic!("handler blew up"));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut unit = backend.spawn(5, &Value::Null, tx).unwrap();
        unit.send(&Request::new(Value::Null)).unwrap();

        let event = next_event(&mut rx).await;
        assert_eq!(event.unit, 5);
        assert!(matches!(
            event.kind,
            UnitEventKind::Failure(UnitFailure::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_terminate_ends_thread() {
        let backend = ThreadBackend::new(|payload, _| Ok(payload));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut unit = backend.spawn(1, &Value::Null, tx).unwrap();
        unit.terminate();

        let event = next_event(&mut rx).await;
        assert_eq!(event.kind, UnitEventKind::Exited(None));
        assert!(unit.send(&Request::new(json!(1))).is_err());
    }

    #[tokio::test]
    async fn test_terminate_discards_running_result() {
        let backend = ThreadBackend::new(|_, ctx| {
            while !ctx.is_terminating() {
                thread::sleep(Duration::from_millis(5));
            }
            Ok(json!("late"))
        });
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut unit = backend.spawn(1, &Value::Null, tx).unwrap();
        unit.send(&Request::new(Value::Null)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        unit.terminate();

        let event = next_event(&mut rx).await;
        assert_eq!(event.kind, UnitEventKind::Exited(None));
    }

    #[tokio::test]
    async fn test_wedged_handler_keeps_thread_counted() {
        let release = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let gate = Arc::clone(&release);
        let backend = ThreadBackend::new(move |_, _| {
            while !gate.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(5));
            }
            Ok(Value::Null)
        });
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut unit = backend.spawn(1, &Value::Null, tx).unwrap();
        assert_eq!(backend.live_threads(), 1);
        unit.send(&Request::new(Value::Null)).unwrap();
        unit.terminate();

        // The handler ignores termination, so its thread is still there.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(backend.live_threads(), 1);

        release.store(true, Ordering::SeqCst);
        let event = next_event(&mut rx).await;
        assert_eq!(event.kind, UnitEventKind::Exited(None));
        assert_eq!(backend.live_threads(), 0);
    }
}
