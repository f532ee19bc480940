//! Child-process execution units.
//!
//! Each unit is a child process speaking NDJSON envelopes:
//! - requests are written to its stdin, one per line,
//! - responses are read from its stdout, one per line,
//! - stderr lines are forwarded to the log.
//!
//! The child finds its init data in `JOBPOOL_INIT_DATA` and recognises that
//! it runs as a worker through `JOBPOOL_WORKER` (see [`crate::worker`]).

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{EventSender, UnitBackend, UnitEvent, UnitHandle, UnitId};
use crate::error::UnitFailure;
use crate::protocol::Request;
use crate::worker::{INIT_DATA_ENV, UNIT_ID_ENV, WORKER_ENV};

/// Longest response line accepted from a worker unless configured otherwise.
pub const DEFAULT_MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// How long stdout may stay open after the worker exited. A grandchild that
/// inherited the pipe would otherwise hold the exit report back forever.
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// How to launch a worker process.
#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    /// Worker executable.
    pub program: String,

    /// Arguments passed to every worker.
    pub args: Vec<String>,

    /// Working directory of the workers, defaults to ours.
    pub working_dir: Option<PathBuf>,

    /// Extra environment, layered over the inherited one.
    pub env: HashMap<String, String>,

    /// Inherited variables to drop.
    pub env_remove: Vec<String>,

    /// Start from an empty environment.
    pub env_clear: bool,

    /// Cap on one response line. `None` means [`DEFAULT_MAX_LINE_BYTES`].
    pub max_line_bytes: Option<usize>,
}

impl ProcessOptions {
    /// Options launching `program` with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Launch the currently running executable as the worker.
    ///
    /// Pairs with [`crate::worker::is_worker_context`] so one binary can act
    /// as both launcher and worker.
    pub fn current_exe() -> Result<Self> {
        let exe = std::env::current_exe().context("Failed to locate current executable")?;
        Ok(Self::new(exe.to_string_lossy()))
    }

    /// Add an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Run workers in `dir`.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Set an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Remove an environment variable.
    #[must_use]
    pub fn env_remove(mut self, key: impl Into<String>) -> Self {
        self.env_remove.push(key.into());
        self
    }

    /// Clear the environment before setting variables.
    #[must_use]
    pub const fn env_clear(mut self) -> Self {
        self.env_clear = true;
        self
    }

    /// Treat response lines longer than `bytes` as a protocol violation.
    #[must_use]
    pub const fn max_line_bytes(mut self, bytes: usize) -> Self {
        self.max_line_bytes = Some(bytes);
        self
    }

    fn line_limit(&self) -> usize {
        self.max_line_bytes.unwrap_or(DEFAULT_MAX_LINE_BYTES)
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);

        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }

        if self.env_clear {
            cmd.env_clear();
        }

        for key in &self.env_remove {
            cmd.env_remove(key);
        }

        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        cmd
    }
}

/// Backend running every unit as a child process.
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    options: ProcessOptions,
}

impl ProcessBackend {
    pub const fn new(options: ProcessOptions) -> Self {
        Self { options }
    }
}

impl UnitBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    fn spawn(
        &self,
        id: UnitId,
        init_data: &Value,
        events: EventSender,
    ) -> Result<Box<dyn UnitHandle>> {
        let init_data = serde_json::to_string(init_data).context("Failed to encode init data")?;

        let mut cmd = self.options.command();
        cmd.env(WORKER_ENV, "1")
            .env(INIT_DATA_ENV, init_data)
            .env(UNIT_ID_ENV, id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn process: {}", self.options.program))?;

        let stdin = child.stdin.take().context("Failed to capture stdin")?;
        let stdout = child.stdout.take().context("Failed to capture stdout")?;
        let stderr = child.stderr.take().context("Failed to capture stderr")?;

        debug!(unit = id, pid = ?child.id(), program = %self.options.program, "spawned worker process");

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();

        tokio::spawn(write_requests(id, stdin, request_rx, events.clone()));
        let limit = self.options.line_limit();
        let reader = tokio::spawn(read_responses(id, stdout, limit, events.clone()));
        tokio::spawn(forward_stderr(id, stderr));
        tokio::spawn(wait_for_exit(id, child, reader, kill_rx, events));

        Ok(Box::new(ProcessUnit {
            requests: Some(request_tx),
            kill: Some(kill_tx),
        }))
    }
}

/// Pool-side handle to a worker process.
struct ProcessUnit {
    requests: Option<mpsc::UnboundedSender<String>>,
    kill: Option<oneshot::Sender<()>>,
}

impl UnitHandle for ProcessUnit {
    fn send(&mut self, request: &Request) -> Result<(), UnitFailure> {
        let line = request
            .to_line()
            .map_err(|e| UnitFailure::Transport(format!("failed to encode request: {e}")))?;

        self.requests
            .as_ref()
            .ok_or_else(|| UnitFailure::Transport("unit is terminating".to_string()))?
            .send(line)
            .map_err(|_| UnitFailure::Transport("worker stdin is closed".to_string()))
    }

    fn terminate(&mut self) {
        // Closing the request channel closes the child's stdin.
        self.requests.take();
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

impl Drop for ProcessUnit {
    fn drop(&mut self) {
        self.terminate();
    }
}

async fn write_requests(
    id: UnitId,
    mut stdin: ChildStdin,
    mut requests: mpsc::UnboundedReceiver<String>,
    events: EventSender,
) {
    while let Some(mut line) = requests.recv().await {
        line.push('\n');
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;

        if let Err(e) = written {
            let failure = UnitFailure::Transport(format!("failed to write to worker stdin: {e}"));
            let _ = events.send(UnitEvent::failure(id, failure));
            break;
        }
    }
}

async fn read_responses(id: UnitId, stdout: ChildStdout, limit: usize, events: EventSender) {
    let mut reader = BufReader::new(stdout);
    let mut line = Vec::new();
    let cap = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);

    loop {
        line.clear();
        let read = (&mut reader).take(cap).read_until(b'\n', &mut line).await;
        match read {
            Ok(0) => break,
            Ok(_) => {
                if line.last() != Some(&b'\n') && line.len() > limit {
                    let failure = UnitFailure::Protocol(format!(
                        "worker wrote a line longer than {limit} bytes"
                    ));
                    let _ = events.send(UnitEvent::failure(id, failure));
                    break;
                }
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                let (event, well_formed) = match serde_json::from_slice::<Value>(&line) {
                    Ok(value) => (UnitEvent::message(id, value), true),
                    Err(e) => (
                        UnitEvent::failure(
                            id,
                            UnitFailure::Protocol(format!("worker wrote invalid JSON: {e}")),
                        ),
                        false,
                    ),
                };
                if events.send(event).is_err() || !well_formed {
                    break;
                }
            }
            Err(e) => {
                let failure = UnitFailure::Transport(format!("failed to read worker stdout: {e}"));
                let _ = events.send(UnitEvent::failure(id, failure));
                break;
            }
        }
    }
}

async fn forward_stderr(id: UnitId, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(unit = id, "[worker stderr] {line}");
    }
}

async fn wait_for_exit(
    id: UnitId,
    mut child: Child,
    mut reader: JoinHandle<()>,
    kill: oneshot::Receiver<()>,
    events: EventSender,
) {
    // A dropped kill sender counts as a kill request too.
    let status = tokio::select! {
        status = child.wait() => Some(status),
        _ = kill => None,
    };

    let Some(status) = status else {
        if let Err(e) = child.kill().await {
            trace!(unit = id, error = %e, "worker process already gone");
        }
        reader.abort();
        debug!(unit = id, "worker process terminated");
        return;
    };

    // Let the reader drain stdout first so a reply written just before
    // exiting is delivered ahead of the exit.
    if tokio::time::timeout(EXIT_DRAIN_GRACE, &mut reader).await.is_err() {
        debug!(unit = id, "worker stdout still open after exit");
        reader.abort();
    }

    match status {
        Ok(status) => {
            debug!(unit = id, code = ?status.code(), "worker process exited");
            let _ = events.send(UnitEvent::exited(id, status.code()));
        }
        Err(e) => {
            let failure = UnitFailure::Transport(format!("failed to wait for worker process: {e}"));
            let _ = events.send(UnitEvent::failure(id, failure));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::UnitEventKind;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    fn shell(script: &str) -> ProcessBackend {
        ProcessBackend::new(ProcessOptions::new("sh").arg("-c").arg(script))
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<UnitEvent>) -> UnitEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for unit event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_round_trip_with_init_data() {
        let backend = shell(
            r#"read line; printf '{"ok":true,"result":%s}\n' "$JOBPOOL_INIT_DATA""#,
        );
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut unit = backend.spawn(3, &json!({"region": "eu"}), tx).unwrap();
        unit.send(&Request::new(json!("hi"))).unwrap();

        let event = next_event(&mut rx).await;
        assert_eq!(event.unit, 3);
        assert_eq!(
            event.kind,
            UnitEventKind::Message(json!({"ok": true, "result": {"region": "eu"}}))
        );

        let event = next_event(&mut rx).await;
        assert_eq!(event.kind, UnitEventKind::Exited(Some(0)));
    }

    #[tokio::test]
    async fn test_worker_env_is_set() {
        let backend = shell(
            r#"read line; printf '{"ok":true,"result":"%s-%s"}\n' "$JOBPOOL_WORKER" "$JOBPOOL_UNIT_ID""#,
        );
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut unit = backend.spawn(9, &Value::Null, tx).unwrap();
        unit.send(&Request::new(Value::Null)).unwrap();

        let event = next_event(&mut rx).await;
        assert_eq!(
            event.kind,
            UnitEventKind::Message(json!({"ok": true, "result": "1-9"}))
        );
    }

    #[tokio::test]
    async fn test_invalid_json_is_protocol_failure() {
        let backend = shell("read line; echo not-json; sleep 5");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut unit = backend.spawn(0, &Value::Null, tx).unwrap();
        unit.send(&Request::new(json!(1))).unwrap();

        let event = next_event(&mut rx).await;
        assert!(matches!(
            event.kind,
            UnitEventKind::Failure(UnitFailure::Protocol(_))
        ));
        unit.terminate();
    }

    #[tokio::test]
    async fn test_exit_code_reported() {
        let backend = shell("exit 42");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _unit = backend.spawn(1, &Value::Null, tx).unwrap();

        let event = next_event(&mut rx).await;
        assert_eq!(event.kind, UnitEventKind::Exited(Some(42)));
    }

    #[tokio::test]
    async fn test_exit_reported_while_grandchild_holds_stdout() {
        let backend = shell("read line; sleep 20 & exit 3");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut unit = backend.spawn(4, &Value::Null, tx).unwrap();
        unit.send(&Request::new(json!(1))).unwrap();

        let event = timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("exit never reported")
            .expect("event channel closed");
        assert_eq!(event.unit, 4);
        assert_eq!(event.kind, UnitEventKind::Exited(Some(3)));
    }

    #[tokio::test]
    async fn test_overlong_line_is_protocol_failure() {
        let options = ProcessOptions::new("sh")
            .arg("-c")
            .arg("read line; head -c 5000 /dev/zero | tr '\\0' a; sleep 5")
            .max_line_bytes(1024);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut unit = ProcessBackend::new(options)
            .spawn(0, &Value::Null, tx)
            .unwrap();
        unit.send(&Request::new(json!(1))).unwrap();

        let event = next_event(&mut rx).await;
        let UnitEventKind::Failure(UnitFailure::Protocol(detail)) = event.kind else {
            panic!("expected protocol failure, got {:?}", event.kind);
        };
        assert!(detail.contains("1024 bytes"));
        unit.terminate();
    }

    #[tokio::test]
    async fn test_line_at_limit_is_accepted() {
        let options = ProcessOptions::new("sh")
            .arg("-c")
            .arg(r#"read line; printf '{"ok":true}\n'; sleep 5"#)
            .max_line_bytes(11);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut unit = ProcessBackend::new(options)
            .spawn(0, &Value::Null, tx)
            .unwrap();
        unit.send(&Request::new(json!(1))).unwrap();

        let event = next_event(&mut rx).await;
        assert_eq!(event.kind, UnitEventKind::Message(json!({"ok": true})));
        unit.terminate();
    }

    #[tokio::test]
    async fn test_terminate_kills_quietly() {
        let backend = shell("sleep 30");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut unit = backend.spawn(1, &Value::Null, tx).unwrap();
        unit.terminate();
        unit.terminate();

        // All unit tasks finish without reporting an exit, closing the channel.
        let closed = timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert!(closed.is_none());
    }

    #[tokio::test]
    async fn test_spawn_nonexistent() {
        let backend = ProcessBackend::new(ProcessOptions::new("nonexistent_command_12345"));
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(backend.spawn(0, &Value::Null, tx).is_err());
    }

    #[tokio::test]
    async fn test_send_after_terminate_fails() {
        let backend = shell("sleep 30");
        let (tx, _rx) = mpsc::unbounded_channel();

        let mut unit = backend.spawn(1, &Value::Null, tx).unwrap();
        unit.terminate();
        assert!(unit.send(&Request::new(json!(1))).is_err());
    }
}
