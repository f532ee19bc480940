//! Envelopes exchanged between the pool and its execution units.
//!
//! The pool sends one request per job:
//!
//! ```text
//! {"payload": <job payload>}
//! ```
//!
//! and expects exactly one response back:
//!
//! ```text
//! {"ok": true,  "result": <value>}
//! {"ok": false, "error": {"name": "...", "message": "...", "stack": "...", "cause": ...}}
//! ```
//!
//! Process units carry these as newline-delimited JSON on stdin/stdout.
//! Anything that does not decode into one of the two response shapes is a
//! [`ProtocolViolation`], which the pool treats as a fault of the unit.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Outbound envelope wrapping a job payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// The job payload, passed through untouched.
    pub payload: Value,
}

impl Request {
    /// Wrap a payload.
    pub const fn new(payload: Value) -> Self {
        Self { payload }
    }

    /// Encode as a single NDJSON line (without the trailing newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a request line read by a worker.
    pub fn from_line(line: &str) -> Result<Self, ProtocolViolation> {
        serde_json::from_str(line)
            .map_err(|e| ProtocolViolation::new(format!("malformed request envelope: {e}")))
    }
}

/// Serialized form of an error raised by a job handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{name}: {message}")]
pub struct ErrorInfo {
    /// Error class name (defaults to "Error").
    #[serde(default = "default_error_name")]
    pub name: String,

    /// Human readable message.
    pub message: String,

    /// Optional stack or debug trace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,

    /// Optional nested cause.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Value>,
}

fn default_error_name() -> String {
    "Error".to_string()
}

impl ErrorInfo {
    /// Create an error with the given name and message.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            cause: None,
        }
    }

    /// Attach a cause.
    #[must_use]
    pub fn with_cause(mut self, cause: Value) -> Self {
        self.cause = Some(cause);
        self
    }

    /// Serialize an `anyhow` error raised by a handler.
    ///
    /// An `ErrorInfo` at the top of the chain is passed through as-is so
    /// handlers can choose their own error name. Otherwise the source chain
    /// becomes nested `cause` objects, innermost last.
    pub fn from_error(err: &anyhow::Error) -> Self {
        if let Some(info) = err.downcast_ref::<Self>() {
            return info.clone();
        }

        let cause = err
            .chain()
            .skip(1)
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .fold(None, |inner: Option<Value>, message| {
                let mut cause = Map::new();
                cause.insert("message".to_string(), Value::String(message));
                if let Some(inner) = inner {
                    cause.insert("cause".to_string(), inner);
                }
                Some(Value::Object(cause))
            });

        Self {
            name: default_error_name(),
            message: err.to_string(),
            stack: Some(format!("{err:?}")),
            cause,
        }
    }
}

/// Inbound envelope: the unit's verdict on one job.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// The handler returned a value.
    Success(Value),
    /// The handler returned an error.
    Failure(ErrorInfo),
}

impl Response {
    /// Build a response from a handler outcome.
    pub fn from_outcome(outcome: anyhow::Result<Value>) -> Self {
        match outcome {
            Ok(result) => Self::Success(result),
            Err(err) => Self::Failure(ErrorInfo::from_error(&err)),
        }
    }

    /// Encode into the wire shape.
    pub fn encode(&self) -> Value {
        match self {
            Self::Success(result) => json!({ "ok": true, "result": result }),
            Self::Failure(error) => json!({ "ok": false, "error": error }),
        }
    }

    /// Decode an inbound message.
    ///
    /// A missing `result` on a success decodes as `null`; a failure must
    /// carry an `error` object with at least a `message`.
    pub fn decode(value: Value) -> Result<Self, ProtocolViolation> {
        let Value::Object(mut envelope) = value else {
            return Err(ProtocolViolation::new(format!(
                "response envelope is not an object: {value}"
            )));
        };

        match envelope.remove("ok") {
            Some(Value::Bool(true)) => Ok(Self::Success(
                envelope.remove("result").unwrap_or(Value::Null),
            )),
            Some(Value::Bool(false)) => {
                let error = envelope
                    .remove("error")
                    .ok_or_else(|| ProtocolViolation::new("failure envelope without `error`"))?;
                let info = serde_json::from_value(error).map_err(|e| {
                    ProtocolViolation::new(format!("malformed `error` object: {e}"))
                })?;
                Ok(Self::Failure(info))
            }
            Some(other) => Err(ProtocolViolation::new(format!(
                "`ok` must be a boolean, got {other}"
            ))),
            None => Err(ProtocolViolation::new("response envelope without `ok`")),
        }
    }
}

/// A message from a unit that matches neither response shape.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("protocol violation: {0}")]
pub struct ProtocolViolation(pub String);

impl ProtocolViolation {
    pub fn new(detail: impl Into<String>) -> Self {
        Self(detail.into())
    }
}
