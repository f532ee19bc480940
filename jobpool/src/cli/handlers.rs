//! Built-in demo handler served by `jobpool` workers.
//!
//! Payloads are objects with an `op` field:
//!
//! | op      | fields          | result                                 |
//! |---------|-----------------|----------------------------------------|
//! | `echo`  | `value`         | `value`                                |
//! | `sleep` | `ms`            | `{"slept_ms": ms}` after sleeping      |
//! | `fail`  | `message`       | handler error named `HandlerError`     |
//! | `crash` | `code`          | process exits (thread units panic)     |
//! | `hang`  |                 | never returns until the unit is killed |
//! | `init`  |                 | the worker's init data                 |
//! | `unit`  |                 | the worker's unit id                   |
//! | `pid`   |                 | the worker's OS process id             |

use std::thread;
use std::time::Duration;

use anyhow::{bail, Result};
use serde_json::{json, Value};

use jobpool::worker::{ContextKind, WorkerContext};
use jobpool::ErrorInfo;

const HANG_POLL: Duration = Duration::from_millis(10);

pub fn builtin(payload: Value, ctx: &WorkerContext) -> Result<Value> {
    let op = payload.get("op").and_then(Value::as_str).unwrap_or("echo");

    match op {
        "echo" => Ok(payload.get("value").cloned().unwrap_or(Value::Null)),
        "sleep" => {
            let ms = payload.get("ms").and_then(Value::as_u64).unwrap_or(0);
            thread::sleep(Duration::from_millis(ms));
            Ok(json!({ "slept_ms": ms }))
        }
        "fail" => {
            let message = payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("requested failure");
            Err(ErrorInfo::new("HandlerError", message).into())
        }
        "crash" => {
            let code = payload
                .get("code")
                .and_then(Value::as_i64)
                .and_then(|c| i32::try_from(c).ok())
                .unwrap_or(1);
            match ctx.kind() {
                ContextKind::Process => std::process::exit(code),
                ContextKind::Thread => panic!("crash requested with code {code}"),
            }
        }
        "hang" => {
            while !ctx.is_terminating() {
                thread::sleep(HANG_POLL);
            }
            bail!("terminated while hanging")
        }
        "init" => Ok(ctx.init_data().clone()),
        "unit" => Ok(json!(ctx.unit_id())),
        "pid" => Ok(json!(std::process::id())),
        other => bail!("unknown op `{other}`"),
    }
}
