//! CLI command execution.

use std::io::Write;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tracing::info;

use jobpool::{
    JobId, Pool, PoolError, ProcessBackend, ProcessOptions, SubmitOptions, ThreadBackend,
};

use super::args::{BackendArg, Cli, Commands, RunArgs};
use super::handlers;

/// Execute the parsed CLI command.
pub async fn execute(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run(args) => run(args).await,
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let config = args.pool_config()?;
    let payloads = read_payloads(&args.input).await?;

    let pool = match args.backend {
        BackendArg::Process => {
            let options = ProcessOptions::current_exe()?;
            Pool::new(config, ProcessBackend::new(options))
        }
        BackendArg::Thread => Pool::new(config, ThreadBackend::new(handlers::builtin)),
    };

    let records = run_payloads(&pool, payloads).await;
    pool.shutdown("run complete").await;

    let failed = records.iter().filter(|r| r["ok"] == json!(false)).count();
    info!(jobs = records.len(), failed, "run finished");

    let mut stdout = std::io::stdout().lock();
    for record in &records {
        writeln!(stdout, "{record}").context("Failed to write to stdout")?;
    }
    Ok(())
}

/// Read one JSON payload per non-empty line from a file, or stdin for `-`.
async fn read_payloads(input: &str) -> Result<Vec<Value>> {
    let text = if input == "-" {
        let mut text = String::new();
        tokio::io::stdin()
            .read_to_string(&mut text)
            .await
            .context("Failed to read payloads from stdin")?;
        text
    } else {
        tokio::fs::read_to_string(input)
            .await
            .with_context(|| format!("Failed to read {input}"))?
    };

    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line).with_context(|| format!("Invalid JSON on line {}", n + 1))
        })
        .collect()
}

/// Submit every payload up front, then collect outcomes in submission order.
async fn run_payloads(pool: &Pool, payloads: Vec<Value>) -> Vec<Value> {
    let handles: Vec<_> = payloads
        .into_iter()
        .map(|payload| pool.submit(payload, SubmitOptions::default()))
        .collect();

    let mut records = Vec::with_capacity(handles.len());
    for (index, handle) in handles.into_iter().enumerate() {
        let job = handle.id();
        records.push(outcome_record(index, job, handle.await));
    }
    records
}

fn outcome_record(index: usize, job: JobId, outcome: Result<Value, PoolError>) -> Value {
    match outcome {
        Ok(result) => json!({
            "index": index,
            "job": job.to_string(),
            "ok": true,
            "result": result,
        }),
        Err(PoolError::Job(info)) => json!({
            "index": index,
            "job": job.to_string(),
            "ok": false,
            "kind": "job",
            "error": info,
        }),
        Err(err) => json!({
            "index": index,
            "job": job.to_string(),
            "ok": false,
            "kind": err.kind(),
            "error": { "message": err.to_string() },
        }),
    }
}
