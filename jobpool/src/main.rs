//! jobpool - run NDJSON job payloads through a supervised worker pool.
//!
//! The same binary is both sides of the pool:
//! - launched normally it parses the CLI and runs a pool
//! - launched by a process pool (`JOBPOOL_WORKER` set) it serves the
//!   built-in demo handler on stdin/stdout

mod cli;

use anyhow::Result;
use clap::Parser;
use jobpool::worker;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{execute, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    // stdout belongs to the protocol in workers, so logs always go to stderr.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive("jobpool=info".parse()?))
        .init();

    if worker::is_worker_context() {
        return worker::serve(cli::handlers::builtin).await;
    }

    let cli = Cli::parse();
    execute(cli).await
}
