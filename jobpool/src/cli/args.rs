//! CLI argument definitions.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;

use jobpool::{PoolConfig, PoolMode, RestartPolicy};

/// jobpool - run JSON jobs on a supervised pool of isolated workers
#[derive(Parser, Debug)]
#[command(name = "jobpool")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run NDJSON payloads through a pool and print one outcome per line
    Run(RunArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// File with one JSON payload per line, `-` for stdin
    #[arg(default_value = "-")]
    pub input: String,

    /// Pool mode
    #[arg(long, value_enum, default_value_t = ModeArg::Persistent)]
    pub mode: ModeArg,

    /// Where workers run
    #[arg(long, value_enum, default_value_t = BackendArg::Process)]
    pub backend: BackendArg,

    /// Worker count (persistent) or concurrency cap (ephemeral)
    #[arg(short = 'n', long, default_value_t = 4)]
    pub size: usize,

    /// Default per-job timeout in milliseconds, 0 for none
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    // === Restart policy (persistent mode) ===
    /// Replacements allowed per window, negative for unlimited
    #[arg(long, default_value_t = 5, allow_negative_numbers = true)]
    pub max_restarts: i64,

    /// Restart window in milliseconds
    #[arg(long, default_value_t = 60_000)]
    pub restart_window_ms: u64,

    /// Delay before a replacement starts, in milliseconds
    #[arg(long, default_value_t = 0)]
    pub restart_delay_ms: u64,

    /// JSON value handed to every worker at startup
    #[arg(long)]
    pub init_data: Option<String>,
}

/// Pool modes selectable on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    /// Long-lived workers, replaced when they crash
    Persistent,
    /// A fresh worker per job
    Ephemeral,
}

/// Execution backends selectable on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendArg {
    /// Each worker is a child process of this binary
    Process,
    /// Each worker is a thread of this process
    Thread,
}

impl From<ModeArg> for PoolMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Persistent => Self::Persistent,
            ModeArg::Ephemeral => Self::Ephemeral,
        }
    }
}

impl RunArgs {
    pub fn pool_config(&self) -> Result<PoolConfig> {
        let base = match PoolMode::from(self.mode) {
            PoolMode::Persistent => PoolConfig::persistent(self.size),
            PoolMode::Ephemeral => PoolConfig::ephemeral(self.size),
        };

        let max_restarts = u32::try_from(self.max_restarts).ok();
        let restart = RestartPolicy::default()
            .with_max_restarts(max_restarts)
            .with_window(Duration::from_millis(self.restart_window_ms))
            .with_delay(Duration::from_millis(self.restart_delay_ms));

        let mut config = base.with_restart(restart);
        if let Some(ms) = self.timeout_ms {
            config = config.with_default_timeout(Duration::from_millis(ms));
        }
        if let Some(raw) = &self.init_data {
            let init_data: Value =
                serde_json::from_str(raw).context("--init-data is not valid JSON")?;
            config = config.with_init_data(init_data);
        }
        Ok(config)
    }
}
