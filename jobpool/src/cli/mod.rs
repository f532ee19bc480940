//! CLI argument parsing and the demo job handler.

mod args;
mod commands;
pub mod handlers;

pub use args::Cli;
pub use commands::execute;
