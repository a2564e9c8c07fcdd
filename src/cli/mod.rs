//! Command-line interface for swe-runner.
//!
//! Provides `run-one` for a single instruction and `run-batch` for a
//! dataset.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
