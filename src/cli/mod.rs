//! Command-line interface for task-forge.
//!
//! Provides commands for running pipeline workers, starting pipelines and
//! inspecting queue statistics.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
