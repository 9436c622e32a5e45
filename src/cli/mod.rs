//! Command-line interface for sqlforge.
//!
//! Provides commands for answering questions and inspecting failed runs.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
