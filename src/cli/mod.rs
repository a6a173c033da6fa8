//! Command-line interface for benchrun.
//!
//! A single command: `benchrun <framework> [benchmark] [options]`.

mod commands;

pub use commands::{invocation_stamp, parse_cli, run, run_with_cli, Cli, SCRIPT_NAME};
