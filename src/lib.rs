//! benchrun: set up a framework and run it against a benchmark.
//!
//! A benchmark is a list of tasks, each evaluated over several folds. The
//! same run can happen on this host, in one Docker container per unit, or
//! on one EC2 instance per unit.

pub mod aws;
pub mod backend;
pub mod benchmark;
pub mod cli;
pub mod config;
pub mod docker;
pub mod error;
pub mod orchestrator;
pub mod results;

pub use backend::{Backend, BackendFactory, DefaultBackendFactory, RunMode, SetupMode};
pub use error::{
    AwsError, BackendError, BenchError, ConfigError, DockerError, ModeError, SelectionError,
};
pub use orchestrator::{Invocation, Orchestrator, Outcome};
pub use results::{RunResult, RunResults, RunStatus, Scores};
