//! Execution backends.
//!
//! A backend prepares an execution environment for a framework and runs the
//! work units of a benchmark in it. All variants implement [`Backend`]:
//!
//! ```text
//! RunMode::Local  → LocalBackend   framework installed on this host, one process per unit
//! RunMode::Docker → DockerBackend  framework image, one container per unit
//! RunMode::Aws    → AwsBackend     framework image on EC2, one instance per unit
//! ```
//!
//! Units run concurrently up to the backend's `parallel_jobs`. A failing
//! unit is recorded as a failed [`RunResult`](crate::results::RunResult);
//! only a [`BackendError`] (the environment itself became unusable) aborts
//! the remaining units.

pub mod aws;
pub mod context;
pub mod docker;
pub mod local;
pub mod pool;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{BackendError, BenchError, ModeError};
use crate::results::RunResults;

pub use aws::AwsBackend;
pub use context::BackendContext;
pub use docker::DockerBackend;
pub use local::LocalBackend;
pub use pool::UnitError;

/// Where the benchmark tasks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Local,
    Docker,
    Aws,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Local => "local",
            RunMode::Docker => "docker",
            RunMode::Aws => "aws",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = ModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(RunMode::Local),
            "docker" => Ok(RunMode::Docker),
            "aws" => Ok(RunMode::Aws),
            other => Err(ModeError::Unsupported(other.to_string())),
        }
    }
}

/// Policy for preparing the execution environment before running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetupMode {
    /// Set up only if the environment is missing or stale.
    #[default]
    Auto,
    /// Never set up.
    Skip,
    /// Always set up, even if the environment looks ready.
    Force,
    /// Set up like `auto`, then stop without running the benchmark.
    Only,
}

impl SetupMode {
    /// Decides whether provisioning must run given the detected state.
    pub fn requires_provisioning(self, environment_ready: bool) -> bool {
        match self {
            SetupMode::Skip => false,
            SetupMode::Force => true,
            SetupMode::Auto | SetupMode::Only => !environment_ready,
        }
    }
}

impl fmt::Display for SetupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SetupMode::Auto => "auto",
            SetupMode::Skip => "skip",
            SetupMode::Force => "force",
            SetupMode::Only => "only",
        };
        f.write_str(s)
    }
}

/// Setup and run contract shared by all execution backends.
#[async_trait]
pub trait Backend: Send + Sync {
    /// The run mode this backend implements.
    fn mode(&self) -> RunMode;

    /// Prepares the execution environment according to `mode`.
    ///
    /// Calling it again with the same mode leaves the environment in the
    /// same state.
    async fn setup(&self, mode: SetupMode) -> Result<(), BackendError>;

    /// Runs every (task, fold) pair of the benchmark.
    async fn run(&self, save_scores: bool) -> Result<RunResults, BenchError>;

    /// Runs the folds of a single task, all of them if `fold_ids` is `None`.
    async fn run_one(
        &self,
        task_id: &str,
        fold_ids: Option<&[u32]>,
        save_scores: bool,
    ) -> Result<RunResults, BenchError>;
}

/// Builds the backend matching a run mode.
pub trait BackendFactory: Send + Sync {
    fn create(&self, mode: RunMode, context: BackendContext) -> Result<Box<dyn Backend>, BenchError>;
}

/// Factory for the built-in backends.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultBackendFactory;

impl BackendFactory for DefaultBackendFactory {
    fn create(&self, mode: RunMode, context: BackendContext) -> Result<Box<dyn Backend>, BenchError> {
        let backend: Box<dyn Backend> = match mode {
            RunMode::Local => Box::new(LocalBackend::new(context)),
            RunMode::Docker => Box::new(DockerBackend::new(context)?),
            RunMode::Aws => Box::new(AwsBackend::new(context)),
        };
        Ok(backend)
    }
}
