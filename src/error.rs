//! Error types for benchrun operations.
//!
//! Defines one error type per subsystem:
//! - Configuration loading and definition lookup
//! - Work unit selection (task / fold)
//! - Run mode parsing
//! - Backend failures that make the execution environment unusable
//! - Docker daemon interactions
//! - `aws` CLI invocations
//!
//! Failures of a single (task, fold) unit are not errors at this level:
//! they are recorded in the run results and never abort sibling units.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or merging configuration and definitions.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Malformed configuration in '{path}': {message}")]
    Malformed { path: PathBuf, message: String },

    #[error("Failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Framework '{0}' is not defined in any frameworks definition file")]
    FrameworkNotFound(String),

    #[error("Benchmark '{0}' not found (not a file, not a user or built-in benchmark)")]
    BenchmarkNotFound(String),

    #[error("Invalid benchmark descriptor '{name}': {reason}")]
    InvalidDescriptor { name: String, reason: String },
}

/// Errors raised when a task or fold selection does not match the benchmark.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error("Task '{task}' not found in benchmark '{benchmark}'")]
    TaskNotFound { task: String, benchmark: String },

    #[error("Fold {fold} is not defined for task '{task}' (available: {available:?})")]
    FoldNotFound {
        task: String,
        fold: u32,
        available: Vec<u32>,
    },

    #[error("Fold ids can only be selected together with a task")]
    FoldsWithoutTask,
}

/// Error raised for an unsupported run mode string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModeError {
    #[error("Unsupported mode '{0}': mode must be one of 'aws', 'docker' or 'local'")]
    Unsupported(String),
}

/// Errors that can occur during Docker operations.
#[derive(Debug, Error)]
pub enum DockerError {
    #[error("Docker build failed: {0}")]
    BuildFailed(String),

    #[error("Docker run failed: {0}")]
    RunFailed(String),

    #[error("Container '{id}' not found")]
    ContainerNotFound { id: String },

    #[error("Docker daemon not available: {0}")]
    DaemonUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while driving the `aws` command line client.
#[derive(Debug, Error)]
pub enum AwsError {
    #[error("aws CLI not available: {0}")]
    NotInstalled(String),

    #[error("aws CLI configuration or credentials error: {0}")]
    Configuration(String),

    #[error("aws {command} failed with exit code {code}: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("Unexpected aws CLI response: {0}")]
    InvalidResponse(String),
}

impl AwsError {
    /// Whether no further aws call can succeed in this environment.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AwsError::NotInstalled(_) | AwsError::Configuration(_))
    }
}

/// Fatal backend errors: the execution environment cannot be used anymore.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Setup failed: {0}")]
    Setup(String),

    #[error("Docker error: {0}")]
    Docker(#[from] DockerError),

    #[error("AWS error: {0}")]
    Aws(#[from] AwsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level error for an invocation.
#[derive(Debug, Error)]
pub enum BenchError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error(transparent)]
    Mode(#[from] ModeError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}
