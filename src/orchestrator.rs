//! Invocation lifecycle.
//!
//! ```text
//! Init ──resolve_config──▶ ConfigResolved ──select_backend──▶ BackendSelected
//!                                                                  │ setup
//!                                        ┌── SetupOutcome::Done ◀──┤ (setup = only)
//!                                        │                         ▼
//!                                        │                   SetupComplete ──run──▶ RunResults
//! ```
//!
//! Each state is a distinct type, so running a backend that was never set
//! up does not compile. Any error ends the lifecycle.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::backend::context::timestamp;
use crate::backend::{Backend, BackendContext, BackendFactory, RunMode, SetupMode};
use crate::benchmark::{load_benchmark, load_framework};
use crate::config::{self, ConfigOverrides, EffectiveConfig, Settings};
use crate::error::{BenchError, SelectionError};
use crate::results::RunResults;

/// What the user asked for.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub framework: String,
    /// Benchmark name or descriptor path.
    pub benchmark: String,
    /// Run mode as given, validated by [`Orchestrator::resolve_config`].
    pub mode: String,
    pub task: Option<String>,
    /// Fold ids; empty means all folds.
    pub folds: Vec<u32>,
    pub input_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub user_dir: Option<PathBuf>,
    pub parallel_jobs: usize,
    pub setup: SetupMode,
    pub region: Option<String>,
    pub script: Option<String>,
    /// Timestamp of log and score files.
    pub stamp: String,
}

impl Invocation {
    pub fn new(framework: impl Into<String>, benchmark: impl Into<String>) -> Self {
        Self {
            framework: framework.into(),
            benchmark: benchmark.into(),
            mode: RunMode::Local.to_string(),
            task: None,
            folds: Vec::new(),
            input_dir: None,
            output_dir: None,
            user_dir: None,
            parallel_jobs: 1,
            setup: SetupMode::Auto,
            region: None,
            script: None,
            stamp: timestamp(),
        }
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = mode.into();
        self
    }

    /// Restricts the run to one task and, optionally, some of its folds.
    pub fn with_task(mut self, task: impl Into<String>, folds: Vec<u32>) -> Self {
        self.task = Some(task.into());
        self.folds = folds;
        self
    }

    pub fn with_folds(mut self, folds: Vec<u32>) -> Self {
        self.folds = folds;
        self
    }

    pub fn with_input_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.input_dir = Some(dir.into());
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn with_user_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.user_dir = Some(dir.into());
        self
    }

    pub fn with_parallel_jobs(mut self, parallel_jobs: usize) -> Self {
        self.parallel_jobs = parallel_jobs;
        self
    }

    pub fn with_setup(mut self, setup: SetupMode) -> Self {
        self.setup = setup;
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.script = Some(script.into());
        self
    }

    pub fn with_stamp(mut self, stamp: impl Into<String>) -> Self {
        self.stamp = stamp.into();
        self
    }

    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            run_mode: self.mode.clone(),
            script: self.script.clone(),
            input_dir: self.input_dir.clone(),
            output_dir: self.output_dir.clone(),
            user_dir: self.user_dir.clone(),
            region: self.region.clone(),
        }
    }

    fn fold_ids(&self) -> Option<&[u32]> {
        if self.folds.is_empty() {
            None
        } else {
            Some(self.folds.as_slice())
        }
    }
}

/// Nothing resolved yet.
pub struct Init;

/// Run mode parsed and configuration merged.
pub struct ConfigResolved {
    mode: RunMode,
    config: Arc<EffectiveConfig>,
    settings: Arc<Settings>,
}

/// Backend built, environment not prepared.
pub struct BackendSelected {
    backend: Box<dyn Backend>,
}

/// Environment prepared, ready to run.
pub struct SetupComplete {
    backend: Box<dyn Backend>,
}

/// Drives one invocation through its lifecycle.
pub struct Orchestrator<S> {
    invocation: Invocation,
    state: S,
}

/// Result of the setup phase.
pub enum SetupOutcome {
    /// Continue with the run phase.
    Ready(Orchestrator<SetupComplete>),
    /// Setup-only invocation, nothing left to do.
    Done,
}

/// Final result of an invocation.
#[derive(Debug)]
pub enum Outcome {
    SetupOnly,
    Completed(RunResults),
}

impl<S> Orchestrator<S> {
    pub fn invocation(&self) -> &Invocation {
        &self.invocation
    }
}

impl Orchestrator<Init> {
    pub fn new(invocation: Invocation) -> Self {
        Self {
            invocation,
            state: Init,
        }
    }

    /// Runs the whole lifecycle.
    pub async fn execute(
        invocation: Invocation,
        factory: &dyn BackendFactory,
    ) -> Result<Outcome, BenchError> {
        let selected = Orchestrator::new(invocation)
            .resolve_config()?
            .select_backend(factory)?;

        match selected.setup().await? {
            SetupOutcome::Done => Ok(Outcome::SetupOnly),
            SetupOutcome::Ready(ready) => Ok(Outcome::Completed(ready.run().await?)),
        }
    }

    /// Validates the request and merges the configuration layers.
    pub fn resolve_config(self) -> Result<Orchestrator<ConfigResolved>, BenchError> {
        let mode: RunMode = self.invocation.mode.parse()?;
        if self.invocation.task.is_none() && !self.invocation.folds.is_empty() {
            return Err(SelectionError::FoldsWithoutTask.into());
        }

        let config = config::resolve(&self.invocation.overrides())?;
        let settings = config.settings()?;
        debug!(
            mode = %mode,
            user_dir = %settings.user_dir().display(),
            input_dir = %settings.input_dir().display(),
            output_dir = %settings.output_dir().display(),
            "Configuration resolved"
        );

        Ok(Orchestrator {
            invocation: self.invocation,
            state: ConfigResolved {
                mode,
                config: Arc::new(config),
                settings: Arc::new(settings),
            },
        })
    }
}

impl Orchestrator<ConfigResolved> {
    pub fn mode(&self) -> RunMode {
        self.state.mode
    }

    pub fn config(&self) -> &EffectiveConfig {
        &self.state.config
    }

    pub fn settings(&self) -> &Settings {
        &self.state.settings
    }

    /// Loads the definitions and builds the backend for the run mode.
    pub fn select_backend(
        self,
        factory: &dyn BackendFactory,
    ) -> Result<Orchestrator<BackendSelected>, BenchError> {
        let inv = &self.invocation;
        let framework = load_framework(&inv.framework, &self.state.settings)?;
        let benchmark = load_benchmark(&inv.benchmark, &self.state.settings)?;
        info!(
            framework = %framework.name,
            version = %framework.version,
            benchmark = %benchmark.name,
            tasks = benchmark.tasks.len(),
            mode = %self.state.mode,
            "Selecting backend"
        );

        let context = BackendContext::new(
            framework,
            benchmark,
            inv.benchmark.clone(),
            self.state.config.clone(),
            self.state.settings.clone(),
            inv.parallel_jobs,
        )
        .with_stamp(inv.stamp.clone());
        let backend = factory.create(self.state.mode, context)?;

        Ok(Orchestrator {
            invocation: self.invocation,
            state: BackendSelected { backend },
        })
    }
}

impl Orchestrator<BackendSelected> {
    /// Prepares the execution environment.
    pub async fn setup(self) -> Result<SetupOutcome, BenchError> {
        let setup = self.invocation.setup;
        if setup == SetupMode::Only {
            warn!("Setup mode 'only': the environment will be set up but no benchmark will run");
        }

        info!(mode = %self.state.backend.mode(), setup = %setup, "Setting up backend");
        self.state.backend.setup(setup).await?;

        if setup == SetupMode::Only {
            return Ok(SetupOutcome::Done);
        }
        Ok(SetupOutcome::Ready(Orchestrator {
            invocation: self.invocation,
            state: SetupComplete {
                backend: self.state.backend,
            },
        }))
    }
}

impl Orchestrator<SetupComplete> {
    /// Runs the requested task, or the whole benchmark, saving scores.
    pub async fn run(self) -> Result<RunResults, BenchError> {
        let backend = &self.state.backend;
        let results = match &self.invocation.task {
            Some(task) => {
                backend
                    .run_one(task, self.invocation.fold_ids(), true)
                    .await?
            }
            None => backend.run(true).await?,
        };

        info!(
            total = results.len(),
            succeeded = results.succeeded(),
            "Benchmark run complete"
        );
        for failed in results.failures() {
            warn!(
                task = %failed.task,
                fold = failed.fold,
                error = failed.error.as_deref().unwrap_or("unknown"),
                "Unit failed"
            );
        }
        Ok(results)
    }
}
