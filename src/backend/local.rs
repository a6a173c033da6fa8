//! Local backend: the framework is installed on this host and every unit
//! runs as a child process.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::context::{absolute, BackendContext};
use super::pool::UnitError;
use super::{Backend, RunMode, SetupMode};
use crate::benchmark::WorkUnit;
use crate::error::{BackendError, BenchError};
use crate::results::{RunResults, Scores};

/// Marker file written once the framework setup command succeeded.
pub const INSTALL_MARKER: &str = ".installed";

/// Score file a framework may write in its unit directory.
pub const RESULT_FILE: &str = "result.json";

/// Captured process output kept in the unit directory.
const RUN_LOG: &str = "run.log";

/// Runs units as child processes of this program.
pub struct LocalBackend {
    context: BackendContext,
}

impl LocalBackend {
    pub fn new(context: BackendContext) -> Self {
        Self { context }
    }

    /// Directory the framework is installed into.
    pub fn framework_dir(&self) -> PathBuf {
        self.context
            .settings
            .local
            .frameworks_dir()
            .join(&self.context.framework.name)
    }

    /// Whether the installed marker matches the framework version.
    pub fn is_installed(&self) -> bool {
        let marker = self.framework_dir().join(INSTALL_MARKER);
        match std::fs::read_to_string(&marker) {
            Ok(content) => content.trim() == self.context.framework.install_marker(),
            Err(_) => false,
        }
    }

    async fn install(&self) -> Result<(), BackendError> {
        let framework = &self.context.framework;
        let dir = absolute(&self.framework_dir())?;
        let marker = dir.join(INSTALL_MARKER);

        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            BackendError::Setup(format!("cannot create {}: {}", dir.display(), e))
        })?;
        if tokio::fs::try_exists(&marker).await.unwrap_or(false) {
            tokio::fs::remove_file(&marker).await?;
        }

        if let Some(setup) = framework.setup.as_deref().filter(|s| !s.is_empty()) {
            info!(framework = %framework.name, "Running framework setup: {}", setup.join(" "));
            let timeout = self.context.settings.local.setup_timeout();
            let mut cmd = Command::new(&setup[0]);
            cmd.args(&setup[1..])
                .current_dir(&dir)
                .envs(&framework.env)
                .env("BENCHRUN_FRAMEWORK", &framework.name)
                .env("BENCHRUN_FRAMEWORK_VERSION", &framework.version)
                .env("BENCHRUN_FRAMEWORK_DIR", &dir);

            let output = run_with_timeout(cmd, timeout)
                .await
                .map_err(BackendError::Setup)?;
            if !output.status.success() {
                return Err(BackendError::Setup(format!(
                    "setup of '{}' exited with {}: {}",
                    framework.name,
                    output.status,
                    last_line(&output.stderr)
                )));
            }
        }

        tokio::fs::write(&marker, framework.install_marker()).await?;
        info!(framework = %framework.name, version = %framework.version, "Framework installed");
        Ok(())
    }

    /// Runs one unit. Only a failure to create the unit directory is fatal.
    pub async fn run_unit(&self, unit: &WorkUnit) -> Result<Option<Scores>, UnitError> {
        let framework = &self.context.framework;
        let dir = absolute(&self.context.unit_dir(unit))?;
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            BackendError::Unavailable(format!("cannot create {}: {}", dir.display(), e))
        })?;
        let result_file = dir.join(RESULT_FILE);
        let _ = tokio::fs::remove_file(&result_file).await;

        let Some((program, args)) = framework.exec.split_first() else {
            return Err(UnitError::failed(format!("{} has no exec command", framework.name)));
        };
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&dir).envs(&framework.env);
        for (key, value) in self.unit_env(unit, &dir) {
            cmd.env(key, value);
        }

        let timeout = Duration::from_secs(
            unit.task
                .max_runtime_seconds
                .saturating_add(self.context.settings.local.timeout_margin_seconds),
        );
        debug!(unit = %unit, ?timeout, "Spawning {}", framework.exec.join(" "));

        let output = run_with_timeout(cmd, timeout).await.map_err(UnitError::Failed)?;

        let mut log = output.stdout.clone();
        log.extend_from_slice(&output.stderr);
        if let Err(e) = tokio::fs::write(dir.join(RUN_LOG), &log).await {
            warn!(unit = %unit, error = %e, "Failed to write run log");
        }

        if !output.status.success() {
            return Err(UnitError::failed(format!(
                "{} exited with {}: {}",
                framework.name,
                output.status,
                last_line(&output.stderr)
            )));
        }

        Ok(read_scores(&result_file))
    }

    /// Environment variables describing a unit to the framework command.
    pub fn unit_env(&self, unit: &WorkUnit, unit_dir: &Path) -> Vec<(String, String)> {
        let ctx = &self.context;
        let task = &unit.task;
        let framework_dir = self.framework_dir();
        let input_dir = ctx.input_dir();
        let framework_dir = absolute(&framework_dir).unwrap_or(framework_dir);
        let input_dir = absolute(&input_dir).unwrap_or(input_dir);
        let mut env = vec![
            ("BENCHRUN_FRAMEWORK", ctx.framework.name.clone()),
            ("BENCHRUN_FRAMEWORK_VERSION", ctx.framework.version.clone()),
            ("BENCHRUN_FRAMEWORK_DIR", framework_dir.display().to_string()),
            ("BENCHRUN_BENCHMARK", ctx.benchmark.name.clone()),
            ("BENCHRUN_TASK", task.name.clone()),
            ("BENCHRUN_FOLD", unit.fold.to_string()),
            ("BENCHRUN_METRIC", task.metric.clone()),
            ("BENCHRUN_MAX_RUNTIME_SECONDS", task.max_runtime_seconds.to_string()),
            ("BENCHRUN_CORES", effective_cores(task.cores).to_string()),
            ("BENCHRUN_INPUT_DIR", input_dir.display().to_string()),
            ("BENCHRUN_OUTPUT_DIR", unit_dir.display().to_string()),
        ];
        if let Some(id) = task.openml_task_id {
            env.push(("BENCHRUN_OPENML_TASK_ID", id.to_string()));
        }
        if let Some(dataset) = &task.dataset {
            env.push(("BENCHRUN_DATASET", dataset.clone()));
        }
        env.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn mode(&self) -> RunMode {
        RunMode::Local
    }

    async fn setup(&self, mode: SetupMode) -> Result<(), BackendError> {
        let ready = self.is_installed();
        if !mode.requires_provisioning(ready) {
            debug!(framework = %self.context.framework.name, %mode, ready, "Skipping framework setup");
            return Ok(());
        }
        self.install().await
    }

    async fn run(&self, save_scores: bool) -> Result<RunResults, BenchError> {
        let units = self.context.select(None, None)?;
        self.context
            .execute(RunMode::Local, units, save_scores, |unit| async move {
                self.run_unit(&unit).await
            })
            .await
    }

    async fn run_one(
        &self,
        task_id: &str,
        fold_ids: Option<&[u32]>,
        save_scores: bool,
    ) -> Result<RunResults, BenchError> {
        let units = self.context.select(Some(task_id), fold_ids)?;
        self.context
            .execute(RunMode::Local, units, save_scores, |unit| async move {
                self.run_unit(&unit).await
            })
            .await
    }
}

/// Runs a command to completion, killing it once `timeout` elapses.
async fn run_with_timeout(
    mut cmd: Command,
    timeout: Duration,
) -> Result<std::process::Output, String> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(format!("failed to spawn command: {}", e)),
        Err(_) => Err(format!("timed out after {}s", timeout.as_secs())),
    }
}

/// Reads the framework score file, ignoring it when absent or invalid.
fn read_scores(path: &Path) -> Option<Scores> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(scores) => Some(scores),
        Err(e) => {
            warn!("Ignoring invalid score file {}: {}", path.display(), e);
            None
        }
    }
}

fn effective_cores(cores: i32) -> usize {
    if cores > 0 {
        cores as usize
    } else {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

fn last_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("")
        .trim()
        .to_string()
}
