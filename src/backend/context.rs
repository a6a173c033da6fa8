//! Run context handed to a backend at construction.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Local;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use super::pool::{self, UnitError};
use super::RunMode;
use crate::benchmark::{self, BenchmarkDescriptor, FrameworkDefinition, WorkUnit};
use crate::config::{EffectiveConfig, Settings};
use crate::error::{BackendError, BenchError};
use crate::results::{ResultStore, RunResult, RunResults, Scores};

/// Everything a backend needs to know about the invocation.
///
/// Shared read-only by all concurrently executing units.
#[derive(Debug, Clone)]
pub struct BackendContext {
    pub framework: FrameworkDefinition,
    pub benchmark: Arc<BenchmarkDescriptor>,
    /// Benchmark argument as given (name or path), forwarded to nested runs.
    pub benchmark_arg: String,
    pub config: Arc<EffectiveConfig>,
    pub settings: Arc<Settings>,
    pub parallel_jobs: usize,
    /// Timestamp shared by the log and score files of this invocation.
    pub stamp: String,
}

impl BackendContext {
    pub fn new(
        framework: FrameworkDefinition,
        benchmark: BenchmarkDescriptor,
        benchmark_arg: impl Into<String>,
        config: Arc<EffectiveConfig>,
        settings: Arc<Settings>,
        parallel_jobs: usize,
    ) -> Self {
        Self {
            framework,
            benchmark: Arc::new(benchmark),
            benchmark_arg: benchmark_arg.into(),
            config,
            settings,
            parallel_jobs: parallel_jobs.clamp(1, Semaphore::MAX_PERMITS),
            stamp: timestamp(),
        }
    }

    /// Overrides the invocation timestamp.
    pub fn with_stamp(mut self, stamp: impl Into<String>) -> Self {
        self.stamp = stamp.into();
        self
    }

    pub fn output_dir(&self) -> PathBuf {
        self.settings.output_dir()
    }

    pub fn input_dir(&self) -> PathBuf {
        self.settings.input_dir()
    }

    pub fn user_dir(&self) -> PathBuf {
        self.settings.user_dir()
    }

    /// Working directory of one unit: `<output_dir>/runs/<framework>/<task>/<fold>`.
    pub fn unit_dir(&self, unit: &WorkUnit) -> PathBuf {
        self.output_dir()
            .join("runs")
            .join(&self.framework.name)
            .join(&unit.task.name)
            .join(unit.fold.to_string())
    }

    pub fn result_store(&self) -> ResultStore {
        ResultStore::new(&self.output_dir(), self.stamp.clone())
    }

    /// Work units of the whole benchmark or of a single task.
    pub fn select(
        &self,
        task_id: Option<&str>,
        fold_ids: Option<&[u32]>,
    ) -> Result<Vec<WorkUnit>, BenchError> {
        Ok(benchmark::resolve(&self.benchmark, task_id, fold_ids)?)
    }

    /// Executes units through `run_unit`, recording one result per unit.
    ///
    /// Unit results are saved as soon as each unit finishes, so they survive
    /// a later fatal error.
    pub async fn execute<F, Fut>(
        &self,
        mode: RunMode,
        units: Vec<WorkUnit>,
        save_scores: bool,
        run_unit: F,
    ) -> Result<RunResults, BenchError>
    where
        F: Fn(WorkUnit) -> Fut + Sync,
        Fut: Future<Output = Result<Option<Scores>, UnitError>> + Send,
    {
        info!(
            framework = %self.framework.name,
            benchmark = %self.benchmark.name,
            mode = %mode,
            units = units.len(),
            parallel_jobs = self.parallel_jobs,
            "Running benchmark units"
        );

        let store = self.result_store();
        let store = &store;
        let run_unit = &run_unit;

        let results = pool::run_bounded(units, self.parallel_jobs, |unit| async move {
            info!(unit = %unit, "Starting unit");
            let start = Instant::now();
            let outcome = run_unit(unit.clone()).await;
            let duration = start.elapsed();

            let result = match outcome {
                Ok(scores) => {
                    info!(unit = %unit, ?duration, "Unit completed");
                    RunResult::success(&self.framework, &self.benchmark.name, &unit, mode, duration)
                        .with_scores(scores)
                }
                Err(UnitError::Failed(message)) => {
                    warn!(unit = %unit, error = %message, "Unit failed");
                    RunResult::failure(
                        &self.framework,
                        &self.benchmark.name,
                        &unit,
                        mode,
                        duration,
                        message,
                    )
                }
                Err(UnitError::Fatal(e)) => return Err(e),
            };

            if save_scores {
                if let Err(e) = store.save_unit(&result) {
                    warn!(unit = %unit, error = %e, "Failed to save unit result");
                }
            }
            Ok(result)
        })
        .await?;

        let results = RunResults::new(results);
        info!(
            total = results.len(),
            succeeded = results.succeeded(),
            failed = results.len() - results.succeeded(),
            "Benchmark units finished"
        );

        if save_scores {
            let path = store
                .save_suite(&results, &self.framework.name, &self.benchmark.name, mode)
                .map_err(BackendError::Io)?;
            info!("Scores saved to {}", path.display());
        }
        Ok(results)
    }
}

/// Resolves `path` against the current directory.
pub(crate) fn absolute(path: &Path) -> Result<PathBuf, BackendError> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// ISO-like local timestamp without separators, e.g. `20240131T235959`.
pub fn timestamp() -> String {
    Local::now().format("%Y%m%dT%H%M%S").to_string()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::benchmark::descriptor::parse_benchmark;
    use crate::config::TaskDefaults;
    use crate::results::tests::framework;
    use tempfile::TempDir;

    pub(crate) fn context_in(dir: &Path, descriptor: &str, parallel_jobs: usize) -> BackendContext {
        let benchmark =
            parse_benchmark("suite", descriptor, None, &TaskDefaults::default()).unwrap();
        let settings = Settings {
            output_dir: dir.join("out").to_string_lossy().into_owned(),
            input_dir: dir.join("in").to_string_lossy().into_owned(),
            user_dir: dir.join("user").to_string_lossy().into_owned(),
            ..Settings::default()
        };
        BackendContext::new(
            framework(),
            benchmark,
            "suite",
            Arc::new(EffectiveConfig::defaults().unwrap()),
            Arc::new(settings),
            parallel_jobs,
        )
        .with_stamp("20240101T000000")
    }

    #[tokio::test]
    async fn test_partial_failure_is_recorded_not_raised() {
        let temp = TempDir::new().unwrap();
        let ctx = context_in(temp.path(), "- name: a\n  folds: 3\n- name: b\n  folds: 2\n", 3);
        let units = ctx.select(None, None).unwrap();
        assert_eq!(units.len(), 5);

        let results = ctx
            .execute(RunMode::Local, units, true, |unit| async move {
                if unit.task.name == "b" && unit.fold == 0 {
                    Err(UnitError::failed("training diverged"))
                } else {
                    Ok(None)
                }
            })
            .await
            .unwrap();

        assert_eq!(results.len(), 5);
        assert_eq!(results.succeeded(), 4);
        let failed: Vec<_> = results.failures().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!((failed[0].task.as_str(), failed[0].fold), ("b", 0));

        let store = ctx.result_store();
        assert!(store.load_unit("fw", "b", 0).is_some());
        assert!(store
            .scores_dir()
            .join("fw_suite_local_20240101T000000.json")
            .is_file());
    }

    #[tokio::test]
    async fn test_fatal_error_propagates_and_keeps_finished_units() {
        let temp = TempDir::new().unwrap();
        let ctx = context_in(temp.path(), "- name: a\n  folds: 4\n", 1);
        let units = ctx.select(Some("a"), None).unwrap();

        let err = ctx
            .execute(RunMode::Docker, units, true, |unit| async move {
                if unit.fold == 2 {
                    Err(UnitError::Fatal(BackendError::Unavailable("daemon gone".into())))
                } else {
                    Ok(None)
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, BenchError::Backend(BackendError::Unavailable(_))));
        let store = ctx.result_store();
        assert!(store.load_unit("fw", "a", 0).is_some());
        assert!(store.load_unit("fw", "a", 1).is_some());
        assert!(store.load_unit("fw", "a", 3).is_none());
    }

    #[test]
    fn test_select_reports_selection_errors() {
        let temp = TempDir::new().unwrap();
        let ctx = context_in(temp.path(), "- name: T\n  folds: 3\n", 1);
        assert_eq!(ctx.select(Some("T"), Some(&[1])).unwrap().len(), 1);
        assert!(matches!(
            ctx.select(Some("T"), Some(&[9])),
            Err(BenchError::Selection(_))
        ));
    }

    #[test]
    fn test_parallel_jobs_within_semaphore_limits() {
        let temp = TempDir::new().unwrap();
        assert_eq!(context_in(temp.path(), "- name: a\n  folds: 1\n", 0).parallel_jobs, 1);
        assert_eq!(
            context_in(temp.path(), "- name: a\n  folds: 1\n", usize::MAX).parallel_jobs,
            Semaphore::MAX_PERMITS
        );
    }

    #[test]
    fn test_timestamp_format() {
        let stamp = timestamp();
        assert_eq!(stamp.len(), 15);
        assert_eq!(&stamp[8..9], "T");
        assert!(stamp.chars().filter(|c| *c != 'T').all(|c| c.is_ascii_digit()));
    }
}
