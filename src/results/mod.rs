//! Results of executed work units.
//!
//! Each executed (task, fold) pair produces one [`RunResult`]. A failed unit
//! is a result with status [`RunStatus::Failed`], never an error: siblings
//! keep running and the suite-level [`RunResults`] still lists it.

pub mod store;

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::RunMode;
use crate::benchmark::{FrameworkDefinition, WorkUnit};

pub use store::ResultStore;

/// Score artifacts reported by a framework for one unit.
///
/// Frameworks write them as `result.json` in their unit output directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scores {
    #[serde(default)]
    pub metric: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
    /// Additional metrics by name.
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    /// Free-form information (model summary, warnings).
    #[serde(default)]
    pub info: Option<String>,
}

/// Status of an executed unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Success => write!(f, "success"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Result of one (task, fold) execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    pub framework: String,
    pub framework_version: String,
    pub benchmark: String,
    pub task: String,
    pub fold: u32,
    pub mode: RunMode,
    pub status: RunStatus,
    #[serde(default)]
    pub scores: Option<Scores>,
    #[serde(default)]
    pub error: Option<String>,
    pub duration: Duration,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl RunResult {
    /// Creates a successful result.
    pub fn success(
        framework: &FrameworkDefinition,
        benchmark: &str,
        unit: &WorkUnit,
        mode: RunMode,
        duration: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id: format!("run-{}", Uuid::new_v4()),
            framework: framework.name.clone(),
            framework_version: framework.version.clone(),
            benchmark: benchmark.to_string(),
            task: unit.task.name.clone(),
            fold: unit.fold,
            mode,
            status: RunStatus::Success,
            scores: None,
            error: None,
            duration,
            started_at: now - chrono::Duration::from_std(duration).unwrap_or_default(),
            completed_at: now,
        }
    }

    /// Creates a failed result.
    pub fn failure(
        framework: &FrameworkDefinition,
        benchmark: &str,
        unit: &WorkUnit,
        mode: RunMode,
        duration: Duration,
        error: impl Into<String>,
    ) -> Self {
        Self {
            status: RunStatus::Failed,
            error: Some(error.into()),
            ..Self::success(framework, benchmark, unit, mode, duration)
        }
    }

    /// Sets the score artifacts.
    pub fn with_scores(mut self, scores: Option<Scores>) -> Self {
        self.scores = scores;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

/// Suite-level collection of unit results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunResults {
    pub results: Vec<RunResult>,
}

impl RunResults {
    pub fn new(results: Vec<RunResult>) -> Self {
        Self { results }
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RunResult> {
        self.results.iter()
    }

    /// Number of successful units.
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    /// Results of failed units.
    pub fn failures(&self) -> impl Iterator<Item = &RunResult> {
        self.results.iter().filter(|r| !r.is_success())
    }

    /// Finds the result of a (task, fold) pair.
    pub fn get(&self, task: &str, fold: u32) -> Option<&RunResult> {
        self.results.iter().find(|r| r.task == task && r.fold == fold)
    }
}

impl IntoIterator for RunResults {
    type Item = RunResult;
    type IntoIter = std::vec::IntoIter<RunResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.into_iter()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::benchmark::TaskDefinition;

    pub(crate) fn framework() -> FrameworkDefinition {
        FrameworkDefinition {
            name: "fw".to_string(),
            version: "1.0".to_string(),
            description: None,
            setup: None,
            exec: vec!["true".to_string()],
            image: None,
            env: BTreeMap::new(),
        }
    }

    pub(crate) fn unit(task: &str, fold: u32) -> WorkUnit {
        WorkUnit::new(
            TaskDefinition {
                name: task.to_string(),
                openml_task_id: None,
                dataset: None,
                folds: vec![0, 1, 2],
                metric: "acc".to_string(),
                max_runtime_seconds: 10,
                cores: 1,
            },
            fold,
        )
    }

    #[test]
    fn test_success_and_failure() {
        let fw = framework();
        let ok = RunResult::success(&fw, "test", &unit("t", 0), RunMode::Local, Duration::from_secs(2));
        assert!(ok.is_success());
        assert_eq!(ok.framework_version, "1.0");
        assert!(ok.completed_at >= ok.started_at);

        let failed = RunResult::failure(
            &fw,
            "test",
            &unit("t", 1),
            RunMode::Docker,
            Duration::from_secs(1),
            "exit code 3",
        );
        assert!(!failed.is_success());
        assert_eq!(failed.error.as_deref(), Some("exit code 3"));
        assert_eq!(failed.status.to_string(), "failed");
    }

    #[test]
    fn test_collection_queries() {
        let fw = framework();
        let results = RunResults::new(vec![
            RunResult::success(&fw, "b", &unit("t", 0), RunMode::Local, Duration::ZERO),
            RunResult::failure(&fw, "b", &unit("t", 1), RunMode::Local, Duration::ZERO, "boom"),
        ]);
        assert_eq!(results.len(), 2);
        assert_eq!(results.succeeded(), 1);
        assert_eq!(results.failures().count(), 1);
        assert!(results.get("t", 1).is_some());
        assert!(results.get("t", 2).is_none());
    }

    #[test]
    fn test_scores_from_framework_json() {
        let scores: Scores =
            serde_json::from_str(r#"{"metric": "auc", "score": 0.91, "metrics": {"logloss": 0.3}}"#)
                .unwrap();
        assert_eq!(scores.metric.as_deref(), Some("auc"));
        assert_eq!(scores.metrics.get("logloss"), Some(&0.3));
        assert!(scores.info.is_none());
    }
}
