//! Benchmark descriptors.
//!
//! A descriptor is a YAML list of task definitions:
//!
//! ```yaml
//! - name: iris
//!   openml_task_id: 59
//!   folds: 2                # folds 0 and 1
//! - name: local-data
//!   dataset: /data/local.csv
//!   folds: [0, 3]           # explicit fold ids
//!   max_runtime_seconds: 600
//! ```
//!
//! Fields that a task leaves out are taken from `benchmarks.defaults`.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{expand_home, Settings, TaskDefaults};
use crate::error::ConfigError;

const BUILTIN_TEST: &str = include_str!("../../resources/benchmarks/test.yaml");
const BUILTIN_VALIDATION: &str = include_str!("../../resources/benchmarks/validation.yaml");

/// A benchmark: an ordered list of tasks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchmarkDescriptor {
    pub name: String,
    /// File the descriptor was loaded from, `None` for built-in ones.
    pub source: Option<PathBuf>,
    pub tasks: Vec<TaskDefinition>,
}

impl BenchmarkDescriptor {
    /// Finds a task by name.
    pub fn task(&self, name: &str) -> Option<&TaskDefinition> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// Total number of (task, fold) pairs.
    pub fn unit_count(&self) -> usize {
        self.tasks.iter().map(|t| t.folds.len()).sum()
    }
}

/// One task of a benchmark with its defaults applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskDefinition {
    pub name: String,
    pub openml_task_id: Option<u64>,
    pub dataset: Option<String>,
    /// Fold ids, in execution order.
    pub folds: Vec<u32>,
    pub metric: String,
    pub max_runtime_seconds: u64,
    pub cores: i32,
}

impl TaskDefinition {
    /// Returns true if the fold id is defined for this task.
    pub fn has_fold(&self, fold: u32) -> bool {
        self.folds.contains(&fold)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FoldSpec {
    Count(u32),
    Ids(Vec<u32>),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTask {
    name: String,
    #[serde(default)]
    openml_task_id: Option<u64>,
    #[serde(default)]
    dataset: Option<String>,
    #[serde(default)]
    folds: Option<FoldSpec>,
    #[serde(default)]
    metric: Option<String>,
    #[serde(default)]
    max_runtime_seconds: Option<u64>,
    #[serde(default)]
    cores: Option<i32>,
}

impl RawTask {
    fn into_task(self, defaults: &TaskDefaults, benchmark: &str) -> Result<TaskDefinition, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidDescriptor {
            name: benchmark.to_string(),
            reason,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("task with an empty name".to_string()));
        }
        if self.name.contains(['/', '\\']) || self.name == "." || self.name == ".." {
            return Err(invalid(format!(
                "task name '{}' must not be a path",
                self.name
            )));
        }

        let folds = match self.folds {
            None => (0..defaults.folds).collect(),
            Some(FoldSpec::Count(count)) => (0..count).collect(),
            Some(FoldSpec::Ids(ids)) => {
                let mut seen = HashSet::new();
                ids.into_iter().filter(|id| seen.insert(*id)).collect::<Vec<_>>()
            }
        };
        if folds.is_empty() {
            return Err(invalid(format!("task '{}' defines no folds", self.name)));
        }

        Ok(TaskDefinition {
            name: self.name,
            openml_task_id: self.openml_task_id,
            dataset: self.dataset,
            folds,
            metric: self.metric.unwrap_or_else(|| defaults.metric.clone()),
            max_runtime_seconds: self
                .max_runtime_seconds
                .unwrap_or(defaults.max_runtime_seconds),
            cores: self.cores.unwrap_or(defaults.cores),
        })
    }
}

/// Parses a descriptor from YAML content.
pub fn parse_benchmark(
    name: &str,
    content: &str,
    source: Option<PathBuf>,
    defaults: &TaskDefaults,
) -> Result<BenchmarkDescriptor, ConfigError> {
    let raw: Vec<RawTask> = serde_yaml::from_str(content).map_err(|e| ConfigError::Malformed {
        path: source
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("<built-in {name}.yaml>"))),
        message: e.to_string(),
    })?;

    let mut names = HashSet::new();
    let mut tasks = Vec::with_capacity(raw.len());
    for raw_task in raw {
        let task = raw_task.into_task(defaults, name)?;
        if !names.insert(task.name.clone()) {
            return Err(ConfigError::InvalidDescriptor {
                name: name.to_string(),
                reason: format!("duplicate task '{}'", task.name),
            });
        }
        tasks.push(task);
    }

    Ok(BenchmarkDescriptor {
        name: name.to_string(),
        source,
        tasks,
    })
}

/// Resolves a benchmark by path or by name.
///
/// An argument naming an existing file, or ending in `.yaml`/`.yml`, is a
/// path. Otherwise `<name>.yaml` is searched in `<user_dir>/benchmarks`,
/// then in `benchmarks.definition_dir`, then among the built-in benchmarks.
pub fn load_benchmark(name_or_path: &str, settings: &Settings) -> Result<BenchmarkDescriptor, ConfigError> {
    let defaults = &settings.benchmarks.defaults;
    let as_path = Path::new(name_or_path);
    let is_yaml = matches!(
        as_path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );

    if as_path.is_file() || is_yaml {
        if !as_path.is_file() {
            return Err(ConfigError::BenchmarkNotFound(name_or_path.to_string()));
        }
        let name = as_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| name_or_path.to_string());
        return read_benchmark(&name, as_path, defaults);
    }

    let file_name = format!("{name_or_path}.yaml");
    let candidates = [
        settings.user_dir().join("benchmarks").join(&file_name),
        expand_home(&settings.benchmarks.definition_dir).join(&file_name),
    ];
    if let Some(path) = candidates.iter().find(|p| p.is_file()) {
        return read_benchmark(name_or_path, path, defaults);
    }

    let builtin = match name_or_path {
        "test" => BUILTIN_TEST,
        "validation" => BUILTIN_VALIDATION,
        _ => return Err(ConfigError::BenchmarkNotFound(name_or_path.to_string())),
    };
    debug!("Using built-in benchmark '{}'", name_or_path);
    parse_benchmark(name_or_path, builtin, None, defaults)
}

fn read_benchmark(name: &str, path: &Path, defaults: &TaskDefaults) -> Result<BenchmarkDescriptor, ConfigError> {
    debug!("Loading benchmark '{}' from {}", name, path.display());
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_benchmark(name, &content, Some(path.to_path_buf()), defaults)
}
