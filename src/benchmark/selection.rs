//! Selection of the work units to execute.

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;

use super::descriptor::{BenchmarkDescriptor, TaskDefinition};
use crate::error::SelectionError;

/// One (task, fold) pair of a benchmark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkUnit {
    pub task: TaskDefinition,
    pub fold: u32,
}

impl WorkUnit {
    pub fn new(task: TaskDefinition, fold: u32) -> Self {
        Self { task, fold }
    }

    /// File-name friendly identifier, `<task>_<fold>`.
    pub fn key(&self) -> String {
        format!("{}_{}", self.task.name, self.fold)
    }
}

impl fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [fold {}]", self.task.name, self.fold)
    }
}

/// Resolves the ordered list of work units for a selection.
///
/// - no task: every fold of every task, in descriptor order
/// - task only: every fold of that task
/// - task and folds: exactly those folds, deduplicated, in the given order
///
/// An empty fold list selects every fold of the task.
pub fn resolve(
    benchmark: &BenchmarkDescriptor,
    task_id: Option<&str>,
    fold_ids: Option<&[u32]>,
) -> Result<Vec<WorkUnit>, SelectionError> {
    let fold_ids = fold_ids.filter(|ids| !ids.is_empty());

    let Some(task_id) = task_id else {
        if fold_ids.is_some() {
            return Err(SelectionError::FoldsWithoutTask);
        }
        return Ok(benchmark.tasks.iter().flat_map(all_folds).collect());
    };

    let task = benchmark
        .task(task_id)
        .ok_or_else(|| SelectionError::TaskNotFound {
            task: task_id.to_string(),
            benchmark: benchmark.name.clone(),
        })?;

    let Some(fold_ids) = fold_ids else {
        return Ok(all_folds(task).collect());
    };

    let mut seen = HashSet::new();
    let mut units = Vec::new();
    for &fold in fold_ids {
        if !task.has_fold(fold) {
            return Err(SelectionError::FoldNotFound {
                task: task.name.clone(),
                fold,
                available: task.folds.clone(),
            });
        }
        if seen.insert(fold) {
            units.push(WorkUnit::new(task.clone(), fold));
        }
    }
    Ok(units)
}

fn all_folds(task: &TaskDefinition) -> impl Iterator<Item = WorkUnit> + '_ {
    task.folds
        .iter()
        .map(move |&fold| WorkUnit::new(task.clone(), fold))
}
