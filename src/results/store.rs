//! Persistence of scores under `<output_dir>/scores`.
//!
//! ```text
//! scores/
//! ├── units/<framework>_<task>_<fold>.json        written as each unit finishes
//! ├── <framework>_<benchmark>_<mode>_<stamp>.json  whole suite, written at the end
//! └── results.jsonl                                one line per unit, appended
//! ```

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{RunResult, RunResults};
use crate::backend::RunMode;

/// Writes unit and suite results below an output directory.
#[derive(Debug, Clone)]
pub struct ResultStore {
    scores_dir: PathBuf,
    stamp: String,
}

impl ResultStore {
    /// Creates a store for `<output_dir>/scores`, stamping suite files with `stamp`.
    pub fn new(output_dir: &Path, stamp: impl Into<String>) -> Self {
        Self {
            scores_dir: output_dir.join("scores"),
            stamp: stamp.into(),
        }
    }

    pub fn scores_dir(&self) -> &Path {
        &self.scores_dir
    }

    /// Path of a unit result file.
    pub fn unit_path(&self, framework: &str, task: &str, fold: u32) -> PathBuf {
        self.scores_dir
            .join("units")
            .join(unit_file_name(framework, task, fold))
    }

    /// Writes the result of one unit, replacing any previous one.
    pub fn save_unit(&self, result: &RunResult) -> std::io::Result<PathBuf> {
        let path = self.unit_path(&result.framework, &result.task, result.fold);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(result)?;
        fs::write(&path, json)?;
        debug!("Saved unit result to {}", path.display());
        Ok(path)
    }

    /// Reads a unit result previously written by [`save_unit`](Self::save_unit).
    pub fn load_unit(&self, framework: &str, task: &str, fold: u32) -> Option<RunResult> {
        read_unit(&self.unit_path(framework, task, fold))
    }

    /// Writes the suite file and appends every unit to `results.jsonl`.
    pub fn save_suite(
        &self,
        results: &RunResults,
        framework: &str,
        benchmark: &str,
        mode: RunMode,
    ) -> std::io::Result<PathBuf> {
        fs::create_dir_all(&self.scores_dir)?;

        let suite_path = self.scores_dir.join(format!(
            "{}_{}_{}_{}.json",
            sanitize(framework),
            sanitize(benchmark),
            mode,
            self.stamp
        ));
        fs::write(&suite_path, serde_json::to_string_pretty(results)?)?;

        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.scores_dir.join("results.jsonl"))?;
        for result in results.iter() {
            writeln!(log, "{}", serde_json::to_string(result)?)?;
        }

        debug!("Saved suite results to {}", suite_path.display());
        Ok(suite_path)
    }
}

/// File name of a unit result.
pub fn unit_file_name(framework: &str, task: &str, fold: u32) -> String {
    format!("{}_{}_{}.json", sanitize(framework), sanitize(task), fold)
}

/// Reads a unit result file, `None` if missing or unreadable.
pub fn read_unit(path: &Path) -> Option<RunResult> {
    let content = fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '.' { c } else { '-' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::tests::{framework, unit};
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_unit_round_trip() {
        let temp = TempDir::new().unwrap();
        let store = ResultStore::new(temp.path(), "20240101T000000");
        let result = RunResult::success(&framework(), "test", &unit("iris", 1), RunMode::Local, Duration::from_secs(3));

        let path = store.save_unit(&result).unwrap();
        assert_eq!(path, temp.path().join("scores/units/fw_iris_1.json"));
        assert_eq!(store.load_unit("fw", "iris", 1), Some(result));
        assert!(store.load_unit("fw", "iris", 2).is_none());
    }

    #[test]
    fn test_suite_appends_jsonl() {
        let temp = TempDir::new().unwrap();
        let store = ResultStore::new(temp.path(), "stamp");
        let fw = framework();
        let results = RunResults::new(vec![
            RunResult::success(&fw, "test", &unit("a", 0), RunMode::Local, Duration::ZERO),
            RunResult::failure(&fw, "test", &unit("a", 1), RunMode::Local, Duration::ZERO, "x"),
        ]);

        let suite = store.save_suite(&results, "fw", "test", RunMode::Local).unwrap();
        assert_eq!(suite.file_name().unwrap(), "fw_test_local_stamp.json");
        store.save_suite(&results, "fw", "test", RunMode::Local).unwrap();

        let lines = fs::read_to_string(store.scores_dir().join("results.jsonl")).unwrap();
        assert_eq!(lines.lines().count(), 4);
    }

    #[test]
    fn test_unit_file_name_sanitized() {
        assert_eq!(unit_file_name("fw", "a/b c", 0), "fw_a-b-c_0.json");
    }
}
