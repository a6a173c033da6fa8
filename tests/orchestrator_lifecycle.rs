//! Integration tests for the invocation lifecycle.
//!
//! Mocked backends check the order of phases; the local backend runs the
//! built-in `test` benchmark end to end with a shell framework.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use benchrun::backend::BackendContext;
use benchrun::results::ResultStore;
use benchrun::{
    Backend, BackendError, BackendFactory, BenchError, DefaultBackendFactory, Invocation,
    ModeError, Orchestrator, Outcome, RunMode, RunResults, SetupMode,
};

const STAMP: &str = "20240101T000000";

#[derive(Default, Clone)]
struct Recorder {
    calls: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    fn push(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

struct RecordingBackend {
    mode: RunMode,
    recorder: Recorder,
}

#[async_trait]
impl Backend for RecordingBackend {
    fn mode(&self) -> RunMode {
        self.mode
    }

    async fn setup(&self, mode: SetupMode) -> Result<(), BackendError> {
        self.recorder.push(format!("setup:{mode}"));
        Ok(())
    }

    async fn run(&self, save_scores: bool) -> Result<RunResults, BenchError> {
        self.recorder.push(format!("run:{save_scores}"));
        Ok(RunResults::default())
    }

    async fn run_one(
        &self,
        task_id: &str,
        fold_ids: Option<&[u32]>,
        _save_scores: bool,
    ) -> Result<RunResults, BenchError> {
        self.recorder
            .push(format!("run_one:{task_id}:{:?}", fold_ids.unwrap_or_default()));
        Ok(RunResults::default())
    }
}

struct RecordingFactory {
    recorder: Recorder,
}

impl BackendFactory for RecordingFactory {
    fn create(&self, mode: RunMode, context: BackendContext) -> Result<Box<dyn Backend>, BenchError> {
        self.recorder
            .push(format!("create:{mode}:{}", context.framework.name));
        Ok(Box::new(RecordingBackend {
            mode,
            recorder: self.recorder.clone(),
        }))
    }
}

fn invocation(temp: &Path) -> Invocation {
    Invocation::new("constantpredictor", "test")
        .with_user_dir(temp.join("user"))
        .with_output_dir(temp.join("out"))
        .with_stamp(STAMP)
}

#[tokio::test]
async fn test_invalid_mode_never_builds_backend() {
    let temp = TempDir::new().unwrap();
    let factory = RecordingFactory {
        recorder: Recorder::default(),
    };

    let err = Orchestrator::execute(invocation(temp.path()).with_mode("gcp"), &factory)
        .await
        .unwrap_err();

    assert!(matches!(err, BenchError::Mode(ModeError::Unsupported(ref m)) if m == "gcp"));
    assert!(factory.recorder.calls().is_empty());
}

#[tokio::test]
async fn test_setup_only_stops_before_run() {
    let temp = TempDir::new().unwrap();
    let factory = RecordingFactory {
        recorder: Recorder::default(),
    };

    let outcome = Orchestrator::execute(
        invocation(temp.path())
            .with_mode("docker")
            .with_setup(SetupMode::Only),
        &factory,
    )
    .await
    .unwrap();

    assert!(matches!(outcome, Outcome::SetupOnly));
    assert_eq!(
        factory.recorder.calls(),
        vec!["create:docker:constantpredictor", "setup:only"]
    );
}

#[tokio::test]
async fn test_setup_runs_before_selected_task() {
    let temp = TempDir::new().unwrap();
    let factory = RecordingFactory {
        recorder: Recorder::default(),
    };

    let outcome = Orchestrator::execute(
        invocation(temp.path())
            .with_setup(SetupMode::Skip)
            .with_task("iris", vec![1]),
        &factory,
    )
    .await
    .unwrap();

    assert!(matches!(outcome, Outcome::Completed(_)));
    assert_eq!(
        factory.recorder.calls(),
        vec![
            "create:local:constantpredictor",
            "setup:skip",
            "run_one:iris:[1]",
        ]
    );
}

#[tokio::test]
async fn test_unknown_framework_is_config_error() {
    let temp = TempDir::new().unwrap();
    let factory = RecordingFactory {
        recorder: Recorder::default(),
    };

    let inv = Invocation::new("no-such-framework", "test")
        .with_user_dir(temp.path())
        .with_output_dir(temp.path().join("out"));
    let err = Orchestrator::execute(inv, &factory).await.unwrap_err();

    assert!(matches!(err, BenchError::Config(_)));
    assert!(factory.recorder.calls().is_empty());
}

#[tokio::test]
async fn test_local_run_of_test_benchmark() {
    let temp = TempDir::new().unwrap();
    let user_dir = temp.path().join("user");
    let out_dir = temp.path().join("out");
    fs::create_dir_all(&user_dir).unwrap();

    // JSON is valid YAML, which keeps the shell quoting out of the way.
    let exec = r#"printf '{"metric":"acc","score":0.%s}' "$BENCHRUN_FOLD" > "$BENCHRUN_OUTPUT_DIR/result.json""#;
    let frameworks = serde_json::json!({
        "X": { "version": "0.1", "exec": ["sh", "-c", exec] }
    });
    fs::write(user_dir.join("frameworks.yaml"), frameworks.to_string()).unwrap();
    let config = serde_json::json!({
        "local": { "frameworks_dir": temp.path().join("frameworks") }
    });
    fs::write(user_dir.join("config.yaml"), config.to_string()).unwrap();

    let inv = Invocation::new("X", "test")
        .with_user_dir(&user_dir)
        .with_output_dir(&out_dir)
        .with_input_dir(temp.path().join("input"))
        .with_parallel_jobs(3)
        .with_stamp(STAMP);
    let outcome = Orchestrator::execute(inv, &DefaultBackendFactory)
        .await
        .unwrap();

    let Outcome::Completed(results) = outcome else {
        panic!("expected a completed run");
    };
    assert_eq!(results.len(), 6);
    assert_eq!(results.succeeded(), 6);
    for task in ["kc2", "iris", "cholesterol"] {
        for fold in [0, 1] {
            let result = results.get(task, fold).unwrap();
            assert_eq!(result.mode, RunMode::Local);
            let score = result.scores.as_ref().and_then(|s| s.score).unwrap();
            assert!((score - f64::from(fold) / 10.0).abs() < 1e-9);
        }
    }

    let store = ResultStore::new(&out_dir, STAMP);
    assert!(store.load_unit("X", "cholesterol", 1).is_some());
    assert!(store
        .scores_dir()
        .join(format!("X_test_local_{STAMP}.json"))
        .is_file());
    let lines = fs::read_to_string(store.scores_dir().join("results.jsonl")).unwrap();
    assert_eq!(lines.lines().count(), 6);
    assert!(temp.path().join("frameworks").join("X").join(".installed").is_file());
}
