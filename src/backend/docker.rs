//! Docker backend: one container of the framework image per unit.
//!
//! Each container runs this same program in local mode for a single
//! (task, fold), with the host input directory and the unit directory
//! mounted. The unit result file the nested run writes into the unit
//! directory is read back on the host.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::context::{absolute, BackendContext};
use super::pool::UnitError;
use super::{Backend, RunMode, SetupMode};
use crate::benchmark::{FrameworkDefinition, WorkUnit};
use crate::config::{CONFIG_FILE_NAME, STAMP_ENV};
use crate::docker::{
    BuildContext, ContainerConfig, DockerClient, DockerfileBuilder, DockerfileConfig,
    CONTAINER_BENCHMARK_DIR, CONTAINER_INPUT_DIR, CONTAINER_OUTPUT_DIR, CONTAINER_USER_DIR,
};
use crate::error::{BackendError, BenchError, DockerError};
use crate::results::store::read_unit;
use crate::results::{ResultStore, RunResults, Scores};

/// Host paths mounted into unit containers.
#[derive(Debug, Clone, PartialEq)]
pub struct HostMounts {
    pub input_dir: PathBuf,
    /// Unit directory, mounted as the nested run's output directory.
    pub output_dir: PathBuf,
    /// Benchmark descriptor file, when the benchmark was given by path.
    pub benchmark_file: Option<PathBuf>,
}

/// Runs units in containers of the framework image.
pub struct DockerBackend {
    context: BackendContext,
    client: DockerClient,
    image: String,
}

impl DockerBackend {
    pub fn new(context: BackendContext) -> Result<Self, BackendError> {
        let client = DockerClient::new()?;
        let image = context
            .framework
            .image_name(&context.settings.docker.image_prefix);
        Ok(Self {
            context,
            client,
            image,
        })
    }

    /// Name of the framework image.
    pub fn image(&self) -> &str {
        &self.image
    }

    async fn ensure_daemon(&self) -> Result<(), BackendError> {
        self.client
            .ping()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))
    }

    async fn build(&self, no_cache: bool) -> Result<(), BackendError> {
        let context = build_context(&self.context).await?.into_tar()?;
        let timeout = Duration::from_secs(self.context.settings.docker.build_timeout_seconds);
        info!(image = %self.image, no_cache, "Building framework image");

        match tokio::time::timeout(timeout, self.client.build_image(&self.image, context, no_cache))
            .await
        {
            Ok(Ok(())) => {
                info!(image = %self.image, "Image built");
                Ok(())
            }
            Ok(Err(e)) => Err(BackendError::Setup(e.to_string())),
            Err(_) => Err(BackendError::Setup(format!(
                "building {} timed out after {}s",
                self.image,
                timeout.as_secs()
            ))),
        }
    }

    /// Maps a Docker API failure to a unit failure, or to a fatal error
    /// when the daemon stopped answering.
    async fn classify(&self, error: DockerError) -> UnitError {
        match self.client.ping().await {
            Ok(()) => UnitError::failed(error.to_string()),
            Err(ping) => UnitError::Fatal(BackendError::Unavailable(format!(
                "{} (daemon ping failed: {})",
                error, ping
            ))),
        }
    }

    async fn host_mounts(&self, unit: &WorkUnit) -> Result<HostMounts, BackendError> {
        let output_dir = self.context.unit_dir(unit);
        tokio::fs::create_dir_all(&output_dir).await.map_err(|e| {
            BackendError::Unavailable(format!("cannot create {}: {}", output_dir.display(), e))
        })?;
        let input_dir = self.context.input_dir();
        if let Err(e) = tokio::fs::create_dir_all(&input_dir).await {
            debug!("Cannot create input dir {}: {}", input_dir.display(), e);
        }
        Ok(HostMounts {
            output_dir: absolute(&output_dir)?,
            input_dir: absolute(&input_dir)?,
            benchmark_file: match &self.context.benchmark.source {
                Some(path) => Some(absolute(path)?),
                None => None,
            },
        })
    }

    async fn run_unit(&self, unit: &WorkUnit) -> Result<Option<Scores>, UnitError> {
        let mounts = self.host_mounts(unit).await?;
        let config = container_config(&self.context, &self.image, unit, &mounts);
        debug!(unit = %unit, container = %config.name, "Creating container");

        let id = match self.client.create_container(&config).await {
            Ok(id) => id,
            Err(e) => return Err(self.classify(e).await),
        };
        let outcome = self.wait_unit(&id, unit).await;
        if let Err(e) = self.client.remove_container(&id, true).await {
            warn!(container = %id, error = %e, "Failed to remove container");
        }
        outcome?;

        let unit_file = ResultStore::new(&mounts.output_dir, self.context.stamp.clone())
            .unit_path(&self.context.framework.name, &unit.task.name, unit.fold);
        nested_outcome(&unit_file)
    }

    async fn wait_unit(&self, id: &str, unit: &WorkUnit) -> Result<(), UnitError> {
        if let Err(e) = self.client.start_container(id).await {
            return Err(self.classify(e).await);
        }

        let timeout = Duration::from_secs(
            unit.task
                .max_runtime_seconds
                .saturating_add(self.context.settings.local.timeout_margin_seconds),
        );
        let code = match tokio::time::timeout(timeout, self.client.wait_container(id)).await {
            Ok(Ok(code)) => code,
            Ok(Err(e)) => return Err(self.classify(e).await),
            Err(_) => {
                return Err(UnitError::failed(format!(
                    "timed out after {}s",
                    timeout.as_secs()
                )))
            }
        };

        if code != 0 {
            let logs = self.client.get_logs(id).await.unwrap_or_default();
            let last = logs.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
            return Err(UnitError::failed(format!(
                "container exited with code {}: {}",
                code,
                last.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for DockerBackend {
    fn mode(&self) -> RunMode {
        RunMode::Docker
    }

    async fn setup(&self, mode: SetupMode) -> Result<(), BackendError> {
        if mode == SetupMode::Skip {
            return Ok(());
        }
        self.ensure_daemon().await?;

        let present = self.client.image_exists(&self.image).await;
        if !mode.requires_provisioning(present) {
            debug!(image = %self.image, %mode, present, "Image is up to date");
            return Ok(());
        }

        let docker = &self.context.settings.docker;
        if self.context.framework.image.is_some() {
            info!(image = %self.image, "Pulling framework image");
            return self
                .client
                .pull_image(&self.image)
                .await
                .map_err(|e| BackendError::Setup(e.to_string()));
        }

        if mode != SetupMode::Force && docker.pull_before_build {
            match self.client.pull_image(&self.image).await {
                Ok(()) => {
                    info!(image = %self.image, "Pulled framework image");
                    return Ok(());
                }
                Err(e) => debug!(image = %self.image, error = %e, "Pull failed, building"),
            }
        }

        self.build(mode == SetupMode::Force).await
    }

    async fn run(&self, save_scores: bool) -> Result<RunResults, BenchError> {
        let units = self.context.select(None, None)?;
        self.context
            .execute(RunMode::Docker, units, save_scores, |unit| async move {
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
            .execute(RunMode::Docker, units, save_scores, |unit| async move {
                self.run_unit(&unit).await
            })
            .await
    }
}

/// Arguments of the nested local run of one unit.
pub fn nested_args(context: &BackendContext, unit: &WorkUnit, benchmark_file: Option<&Path>) -> Vec<String> {
    let benchmark = match benchmark_file.and_then(|p| p.file_name()) {
        Some(name) => format!("{}/{}", CONTAINER_BENCHMARK_DIR, name.to_string_lossy()),
        None => context.benchmark_arg.clone(),
    };
    vec![
        context.framework.name.clone(),
        benchmark,
        "-m".to_string(),
        "local".to_string(),
        "-s".to_string(),
        "skip".to_string(),
        "-t".to_string(),
        unit.task.name.clone(),
        "-f".to_string(),
        unit.fold.to_string(),
        "-i".to_string(),
        CONTAINER_INPUT_DIR.to_string(),
        "-o".to_string(),
        CONTAINER_OUTPUT_DIR.to_string(),
        "-u".to_string(),
        CONTAINER_USER_DIR.to_string(),
    ]
}

/// Outcome of a nested unit run, read from the unit file it wrote.
pub(crate) fn nested_outcome(unit_file: &Path) -> Result<Option<Scores>, UnitError> {
    match read_unit(unit_file) {
        Some(result) if result.is_success() => Ok(result.scores),
        Some(result) => Err(UnitError::failed(
            result
                .error
                .unwrap_or_else(|| "unit failed in nested run".to_string()),
        )),
        None => Err(UnitError::failed(format!(
            "nested run produced no result at {}",
            unit_file.display()
        ))),
    }
}

/// Container running one unit.
pub fn container_config(
    context: &BackendContext,
    image: &str,
    unit: &WorkUnit,
    mounts: &HostMounts,
) -> ContainerConfig {
    let suffix = Uuid::new_v4().simple().to_string();
    let name = container_name(&format!(
        "benchrun-{}-{}-{}-{}",
        context.framework.name,
        unit.task.name,
        unit.fold,
        &suffix[..8]
    ));

    let mut config = ContainerConfig::new(name, image)
        .with_cmd(nested_args(context, unit, mounts.benchmark_file.as_deref()))
        .with_env(STAMP_ENV, &context.stamp)
        .with_bind(&mounts.input_dir.to_string_lossy(), CONTAINER_INPUT_DIR, true)
        .with_bind(&mounts.output_dir.to_string_lossy(), CONTAINER_OUTPUT_DIR, false);

    if let Some(file) = &mounts.benchmark_file {
        if let Some(file_name) = file.file_name() {
            let target = format!("{}/{}", CONTAINER_BENCHMARK_DIR, file_name.to_string_lossy());
            config = config.with_bind(&file.to_string_lossy(), &target, true);
        }
    }
    if unit.task.cores > 0 {
        config = config.with_cpus(unit.task.cores as f64);
    }
    config
}

/// Build context of the framework image: Dockerfile, this program and the
/// framework definition with the user configuration.
pub async fn build_context(context: &BackendContext) -> Result<BuildContext, BackendError> {
    let framework = &context.framework;
    let docker = &context.settings.docker;

    let dockerfile = DockerfileBuilder::new(DockerfileConfig {
        base_image: docker.base_image.clone(),
        framework: framework.name.clone(),
        version: framework.version.clone(),
        packages: docker.packages.clone(),
        env_vars: framework.env.clone(),
    })
    .build();

    let definitions = framework_definitions(framework)?;

    let exe = std::env::current_exe()?;
    let binary = tokio::fs::read(&exe).await?;

    let mut build = BuildContext::new();
    build.add_file("Dockerfile", dockerfile, 0o644);
    build.add_file("benchrun", binary, 0o755);
    build.add_file("custom/frameworks.yaml", definitions, 0o644);
    let user_config = context.user_dir().join(CONFIG_FILE_NAME);
    if let Ok(content) = tokio::fs::read(&user_config).await {
        build.add_file(format!("custom/{}", CONFIG_FILE_NAME), content, 0o644);
    }
    Ok(build)
}

/// A frameworks file defining only `framework`.
pub(crate) fn framework_definitions(framework: &FrameworkDefinition) -> Result<String, BackendError> {
    let definitions = BTreeMap::from([(framework.name.clone(), framework.clone())]);
    serde_yaml::to_string(&definitions)
        .map_err(|e| BackendError::Setup(format!("cannot serialize framework definition: {}", e)))
}

fn container_name(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') { c } else { '-' })
        .collect::<String>()
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::context::tests::context_in;
    use crate::results::tests::unit;
    use tempfile::TempDir;

    fn mounts(benchmark_file: Option<&str>) -> HostMounts {
        HostMounts {
            input_dir: PathBuf::from("/data/in"),
            output_dir: PathBuf::from("/data/out"),
            benchmark_file: benchmark_file.map(PathBuf::from),
        }
    }

    #[test]
    fn test_nested_args_run_single_unit_locally() {
        let temp = TempDir::new().unwrap();
        let ctx = context_in(temp.path(), "- name: iris\n  folds: 3\n", 1);
        let args = nested_args(&ctx, &unit("iris", 2), None);

        assert_eq!(&args[..2], &["fw".to_string(), "suite".to_string()]);
        let joined = args.join(" ");
        assert!(joined.contains("-m local -s skip -t iris -f 2"));
        assert!(joined.contains("-o /output"));
        assert!(joined.contains("-u /bench/custom"));
    }

    #[test]
    fn test_container_config_mounts() {
        let temp = TempDir::new().unwrap();
        let ctx = context_in(temp.path(), "- name: iris\n  folds: 3\n", 1);
        let config = container_config(
            &ctx,
            "benchrun/fw:1.0",
            &unit("iris", 0),
            &mounts(Some("/home/me/bench/my suite.yaml")),
        );

        assert!(config.name.starts_with("benchrun-fw-iris-0-"));
        assert!(!config.name.contains(' '));
        assert_eq!(config.image, "benchrun/fw:1.0");
        assert!(config.binds.contains(&"/data/in:/input:ro".to_string()));
        assert!(config.binds.contains(&"/data/out:/output".to_string()));
        assert!(config
            .binds
            .contains(&"/home/me/bench/my suite.yaml:/benchmark/my suite.yaml:ro".to_string()));
        assert_eq!(config.cmd[1], "/benchmark/my suite.yaml");
        assert_eq!(config.cpus, Some(1.0));
    }

    #[tokio::test]
    async fn test_build_context_contents() {
        let temp = TempDir::new().unwrap();
        let ctx = context_in(temp.path(), "- name: iris\n  folds: 1\n", 1);
        std::fs::create_dir_all(ctx.user_dir()).unwrap();
        std::fs::write(ctx.user_dir().join("config.yaml"), "output_dir: /tmp/x\n").unwrap();

        let build = build_context(&ctx).await.unwrap();
        let paths: Vec<&str> = build.paths().collect();
        assert_eq!(
            paths,
            vec!["Dockerfile", "benchrun", "custom/frameworks.yaml", "custom/config.yaml"]
        );
    }

    #[test]
    fn test_container_name_sanitized() {
        assert_eq!(container_name("benchrun-FW-a/b c-0"), "benchrun-fw-a-b-c-0");
    }
}
