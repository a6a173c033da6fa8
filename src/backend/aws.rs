//! AWS backend: one EC2 instance per unit, driven through the `aws` CLI.
//!
//! Setup makes sure the S3 bucket exists and holds the run resources (the
//! framework definition, the user configuration and the benchmark file).
//! Each unit instance runs the framework image for that unit, uploads its
//! output to S3 and terminates itself; the host polls the instance state
//! and then downloads the unit result.

use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use super::context::BackendContext;
use super::docker::{framework_definitions, nested_args, nested_outcome};
use super::pool::UnitError;
use super::{Backend, RunMode, SetupMode};
use crate::aws::{parse_instance_id, parse_instance_state, render_user_data, AwsCli, UnitLocation};
use crate::benchmark::WorkUnit;
use crate::config::CONFIG_FILE_NAME;
use crate::error::{AwsError, BackendError, BenchError};
use crate::results::store::unit_file_name;
use crate::results::{RunResults, Scores};

/// Object marking uploaded run resources.
const RESOURCES_MARKER: &str = ".installed";

/// Runs units on dedicated EC2 instances.
pub struct AwsBackend {
    context: BackendContext,
    cli: AwsCli,
    image: String,
}

impl AwsBackend {
    pub fn new(context: BackendContext) -> Self {
        let cli = AwsCli::new(context.settings.aws.region.clone());
        let image = context
            .framework
            .image_name(&context.settings.docker.image_prefix);
        Self {
            context,
            cli,
            image,
        }
    }

    /// Replaces the CLI wrapper.
    pub fn with_cli(mut self, cli: AwsCli) -> Self {
        self.cli = cli;
        self
    }

    fn bucket(&self) -> &str {
        &self.context.settings.aws.s3.bucket
    }

    /// Key prefix of the resources of this framework and benchmark.
    pub fn resources_key(&self) -> String {
        format!(
            "{}/resources/{}_{}",
            self.context.settings.aws.s3.root_key.trim_end_matches('/'),
            self.context.framework.name,
            self.context.benchmark.name
        )
    }

    /// Where a unit finds its resources and uploads its output.
    pub fn unit_location(&self, unit: &WorkUnit) -> UnitLocation {
        UnitLocation {
            bucket: self.bucket().to_string(),
            resources_key: self.resources_key(),
            output_key: format!(
                "{}/{}/{}_{}_{}",
                self.context.settings.aws.s3.root_key.trim_end_matches('/'),
                self.context.stamp,
                self.context.framework.name,
                unit.task.name,
                unit.fold
            ),
        }
    }

    /// `Ok(false)` when the call fails for a non-fatal reason.
    async fn exists(&self, args: &[&str]) -> Result<bool, AwsError> {
        match self.cli.call(args).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                debug!(error = %e, "Resource check failed");
                Ok(false)
            }
        }
    }

    async fn bucket_exists(&self) -> Result<bool, AwsError> {
        self.exists(&["s3api", "head-bucket", "--bucket", self.bucket()])
            .await
    }

    async fn resources_uploaded(&self) -> Result<bool, AwsError> {
        let key = format!("{}/{}", self.resources_key(), RESOURCES_MARKER);
        self.exists(&["s3api", "head-object", "--bucket", self.bucket(), "--key", key.as_str()])
            .await
    }

    async fn create_bucket(&self) -> Result<(), AwsError> {
        info!(bucket = %self.bucket(), "Creating S3 bucket");
        let location;
        let mut args = vec!["s3api", "create-bucket", "--bucket", self.bucket()];
        if let Some(region) = self.cli.region().filter(|r| *r != "us-east-1") {
            location = format!("LocationConstraint={}", region);
            args.push("--create-bucket-configuration");
            args.push(location.as_str());
        }
        self.cli.call(&args).await?;
        Ok(())
    }

    async fn upload_resources(&self) -> Result<(), BackendError> {
        let staging = TempDir::new()?;
        let custom = staging.path().join("custom");
        tokio::fs::create_dir_all(&custom).await?;
        tokio::fs::write(
            custom.join("frameworks.yaml"),
            framework_definitions(&self.context.framework)?,
        )
        .await?;

        let user_config = self.context.user_dir().join(CONFIG_FILE_NAME);
        if tokio::fs::try_exists(&user_config).await.unwrap_or(false) {
            tokio::fs::copy(&user_config, custom.join(CONFIG_FILE_NAME)).await?;
        }
        if let Some(source) = &self.context.benchmark.source {
            if let Some(name) = source.file_name() {
                let dir = staging.path().join("benchmark");
                tokio::fs::create_dir_all(&dir).await?;
                tokio::fs::copy(source, dir.join(name)).await?;
            }
        }

        let resources = format!("s3://{}/{}", self.bucket(), self.resources_key());
        info!("Uploading run resources to {}", resources);
        let staging_path = staging.path().to_string_lossy().into_owned();
        self.cli
            .call(&["s3", "cp", "--recursive", staging_path.as_str(), resources.as_str()])
            .await?;

        let marker = staging.path().join(RESOURCES_MARKER);
        tokio::fs::write(&marker, self.context.framework.install_marker()).await?;
        let marker_path = marker.to_string_lossy().into_owned();
        let marker_uri = format!("{}/{}", resources, RESOURCES_MARKER);
        self.cli
            .call(&["s3", "cp", marker_path.as_str(), marker_uri.as_str()])
            .await?;
        Ok(())
    }

    async fn run_unit(&self, unit: &WorkUnit) -> Result<Option<Scores>, UnitError> {
        let aws = &self.context.settings.aws;
        let ami = aws.ec2.ami.as_deref().ok_or_else(|| {
            UnitError::Fatal(BackendError::Setup("aws.ec2.ami is not configured".to_string()))
        })?;

        let location = self.unit_location(unit);
        let args = nested_args(&self.context, unit, self.context.benchmark.source.as_deref());
        let user_data = render_user_data(&location, self.cli.region(), &self.image, &args);
        let tags = format!(
            "ResourceType=instance,Tags=[{{Key=Name,Value=benchrun-{}-{}-{}}}]",
            self.context.framework.name, unit.task.name, unit.fold
        );

        let mut launch = vec![
            "ec2",
            "run-instances",
            "--image-id",
            ami,
            "--instance-type",
            aws.ec2.instance_type.as_str(),
            "--count",
            "1",
            "--instance-initiated-shutdown-behavior",
            "terminate",
            "--user-data",
            user_data.as_str(),
            "--tag-specifications",
            tags.as_str(),
        ];
        if let Some(key_name) = &aws.ec2.key_name {
            launch.push("--key-name");
            launch.push(key_name.as_str());
        }

        let response = self.cli.call_json(&launch).await.map_err(unit_error)?;
        let instance_id = parse_instance_id(&response).map_err(unit_error)?;
        info!(unit = %unit, instance = %instance_id, "Instance launched");

        let budget = Duration::from_secs(
            unit.task
                .max_runtime_seconds
                .saturating_add(aws.overhead_seconds),
        );
        self.wait_terminated(&instance_id, budget).await?;

        let staging = TempDir::new().map_err(|e| UnitError::failed(e.to_string()))?;
        let file_name = unit_file_name(&self.context.framework.name, &unit.task.name, unit.fold);
        let local = staging.path().join(&file_name);
        self.download(&format!("{}/scores/units/{}", location.output_uri(), file_name), &local)
            .await?;
        nested_outcome(&local)
    }

    async fn wait_terminated(&self, instance_id: &str, budget: Duration) -> Result<(), UnitError> {
        let poll = Duration::from_secs(self.context.settings.aws.poll_interval_seconds);
        // No deadline when the budget does not fit in an Instant.
        let deadline = Instant::now().checked_add(budget);

        loop {
            tokio::time::sleep(poll).await;
            match self
                .cli
                .call_json(&["ec2", "describe-instances", "--instance-ids", instance_id])
                .await
            {
                Ok(response) => {
                    let state = parse_instance_state(&response);
                    debug!(instance = %instance_id, state = ?state, "Polled instance");
                    if matches!(state.as_deref(), Some("terminated") | Some("stopped")) {
                        return Ok(());
                    }
                }
                Err(e) if e.is_fatal() => return Err(UnitError::Fatal(e.into())),
                Err(e) => warn!(instance = %instance_id, error = %e, "Failed to poll instance"),
            }

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                warn!(instance = %instance_id, "Unit exceeded its time budget, terminating");
                if let Err(e) = self
                    .cli
                    .call(&["ec2", "terminate-instances", "--instance-ids", instance_id])
                    .await
                {
                    warn!(instance = %instance_id, error = %e, "Failed to terminate instance");
                }
                return Err(UnitError::failed(format!(
                    "timed out after {}s",
                    budget.as_secs()
                )));
            }
        }
    }

    async fn download(&self, uri: &str, local: &Path) -> Result<(), UnitError> {
        let local = local.to_string_lossy().into_owned();
        self.cli
            .call(&["s3", "cp", uri, local.as_str()])
            .await
            .map_err(unit_error)?;
        Ok(())
    }
}

#[async_trait]
impl Backend for AwsBackend {
    fn mode(&self) -> RunMode {
        RunMode::Aws
    }

    async fn setup(&self, mode: SetupMode) -> Result<(), BackendError> {
        if mode == SetupMode::Skip {
            return Ok(());
        }

        let bucket = self.bucket_exists().await?;
        let uploaded = bucket && self.resources_uploaded().await?;
        if !mode.requires_provisioning(uploaded) {
            debug!(bucket = %self.bucket(), %mode, "Run resources are up to date");
            return Ok(());
        }

        if !bucket {
            self.create_bucket().await?;
        }
        self.upload_resources().await
    }

    async fn run(&self, save_scores: bool) -> Result<RunResults, BenchError> {
        let units = self.context.select(None, None)?;
        self.context
            .execute(RunMode::Aws, units, save_scores, |unit| async move {
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
            .execute(RunMode::Aws, units, save_scores, |unit| async move {
                self.run_unit(&unit).await
            })
            .await
    }
}

fn unit_error(error: AwsError) -> UnitError {
    if error.is_fatal() {
        UnitError::Fatal(error.into())
    } else {
        UnitError::failed(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::context::tests::context_in;
    use crate::results::tests::{framework, unit};
    use crate::results::{ResultStore, RunResult};
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;

    /// Backend whose `aws` is a shell script logging its arguments.
    fn backend(dir: &Path, script: &str) -> (AwsBackend, std::path::PathBuf) {
        backend_for(dir, script, "- name: iris\n  folds: 2\n  max_runtime_seconds: 5\n")
    }

    fn backend_for(dir: &Path, script: &str, descriptor: &str) -> (AwsBackend, std::path::PathBuf) {
        let log = dir.join("aws.log");
        let program = dir.join("aws");
        std::fs::write(
            &program,
            format!("#!/bin/sh\necho \"$*\" >> '{}'\n{}\n", log.display(), script),
        )
        .unwrap();
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut ctx = context_in(dir, descriptor, 2);
        let mut settings = (*ctx.settings).clone();
        settings.aws.poll_interval_seconds = 0;
        settings.aws.ec2.ami = Some("ami-123".to_string());
        ctx.settings = Arc::new(settings);

        let cli = AwsCli::new(Some("eu-west-1".to_string())).with_program(program.to_string_lossy());
        (AwsBackend::new(ctx).with_cli(cli), log)
    }

    fn calls(log: &Path) -> Vec<String> {
        std::fs::read_to_string(log)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn test_auto_setup_uploads_only_when_missing() {
        let temp = TempDir::new().unwrap();
        let (aws, log) = backend(temp.path(), r#"case "$*" in *head-object*) exit 254;; esac"#);

        aws.setup(SetupMode::Auto).await.unwrap();
        let made = calls(&log);
        assert!(made.iter().any(|c| c.contains("s3api head-bucket --bucket benchrun-runs")));
        assert!(!made.iter().any(|c| c.contains("create-bucket")));
        assert!(made
            .iter()
            .any(|c| c.contains("s3 cp --recursive") && c.contains("s3://benchrun-runs/runs/resources/fw_suite")));
        assert!(made.iter().any(|c| c.ends_with("runs/resources/fw_suite/.installed")));
    }

    #[tokio::test]
    async fn test_auto_setup_is_noop_when_ready_and_force_reuploads() {
        let temp = TempDir::new().unwrap();
        let (aws, log) = backend(temp.path(), "exit 0");

        aws.setup(SetupMode::Auto).await.unwrap();
        assert!(!calls(&log).iter().any(|c| c.contains("s3 cp")));

        aws.setup(SetupMode::Force).await.unwrap();
        aws.setup(SetupMode::Force).await.unwrap();
        let uploads = calls(&log).iter().filter(|c| c.contains("s3 cp --recursive")).count();
        assert_eq!(uploads, 2);
    }

    #[tokio::test]
    async fn test_missing_bucket_is_created_in_region() {
        let temp = TempDir::new().unwrap();
        let (aws, log) = backend(
            temp.path(),
            r#"case "$*" in *head-bucket*|*head-object*) exit 254;; esac"#,
        );

        aws.setup(SetupMode::Auto).await.unwrap();
        assert!(calls(&log)
            .iter()
            .any(|c| c.contains("create-bucket --bucket benchrun-runs --create-bucket-configuration LocationConstraint=eu-west-1")));
    }

    #[tokio::test]
    async fn test_credentials_error_is_fatal() {
        let temp = TempDir::new().unwrap();
        let (aws, _) = backend(temp.path(), "exit 253");
        let err = aws.setup(SetupMode::Auto).await.unwrap_err();
        assert!(matches!(err, BackendError::Aws(AwsError::Configuration(_))));

        let err = aws.run(false).await.unwrap_err();
        assert!(matches!(err, BenchError::Backend(BackendError::Aws(_))));
    }

    #[tokio::test]
    async fn test_unit_runs_on_instance() {
        let temp = TempDir::new().unwrap();
        let mut nested = RunResult::success(
            &framework(),
            "suite",
            &unit("iris", 0),
            RunMode::Local,
            Duration::from_secs(1),
        );
        nested.scores = Some(Scores {
            score: Some(0.75),
            ..Scores::default()
        });
        let saved = ResultStore::new(&temp.path().join("nested"), "s").save_unit(&nested).unwrap();

        let script = format!(
            r#"case "$*" in
  *run-instances*) echo '{{"Instances": [{{"InstanceId": "i-42"}}]}}' ;;
  *describe-instances*) echo '{{"Reservations": [{{"Instances": [{{"State": {{"Name": "terminated"}}}}]}}]}}' ;;
  *"s3 cp s3://"*) for last; do :; done; cp '{}' "$last" ;;
esac"#,
            saved.display()
        );
        let (aws, log) = backend(temp.path(), &script);

        let results = aws.run_one("iris", Some(&[0]), false).await.unwrap();
        assert_eq!(results.len(), 1);
        let result = results.get("iris", 0).unwrap();
        assert!(result.is_success());
        assert_eq!(result.mode, RunMode::Aws);
        assert_eq!(result.scores.as_ref().unwrap().score, Some(0.75));

        let made = calls(&log);
        let launch = made.iter().find(|c| c.contains("run-instances")).unwrap();
        assert!(launch.contains("--image-id ami-123"));
        assert!(launch.contains("--instance-initiated-shutdown-behavior terminate"));
        assert!(made.iter().any(|c| c.contains("describe-instances --instance-ids i-42")));
        assert!(!made.iter().any(|c| c.contains("terminate-instances")));
    }

    #[tokio::test]
    async fn test_unbounded_runtime_polls_without_deadline() {
        let temp = TempDir::new().unwrap();
        let script = r#"case "$*" in
  *run-instances*) echo '{"Instances": [{"InstanceId": "i-7"}]}' ;;
  *describe-instances*) echo '{"Reservations": [{"Instances": [{"State": {"Name": "terminated"}}]}]}' ;;
  *"s3 cp s3://"*) exit 1 ;;
esac"#;
        let (aws, log) = backend_for(
            temp.path(),
            script,
            "- name: iris\n  folds: 1\n  max_runtime_seconds: 18446744073709551615\n",
        );

        let results = aws.run(false).await.unwrap();
        let result = results.get("iris", 0).unwrap();
        assert!(!result.is_success());
        assert!(!result.error.as_deref().unwrap().contains("timed out"));
        assert!(!calls(&log).iter().any(|c| c.contains("terminate-instances")));
    }

    #[tokio::test]
    async fn test_missing_ami_is_fatal() {
        let temp = TempDir::new().unwrap();
        let (mut aws, _) = backend(temp.path(), "exit 0");
        let mut settings = (*aws.context.settings).clone();
        settings.aws.ec2.ami = None;
        aws.context.settings = Arc::new(settings);

        let err = aws.run(false).await.unwrap_err();
        assert!(matches!(err, BenchError::Backend(BackendError::Setup(_))));
    }

    #[test]
    fn test_unit_location() {
        let temp = TempDir::new().unwrap();
        let (aws, _) = backend(temp.path(), "exit 0");
        let location = aws.unit_location(&unit("iris", 1));
        assert_eq!(location.resources_uri(), "s3://benchrun-runs/runs/resources/fw_suite");
        assert_eq!(
            location.output_uri(),
            "s3://benchrun-runs/runs/20240101T000000/fw_iris_1"
        );
    }
}
