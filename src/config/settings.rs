//! Typed views of the effective configuration.
//!
//! Every section falls back to the built-in defaults for keys that are
//! absent, so a partially specified user configuration still deserializes.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Typed root of the effective configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory holding user overrides (config, frameworks, benchmarks).
    pub user_dir: String,
    /// Directory where datasets are loaded from.
    pub input_dir: String,
    /// Directory where logs and scores are written.
    pub output_dir: String,
    /// Run mode requested for this invocation.
    pub run_mode: String,
    /// Identity of the invoking script, used in log and score file names.
    pub script: String,
    pub frameworks: FrameworksSettings,
    pub benchmarks: BenchmarksSettings,
    pub local: LocalSettings,
    pub docker: DockerSettings,
    pub aws: AwsSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            user_dir: "~/.config/benchrun".to_string(),
            input_dir: "~/.benchrun/input".to_string(),
            output_dir: "./results".to_string(),
            run_mode: "local".to_string(),
            script: "benchrun".to_string(),
            frameworks: FrameworksSettings::default(),
            benchmarks: BenchmarksSettings::default(),
            local: LocalSettings::default(),
            docker: DockerSettings::default(),
            aws: AwsSettings::default(),
        }
    }
}

impl Settings {
    /// User directory with `~` expanded.
    pub fn user_dir(&self) -> PathBuf {
        expand_home(&self.user_dir)
    }

    /// Input directory with `~` expanded.
    pub fn input_dir(&self) -> PathBuf {
        expand_home(&self.input_dir)
    }

    /// Output directory with `~` expanded.
    pub fn output_dir(&self) -> PathBuf {
        expand_home(&self.output_dir)
    }
}

/// Location of framework definitions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameworksSettings {
    /// Extra definitions file merged over the built-in and user ones.
    pub definition_file: Option<String>,
}

/// Location and defaults of benchmark descriptors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchmarksSettings {
    /// Directory searched for `<name>.yaml` descriptors.
    pub definition_dir: String,
    /// Values applied to tasks that do not set them.
    pub defaults: TaskDefaults,
}

impl Default for BenchmarksSettings {
    fn default() -> Self {
        Self {
            definition_dir: "./benchmarks".to_string(),
            defaults: TaskDefaults::default(),
        }
    }
}

/// Default task parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskDefaults {
    pub folds: u32,
    pub max_runtime_seconds: u64,
    /// Number of cores granted to the framework, `-1` for all.
    pub cores: i32,
    pub metric: String,
}

impl Default for TaskDefaults {
    fn default() -> Self {
        Self {
            folds: 10,
            max_runtime_seconds: 3600,
            cores: -1,
            metric: "auto".to_string(),
        }
    }
}

/// Local mode settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSettings {
    /// Directory where frameworks are installed, one subdirectory each.
    pub frameworks_dir: String,
    pub setup_timeout_seconds: u64,
    /// Added to a task's max runtime before the process is killed.
    pub timeout_margin_seconds: u64,
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            frameworks_dir: "~/.benchrun/frameworks".to_string(),
            setup_timeout_seconds: 1800,
            timeout_margin_seconds: 300,
        }
    }
}

impl LocalSettings {
    pub fn frameworks_dir(&self) -> PathBuf {
        expand_home(&self.frameworks_dir)
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_secs(self.setup_timeout_seconds)
    }
}

/// Docker mode settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerSettings {
    /// Repository prefix of framework images (`<prefix>/<framework>:<version>`).
    pub image_prefix: String,
    /// Base image of generated Dockerfiles.
    pub base_image: String,
    /// Try pulling a missing image before building it.
    pub pull_before_build: bool,
    pub build_timeout_seconds: u64,
    /// System packages installed in framework images.
    pub packages: Vec<String>,
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            image_prefix: "benchrun".to_string(),
            base_image: "ubuntu:22.04".to_string(),
            pull_before_build: true,
            build_timeout_seconds: 3600,
            packages: vec![
                "ca-certificates".to_string(),
                "python3".to_string(),
                "python3-pip".to_string(),
            ],
        }
    }
}

/// AWS mode settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsSettings {
    /// Region; falls back to the AWS CLI's own default when unset.
    pub region: Option<String>,
    /// Added to a task's max runtime before its instance is terminated.
    pub overhead_seconds: u64,
    pub poll_interval_seconds: u64,
    pub s3: S3Settings,
    pub ec2: Ec2Settings,
}

impl Default for AwsSettings {
    fn default() -> Self {
        Self {
            region: None,
            overhead_seconds: 1200,
            poll_interval_seconds: 30,
            s3: S3Settings::default(),
            ec2: Ec2Settings::default(),
        }
    }
}

/// S3 storage used to exchange resources and results with instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Settings {
    pub bucket: String,
    pub root_key: String,
}

impl Default for S3Settings {
    fn default() -> Self {
        Self {
            bucket: "benchrun-runs".to_string(),
            root_key: "runs".to_string(),
        }
    }
}

/// EC2 instances launched per work unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Ec2Settings {
    pub instance_type: String,
    pub ami: Option<String>,
    pub key_name: Option<String>,
}

impl Default for Ec2Settings {
    fn default() -> Self {
        Self {
            instance_type: "m5.xlarge".to_string(),
            ami: None,
            key_name: None,
        }
    }
}

/// Expands a leading `~` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"));
    }
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
