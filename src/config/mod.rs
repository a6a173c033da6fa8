//! Layered configuration.
//!
//! The effective configuration is produced by deep-merging, in priority
//! order:
//!
//! ```text
//! built-in defaults → <input_dir>/config.yaml → <user_dir>/config.yaml → command line
//! ```
//!
//! Merging is key-wise: mappings merge recursively, any other value is
//! replaced by the last source that defines it (a YAML `null` counts as
//! not defined). A key is removed only when a later source sets it to
//! [`UNSET`].
//!
//! # Example
//!
//! ```ignore
//! use benchrun::config::{self, ConfigOverrides};
//!
//! let overrides = ConfigOverrides::new("docker").with_output_dir("./out");
//! let config = config::resolve(&overrides)?;
//! let settings = config.settings()?;
//! assert_eq!(settings.run_mode, "docker");
//! ```

pub mod settings;

use std::fs;
use std::path::{Path, PathBuf};

use serde_yaml::{Mapping, Value};
use tracing::debug;

use crate::error::ConfigError;

pub use settings::{
    expand_home, AwsSettings, BenchmarksSettings, DockerSettings, LocalSettings, Settings,
    TaskDefaults,
};

/// Built-in default configuration.
const DEFAULT_CONFIG: &str = include_str!("../../resources/config.yaml");

/// Sentinel value removing a key inherited from an earlier source.
pub const UNSET: &str = "__unset__";

/// Environment variable carrying the invocation timestamp into nested runs.
pub const STAMP_ENV: &str = "BENCHRUN_STAMP";

/// Name of the override file looked up in the input and user directories.
pub const CONFIG_FILE_NAME: &str = "config.yaml";

/// The single configuration mapping produced after merging all sources.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveConfig {
    root: Value,
}

impl EffectiveConfig {
    /// Parses the built-in defaults.
    pub fn defaults() -> Result<Self, ConfigError> {
        let root = parse_mapping(DEFAULT_CONFIG, Path::new("<built-in config.yaml>"))?;
        Ok(Self { root })
    }

    /// Wraps an already merged value.
    pub fn from_value(root: Value) -> Self {
        Self {
            root: strip_unset(&root),
        }
    }

    /// Returns the underlying mapping.
    pub fn as_value(&self) -> &Value {
        &self.root
    }

    /// Looks up a value by dotted path, e.g. `aws.s3.bucket`.
    pub fn get(&self, dotted: &str) -> Option<&Value> {
        dotted
            .split('.')
            .try_fold(&self.root, |node, key| node.as_mapping()?.get(key))
    }

    /// Returns a new configuration with `overlay` merged on top.
    pub fn merged_with(&self, overlay: &Value) -> Self {
        Self {
            root: merge_values(&self.root, overlay),
        }
    }

    /// Deserializes the typed view of this configuration.
    pub fn settings(&self) -> Result<Settings, ConfigError> {
        serde_yaml::from_value(self.root.clone())
            .map_err(|e| ConfigError::Invalid(format!("effective configuration: {e}")))
    }
}

/// Deep-merges `overrides` on top of `base`, in order.
///
/// Pure: neither input is modified.
pub fn merge<'a>(base: &Value, overrides: impl IntoIterator<Item = &'a Value>) -> EffectiveConfig {
    let root = overrides
        .into_iter()
        .fold(strip_unset(base), |acc, overlay| merge_values(&acc, overlay));
    EffectiveConfig { root }
}

/// Loads a configuration file.
///
/// A missing file yields `Ok(None)`; an empty file yields an empty mapping.
pub fn load(path: &Path) -> Result<Option<Value>, ConfigError> {
    if !path.is_file() {
        debug!("No configuration file at {}", path.display());
        return Ok(None);
    }
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    debug!("Loaded configuration file {}", path.display());
    parse_mapping(&content, path).map(Some)
}

/// Overrides supplied on the command line, applied last.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub run_mode: String,
    pub script: Option<String>,
    pub input_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub user_dir: Option<PathBuf>,
    pub region: Option<String>,
}

impl ConfigOverrides {
    /// Creates overrides for the given run mode.
    pub fn new(run_mode: impl Into<String>) -> Self {
        Self {
            run_mode: run_mode.into(),
            ..Default::default()
        }
    }

    /// Sets the script identity.
    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.script = Some(script.into());
        self
    }

    /// Sets the input directory.
    pub fn with_input_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.input_dir = Some(dir.into());
        self
    }

    /// Sets the output directory.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// Sets the user directory.
    pub fn with_user_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.user_dir = Some(dir.into());
        self
    }

    /// Sets the AWS region.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Renders the overrides as a configuration mapping.
    pub fn to_value(&self) -> Value {
        let mut root = Mapping::new();
        root.insert("run_mode".into(), self.run_mode.clone().into());
        if let Some(script) = &self.script {
            root.insert("script".into(), script.clone().into());
        }
        let dirs = [
            ("input_dir", &self.input_dir),
            ("output_dir", &self.output_dir),
            ("user_dir", &self.user_dir),
        ];
        for (key, dir) in dirs {
            if let Some(dir) = dir {
                root.insert(key.into(), dir.to_string_lossy().into_owned().into());
            }
        }
        if let Some(region) = &self.region {
            let mut aws = Mapping::new();
            aws.insert("region".into(), region.clone().into());
            root.insert("aws".into(), Value::Mapping(aws));
        }
        Value::Mapping(root)
    }
}

/// Resolves the effective configuration from all layers.
///
/// The input directory override is only consulted when an input directory
/// was given on the command line. The user directory is taken from the
/// command line if given, else from the defaults and input override.
pub fn resolve(overrides: &ConfigOverrides) -> Result<EffectiveConfig, ConfigError> {
    let defaults = EffectiveConfig::defaults()?;
    let cli = overrides.to_value();

    let input = match &overrides.input_dir {
        Some(dir) => load(&dir.join(CONFIG_FILE_NAME))?,
        None => None,
    };

    let user_dir = match &overrides.user_dir {
        Some(dir) => dir.clone(),
        None => {
            let partial = merge(defaults.as_value(), input.iter());
            partial.settings()?.user_dir()
        }
    };
    let user = load(&user_dir.join(CONFIG_FILE_NAME))?;

    let layers: Vec<&Value> = input.iter().chain(user.iter()).chain([&cli]).collect();
    Ok(merge(defaults.as_value(), layers))
}

fn parse_mapping(content: &str, path: &Path) -> Result<Value, ConfigError> {
    let value: Value = serde_yaml::from_str(content).map_err(|e| ConfigError::Malformed {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    match value {
        Value::Null => Ok(Value::Mapping(Mapping::new())),
        Value::Mapping(_) => Ok(value),
        _ => Err(ConfigError::Malformed {
            path: path.to_path_buf(),
            message: "top level must be a mapping".to_string(),
        }),
    }
}

fn is_unset(value: &Value) -> bool {
    value.as_str() == Some(UNSET)
}

fn strip_unset(value: &Value) -> Value {
    match value {
        Value::Mapping(map) => Value::Mapping(
            map.iter()
                .filter(|(_, v)| !is_unset(v))
                .map(|(k, v)| (k.clone(), strip_unset(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn merge_values(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (_, Value::Null) => strip_unset(base),
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            let mut merged = match strip_unset(&Value::Mapping(base_map.clone())) {
                Value::Mapping(map) => map,
                _ => Mapping::new(),
            };
            for (key, value) in overlay_map {
                if is_unset(value) {
                    merged.remove(key);
                    continue;
                }
                if value.is_null() {
                    continue;
                }
                let next = match merged.get(key) {
                    Some(existing) => merge_values(existing, value),
                    None => strip_unset(value),
                };
                merged.insert(key.clone(), next);
            }
            Value::Mapping(merged)
        }
        (_, other) => strip_unset(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn yaml(s: &str) -> Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn test_defaults_parse() {
        let config = EffectiveConfig::defaults().unwrap();
        assert_eq!(config.get("run_mode").and_then(Value::as_str), Some("local"));
        assert_eq!(
            config.get("aws.s3.bucket").and_then(Value::as_str),
            Some("benchrun-runs")
        );
        let settings = config.settings().unwrap();
        assert_eq!(settings.benchmarks.defaults.folds, 10);
    }

    #[test]
    fn test_merge_is_key_wise() {
        let base = yaml("a: 1\nnested:\n  x: 1\n  y: 2\n");
        let over = yaml("nested:\n  y: 3\n  z: 4\n");
        let merged = merge(&base, [&over]);
        assert_eq!(
            merged.as_value(),
            &yaml("a: 1\nnested:\n  x: 1\n  y: 3\n  z: 4\n")
        );
    }

    #[test]
    fn test_merge_null_does_not_override() {
        let base = yaml("region: eu-west-1\n");
        let over = yaml("region: null\n");
        let merged = merge(&base, [&over]);
        assert_eq!(merged.get("region").and_then(Value::as_str), Some("eu-west-1"));
    }

    #[test]
    fn test_merge_unset_removes_key() {
        let base = yaml("keep: 1\ndrop: 2\nnested:\n  gone: true\n  stays: true\n");
        let over = yaml("drop: __unset__\nnested:\n  gone: __unset__\n");
        let merged = merge(&base, [&over]);
        assert_eq!(merged.as_value(), &yaml("keep: 1\nnested:\n  stays: true\n"));
    }

    #[test]
    fn test_merge_later_sources_win() {
        let base = yaml("mode: local\n");
        let first = yaml("mode: docker\n");
        let second = yaml("mode: aws\n");
        let merged = merge(&base, [&first, &second]);
        assert_eq!(merged.get("mode").and_then(Value::as_str), Some("aws"));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let base = EffectiveConfig::defaults().unwrap();
        let input = yaml("input_dir: /data\nbenchmarks:\n  defaults:\n    folds: 3\n");
        let user = yaml("aws:\n  region: us-east-1\n  ec2:\n    ami: __unset__\n");
        let merged = merge(base.as_value(), [&input, &user]);

        let again = merge(merged.as_value(), [merged.as_value()]);
        assert_eq!(again, merged);
        assert!(merged.get("aws.ec2.ami").is_none());
    }

    #[test]
    fn test_merge_does_not_touch_inputs() {
        let base = yaml("a:\n  b: 1\n");
        let over = yaml("a:\n  b: 2\n");
        let _ = merge(&base, [&over]);
        assert_eq!(base, yaml("a:\n  b: 1\n"));
    }

    #[test]
    fn test_load_missing_file_is_none() {
        let temp = TempDir::new().unwrap();
        let loaded = load(&temp.path().join("config.yaml")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_load_malformed_file_fails() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.yaml");
        fs::write(&path, "output_dir: [unclosed\n").unwrap();
        let err = load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Malformed { .. }));

        fs::write(&path, "- just\n- a list\n").unwrap();
        let err = load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Malformed { .. }));
    }

    #[test]
    fn test_resolve_priority_order() {
        let input_dir = TempDir::new().unwrap();
        let user_dir = TempDir::new().unwrap();
        fs::write(
            input_dir.path().join("config.yaml"),
            "output_dir: /from/input\ndocker:\n  image_prefix: input-prefix\n",
        )
        .unwrap();
        fs::write(
            user_dir.path().join("config.yaml"),
            "output_dir: /from/user\ndocker:\n  base_image: debian:12\n",
        )
        .unwrap();

        let overrides = ConfigOverrides::new("docker")
            .with_input_dir(input_dir.path())
            .with_user_dir(user_dir.path());
        let config = resolve(&overrides).unwrap();
        let settings = config.settings().unwrap();

        assert_eq!(settings.run_mode, "docker");
        assert_eq!(settings.output_dir, "/from/user");
        assert_eq!(settings.docker.image_prefix, "input-prefix");
        assert_eq!(settings.docker.base_image, "debian:12");

        let overrides = overrides.with_output_dir("/from/cli");
        let settings = resolve(&overrides).unwrap().settings().unwrap();
        assert_eq!(settings.output_dir, "/from/cli");
    }

    #[test]
    fn test_resolve_reports_malformed_user_config() {
        let user_dir = TempDir::new().unwrap();
        fs::write(user_dir.path().join("config.yaml"), "aws: {region: [eu\n").unwrap();
        let overrides = ConfigOverrides::new("local").with_user_dir(user_dir.path());
        assert!(matches!(
            resolve(&overrides),
            Err(ConfigError::Malformed { .. })
        ));
    }

    #[test]
    fn test_region_override() {
        let user_dir = TempDir::new().unwrap();
        let overrides = ConfigOverrides::new("aws")
            .with_user_dir(user_dir.path())
            .with_region("ap-southeast-2");
        let config = resolve(&overrides).unwrap();
        assert_eq!(
            config.get("aws.region").and_then(Value::as_str),
            Some("ap-southeast-2")
        );
    }
}
