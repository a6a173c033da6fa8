//! Framework definitions.
//!
//! Definitions are keyed by framework name and merged from, in order, the
//! built-in `frameworks.yaml`, `<user_dir>/frameworks.yaml` and the file
//! named by `frameworks.definition_file`. Later files override earlier
//! ones field by field.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::config::{self, expand_home, Settings};
use crate::error::ConfigError;

const BUILTIN_FRAMEWORKS: &str = include_str!("../../resources/frameworks.yaml");

/// File name of the user frameworks override.
pub const FRAMEWORKS_FILE_NAME: &str = "frameworks.yaml";

/// How to install and invoke a framework.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameworkDefinition {
    /// Name, filled from the definition key.
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Command installing the framework, run inside its directory.
    #[serde(default)]
    pub setup: Option<Vec<String>>,
    /// Command training and scoring one (task, fold).
    pub exec: Vec<String>,
    /// Image used in docker and aws modes instead of the generated one.
    #[serde(default)]
    pub image: Option<String>,
    /// Extra environment passed to `setup` and `exec`.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_version() -> String {
    "latest".to_string()
}

impl FrameworkDefinition {
    /// Marker content identifying an installed framework version.
    pub fn install_marker(&self) -> String {
        format!("{} {}", self.name, self.version)
    }

    /// Image name and tag under the given repository prefix.
    pub fn image_name(&self, prefix: &str) -> String {
        match &self.image {
            Some(image) => image.clone(),
            None => format!(
                "{}/{}:{}",
                prefix,
                self.name.to_lowercase(),
                self.version.to_lowercase()
            ),
        }
    }
}

/// Looks up a framework by name in all definition files.
pub fn load_framework(name: &str, settings: &Settings) -> Result<FrameworkDefinition, ConfigError> {
    let builtin: Value = serde_yaml::from_str(BUILTIN_FRAMEWORKS).map_err(|e| {
        ConfigError::Malformed {
            path: Path::new("<built-in frameworks.yaml>").to_path_buf(),
            message: e.to_string(),
        }
    })?;

    let user = config::load(&settings.user_dir().join(FRAMEWORKS_FILE_NAME))?;
    let extra = match &settings.frameworks.definition_file {
        Some(file) => config::load(&expand_home(file))?,
        None => None,
    };
    let merged = config::merge(&builtin, user.iter().chain(extra.iter()));

    let entry = merged
        .as_value()
        .get(name)
        .cloned()
        .ok_or_else(|| ConfigError::FrameworkNotFound(name.to_string()))?;
    let mut definition: FrameworkDefinition = serde_yaml::from_value(entry).map_err(|e| {
        ConfigError::Invalid(format!("framework '{name}': {e}"))
    })?;
    definition.name = name.to_string();

    if definition.exec.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "framework '{name}' has an empty exec command"
        )));
    }
    Ok(definition)
}
