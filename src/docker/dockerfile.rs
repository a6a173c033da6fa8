//! Dockerfile generation and build contexts for framework images.
//!
//! A framework image bundles this program and the framework definition,
//! and installs the framework at build time by running the local setup.
//! Containers then run single units through the image entrypoint.

use std::collections::BTreeMap;
use std::io;

use serde::{Deserialize, Serialize};

/// Path of the program inside framework images.
pub const CONTAINER_BINARY: &str = "/usr/local/bin/benchrun";

/// User directory baked into framework images.
pub const CONTAINER_USER_DIR: &str = "/bench/custom";

/// Mount point of the host input directory.
pub const CONTAINER_INPUT_DIR: &str = "/input";

/// Mount point of the host output directory.
pub const CONTAINER_OUTPUT_DIR: &str = "/output";

/// Mount point of a benchmark descriptor file given by path.
pub const CONTAINER_BENCHMARK_DIR: &str = "/benchmark";

/// Configuration for generating a framework Dockerfile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerfileConfig {
    /// Base Docker image to use.
    pub base_image: String,
    pub framework: String,
    pub version: String,
    /// System packages to install via apt-get.
    pub packages: Vec<String>,
    /// Environment variables to set in the image.
    pub env_vars: BTreeMap<String, String>,
}

/// Builder for generating Dockerfile content.
#[derive(Debug, Clone)]
pub struct DockerfileBuilder {
    config: DockerfileConfig,
}

impl DockerfileBuilder {
    pub fn new(config: DockerfileConfig) -> Self {
        Self { config }
    }

    /// Build and return the Dockerfile content as a string.
    pub fn build(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("FROM {}", self.config.base_image));
        lines.push(String::new());

        lines.push(format!(
            "LABEL benchrun.framework=\"{}\"",
            escape_env_value(&self.config.framework)
        ));
        lines.push(format!(
            "LABEL benchrun.version=\"{}\"",
            escape_env_value(&self.config.version)
        ));
        lines.push(String::new());

        let valid_packages = filter_valid_packages(&self.config.packages);
        if !valid_packages.is_empty() {
            lines.push("ENV DEBIAN_FRONTEND=noninteractive".to_string());
            lines.push(format!(
                "RUN apt-get update && apt-get install -y --no-install-recommends {} && rm -rf /var/lib/apt/lists/*",
                valid_packages.join(" \\\n    ")
            ));
            lines.push(String::new());
        }

        for (key, value) in &self.config.env_vars {
            lines.push(format!("ENV {}=\"{}\"", key, escape_env_value(value)));
        }
        if !self.config.env_vars.is_empty() {
            lines.push(String::new());
        }

        lines.push(format!("COPY benchrun {}", CONTAINER_BINARY));
        lines.push(format!("COPY custom {}", CONTAINER_USER_DIR));
        lines.push(String::new());

        lines.push("WORKDIR /bench".to_string());
        lines.push(format!(
            "RUN benchrun {} -m local -s only -u {} -o /tmp/benchrun-setup && rm -rf /tmp/benchrun-setup",
            self.config.framework, CONTAINER_USER_DIR
        ));
        lines.push(String::new());

        lines.push("ENTRYPOINT [\"benchrun\"]".to_string());

        lines.join("\n")
    }
}

/// Files of a `docker build` context, packed as an uncompressed tar.
#[derive(Debug, Default)]
pub struct BuildContext {
    files: Vec<(String, Vec<u8>, u32)>,
}

impl BuildContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a file at `path` relative to the context root.
    pub fn add_file(&mut self, path: impl Into<String>, content: impl Into<Vec<u8>>, mode: u32) {
        self.files.push((path.into(), content.into(), mode));
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(|(path, _, _)| path.as_str())
    }

    /// Packs the context into tar bytes accepted by the build endpoint.
    pub fn into_tar(self) -> io::Result<Vec<u8>> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, content, mode) in &self.files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(*mode);
            header.set_cksum();
            builder.append_data(&mut header, path, content.as_slice())?;
        }
        builder.into_inner()
    }
}

/// Escape special characters in values written between double quotes.
fn escape_env_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('$', "\\$")
}

/// Validate a package name to prevent command injection.
///
/// Package names must only contain alphanumeric characters, hyphens, underscores,
/// periods, colons (for versioning), and plus signs.
pub fn is_valid_package_name(package: &str) -> bool {
    if package.is_empty() {
        return false;
    }
    package
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '+'))
}

/// Filter and return only valid package names from a list.
pub fn filter_valid_packages(packages: &[String]) -> Vec<String> {
    packages
        .iter()
        .filter(|p| is_valid_package_name(p))
        .cloned()
        .collect()
}
