//! User-data script of unit instances.
//!
//! The instance fetches the run resources from S3, runs the framework image
//! for one unit, uploads its output directory and powers off. Instances are
//! launched with shutdown behavior `terminate`, so powering off ends them.

/// Location of a unit's resources and results in S3.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitLocation {
    pub bucket: String,
    /// Key prefix of the uploaded user directory and benchmark file.
    pub resources_key: String,
    /// Key prefix the unit output directory is uploaded to.
    pub output_key: String,
}

impl UnitLocation {
    pub fn resources_uri(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.resources_key)
    }

    pub fn output_uri(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.output_key)
    }
}

/// Renders the user-data script of one unit.
pub fn render(location: &UnitLocation, region: Option<&str>, image: &str, args: &[String]) -> String {
    let region_opt = region
        .map(|r| format!(" --region {}", shell_quote(r)))
        .unwrap_or_default();
    let args = args.iter().map(|a| shell_quote(a)).collect::<Vec<_>>().join(" ");

    let mut script = Vec::new();
    script.push("#!/bin/bash".to_string());
    script.push("set -u".to_string());
    script.push("trap 'shutdown -h now' EXIT".to_string());
    script.push("mkdir -p /bench/custom /bench/input /bench/output /benchmark".to_string());
    script.push(format!(
        "aws{} s3 cp --recursive {}/custom /bench/custom",
        region_opt,
        shell_quote(&location.resources_uri())
    ));
    script.push(format!(
        "aws{} s3 cp --recursive {}/benchmark /benchmark || true",
        region_opt,
        shell_quote(&location.resources_uri())
    ));
    script.push(format!("docker pull {} || true", shell_quote(image)));
    script.push(format!(
        "docker run --rm -v /bench/input:/input:ro -v /bench/output:/output -v /benchmark:/benchmark:ro -v /bench/custom:/bench/custom:ro {} {}",
        shell_quote(image),
        args
    ));
    script.push(format!(
        "aws{} s3 cp --recursive /bench/output {}",
        region_opt,
        shell_quote(&location.output_uri())
    ));
    script.push(String::new());
    script.join("\n")
}

/// Quotes a word for POSIX shells.
pub fn shell_quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '=' | '@'))
    {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', "'\\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location() -> UnitLocation {
        UnitLocation {
            bucket: "benchrun-runs".to_string(),
            resources_key: "runs/resources/fw_test".to_string(),
            output_key: "runs/20240101T000000/fw_iris_0".to_string(),
        }
    }

    #[test]
    fn test_render_script() {
        let args = vec!["fw".to_string(), "test".to_string(), "-t".to_string(), "iris".to_string()];
        let script = render(&location(), Some("us-east-1"), "benchrun/fw:1.0", &args);

        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("trap 'shutdown -h now' EXIT"));
        assert!(script.contains("aws --region us-east-1 s3 cp --recursive s3://benchrun-runs/runs/resources/fw_test/custom /bench/custom"));
        assert!(script.contains("benchrun/fw:1.0 fw test -t iris"));
        assert!(script.contains("/bench/output s3://benchrun-runs/runs/20240101T000000/fw_iris_0"));
    }

    #[test]
    fn test_render_without_region() {
        let script = render(&location(), None, "img", &[]);
        assert!(script.contains("\naws s3 cp"));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain-word_1.0"), "plain-word_1.0");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote(""), "''");
    }
}
