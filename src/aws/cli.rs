//! Thin async wrapper over the `aws` command line client.

use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use crate::error::AwsError;

/// Exit code of the aws CLI for configuration and credential errors.
const CONFIGURATION_EXIT_CODE: i32 = 253;

/// Timeout of a single CLI call.
const CALL_TIMEOUT: Duration = Duration::from_secs(300);

/// Invokes `aws` subcommands with JSON output.
#[derive(Debug, Clone)]
pub struct AwsCli {
    program: String,
    region: Option<String>,
}

impl AwsCli {
    pub fn new(region: Option<String>) -> Self {
        Self {
            program: "aws".to_string(),
            region,
        }
    }

    /// Uses another executable in place of `aws`.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    /// Full argument list of a call, global options first.
    pub fn command_args(&self, args: &[&str]) -> Vec<String> {
        let mut full = Vec::with_capacity(args.len() + 4);
        if let Some(region) = &self.region {
            full.push("--region".to_string());
            full.push(region.clone());
        }
        full.push("--output".to_string());
        full.push("json".to_string());
        full.extend(args.iter().map(|a| a.to_string()));
        full
    }

    /// Runs a call and returns its standard output.
    pub async fn call(&self, args: &[&str]) -> Result<String, AwsError> {
        let command = args.iter().take(2).cloned().collect::<Vec<_>>().join(" ");
        debug!("aws {}", args.join(" "));

        let mut cmd = Command::new(&self.program);
        cmd.args(self.command_args(args))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(CALL_TIMEOUT, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == ErrorKind::NotFound => {
                return Err(AwsError::NotInstalled(format!("'{}' not found", self.program)))
            }
            Ok(Err(e)) => return Err(AwsError::NotInstalled(e.to_string())),
            Err(_) => {
                return Err(AwsError::CommandFailed {
                    command,
                    code: -1,
                    stderr: format!("timed out after {}s", CALL_TIMEOUT.as_secs()),
                })
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        match output.status.code() {
            Some(0) => Ok(String::from_utf8_lossy(&output.stdout).into_owned()),
            Some(CONFIGURATION_EXIT_CODE) => Err(AwsError::Configuration(stderr)),
            code => Err(AwsError::CommandFailed {
                command,
                code: code.unwrap_or(-1),
                stderr,
            }),
        }
    }

    /// Runs a call and parses its JSON output.
    pub async fn call_json(&self, args: &[&str]) -> Result<Value, AwsError> {
        let stdout = self.call(args).await?;
        if stdout.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&stdout).map_err(|e| AwsError::InvalidResponse(e.to_string()))
    }
}

/// Instance id in a `run-instances` response.
pub fn parse_instance_id(response: &Value) -> Result<String, AwsError> {
    response
        .pointer("/Instances/0/InstanceId")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| AwsError::InvalidResponse("run-instances returned no instance id".to_string()))
}

/// Instance state name in a `describe-instances` response.
pub fn parse_instance_state(response: &Value) -> Option<String> {
    response
        .pointer("/Reservations/0/Instances/0/State/Name")
        .and_then(Value::as_str)
        .map(str::to_string)
}
