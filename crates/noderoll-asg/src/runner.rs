//! Running the `aws` command-line client.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use noderoll_core::{RollError, RollResult};

/// Error codes in aws CLI output that mean the credentials are missing,
/// expired or lack permission.
const AUTH_MARKERS: &[&str] = &[
    "AccessDenied",
    "UnauthorizedOperation",
    "ExpiredToken",
    "InvalidClientTokenId",
    "UnrecognizedClientException",
    "Unable to locate credentials",
];

/// Executes one aws CLI invocation and returns its stdout.
#[async_trait]
pub trait AwsRunner: Send + Sync {
    async fn run(&self, args: &[String]) -> RollResult<String>;
}

/// Runs the real `aws` binary with JSON output.
#[derive(Debug, Clone)]
pub struct AwsCli {
    program: String,
    region: Option<String>,
    profile: Option<String>,
}

impl AwsCli {
    pub fn new() -> Self {
        Self {
            program: "aws".to_string(),
            region: None,
            profile: None,
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_region(mut self, region: Option<String>) -> Self {
        self.region = region;
        self
    }

    pub fn with_profile(mut self, profile: Option<String>) -> Self {
        self.profile = profile;
        self
    }

    fn global_args(&self) -> Vec<String> {
        let mut args = vec!["--output".to_string(), "json".to_string()];
        if let Some(region) = &self.region {
            args.extend(["--region".to_string(), region.clone()]);
        }
        if let Some(profile) = &self.profile {
            args.extend(["--profile".to_string(), profile.clone()]);
        }
        args
    }
}

impl Default for AwsCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AwsRunner for AwsCli {
    async fn run(&self, args: &[String]) -> RollResult<String> {
        let operation = args.iter().take(2).cloned().collect::<Vec<_>>().join(" ");
        debug!(%operation, "running aws");

        let mut command = Command::new(&self.program);
        command.kill_on_drop(true);
        command.args(args);
        command.args(self.global_args());
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let output = command
            .output()
            .await
            .map_err(|e| RollError::api(format!("failed to run {}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(&operation, output.status.code(), &stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Map a failed invocation to `Auth` or `Api` from its stderr.
pub fn classify_failure(operation: &str, code: Option<i32>, stderr: &str) -> RollError {
    let detail = stderr.trim();
    let message = match code {
        Some(code) => format!("aws {operation} exited with {code}: {detail}"),
        None => format!("aws {operation} was killed: {detail}"),
    };
    if AUTH_MARKERS.iter().any(|m| detail.contains(m)) {
        RollError::auth(message)
    } else {
        RollError::api(message)
    }
}

/// Parse aws CLI JSON output.
pub fn parse<T: serde::de::DeserializeOwned>(operation: &str, stdout: &str) -> RollResult<T> {
    serde_json::from_str(stdout)
        .map_err(|e| RollError::api(format!("unexpected output from aws {operation}: {e}")))
}

#[cfg(test)]
mod tests {
    use noderoll_core::ErrorKind;

    use super::*;

    #[test]
    fn credential_problems_are_auth_errors() {
        let denied = classify_failure(
            "autoscaling terminate-instance-in-auto-scaling-group",
            Some(254),
            "An error occurred (AccessDenied) when calling the TerminateInstanceInAutoScalingGroup operation: User is not authorized",
        );
        assert_eq!(denied.kind(), ErrorKind::Auth);

        let expired = classify_failure(
            "ec2 describe-instances",
            Some(254),
            "An error occurred (ExpiredToken) when calling the DescribeInstances operation",
        );
        assert_eq!(expired.kind(), ErrorKind::Auth);
    }

    #[test]
    fn other_failures_are_api_errors() {
        let err = classify_failure(
            "autoscaling describe-auto-scaling-groups",
            Some(254),
            "An error occurred (Throttling) when calling the DescribeAutoScalingGroups operation: Rate exceeded\n",
        );
        assert_eq!(err.kind(), ErrorKind::Api);
        assert!(err.to_string().contains("Rate exceeded"));
        assert!(err.to_string().contains("exited with 254"));
    }

    #[test]
    fn global_args_carry_region_and_profile() {
        let cli = AwsCli::new()
            .with_region(Some("eu-west-1".into()))
            .with_profile(Some("ops".into()));
        assert_eq!(
            cli.global_args(),
            ["--output", "json", "--region", "eu-west-1", "--profile", "ops"]
        );
        assert_eq!(AwsCli::default().global_args(), ["--output", "json"]);
    }

    #[tokio::test]
    async fn missing_binary_is_an_api_error() {
        let cli = AwsCli::new().with_program("/nonexistent/aws-noderoll-test");
        let err = cli.run(&["sts".into(), "get-caller-identity".into()]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Api);
    }

    #[test]
    fn garbage_output_is_an_api_error() {
        let err = parse::<serde_json::Value>("ec2 describe-instances", "not json").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Api);
    }
}
