//! Error taxonomy for a rotation run.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for rotation operations.
pub type RollResult<T> = Result<T, RollError>;

/// Errors that can end a rotation run.
#[derive(Debug, Error)]
pub enum RollError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("discovery error: {0}")]
    Discovery(String),

    #[error("authorization denied: {0}")]
    Auth(String),

    #[error("another run holds the lock for cluster {cluster} (holder: {holder})")]
    ConcurrentRun { cluster: String, holder: String },

    #[error("autoscaler toggle failed: {0}")]
    AutoscalerToggle(String),

    #[error("drain of node {node} timed out after {attempts} attempts ({remaining} pods remaining)")]
    DrainTimeout {
        node: String,
        attempts: u32,
        remaining: usize,
    },

    #[error("no ready replacement for node {node} (instance {instance_id}) after {attempts} attempts")]
    ReplacementTimeout {
        node: String,
        instance_id: String,
        attempts: u32,
    },

    #[error("{scope} did not become healthy after {attempts} attempts: {reason}")]
    HealthCheckTimeout {
        scope: String,
        attempts: u32,
        reason: String,
    },

    #[error("run deadline exceeded during {0}")]
    DeadlineExceeded(String),

    #[error("run interrupted by shutdown signal")]
    Interrupted,

    #[error("api error: {0}")]
    Api(String),
}

impl RollError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn discovery(msg: impl Into<String>) -> Self {
        Self::Discovery(msg.into())
    }

    pub fn api(msg: impl Into<String>) -> Self {
        Self::Api(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    /// The category this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Discovery(_) => ErrorKind::Discovery,
            Self::Auth(_) => ErrorKind::Auth,
            Self::ConcurrentRun { .. } => ErrorKind::ConcurrentRun,
            Self::AutoscalerToggle(_) => ErrorKind::AutoscalerToggle,
            Self::DrainTimeout { .. } => ErrorKind::DrainTimeout,
            Self::ReplacementTimeout { .. } => ErrorKind::ReplacementTimeout,
            Self::HealthCheckTimeout { .. } => ErrorKind::HealthCheckTimeout,
            Self::DeadlineExceeded(_) => ErrorKind::DeadlineExceeded,
            Self::Interrupted => ErrorKind::Interrupted,
            Self::Api(_) => ErrorKind::Api,
        }
    }
}

/// Error category, stable across runs, used for reporting and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Discovery,
    Auth,
    ConcurrentRun,
    AutoscalerToggle,
    DrainTimeout,
    ReplacementTimeout,
    HealthCheckTimeout,
    DeadlineExceeded,
    Interrupted,
    Api,
}

impl ErrorKind {
    /// Process exit code: 2 for configuration errors, 1 for everything else.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Config => 2,
            _ => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Discovery => "discovery",
            Self::Auth => "auth",
            Self::ConcurrentRun => "concurrent_run",
            Self::AutoscalerToggle => "autoscaler_toggle",
            Self::DrainTimeout => "drain_timeout",
            Self::ReplacementTimeout => "replacement_timeout",
            Self::HealthCheckTimeout => "health_check_timeout",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Interrupted => "interrupted",
            Self::Api => "api",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_exit_with_two() {
        let err = RollError::config("GLOBAL_MAX_RETRY must be an integer");
        assert_eq!(err.kind(), ErrorKind::Config);
        assert_eq!(err.kind().exit_code(), 2);
    }

    #[test]
    fn operational_errors_exit_with_one() {
        let err = RollError::DrainTimeout {
            node: "ip-10-0-0-1".into(),
            attempts: 3,
            remaining: 2,
        };
        assert_eq!(err.kind().exit_code(), 1);
        assert!(err.to_string().contains("ip-10-0-0-1"));
    }

    #[test]
    fn concurrent_run_names_the_holder() {
        let err = RollError::ConcurrentRun {
            cluster: "prod".into(),
            holder: "job-1".into(),
        };
        assert_eq!(err.kind(), ErrorKind::ConcurrentRun);
        assert_eq!(err.kind().exit_code(), 1);
        assert!(err.to_string().contains("job-1"));
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::HealthCheckTimeout).unwrap();
        assert_eq!(json, "\"health_check_timeout\"");
        assert_eq!(ErrorKind::HealthCheckTimeout.to_string(), "health_check_timeout");
    }
}
