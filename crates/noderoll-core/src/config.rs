//! Run configuration, parsed once from a flat string map.
//!
//! The deployment glue hands the controller its tuning parameters as a flat
//! mapping (environment variables sourced from a config map). An optional
//! TOML file with the same top-level keys can be layered underneath; the
//! environment wins.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{RollError, RollResult};
use crate::types::RetryBudget;

pub const DEFAULT_DRAIN_ARGS: &str = "--timeout=300s";
pub const DEFAULT_SUSPEND_PROCESSES: &str = "AZRebalance,AlarmNotification,ScheduledActions";
pub const DEFAULT_LOCK_NAMESPACE: &str = "kube-system";

/// Longest wait, interval or deadline a run accepts.
pub const MAX_WAIT: Duration = Duration::from_secs(30 * 24 * 3600);

/// Every key the controller understands.
pub const KNOWN_KEYS: &[&str] = &[
    "EXTRA_DRAIN_ARGS",
    "GLOBAL_HEALTH_WAIT",
    "GLOBAL_MAX_RETRY",
    "BETWEEN_NODES_WAIT",
    "CLUSTER_HEALTH_WAIT",
    "CLUSTER_HEALTH_RETRY",
    "K8S_AUTOSCALER_ENABLED",
    "K8S_AUTOSCALER_NAMESPACE",
    "K8S_AUTOSCALER_DEPLOYMENT",
    "K8S_AUTOSCALER_REPLICAS",
    "DRAIN_RETRY_WAIT",
    "DRAIN_MAX_RETRY",
    "RUN_DEADLINE",
    "EXCLUDE_NODE_LABEL_KEYS",
    "TAINT_NODES",
    "DELETE_DRAINED_NODES",
    "ASG_SUSPEND_PROCESSES",
    "RUN_LOCK_NAMESPACE",
    "K8S_WORKER_GROUPS_ORDER",
    "DRY_RUN",
];

/// Immutable snapshot of the tuning parameters for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Eviction parameters parsed from `EXTRA_DRAIN_ARGS`.
    pub drain: DrainOptions,
    /// Retry policy for pod evictions.
    pub drain_budget: RetryBudget,
    /// Polling policy for a replacement node and its health.
    pub node_health: RetryBudget,
    /// Pause after a node finishes before the next one is cordoned.
    pub between_nodes_wait: Duration,
    /// Polling policy for the final cluster-wide health gate.
    pub cluster_health: RetryBudget,
    /// External autoscaler to pause, if enabled.
    pub autoscaler: Option<AutoscalerTarget>,
    /// Wall-clock bound for the whole run.
    pub run_deadline: Duration,
    /// Nodes carrying any of these label keys are never rotated.
    pub exclude_node_label_keys: Vec<String>,
    /// Taint nodes instead of cordoning them.
    pub taint_nodes: bool,
    /// Delete the node object once drained, before terminating its instance.
    pub delete_drained_nodes: bool,
    /// Scaling-group processes suspended while the run is in progress.
    pub suspend_processes: Vec<String>,
    /// Namespace holding the run lease.
    pub lock_namespace: String,
    /// Scaling-group name fragments, in rotation order. Empty means every
    /// group, oldest node first.
    pub worker_group_order: Vec<String>,
    /// Discover and report only.
    pub dry_run: bool,
}

/// Identity of the autoscaler deployment paused during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoscalerTarget {
    pub namespace: String,
    pub deployment: String,
    /// Used when the live replica count cannot be read.
    pub fallback_replicas: Option<i32>,
}

/// Eviction parameters, kubectl-drain style.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainOptions {
    /// Upper bound for one node's drain.
    pub timeout: Option<Duration>,
    /// Grace period handed to each eviction; `None` keeps the pod's own.
    pub grace_period_secs: Option<u32>,
}

impl Default for DrainOptions {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(300)),
            grace_period_secs: None,
        }
    }
}

impl DrainOptions {
    /// Parse `EXTRA_DRAIN_ARGS`.
    ///
    /// Accepts `--timeout=<dur>` and `--grace-period=<secs>`. Flags that the
    /// eviction API implies anyway are accepted silently; anything else is
    /// logged and ignored.
    pub fn parse(args: &str) -> RollResult<Self> {
        let mut opts = DrainOptions {
            timeout: None,
            grace_period_secs: None,
        };

        for arg in args.split_whitespace() {
            let (flag, value) = match arg.split_once('=') {
                Some((f, v)) => (f, Some(v)),
                None => (arg, None),
            };
            match flag {
                "--timeout" => {
                    let value = value.ok_or_else(|| {
                        RollError::config("EXTRA_DRAIN_ARGS: --timeout needs a value")
                    })?;
                    let timeout = parse_duration(value).ok_or_else(|| {
                        RollError::config(format!("EXTRA_DRAIN_ARGS: invalid --timeout {value:?}"))
                    })?;
                    if timeout > MAX_WAIT {
                        return Err(RollError::config(format!(
                            "EXTRA_DRAIN_ARGS: --timeout {value:?} exceeds {}s",
                            MAX_WAIT.as_secs()
                        )));
                    }
                    // kubectl treats 0 as "wait forever".
                    opts.timeout = (!timeout.is_zero()).then_some(timeout);
                }
                "--grace-period" => {
                    let value = value.ok_or_else(|| {
                        RollError::config("EXTRA_DRAIN_ARGS: --grace-period needs a value")
                    })?;
                    let secs: i64 = value.parse().map_err(|_| {
                        RollError::config(format!(
                            "EXTRA_DRAIN_ARGS: invalid --grace-period {value:?}"
                        ))
                    })?;
                    opts.grace_period_secs = u32::try_from(secs).ok();
                }
                "--ignore-daemonsets" | "--delete-emptydir-data" | "--delete-local-data"
                | "--force" => {}
                other => warn!(flag = %other, "ignoring unsupported drain argument"),
            }
        }

        Ok(opts)
    }
}

impl RunConfig {
    /// Build a config from a flat key/value map, applying defaults.
    pub fn from_map(values: &HashMap<String, String>) -> RollResult<Self> {
        let src = Source(values);

        let drain = DrainOptions::parse(src.get("EXTRA_DRAIN_ARGS").unwrap_or(DEFAULT_DRAIN_ARGS))?;

        let autoscaler = if src.bool("K8S_AUTOSCALER_ENABLED", false)? {
            let namespace = src.required("K8S_AUTOSCALER_NAMESPACE")?;
            let deployment = src.required("K8S_AUTOSCALER_DEPLOYMENT")?;
            let fallback_replicas = match src.get("K8S_AUTOSCALER_REPLICAS") {
                Some(raw) => {
                    let n: i32 = raw.parse().map_err(|_| {
                        RollError::config(format!("K8S_AUTOSCALER_REPLICAS: invalid integer {raw:?}"))
                    })?;
                    if n < 0 {
                        return Err(RollError::config("K8S_AUTOSCALER_REPLICAS must not be negative"));
                    }
                    Some(n)
                }
                None => None,
            };
            Some(AutoscalerTarget {
                namespace,
                deployment,
                fallback_replicas,
            })
        } else {
            None
        };

        let run_deadline = src.secs("RUN_DEADLINE", 7200)?;
        if run_deadline.is_zero() {
            return Err(RollError::config("RUN_DEADLINE must be greater than zero"));
        }

        Ok(Self {
            drain,
            drain_budget: src.budget("DRAIN_RETRY_WAIT", 5, "DRAIN_MAX_RETRY", 60)?,
            node_health: src.budget("GLOBAL_HEALTH_WAIT", 30, "GLOBAL_MAX_RETRY", 100)?,
            between_nodes_wait: src.secs("BETWEEN_NODES_WAIT", 10)?,
            cluster_health: src.budget("CLUSTER_HEALTH_WAIT", 120, "CLUSTER_HEALTH_RETRY", 20)?,
            autoscaler,
            run_deadline,
            exclude_node_label_keys: src.list("EXCLUDE_NODE_LABEL_KEYS", ""),
            taint_nodes: src.bool("TAINT_NODES", false)?,
            delete_drained_nodes: src.bool("DELETE_DRAINED_NODES", true)?,
            suspend_processes: src.list("ASG_SUSPEND_PROCESSES", DEFAULT_SUSPEND_PROCESSES),
            lock_namespace: src
                .get("RUN_LOCK_NAMESPACE")
                .unwrap_or(DEFAULT_LOCK_NAMESPACE)
                .to_string(),
            worker_group_order: src.group_order("K8S_WORKER_GROUPS_ORDER")?,
            dry_run: src.bool("DRY_RUN", false)?,
        })
    }

    /// Build a config from the process environment, optionally layered over
    /// a TOML file.
    pub fn load(file: Option<&Path>) -> RollResult<Self> {
        let mut values = match file {
            Some(path) => read_toml_map(path)?,
            None => HashMap::new(),
        };
        for (key, value) in std::env::vars() {
            if KNOWN_KEYS.contains(&key.as_str()) {
                values.insert(key, value);
            }
        }
        Self::from_map(&values)
    }
}

/// Read a flat TOML file into a key/value map.
///
/// Only top-level strings, integers and booleans are accepted; tables are
/// rejected so that the file mirrors the config map it stands in for.
pub fn read_toml_map(path: &Path) -> RollResult<HashMap<String, String>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| RollError::config(format!("reading {}: {e}", path.display())))?;
    let table: toml::Table = toml::from_str(&content)
        .map_err(|e| RollError::config(format!("parsing {}: {e}", path.display())))?;

    let mut values = HashMap::new();
    for (key, value) in table {
        let rendered = match value {
            toml::Value::String(s) => s,
            toml::Value::Integer(i) => i.to_string(),
            toml::Value::Boolean(b) => b.to_string(),
            other => {
                return Err(RollError::config(format!(
                    "{}: key {key} must be a string, integer or boolean, got {}",
                    path.display(),
                    other.type_str()
                )));
            }
        };
        if !KNOWN_KEYS.contains(&key.as_str()) {
            warn!(%key, file = %path.display(), "ignoring unknown configuration key");
            continue;
        }
        values.insert(key, rendered);
    }
    Ok(values)
}

struct Source<'a>(&'a HashMap<String, String>);

impl Source<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> RollResult<String> {
        self.get(key)
            .map(str::to_string)
            .ok_or_else(|| RollError::config(format!("{key} is required when K8S_AUTOSCALER_ENABLED is set")))
    }

    fn u64(&self, key: &str, default: u64) -> RollResult<u64> {
        match self.get(key) {
            Some(raw) => raw
                .parse()
                .map_err(|_| RollError::config(format!("{key}: invalid integer {raw:?}"))),
            None => Ok(default),
        }
    }

    fn secs(&self, key: &str, default: u64) -> RollResult<Duration> {
        let secs = self.u64(key, default)?;
        if secs > MAX_WAIT.as_secs() {
            return Err(RollError::config(format!(
                "{key}: {secs}s exceeds {}s",
                MAX_WAIT.as_secs()
            )));
        }
        Ok(Duration::from_secs(secs))
    }

    fn budget(
        &self,
        wait_key: &str,
        wait_default: u64,
        retry_key: &str,
        retry_default: u32,
    ) -> RollResult<RetryBudget> {
        let interval = self.secs(wait_key, wait_default)?;
        let max_attempts = self.u64(retry_key, retry_default as u64)?;
        let max_attempts = u32::try_from(max_attempts)
            .map_err(|_| RollError::config(format!("{retry_key}: value too large")))?;
        if max_attempts == 0 {
            return Err(RollError::config(format!("{retry_key} must be at least 1")));
        }
        Ok(RetryBudget::new(interval, max_attempts))
    }

    fn bool(&self, key: &str, default: bool) -> RollResult<bool> {
        match self.get(key) {
            Some(raw) => parse_bool(raw)
                .ok_or_else(|| RollError::config(format!("{key}: invalid boolean {raw:?}"))),
            None => Ok(default),
        }
    }

    /// A JSON array of strings or a comma-separated list.
    fn group_order(&self, key: &str) -> RollResult<Vec<String>> {
        let Some(raw) = self.get(key) else {
            return Ok(Vec::new());
        };
        let entries: Vec<String> = if raw.starts_with('[') {
            serde_json::from_str(raw)
                .map_err(|e| RollError::config(format!("{key}: invalid JSON list {raw:?}: {e}")))?
        } else {
            raw.split(',').map(str::to_string).collect()
        };
        Ok(entries
            .into_iter()
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .collect())
    }

    fn list(&self, key: &str, default: &str) -> Vec<String> {
        // An explicitly empty value clears the default list.
        let raw = match self.0.get(key) {
            Some(v) => v.as_str(),
            None => default,
        };
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" | "on" => Some(true),
        "false" | "0" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a duration string like "300s", "500ms", "5m", "1h" or "90".
///
/// Returns `None` for malformed input and for values that overflow.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok()?.checked_mul(60).map(Duration::from_secs)
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.parse::<u64>().ok()?.checked_mul(3600).map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_match_the_documented_table() {
        let cfg = RunConfig::from_map(&HashMap::new()).unwrap();
        assert_eq!(cfg.drain.timeout, Some(Duration::from_secs(300)));
        assert_eq!(cfg.node_health, RetryBudget::new(Duration::from_secs(30), 100));
        assert_eq!(cfg.between_nodes_wait, Duration::from_secs(10));
        assert_eq!(cfg.cluster_health, RetryBudget::new(Duration::from_secs(120), 20));
        assert_eq!(cfg.drain_budget, RetryBudget::new(Duration::from_secs(5), 60));
        assert_eq!(cfg.run_deadline, Duration::from_secs(7200));
        assert!(cfg.autoscaler.is_none());
        assert!(cfg.exclude_node_label_keys.is_empty());
        assert!(!cfg.taint_nodes);
        assert!(cfg.delete_drained_nodes);
        assert_eq!(
            cfg.suspend_processes,
            vec!["AZRebalance", "AlarmNotification", "ScheduledActions"]
        );
        assert_eq!(cfg.lock_namespace, "kube-system");
        assert!(cfg.worker_group_order.is_empty());
        assert!(!cfg.dry_run);
    }

    #[test]
    fn health_budgets_use_distinct_keys() {
        let cfg = RunConfig::from_map(&map(&[
            ("GLOBAL_HEALTH_WAIT", "1"),
            ("GLOBAL_MAX_RETRY", "2"),
            ("CLUSTER_HEALTH_WAIT", "7"),
            ("CLUSTER_HEALTH_RETRY", "9"),
        ]))
        .unwrap();
        assert_eq!(cfg.node_health, RetryBudget::new(Duration::from_secs(1), 2));
        assert_eq!(cfg.cluster_health, RetryBudget::new(Duration::from_secs(7), 9));
    }

    #[test]
    fn autoscaler_requires_namespace_and_deployment() {
        let err = RunConfig::from_map(&map(&[("K8S_AUTOSCALER_ENABLED", "true")])).unwrap_err();
        assert!(matches!(err, RollError::Config(msg) if msg.contains("K8S_AUTOSCALER_NAMESPACE")));

        let cfg = RunConfig::from_map(&map(&[
            ("K8S_AUTOSCALER_ENABLED", "True"),
            ("K8S_AUTOSCALER_NAMESPACE", "kube-system"),
            ("K8S_AUTOSCALER_DEPLOYMENT", "cluster-autoscaler"),
            ("K8S_AUTOSCALER_REPLICAS", "2"),
        ]))
        .unwrap();
        assert_eq!(
            cfg.autoscaler,
            Some(AutoscalerTarget {
                namespace: "kube-system".into(),
                deployment: "cluster-autoscaler".into(),
                fallback_replicas: Some(2),
            })
        );
    }

    #[test]
    fn disabled_autoscaler_ignores_its_keys() {
        let cfg = RunConfig::from_map(&map(&[
            ("K8S_AUTOSCALER_ENABLED", "false"),
            ("K8S_AUTOSCALER_REPLICAS", "not-a-number"),
        ]))
        .unwrap();
        assert!(cfg.autoscaler.is_none());
    }

    #[test]
    fn malformed_values_are_config_errors() {
        for (key, value) in [
            ("GLOBAL_HEALTH_WAIT", "soon"),
            ("GLOBAL_MAX_RETRY", "0"),
            ("CLUSTER_HEALTH_RETRY", "-1"),
            ("TAINT_NODES", "maybe"),
            ("RUN_DEADLINE", "0"),
            ("EXTRA_DRAIN_ARGS", "--timeout=forever"),
        ] {
            let err = RunConfig::from_map(&map(&[(key, value)])).unwrap_err();
            assert!(matches!(err, RollError::Config(_)), "{key}={value} should be rejected");
        }
    }

    #[test]
    fn lists_split_on_commas() {
        let cfg = RunConfig::from_map(&map(&[
            ("EXCLUDE_NODE_LABEL_KEYS", "spotinst.io/node-lifecycle, noderoll.io/skip ,"),
            ("ASG_SUSPEND_PROCESSES", ""),
        ]))
        .unwrap();
        assert_eq!(
            cfg.exclude_node_label_keys,
            vec!["spotinst.io/node-lifecycle", "noderoll.io/skip"]
        );
        assert!(cfg.suspend_processes.is_empty());
    }

    #[test]
    fn worker_group_order_accepts_json_or_commas() {
        let json = RunConfig::from_map(&map(&[(
            "K8S_WORKER_GROUPS_ORDER",
            r#"["system", "workers", " "]"#,
        )]))
        .unwrap();
        assert_eq!(json.worker_group_order, vec!["system", "workers"]);

        let commas =
            RunConfig::from_map(&map(&[("K8S_WORKER_GROUPS_ORDER", "system, workers")])).unwrap();
        assert_eq!(commas.worker_group_order, json.worker_group_order);

        let err = RunConfig::from_map(&map(&[("K8S_WORKER_GROUPS_ORDER", "[\"system\"")])).unwrap_err();
        assert!(matches!(err, RollError::Config(msg) if msg.contains("K8S_WORKER_GROUPS_ORDER")));
    }

    #[test]
    fn drain_args_parse_kubectl_flags() {
        let opts =
            DrainOptions::parse("--ignore-daemonsets --timeout=2m --grace-period=30 --delete-emptydir-data")
                .unwrap();
        assert_eq!(opts.timeout, Some(Duration::from_secs(120)));
        assert_eq!(opts.grace_period_secs, Some(30));
    }

    #[test]
    fn drain_args_zero_timeout_and_negative_grace() {
        let opts = DrainOptions::parse("--timeout=0s --grace-period=-1").unwrap();
        assert_eq!(opts.timeout, None);
        assert_eq!(opts.grace_period_secs, None);
    }

    #[test]
    fn drain_args_ignore_unknown_flags() {
        let opts = DrainOptions::parse("--pod-selector=app=web").unwrap();
        assert_eq!(opts.timeout, None);
    }

    #[test]
    fn toml_file_is_layered_as_flat_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("noderoll.toml");
        std::fs::write(
            &path,
            "GLOBAL_MAX_RETRY = 5\nTAINT_NODES = true\nEXTRA_DRAIN_ARGS = \"--timeout=60s\"\nUNKNOWN = 1\n",
        )
        .unwrap();

        let values = read_toml_map(&path).unwrap();
        assert_eq!(values.get("GLOBAL_MAX_RETRY").map(String::as_str), Some("5"));
        assert!(!values.contains_key("UNKNOWN"));

        let cfg = RunConfig::from_map(&values).unwrap();
        assert_eq!(cfg.node_health.max_attempts, 5);
        assert!(cfg.taint_nodes);
        assert_eq!(cfg.drain.timeout, Some(Duration::from_secs(60)));
    }

    #[test]
    fn toml_tables_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("noderoll.toml");
        std::fs::write(&path, "[health]\nwait = 1\n").unwrap();
        assert!(matches!(read_toml_map(&path), Err(RollError::Config(_))));
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("300s"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("90"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("later"), None);
        assert_eq!(parse_duration("999999999999999999m"), None);
        assert_eq!(parse_duration("18446744073709551615h"), None);
    }

    #[test]
    fn oversized_drain_timeouts_are_config_errors() {
        for args in [
            "--timeout=18446744073709551615s",
            "--timeout=999999999999999999m",
            "--timeout=31d",
            "--timeout=721h",
        ] {
            let err = DrainOptions::parse(args).unwrap_err();
            assert!(matches!(err, RollError::Config(_)), "{args} should be rejected");
        }
        let opts = DrainOptions::parse("--timeout=720h").unwrap();
        assert_eq!(opts.timeout, Some(MAX_WAIT));
    }

    #[test]
    fn oversized_waits_are_config_errors() {
        for key in ["RUN_DEADLINE", "BETWEEN_NODES_WAIT", "GLOBAL_HEALTH_WAIT", "DRAIN_RETRY_WAIT"] {
            let err = RunConfig::from_map(&map(&[(key, "18446744073709551615")])).unwrap_err();
            assert!(matches!(err, RollError::Config(msg) if msg.contains(key)), "{key}");
        }
        let cfg = RunConfig::from_map(&map(&[("RUN_DEADLINE", "2592000")])).unwrap();
        assert_eq!(cfg.run_deadline, MAX_WAIT);
    }
}
