//! Shared types: node and scaling-group views, node records, retry budgets.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// A bounded polling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryBudget {
    /// Wait between attempts.
    pub interval: Duration,
    /// Attempts before giving up. Always at least 1.
    pub max_attempts: u32,
}

impl RetryBudget {
    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    pub fn from_secs(interval_secs: u64, max_attempts: u32) -> Self {
        Self::new(Duration::from_secs(interval_secs), max_attempts)
    }
}

/// The template a scaling group launches instances from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LaunchVersion {
    /// A named launch configuration.
    LaunchConfiguration { name: String },
    /// A launch template at a resolved numeric version.
    LaunchTemplate { id: String, version: String },
}

impl fmt::Display for LaunchVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LaunchConfiguration { name } => write!(f, "lc:{name}"),
            Self::LaunchTemplate { id, version } => write!(f, "lt:{id}:{version}"),
        }
    }
}

/// Kubernetes view of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    /// `spec.providerID`, e.g. `aws:///us-east-1a/i-0abc123`.
    pub provider_id: Option<String>,
    pub labels: BTreeMap<String, String>,
    /// `Ready` condition is `True`.
    pub ready: bool,
    /// `spec.unschedulable`.
    pub unschedulable: bool,
    pub created_at: Option<DateTime<Utc>>,
}

const CONTROL_PLANE_LABELS: &[&str] = &[
    "node-role.kubernetes.io/control-plane",
    "node-role.kubernetes.io/master",
];

impl NodeInfo {
    /// Instance id parsed from the provider id.
    pub fn instance_id(&self) -> Option<&str> {
        self.provider_id.as_deref().and_then(parse_instance_id)
    }

    pub fn is_control_plane(&self) -> bool {
        CONTROL_PLANE_LABELS
            .iter()
            .any(|key| self.labels.contains_key(*key))
    }

    /// Whether any of `keys` is present as a label key.
    pub fn has_any_label(&self, keys: &[String]) -> bool {
        keys.iter().any(|key| self.labels.contains_key(key))
    }
}

static INSTANCE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^i-[0-9a-f]{8,17}$").expect("instance id pattern"));

/// Extract an EC2 instance id from a node provider id.
///
/// ```
/// use noderoll_core::parse_instance_id;
/// assert_eq!(parse_instance_id("aws:///us-east-1a/i-0abc1234def567890"), Some("i-0abc1234def567890"));
/// assert_eq!(parse_instance_id("fargate:///ns/pod"), None);
/// ```
pub fn parse_instance_id(provider_id: &str) -> Option<&str> {
    if !provider_id.starts_with("aws://") {
        return None;
    }
    let last = provider_id.rsplit('/').next()?;
    INSTANCE_ID.is_match(last).then_some(last)
}

/// A pod scheduled on a node being drained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodInfo {
    pub namespace: String,
    pub name: String,
    /// Kinds of the pod's owner references.
    pub owner_kinds: Vec<String>,
    /// Static pod mirrored by the kubelet.
    pub mirror: bool,
    /// `status.phase`.
    pub phase: Option<String>,
    /// `metadata.deletionTimestamp` is set.
    pub terminating: bool,
}

impl PodInfo {
    /// Whether draining the node has to get rid of this pod.
    ///
    /// DaemonSet pods are recreated on the node regardless, mirror pods
    /// cannot be evicted, and finished pods hold no workload.
    pub fn is_evictable(&self) -> bool {
        if self.mirror || self.owner_kinds.iter().any(|k| k == "DaemonSet") {
            return false;
        }
        !matches!(self.phase.as_deref(), Some("Succeeded") | Some("Failed"))
    }

    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Result of a single eviction request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvictionOutcome {
    /// The eviction was accepted.
    Evicted,
    /// The pod no longer exists.
    Gone,
    /// Rejected by a disruption budget (HTTP 429); try again later.
    Blocked(String),
}

/// Desired vs ready replicas of a workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub desired: i32,
    pub ready: i32,
}

impl WorkloadStatus {
    pub fn is_satisfied(&self) -> bool {
        self.ready == self.desired
    }
}

/// Cloud view of a scaling group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingGroup {
    pub name: String,
    /// Version new instances are launched from. `None` when the group uses a
    /// mixed-instances policy without a single template.
    pub current_version: Option<LaunchVersion>,
    pub desired_capacity: u32,
    pub instances: Vec<GroupInstance>,
}

impl ScalingGroup {
    pub fn instance(&self, instance_id: &str) -> Option<&GroupInstance> {
        self.instances.iter().find(|i| i.instance_id == instance_id)
    }

    /// Instances that are in service and reported healthy.
    pub fn healthy_instances(&self) -> impl Iterator<Item = &GroupInstance> {
        self.instances.iter().filter(|i| i.is_in_service())
    }
}

/// An instance as reported by its scaling group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInstance {
    pub instance_id: String,
    pub version: Option<LaunchVersion>,
    pub lifecycle_state: String,
    pub health_status: String,
    pub launched_at: Option<DateTime<Utc>>,
}

impl GroupInstance {
    pub fn is_in_service(&self) -> bool {
        self.lifecycle_state == "InService" && self.health_status == "Healthy"
    }
}

/// A worker node paired with its backing instance, captured at discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_name: String,
    pub instance_id: String,
    pub group: String,
    pub version: LaunchVersion,
    pub outdated: bool,
    pub launched_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_id_from_provider_id() {
        assert_eq!(
            parse_instance_id("aws:///eu-west-1b/i-0123456789abcdef0"),
            Some("i-0123456789abcdef0")
        );
        assert_eq!(parse_instance_id("aws:///eu-west-1b/"), None);
        assert_eq!(parse_instance_id("aws:///eu-west-1b/fargate-ip-10-0-0-1"), None);
        assert_eq!(parse_instance_id("gce://project/zone/i-0123456789"), None);
    }

    #[test]
    fn daemonset_mirror_and_finished_pods_are_not_evictable() {
        let base = PodInfo {
            namespace: "default".into(),
            name: "web-1".into(),
            owner_kinds: vec!["ReplicaSet".into()],
            mirror: false,
            phase: Some("Running".into()),
            terminating: false,
        };
        assert!(base.is_evictable());

        let ds = PodInfo {
            owner_kinds: vec!["DaemonSet".into()],
            ..base.clone()
        };
        assert!(!ds.is_evictable());

        let mirror = PodInfo {
            mirror: true,
            ..base.clone()
        };
        assert!(!mirror.is_evictable());

        let done = PodInfo {
            phase: Some("Succeeded".into()),
            ..base
        };
        assert!(!done.is_evictable());
    }

    #[test]
    fn control_plane_detection() {
        let mut node = NodeInfo {
            name: "cp-1".into(),
            provider_id: None,
            labels: BTreeMap::new(),
            ready: true,
            unschedulable: false,
            created_at: None,
        };
        assert!(!node.is_control_plane());
        node.labels
            .insert("node-role.kubernetes.io/control-plane".into(), String::new());
        assert!(node.is_control_plane());
    }

    #[test]
    fn launch_version_display() {
        let lt = LaunchVersion::LaunchTemplate {
            id: "lt-0abc".into(),
            version: "7".into(),
        };
        assert_eq!(lt.to_string(), "lt:lt-0abc:7");
    }
}
