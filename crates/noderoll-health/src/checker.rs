//! Health evaluation for one point in time.
//!
//! Pure functions over node, workload and scaling-group views; the monitor
//! fetches the views and calls these on every poll.

use std::collections::HashSet;
use std::fmt;

use noderoll_core::{NodeInfo, ScalingGroup, WorkloadStatus};

/// What a health check covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthScope {
    /// One node, typically a freshly registered replacement.
    Node(String),
    /// Every worker node, every workload, every scaling group.
    Cluster,
}

impl fmt::Display for HealthScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node(name) => write!(f, "node {name}"),
            Self::Cluster => f.write_str("cluster"),
        }
    }
}

/// Result of a single health evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthSnapshot {
    /// Nodes in scope that are missing or not Ready.
    pub unready_nodes: Vec<String>,
    /// Workloads whose ready replicas differ from desired.
    pub unsatisfied_workloads: Vec<String>,
    /// Scaling groups short of capacity, or instances without a node.
    pub capacity_gaps: Vec<String>,
}

impl HealthSnapshot {
    pub fn is_healthy(&self) -> bool {
        self.unready_nodes.is_empty()
            && self.unsatisfied_workloads.is_empty()
            && self.capacity_gaps.is_empty()
    }

    /// One-line description of what is still failing.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if !self.unready_nodes.is_empty() {
            parts.push(format!("nodes not ready: {}", self.unready_nodes.join(", ")));
        }
        if !self.unsatisfied_workloads.is_empty() {
            parts.push(format!(
                "workloads below desired replicas: {}",
                self.unsatisfied_workloads.join(", ")
            ));
        }
        if !self.capacity_gaps.is_empty() {
            parts.push(format!("capacity: {}", self.capacity_gaps.join(", ")));
        }
        if parts.is_empty() {
            "healthy".to_string()
        } else {
            parts.join("; ")
        }
    }
}

/// Nodes in `scope` that are not Ready. A node-scoped check also fails when
/// the node is not registered at all.
pub fn unready_nodes(scope: &HealthScope, nodes: &[NodeInfo], excluded: &[String]) -> Vec<String> {
    match scope {
        HealthScope::Node(name) => match nodes.iter().find(|n| &n.name == name) {
            Some(node) if node.ready => Vec::new(),
            Some(node) => vec![node.name.clone()],
            None => vec![format!("{name} (not registered)")],
        },
        HealthScope::Cluster => nodes
            .iter()
            .filter(|n| !n.is_control_plane() && !n.has_any_label(excluded))
            .filter(|n| !n.ready)
            .map(|n| n.name.clone())
            .collect(),
    }
}

/// Workloads whose ready replica count differs from the desired count.
pub fn unsatisfied_workloads(workloads: &[WorkloadStatus]) -> Vec<String> {
    workloads
        .iter()
        .filter(|w| !w.is_satisfied())
        .map(|w| {
            format!(
                "{}/{}/{} ({}/{})",
                w.kind, w.namespace, w.name, w.ready, w.desired
            )
        })
        .collect()
}

/// Groups with fewer healthy in-service instances than desired, and healthy
/// instances that have no node registered yet.
pub fn capacity_gaps(groups: &[ScalingGroup], nodes: &[NodeInfo]) -> Vec<String> {
    let registered: HashSet<&str> = nodes.iter().filter_map(|n| n.instance_id()).collect();

    let mut gaps = Vec::new();
    for group in groups {
        let healthy: Vec<_> = group.healthy_instances().collect();
        if (healthy.len() as u32) < group.desired_capacity {
            gaps.push(format!(
                "{} has {}/{} instances in service",
                group.name,
                healthy.len(),
                group.desired_capacity
            ));
        }
        for instance in healthy {
            if !registered.contains(instance.instance_id.as_str()) {
                gaps.push(format!(
                    "{} instance {} has no registered node",
                    group.name, instance.instance_id
                ));
            }
        }
    }
    gaps
}
