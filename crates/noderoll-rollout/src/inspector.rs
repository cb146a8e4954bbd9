//! Cluster state inspector: maps nodes to instances and finds the work.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use noderoll_core::{
    ClusterApi, GroupInstance, NodeInfo, NodeRecord, RollError, RollResult, ScalingGroup,
    ScalingGroupApi,
};

use crate::strategy::{LaunchVersionMismatch, OutdatedPredicate};

/// Everything discovered at the start of a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RotationPlan {
    /// Worker nodes, oldest launch first.
    pub records: Vec<NodeRecord>,
    /// Nodes left alone because they carry an excluded label or sit in a
    /// group outside the configured group order.
    pub excluded: Vec<String>,
}

impl RotationPlan {
    pub fn outdated(&self) -> impl Iterator<Item = &NodeRecord> {
        self.records.iter().filter(|r| r.outdated)
    }

    /// Nodes that will not be rotated: up to date or excluded.
    pub fn skipped(&self) -> Vec<String> {
        self.records
            .iter()
            .filter(|r| !r.outdated)
            .map(|r| r.node_name.clone())
            .chain(self.excluded.iter().cloned())
            .collect()
    }

    /// Groups owning at least one outdated node, sorted.
    pub fn outdated_groups(&self) -> Vec<String> {
        self.outdated()
            .map(|r| r.group.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

pub struct ClusterStateInspector {
    cluster: Arc<dyn ClusterApi>,
    groups: Arc<dyn ScalingGroupApi>,
    predicate: Box<dyn OutdatedPredicate>,
    excluded_label_keys: Vec<String>,
    group_order: Vec<String>,
}

impl ClusterStateInspector {
    pub fn new(cluster: Arc<dyn ClusterApi>, groups: Arc<dyn ScalingGroupApi>) -> Self {
        Self {
            cluster,
            groups,
            predicate: Box::new(LaunchVersionMismatch),
            excluded_label_keys: Vec::new(),
            group_order: Vec::new(),
        }
    }

    pub fn with_predicate(mut self, predicate: Box<dyn OutdatedPredicate>) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn with_excluded_labels(mut self, keys: Vec<String>) -> Self {
        self.excluded_label_keys = keys;
        self
    }

    /// Restrict and order the rotation by scaling-group name.
    ///
    /// A group belongs to the first entry that is a substring of its name and
    /// is rotated in entry order. Groups matching no entry are left alone. An
    /// empty order rotates every group.
    pub fn with_group_order(mut self, order: Vec<String>) -> Self {
        self.group_order = order;
        self
    }

    /// Position of `group` in the group order; `None` when it is out of scope.
    fn group_rank(&self, group: &str) -> Option<usize> {
        if self.group_order.is_empty() {
            return Some(0);
        }
        self.group_order.iter().position(|entry| group.contains(entry.as_str()))
    }

    /// Build the ordered node records for `cluster_name`.
    ///
    /// Every worker node must map to exactly one instance in one of the
    /// cluster's scaling groups, with a known launch version; otherwise the
    /// whole run fails with `Discovery`.
    pub async fn inspect(&self, cluster_name: &str) -> RollResult<RotationPlan> {
        let groups = self.groups.cluster_groups(cluster_name).await?;
        let nodes = self.cluster.list_nodes().await?;
        debug!(cluster = %cluster_name, groups = groups.len(), nodes = nodes.len(), "inspecting cluster");

        let mut plan = RotationPlan::default();
        for node in &nodes {
            if node.is_control_plane() {
                debug!(node = %node.name, "ignoring control-plane node");
                continue;
            }
            if node.has_any_label(&self.excluded_label_keys) {
                debug!(node = %node.name, "node excluded by label");
                plan.excluded.push(node.name.clone());
                continue;
            }
            let record = self.record_for(node, &groups)?;
            if self.group_rank(&record.group).is_none() {
                debug!(node = %node.name, group = %record.group, "group outside the worker group order");
                plan.excluded.push(record.node_name);
                continue;
            }
            plan.records.push(record);
        }

        // Group order first, then each group's nodes oldest launch first.
        plan.records.sort_by_cached_key(|r| {
            (
                self.group_rank(&r.group),
                (!self.group_order.is_empty()).then(|| r.group.clone()),
                r.launched_at.is_none(),
                r.launched_at,
                r.node_name.clone(),
            )
        });
        plan.excluded.sort();

        info!(
            cluster = %cluster_name,
            predicate = self.predicate.name(),
            nodes = plan.records.len(),
            outdated = plan.outdated().count(),
            excluded = plan.excluded.len(),
            "discovery complete"
        );
        Ok(plan)
    }

    fn record_for(&self, node: &NodeInfo, groups: &[ScalingGroup]) -> RollResult<NodeRecord> {
        let instance_id = node.instance_id().ok_or_else(|| {
            RollError::discovery(format!(
                "node {} has no instance id in provider id {:?}",
                node.name, node.provider_id
            ))
        })?;

        let owners: Vec<(&ScalingGroup, &GroupInstance)> = groups
            .iter()
            .filter_map(|g| g.instance(instance_id).map(|i| (g, i)))
            .collect();
        let (group, instance) = match owners.as_slice() {
            [one] => *one,
            [] => {
                return Err(RollError::discovery(format!(
                    "node {} (instance {instance_id}) is not in any scaling group of the cluster",
                    node.name
                )));
            }
            many => {
                let names: Vec<&str> = many.iter().map(|(g, _)| g.name.as_str()).collect();
                return Err(RollError::discovery(format!(
                    "node {} (instance {instance_id}) is claimed by several groups: {}",
                    node.name,
                    names.join(", ")
                )));
            }
        };

        let version = instance.version.clone().ok_or_else(|| {
            RollError::discovery(format!(
                "instance {instance_id} of node {} has no launch version",
                node.name
            ))
        })?;
        let current = group.current_version.as_ref().ok_or_else(|| {
            RollError::discovery(format!("scaling group {} has no launch version", group.name))
        })?;

        Ok(NodeRecord {
            node_name: node.name.clone(),
            instance_id: instance_id.to_string(),
            group: group.name.clone(),
            outdated: self.predicate.is_outdated(&version, current),
            version,
            launched_at: instance.launched_at.or(node.created_at),
        })
    }
}
