//! Instance replacer: terminate the drained instance and wait for the
//! group to bring up a Ready replacement node.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use noderoll_core::{
    ClusterApi, Deadline, NodeInfo, NodeRecord, RetryBudget, RollError, RollResult,
    ScalingGroup, ScalingGroupApi,
};

pub struct InstanceReplacer {
    cluster: Arc<dyn ClusterApi>,
    groups: Arc<dyn ScalingGroupApi>,
    budget: RetryBudget,
    delete_node: bool,
}

impl InstanceReplacer {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        groups: Arc<dyn ScalingGroupApi>,
        budget: RetryBudget,
    ) -> Self {
        Self {
            cluster,
            groups,
            budget,
            delete_node: true,
        }
    }

    /// Whether to delete the node object before terminating its instance.
    pub fn with_node_deletion(mut self, delete_node: bool) -> Self {
        self.delete_node = delete_node;
        self
    }

    /// Replace the record's instance and return the name of the new node.
    pub async fn replace(&self, record: &NodeRecord, deadline: &Deadline) -> RollResult<String> {
        let group = self.group(&record.group).await?;
        if group.instance(&record.instance_id).is_none() {
            return Err(RollError::discovery(format!(
                "instance {} is no longer in scaling group {}",
                record.instance_id, record.group
            )));
        }

        let known: HashSet<String> = self
            .cluster
            .list_nodes()
            .await?
            .into_iter()
            .map(|n| n.name)
            .collect();

        if self.delete_node {
            self.cluster.delete_node(&record.node_name).await?;
            debug!(node = %record.node_name, "node object deleted");
        }
        self.groups.terminate_instance(&record.instance_id).await?;
        info!(node = %record.node_name, instance = %record.instance_id, group = %record.group, "instance terminated");

        for attempt in 1..=self.budget.max_attempts {
            deadline.check("replacing")?;

            let nodes = self.cluster.list_nodes().await?;
            let group = self.group(&record.group).await?;
            if let Some(node) = find_replacement(&nodes, &group, &known) {
                info!(old = %record.node_name, new = %node.name, attempt, "replacement node ready");
                return Ok(node.name.clone());
            }
            debug!(node = %record.node_name, attempt, max = self.budget.max_attempts, "waiting for replacement node");

            if attempt < self.budget.max_attempts {
                deadline.sleep(self.budget.interval, "replacing").await?;
            }
        }

        warn!(node = %record.node_name, instance = %record.instance_id, "no ready replacement");
        Err(RollError::ReplacementTimeout {
            node: record.node_name.clone(),
            instance_id: record.instance_id.clone(),
            attempts: self.budget.max_attempts,
        })
    }

    async fn group(&self, name: &str) -> RollResult<ScalingGroup> {
        self.groups
            .describe_group(name)
            .await?
            .ok_or_else(|| RollError::discovery(format!("scaling group {name} no longer exists")))
    }
}

/// A Ready node not seen before termination, backed by an instance of
/// `group`.
fn find_replacement<'a>(
    nodes: &'a [NodeInfo],
    group: &ScalingGroup,
    known: &HashSet<String>,
) -> Option<&'a NodeInfo> {
    nodes.iter().find(|n| {
        n.ready
            && !known.contains(&n.name)
            && n.instance_id().is_some_and(|id| group.instance(id).is_some())
    })
}
