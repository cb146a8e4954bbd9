//! Node drainer: cordon, then evict pods until none are left.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use noderoll_core::{
    ClusterApi, Deadline, DrainOptions, EvictionOutcome, NodeInfo, NodeRecord, PodInfo,
    RetryBudget, RollError, RollResult,
};

/// Outcome of a successful drain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub attempts: u32,
    pub evicted: usize,
}

pub struct NodeDrainer {
    cluster: Arc<dyn ClusterApi>,
    options: DrainOptions,
    budget: RetryBudget,
    taint: bool,
}

impl NodeDrainer {
    pub fn new(cluster: Arc<dyn ClusterApi>, options: DrainOptions, budget: RetryBudget) -> Self {
        Self {
            cluster,
            options,
            budget,
            taint: false,
        }
    }

    /// Apply the rotation `NoSchedule` taint instead of cordoning.
    pub fn with_taint(mut self, taint: bool) -> Self {
        self.taint = taint;
        self
    }

    /// Stop new pods from landing on the node.
    pub async fn cordon(&self, record: &NodeRecord) -> RollResult<()> {
        let node = self.verify(record).await?;
        if self.taint {
            self.cluster.taint_node(&record.node_name).await?;
            info!(node = %record.node_name, "node tainted");
        } else if node.unschedulable {
            debug!(node = %record.node_name, "node already cordoned");
        } else {
            self.cluster.cordon_node(&record.node_name).await?;
            info!(node = %record.node_name, "node cordoned");
        }
        Ok(())
    }

    /// Evict every evictable pod on the node.
    ///
    /// Each attempt requests eviction of the pending pods, then re-lists the
    /// node. Evictions refused by a disruption budget are retried on the next
    /// attempt. Fails with `DrainTimeout` when the drain budget or the
    /// `--timeout` drain argument runs out.
    pub async fn drain(&self, record: &NodeRecord, deadline: &Deadline) -> RollResult<DrainReport> {
        self.verify(record).await?;
        let node = record.node_name.as_str();
        // A timeout too large to represent behaves like no timeout.
        let limit = self.options.timeout.and_then(|t| Instant::now().checked_add(t));

        let mut pending = self.evictable(node).await?;
        let mut evicted = 0;

        for attempt in 1..=self.budget.max_attempts {
            deadline.check("draining")?;
            if limit.is_some_and(|l| Instant::now() >= l) {
                warn!(%node, attempt, "drain timeout reached");
                return Err(timeout(node, attempt - 1, pending.len()));
            }
            if pending.is_empty() {
                info!(%node, attempt, evicted, "node drained");
                return Ok(DrainReport { attempts: attempt, evicted });
            }

            for pod in pending.iter().filter(|p| !p.terminating) {
                match self
                    .cluster
                    .evict_pod(&pod.namespace, &pod.name, &self.options)
                    .await?
                {
                    EvictionOutcome::Evicted => {
                        debug!(%node, pod = %pod.key(), "pod evicted");
                        evicted += 1;
                    }
                    EvictionOutcome::Gone => debug!(%node, pod = %pod.key(), "pod already gone"),
                    EvictionOutcome::Blocked(reason) => {
                        debug!(%node, pod = %pod.key(), attempt, %reason, "eviction refused, will retry")
                    }
                }
            }

            pending = self.evictable(node).await?;
            if pending.is_empty() {
                info!(%node, attempt, evicted, "node drained");
                return Ok(DrainReport { attempts: attempt, evicted });
            }
            debug!(%node, attempt, remaining = pending.len(), "pods still on node");

            if attempt < self.budget.max_attempts {
                let wait = match limit {
                    Some(l) => self.budget.interval.min(l.saturating_duration_since(Instant::now())),
                    None => self.budget.interval,
                };
                deadline.sleep(wait, "draining").await?;
            }
        }

        warn!(%node, attempts = self.budget.max_attempts, remaining = pending.len(), "drain retries exhausted");
        Err(timeout(node, self.budget.max_attempts, pending.len()))
    }

    /// Re-read the node and make sure it is still backed by the recorded
    /// instance.
    async fn verify(&self, record: &NodeRecord) -> RollResult<NodeInfo> {
        let node = self
            .cluster
            .get_node(&record.node_name)
            .await?
            .ok_or_else(|| RollError::discovery(format!("node {} no longer exists", record.node_name)))?;
        if node.instance_id() != Some(record.instance_id.as_str()) {
            return Err(RollError::discovery(format!(
                "node {} is no longer backed by instance {}",
                record.node_name, record.instance_id
            )));
        }
        Ok(node)
    }

    async fn evictable(&self, node: &str) -> RollResult<Vec<PodInfo>> {
        let pods = self.cluster.list_pods_on_node(node).await?;
        Ok(pods.into_iter().filter(PodInfo::is_evictable).collect())
    }
}

fn timeout(node: &str, attempts: u32, remaining: usize) -> RollError {
    RollError::DrainTimeout {
        node: node.to_string(),
        attempts,
        remaining,
    }
}
