//! Health monitor: polls the cluster until a scope is healthy.
//!
//! The `ClusterHealthMonitor` gathers nodes, workloads and (for cluster
//! scope) scaling-group capacity, evaluates them with the `checker`
//! functions, and retries on a bounded budget.

use std::sync::Arc;

use tracing::{debug, info, warn};

use noderoll_core::{
    ClusterApi, Deadline, RetryBudget, RollError, RollResult, ScalingGroupApi,
};

use crate::checker::{HealthScope, HealthSnapshot, capacity_gaps, unready_nodes, unsatisfied_workloads};

/// Scaling groups whose capacity is part of cluster health.
struct CapacityCheck {
    groups: Arc<dyn ScalingGroupApi>,
    cluster: String,
}

/// Evaluates node and cluster health on behalf of a rotation run.
pub struct ClusterHealthMonitor {
    cluster: Arc<dyn ClusterApi>,
    capacity: Option<CapacityCheck>,
    excluded_label_keys: Vec<String>,
}

impl ClusterHealthMonitor {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self {
            cluster,
            capacity: None,
            excluded_label_keys: Vec::new(),
        }
    }

    /// Also require every scaling group of `cluster_name` to be at its
    /// desired capacity, with a registered node per in-service instance.
    pub fn with_capacity_check(
        mut self,
        groups: Arc<dyn ScalingGroupApi>,
        cluster_name: impl Into<String>,
    ) -> Self {
        self.capacity = Some(CapacityCheck {
            groups,
            cluster: cluster_name.into(),
        });
        self
    }

    /// Ignore nodes carrying any of these label keys in cluster scope.
    pub fn with_excluded_labels(mut self, keys: Vec<String>) -> Self {
        self.excluded_label_keys = keys;
        self
    }

    /// Evaluate `scope` once.
    pub async fn check(&self, scope: &HealthScope) -> RollResult<HealthSnapshot> {
        let nodes = self.cluster.list_nodes().await?;
        let workloads = self.cluster.list_workloads().await?;

        let mut snapshot = HealthSnapshot {
            unready_nodes: unready_nodes(scope, &nodes, &self.excluded_label_keys),
            unsatisfied_workloads: unsatisfied_workloads(&workloads),
            capacity_gaps: Vec::new(),
        };

        if let (HealthScope::Cluster, Some(capacity)) = (scope, &self.capacity) {
            let groups = capacity.groups.cluster_groups(&capacity.cluster).await?;
            snapshot.capacity_gaps = capacity_gaps(&groups, &nodes);
        }

        Ok(snapshot)
    }

    /// Poll `scope` until it is healthy, at most `budget.max_attempts` times.
    ///
    /// Checks first and sleeps `budget.interval` between attempts. Fails with
    /// `HealthCheckTimeout` carrying the last failing reason, or with
    /// `DeadlineExceeded` if the run deadline passes while waiting.
    pub async fn await_healthy(
        &self,
        scope: &HealthScope,
        budget: RetryBudget,
        deadline: &Deadline,
    ) -> RollResult<HealthSnapshot> {
        let stage = format!("{scope} health check");
        let mut last = HealthSnapshot::default();

        for attempt in 1..=budget.max_attempts {
            deadline.check(&stage)?;

            let snapshot = self.check(scope).await?;
            if snapshot.is_healthy() {
                info!(%scope, attempt, "healthy");
                return Ok(snapshot);
            }

            debug!(%scope, attempt, max = budget.max_attempts, reason = %snapshot.summary(), "not healthy yet");
            last = snapshot;

            if attempt < budget.max_attempts {
                deadline.sleep(budget.interval, &stage).await?;
            }
        }

        warn!(%scope, attempts = budget.max_attempts, reason = %last.summary(), "health check gave up");
        Err(RollError::HealthCheckTimeout {
            scope: scope.to_string(),
            attempts: budget.max_attempts,
            reason: last.summary(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use noderoll_core::WorkloadStatus;
    use noderoll_core::fake::{FakeCloud, lt};
    use tokio::time::Instant;

    use super::*;

    fn monitor(fake: &FakeCloud) -> ClusterHealthMonitor {
        ClusterHealthMonitor::new(Arc::new(fake.clone()))
            .with_capacity_check(Arc::new(fake.clone()), "prod")
    }

    fn deployment(ready: i32, desired: i32) -> WorkloadStatus {
        WorkloadStatus {
            kind: "Deployment".into(),
            namespace: "web".into(),
            name: "api".into(),
            desired,
            ready,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_cluster_passes_on_first_attempt() {
        let fake = FakeCloud::new();
        fake.add_group("prod", "workers", lt("1"));
        fake.add_node("workers", lt("1"));
        fake.set_workloads(vec![deployment(3, 3)]);

        let start = Instant::now();
        let deadline = Deadline::after(Duration::from_secs(600));
        monitor(&fake)
            .await_healthy(&HealthScope::Cluster, RetryBudget::from_secs(10, 5), &deadline)
            .await
            .unwrap();
        assert_eq!(fake.list_node_calls(), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn unsatisfied_workload_times_out_with_reason() {
        let fake = FakeCloud::new();
        fake.add_group("prod", "workers", lt("1"));
        fake.add_node("workers", lt("1"));
        fake.set_workloads(vec![deployment(1, 3)]);

        let start = Instant::now();
        let deadline = Deadline::after(Duration::from_secs(600));
        let err = monitor(&fake)
            .await_healthy(&HealthScope::Cluster, RetryBudget::from_secs(10, 3), &deadline)
            .await
            .unwrap_err();

        match err {
            RollError::HealthCheckTimeout { scope, attempts, reason } => {
                assert_eq!(scope, "cluster");
                assert_eq!(attempts, 3);
                assert!(reason.contains("Deployment/web/api (1/3)"), "{reason}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fake.list_node_calls(), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn node_scope_waits_for_readiness() {
        let fake = FakeCloud::new();
        fake.add_group("prod", "workers", lt("1"));
        let node = fake.add_node("workers", lt("1"));
        fake.set_node_ready(&node, false);

        let probe = {
            let fake = fake.clone();
            let node = node.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(15)).await;
                fake.set_node_ready(&node, true);
            })
        };

        let deadline = Deadline::after(Duration::from_secs(600));
        monitor(&fake)
            .await_healthy(&HealthScope::Node(node), RetryBudget::from_secs(10, 5), &deadline)
            .await
            .unwrap();
        probe.await.unwrap();
        assert_eq!(fake.list_node_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn run_deadline_cuts_health_wait_short() {
        let fake = FakeCloud::new();
        fake.set_workloads(vec![deployment(0, 1)]);

        let deadline = Deadline::after(Duration::from_secs(25));
        let err = monitor(&fake)
            .await_healthy(&HealthScope::Cluster, RetryBudget::from_secs(10, 10), &deadline)
            .await
            .unwrap_err();
        assert!(matches!(err, RollError::DeadlineExceeded(_)), "{err}");
    }

    #[tokio::test]
    async fn missing_group_capacity_fails_cluster_scope_only() {
        let fake = FakeCloud::new();
        fake.add_group("prod", "workers", lt("1"));
        let node = fake.add_node("workers", lt("1"));
        fake.remove_node(&node);

        let snapshot = monitor(&fake).check(&HealthScope::Cluster).await.unwrap();
        assert_eq!(snapshot.capacity_gaps.len(), 1);

        let without_capacity = ClusterHealthMonitor::new(Arc::new(fake.clone()));
        let snapshot = without_capacity.check(&HealthScope::Cluster).await.unwrap();
        assert!(snapshot.is_healthy());
    }
}
