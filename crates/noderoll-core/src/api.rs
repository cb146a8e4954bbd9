//! Boundaries to the cluster API, the scaling-group API and the run lock.
//!
//! The rotation engine only talks to the outside world through these traits,
//! so the real clients can be swapped for in-memory ones in tests.

use async_trait::async_trait;

use crate::config::DrainOptions;
use crate::error::RollResult;
use crate::types::{EvictionOutcome, NodeInfo, PodInfo, ScalingGroup, WorkloadStatus};

/// Kubernetes operations needed for a rotation.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// List every node in the cluster.
    async fn list_nodes(&self) -> RollResult<Vec<NodeInfo>>;

    /// Get a single node, `None` if it does not exist.
    async fn get_node(&self, name: &str) -> RollResult<Option<NodeInfo>>;

    /// Mark a node unschedulable.
    async fn cordon_node(&self, name: &str) -> RollResult<()>;

    /// Add the rotation `NoSchedule` taint to a node.
    async fn taint_node(&self, name: &str) -> RollResult<()>;

    /// Delete a node object. Deleting a missing node is not an error.
    async fn delete_node(&self, name: &str) -> RollResult<()>;

    /// List the pods bound to a node.
    async fn list_pods_on_node(&self, node: &str) -> RollResult<Vec<PodInfo>>;

    /// Request eviction of a single pod.
    async fn evict_pod(
        &self,
        namespace: &str,
        name: &str,
        options: &DrainOptions,
    ) -> RollResult<EvictionOutcome>;

    /// Replica status of all Deployments and StatefulSets.
    async fn list_workloads(&self) -> RollResult<Vec<WorkloadStatus>>;

    /// Desired replica count of a deployment, `None` if it does not exist.
    async fn deployment_replicas(&self, namespace: &str, name: &str) -> RollResult<Option<i32>>;

    /// Set the replica count of a deployment.
    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> RollResult<()>;
}

/// Cloud scaling-group operations needed for a rotation.
#[async_trait]
pub trait ScalingGroupApi: Send + Sync {
    /// All scaling groups backing worker nodes of `cluster`.
    async fn cluster_groups(&self, cluster: &str) -> RollResult<Vec<ScalingGroup>>;

    /// A single group by name, `None` if it does not exist.
    async fn describe_group(&self, name: &str) -> RollResult<Option<ScalingGroup>>;

    /// Terminate an instance without lowering the group's desired capacity,
    /// so the group launches a replacement.
    async fn terminate_instance(&self, instance_id: &str) -> RollResult<()>;

    async fn suspend_processes(&self, group: &str, processes: &[String]) -> RollResult<()>;

    async fn resume_processes(&self, group: &str, processes: &[String]) -> RollResult<()>;
}

/// Proof that a run holds the exclusivity claim for a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunClaim {
    pub cluster: String,
    pub holder: String,
    /// Opaque version token the lock uses to release only its own claim.
    pub token: Option<String>,
}

/// Exclusivity claim scoped to a cluster identifier.
#[async_trait]
pub trait RunLock: Send + Sync {
    /// Claim the cluster for `holder`.
    ///
    /// Fails with `ConcurrentRun` if another holder's claim is still live.
    async fn acquire(&self, cluster: &str, holder: &str) -> RollResult<RunClaim>;

    /// Give the claim back. Releasing a claim that was taken over is a no-op.
    async fn release(&self, claim: &RunClaim) -> RollResult<()>;
}
