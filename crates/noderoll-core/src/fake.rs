//! In-memory cluster, scaling groups and run lock for tests.
//!
//! `FakeCloud` implements all three boundary traits over one shared world.
//! Terminating an instance immediately launches a replacement at the group's
//! current version and registers its node, Ready unless told otherwise.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};

use crate::api::{ClusterApi, RunClaim, RunLock, ScalingGroupApi};
use crate::config::DrainOptions;
use crate::error::{RollError, RollResult};
use crate::types::{
    EvictionOutcome, GroupInstance, LaunchVersion, NodeInfo, PodInfo, ScalingGroup,
    WorkloadStatus,
};

/// Launch template version helper.
pub fn lt(version: &str) -> LaunchVersion {
    LaunchVersion::LaunchTemplate {
        id: "lt-0fake".to_string(),
        version: version.to_string(),
    }
}

#[derive(Debug, Default)]
pub struct FakeWorld {
    pub nodes: BTreeMap<String, NodeInfo>,
    /// (node name, pod)
    pub pods: Vec<(String, PodInfo)>,
    /// group name → (cluster, group)
    pub groups: BTreeMap<String, (String, ScalingGroup)>,
    pub deployments: BTreeMap<(String, String), i32>,
    pub workloads: Vec<WorkloadStatus>,
    /// pod key → remaining 429 rejections
    pub blocked_evictions: HashMap<String, u32>,
    /// Ordered log of mutating calls, e.g. `cordon:ip-10-0-0-1`.
    pub events: Vec<String>,
    pub list_node_calls: u32,
    pub eviction_attempts: u32,
    pub lease: Option<RunClaim>,
    pub replacements_not_ready: bool,
    pub fail_scale: bool,
    pub fail_processes: bool,
    pub next_id: u64,
}

/// Shared handle to a `FakeWorld`.
#[derive(Debug, Clone, Default)]
pub struct FakeCloud {
    world: Arc<Mutex<FakeWorld>>,
}

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn world(&self) -> MutexGuard<'_, FakeWorld> {
        self.world.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_group(&self, cluster: &str, name: &str, version: LaunchVersion) {
        let group = ScalingGroup {
            name: name.to_string(),
            current_version: Some(version),
            desired_capacity: 0,
            instances: Vec::new(),
        };
        self.world()
            .groups
            .insert(name.to_string(), (cluster.to_string(), group));
    }

    /// Point a group at a new launch version; existing instances keep theirs.
    pub fn set_group_version(&self, group: &str, version: LaunchVersion) {
        if let Some((_, g)) = self.world().groups.get_mut(group) {
            g.current_version = Some(version);
        }
    }

    /// Launch an instance in `group` at `version` and register its Ready node.
    pub fn add_node(&self, group: &str, version: LaunchVersion) -> String {
        let mut world = self.world();
        world.launch(group, Some(version), true)
    }

    pub fn add_pod(&self, node: &str, namespace: &str, name: &str, owner_kind: &str) {
        let pod = PodInfo {
            namespace: namespace.to_string(),
            name: name.to_string(),
            owner_kinds: vec![owner_kind.to_string()],
            mirror: false,
            phase: Some("Running".to_string()),
            terminating: false,
        };
        self.world().pods.push((node.to_string(), pod));
    }

    pub fn set_deployment(&self, namespace: &str, name: &str, replicas: i32) {
        self.world()
            .deployments
            .insert((namespace.to_string(), name.to_string()), replicas);
    }

    pub fn deployment(&self, namespace: &str, name: &str) -> Option<i32> {
        self.world()
            .deployments
            .get(&(namespace.to_string(), name.to_string()))
            .copied()
    }

    pub fn set_workloads(&self, workloads: Vec<WorkloadStatus>) {
        self.world().workloads = workloads;
    }

    /// Reject the next `times` evictions of `namespace/name` with a 429.
    pub fn block_eviction(&self, pod_key: &str, times: u32) {
        self.world()
            .blocked_evictions
            .insert(pod_key.to_string(), times);
    }

    pub fn set_replacements_ready(&self, ready: bool) {
        self.world().replacements_not_ready = !ready;
    }

    pub fn set_node_ready(&self, node: &str, ready: bool) {
        if let Some(n) = self.world().nodes.get_mut(node) {
            n.ready = ready;
        }
    }

    pub fn fail_scale_calls(&self, fail: bool) {
        self.world().fail_scale = fail;
    }

    pub fn fail_process_calls(&self, fail: bool) {
        self.world().fail_processes = fail;
    }

    pub fn remove_node(&self, node: &str) {
        self.world().nodes.remove(node);
    }

    pub fn node_names(&self) -> Vec<String> {
        self.world().nodes.keys().cloned().collect()
    }

    pub fn events(&self) -> Vec<String> {
        self.world().events.clone()
    }

    /// Events starting with `prefix`.
    pub fn events_with(&self, prefix: &str) -> Vec<String> {
        self.world()
            .events
            .iter()
            .filter(|e| e.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn list_node_calls(&self) -> u32 {
        self.world().list_node_calls
    }

    pub fn eviction_attempts(&self) -> u32 {
        self.world().eviction_attempts
    }

    /// Plant a lease as if another run held it.
    pub fn hold_lease(&self, cluster: &str, holder: &str) {
        self.world().lease = Some(RunClaim {
            cluster: cluster.to_string(),
            holder: holder.to_string(),
            token: Some("other".to_string()),
        });
    }

    pub fn lease(&self) -> Option<RunClaim> {
        self.world().lease.clone()
    }
}

impl FakeWorld {
    fn launch(&mut self, group: &str, version: Option<LaunchVersion>, ready: bool) -> String {
        self.next_id += 1;
        let n = self.next_id;
        let instance_id = format!("i-{n:017x}");
        let node_name = format!("ip-10-0-0-{n}");
        let launched_at = base_time() + ChronoDuration::minutes(n as i64);

        if let Some((_, g)) = self.groups.get_mut(group) {
            let version = version.or_else(|| g.current_version.clone());
            g.instances.push(GroupInstance {
                instance_id: instance_id.clone(),
                version,
                lifecycle_state: "InService".to_string(),
                health_status: "Healthy".to_string(),
                launched_at: Some(launched_at),
            });
            g.desired_capacity = g.instances.len() as u32;
        }

        self.nodes.insert(
            node_name.clone(),
            NodeInfo {
                name: node_name.clone(),
                provider_id: Some(format!("aws:///us-east-1a/{instance_id}")),
                labels: BTreeMap::new(),
                ready,
                unschedulable: false,
                created_at: Some(launched_at),
            },
        );
        node_name
    }

    fn node_for_instance(&self, instance_id: &str) -> Option<String> {
        self.nodes
            .values()
            .find(|n| n.instance_id() == Some(instance_id))
            .map(|n| n.name.clone())
    }
}

#[async_trait]
impl ClusterApi for FakeCloud {
    async fn list_nodes(&self) -> RollResult<Vec<NodeInfo>> {
        let mut world = self.world();
        world.list_node_calls += 1;
        Ok(world.nodes.values().cloned().collect())
    }

    async fn get_node(&self, name: &str) -> RollResult<Option<NodeInfo>> {
        Ok(self.world().nodes.get(name).cloned())
    }

    async fn cordon_node(&self, name: &str) -> RollResult<()> {
        let mut world = self.world();
        let node = world
            .nodes
            .get_mut(name)
            .ok_or_else(|| RollError::api(format!("node {name} not found")))?;
        node.unschedulable = true;
        world.events.push(format!("cordon:{name}"));
        Ok(())
    }

    async fn taint_node(&self, name: &str) -> RollResult<()> {
        let mut world = self.world();
        if !world.nodes.contains_key(name) {
            return Err(RollError::api(format!("node {name} not found")));
        }
        world.events.push(format!("taint:{name}"));
        Ok(())
    }

    async fn delete_node(&self, name: &str) -> RollResult<()> {
        let mut world = self.world();
        world.nodes.remove(name);
        world.events.push(format!("delete-node:{name}"));
        Ok(())
    }

    async fn list_pods_on_node(&self, node: &str) -> RollResult<Vec<PodInfo>> {
        Ok(self
            .world()
            .pods
            .iter()
            .filter(|(n, _)| n == node)
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn evict_pod(
        &self,
        namespace: &str,
        name: &str,
        _options: &DrainOptions,
    ) -> RollResult<EvictionOutcome> {
        let mut world = self.world();
        world.eviction_attempts += 1;
        let key = format!("{namespace}/{name}");

        if let Some(remaining) = world.blocked_evictions.get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                world.events.push(format!("evict-blocked:{key}"));
                return Ok(EvictionOutcome::Blocked(
                    "Cannot evict pod as it would violate the pod's disruption budget.".to_string(),
                ));
            }
        }

        let before = world.pods.len();
        world
            .pods
            .retain(|(_, p)| !(p.namespace == namespace && p.name == name));
        if world.pods.len() == before {
            return Ok(EvictionOutcome::Gone);
        }
        world.events.push(format!("evict:{key}"));
        Ok(EvictionOutcome::Evicted)
    }

    async fn list_workloads(&self) -> RollResult<Vec<WorkloadStatus>> {
        Ok(self.world().workloads.clone())
    }

    async fn deployment_replicas(&self, namespace: &str, name: &str) -> RollResult<Option<i32>> {
        Ok(self.deployment(namespace, name))
    }

    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> RollResult<()> {
        let mut world = self.world();
        if world.fail_scale {
            return Err(RollError::api(format!("scaling {namespace}/{name} failed")));
        }
        let key = (namespace.to_string(), name.to_string());
        if !world.deployments.contains_key(&key) {
            return Err(RollError::api(format!("deployment {namespace}/{name} not found")));
        }
        world.deployments.insert(key, replicas);
        world.events.push(format!("scale:{namespace}/{name}:{replicas}"));
        Ok(())
    }
}

#[async_trait]
impl ScalingGroupApi for FakeCloud {
    async fn cluster_groups(&self, cluster: &str) -> RollResult<Vec<ScalingGroup>> {
        Ok(self
            .world()
            .groups
            .values()
            .filter(|(c, _)| c == cluster)
            .map(|(_, g)| g.clone())
            .collect())
    }

    async fn describe_group(&self, name: &str) -> RollResult<Option<ScalingGroup>> {
        Ok(self.world().groups.get(name).map(|(_, g)| g.clone()))
    }

    async fn terminate_instance(&self, instance_id: &str) -> RollResult<()> {
        let mut world = self.world();
        let group = world
            .groups
            .iter_mut()
            .find_map(|(name, (_, g))| {
                let before = g.instances.len();
                g.instances.retain(|i| i.instance_id != instance_id);
                (g.instances.len() != before).then(|| name.clone())
            })
            .ok_or_else(|| RollError::api(format!("instance {instance_id} not in any group")))?;

        if let Some(node) = world.node_for_instance(instance_id) {
            world.nodes.remove(&node);
            world.pods.retain(|(n, _)| *n != node);
        }
        world.events.push(format!("terminate:{instance_id}"));

        let ready = !world.replacements_not_ready;
        world.launch(&group, None, ready);
        Ok(())
    }

    async fn suspend_processes(&self, group: &str, processes: &[String]) -> RollResult<()> {
        let mut world = self.world();
        if world.fail_processes {
            return Err(RollError::api(format!("suspending processes of {group} failed")));
        }
        world
            .events
            .push(format!("suspend-processes:{group}:{}", processes.join(",")));
        Ok(())
    }

    async fn resume_processes(&self, group: &str, processes: &[String]) -> RollResult<()> {
        let mut world = self.world();
        if world.fail_processes {
            return Err(RollError::api(format!("resuming processes of {group} failed")));
        }
        world
            .events
            .push(format!("resume-processes:{group}:{}", processes.join(",")));
        Ok(())
    }
}

#[async_trait]
impl RunLock for FakeCloud {
    async fn acquire(&self, cluster: &str, holder: &str) -> RollResult<RunClaim> {
        let mut world = self.world();
        if let Some(existing) = &world.lease {
            if existing.cluster == cluster && existing.holder != holder {
                return Err(RollError::ConcurrentRun {
                    cluster: cluster.to_string(),
                    holder: existing.holder.clone(),
                });
            }
        }
        let claim = RunClaim {
            cluster: cluster.to_string(),
            holder: holder.to_string(),
            token: Some(format!("{holder}-token")),
        };
        world.lease = Some(claim.clone());
        world.events.push(format!("lock:{cluster}"));
        Ok(claim)
    }

    async fn release(&self, claim: &RunClaim) -> RollResult<()> {
        let mut world = self.world();
        if world.lease.as_ref() == Some(claim) {
            world.lease = None;
            world.events.push(format!("unlock:{}", claim.cluster));
        }
        Ok(())
    }
}
