//! `ClusterApi` over a kube-rs client.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::Client;
use kube::api::{Api, DeleteParams, EvictParams, ListParams, Patch, PatchParams, PostParams};
use serde_json::json;
use tracing::debug;

use noderoll_core::{
    ClusterApi, DrainOptions, EvictionOutcome, NodeInfo, PodInfo, RollResult, WorkloadStatus,
};

use crate::convert::{
    deployment_status, map_kube_error, node_info, pod_info, statefulset_status, status_code,
    with_rotation_taint,
};

pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    async fn patch_node(&self, name: &str, patch: serde_json::Value, context: &str) -> RollResult<()> {
        self.nodes()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_kube_error(context, e))?;
        Ok(())
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn list_nodes(&self) -> RollResult<Vec<NodeInfo>> {
        let list = self
            .nodes()
            .list(&ListParams::default())
            .await
            .map_err(|e| map_kube_error("listing nodes", e))?;
        Ok(list.items.iter().map(node_info).collect())
    }

    async fn get_node(&self, name: &str) -> RollResult<Option<NodeInfo>> {
        let node = self
            .nodes()
            .get_opt(name)
            .await
            .map_err(|e| map_kube_error(&format!("reading node {name}"), e))?;
        Ok(node.as_ref().map(node_info))
    }

    async fn cordon_node(&self, name: &str) -> RollResult<()> {
        self.patch_node(
            name,
            json!({"spec": {"unschedulable": true}}),
            &format!("cordoning node {name}"),
        )
        .await
    }

    async fn taint_node(&self, name: &str) -> RollResult<()> {
        let node = self
            .nodes()
            .get(name)
            .await
            .map_err(|e| map_kube_error(&format!("reading node {name}"), e))?;
        let Some(taints) = with_rotation_taint(&node) else {
            debug!(node = %name, "rotation taint already present");
            return Ok(());
        };
        self.patch_node(
            name,
            json!({"spec": {"taints": taints}}),
            &format!("tainting node {name}"),
        )
        .await
    }

    async fn delete_node(&self, name: &str) -> RollResult<()> {
        match self.nodes().delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if status_code(&e) == Some(404) => {
                debug!(node = %name, "node already deleted");
                Ok(())
            }
            Err(e) => Err(map_kube_error(&format!("deleting node {name}"), e)),
        }
    }

    async fn list_pods_on_node(&self, node: &str) -> RollResult<Vec<PodInfo>> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={node}"));
        let list = pods
            .list(&params)
            .await
            .map_err(|e| map_kube_error(&format!("listing pods on {node}"), e))?;
        Ok(list.items.iter().map(pod_info).collect())
    }

    async fn evict_pod(
        &self,
        namespace: &str,
        name: &str,
        options: &DrainOptions,
    ) -> RollResult<EvictionOutcome> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = EvictParams {
            delete_options: Some(DeleteParams {
                grace_period_seconds: options.grace_period_secs,
                ..Default::default()
            }),
            post_options: PostParams::default(),
        };

        match pods.evict(name, &params).await {
            Ok(_) => Ok(EvictionOutcome::Evicted),
            Err(kube::Error::Api(resp)) if resp.code == 429 => {
                Ok(EvictionOutcome::Blocked(resp.message))
            }
            Err(e) if status_code(&e) == Some(404) => Ok(EvictionOutcome::Gone),
            Err(e) => Err(map_kube_error(&format!("evicting {namespace}/{name}"), e)),
        }
    }

    async fn list_workloads(&self) -> RollResult<Vec<WorkloadStatus>> {
        let deployments: Api<Deployment> = Api::all(self.client.clone());
        let statefulsets: Api<StatefulSet> = Api::all(self.client.clone());

        let mut workloads: Vec<WorkloadStatus> = deployments
            .list(&ListParams::default())
            .await
            .map_err(|e| map_kube_error("listing deployments", e))?
            .items
            .iter()
            .map(deployment_status)
            .collect();
        workloads.extend(
            statefulsets
                .list(&ListParams::default())
                .await
                .map_err(|e| map_kube_error("listing statefulsets", e))?
                .items
                .iter()
                .map(statefulset_status),
        );
        Ok(workloads)
    }

    async fn deployment_replicas(&self, namespace: &str, name: &str) -> RollResult<Option<i32>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let deployment = api
            .get_opt(name)
            .await
            .map_err(|e| map_kube_error(&format!("reading deployment {namespace}/{name}"), e))?;
        Ok(deployment.map(|d| d.spec.and_then(|s| s.replicas).unwrap_or(1)))
    }

    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> RollResult<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({"spec": {"replicas": replicas}});
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_kube_error(&format!("scaling deployment {namespace}/{name}"), e))?;
        Ok(())
    }
}
