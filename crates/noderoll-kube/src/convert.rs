//! Conversions from Kubernetes objects to noderoll views, and API error
//! mapping.

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Node, Pod, Taint};

use noderoll_core::{NodeInfo, PodInfo, RollError, WorkloadStatus};

/// Taint applied instead of cordoning when `TAINT_NODES` is set.
pub const ROTATION_TAINT_KEY: &str = "noderoll.io/rotating";
pub const ROTATION_TAINT_VALUE: &str = "true";
pub const ROTATION_TAINT_EFFECT: &str = "NoSchedule";

const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

pub fn node_info(node: &Node) -> NodeInfo {
    let spec = node.spec.as_ref();
    let ready = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| conds.iter().any(|c| c.type_ == "Ready" && c.status == "True"));

    NodeInfo {
        name: node.metadata.name.clone().unwrap_or_default(),
        provider_id: spec.and_then(|s| s.provider_id.clone()),
        labels: node.metadata.labels.clone().unwrap_or_default(),
        ready,
        unschedulable: spec.and_then(|s| s.unschedulable).unwrap_or(false),
        created_at: node.metadata.creation_timestamp.as_ref().map(|t| t.0),
    }
}

pub fn pod_info(pod: &Pod) -> PodInfo {
    let meta = &pod.metadata;
    PodInfo {
        namespace: meta.namespace.clone().unwrap_or_default(),
        name: meta.name.clone().unwrap_or_default(),
        owner_kinds: meta
            .owner_references
            .iter()
            .flatten()
            .map(|o| o.kind.clone())
            .collect(),
        mirror: meta
            .annotations
            .as_ref()
            .is_some_and(|a| a.contains_key(MIRROR_POD_ANNOTATION)),
        phase: pod.status.as_ref().and_then(|s| s.phase.clone()),
        terminating: meta.deletion_timestamp.is_some(),
    }
}

pub fn deployment_status(d: &Deployment) -> WorkloadStatus {
    WorkloadStatus {
        kind: "Deployment".to_string(),
        namespace: d.metadata.namespace.clone().unwrap_or_default(),
        name: d.metadata.name.clone().unwrap_or_default(),
        desired: d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1),
        ready: d.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0),
    }
}

pub fn statefulset_status(s: &StatefulSet) -> WorkloadStatus {
    WorkloadStatus {
        kind: "StatefulSet".to_string(),
        namespace: s.metadata.namespace.clone().unwrap_or_default(),
        name: s.metadata.name.clone().unwrap_or_default(),
        desired: s.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1),
        ready: s.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0),
    }
}

/// The node's taints with the rotation taint appended, or `None` if it is
/// already present.
pub fn with_rotation_taint(node: &Node) -> Option<Vec<Taint>> {
    let mut taints = node
        .spec
        .as_ref()
        .and_then(|s| s.taints.clone())
        .unwrap_or_default();
    if taints
        .iter()
        .any(|t| t.key == ROTATION_TAINT_KEY && t.effect == ROTATION_TAINT_EFFECT)
    {
        return None;
    }
    taints.push(Taint {
        key: ROTATION_TAINT_KEY.to_string(),
        value: Some(ROTATION_TAINT_VALUE.to_string()),
        effect: ROTATION_TAINT_EFFECT.to_string(),
        time_added: None,
    });
    Some(taints)
}

/// HTTP status of an API error response, if the error is one.
pub fn status_code(err: &kube::Error) -> Option<u16> {
    match err {
        kube::Error::Api(resp) => Some(resp.code),
        _ => None,
    }
}

/// 401/403 become `Auth`, everything else `Api`.
pub fn map_kube_error(context: &str, err: kube::Error) -> RollError {
    match status_code(&err) {
        Some(401 | 403) => RollError::auth(format!("{context}: {err}")),
        _ => RollError::api(format!("{context}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use noderoll_core::ErrorKind;
    use serde_json::json;

    use super::*;

    fn node(value: serde_json::Value) -> Node {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn node_view_reads_ready_condition_and_provider_id() {
        let n = node(json!({
            "metadata": {
                "name": "ip-10-0-1-7.ec2.internal",
                "labels": {"eks.amazonaws.com/nodegroup": "workers"},
                "creationTimestamp": "2024-03-01T10:00:00Z"
            },
            "spec": {"providerID": "aws:///us-east-1a/i-0abc1234def567890"},
            "status": {"conditions": [
                {"type": "MemoryPressure", "status": "False"},
                {"type": "Ready", "status": "True"}
            ]}
        }));
        let info = node_info(&n);
        assert_eq!(info.name, "ip-10-0-1-7.ec2.internal");
        assert_eq!(info.instance_id(), Some("i-0abc1234def567890"));
        assert!(info.ready);
        assert!(!info.unschedulable);
        assert!(info.created_at.is_some());
    }

    #[test]
    fn node_without_conditions_is_not_ready() {
        let info = node_info(&node(json!({"metadata": {"name": "n"}})));
        assert!(!info.ready);
        assert_eq!(info.provider_id, None);
    }

    #[test]
    fn pod_view_detects_owners_mirror_and_termination() {
        let pod: Pod = serde_json::from_value(json!({
            "metadata": {
                "name": "kube-proxy-abc",
                "namespace": "kube-system",
                "annotations": {"kubernetes.io/config.mirror": "x"},
                "deletionTimestamp": "2024-03-01T10:00:00Z",
                "ownerReferences": [
                    {"apiVersion": "apps/v1", "kind": "DaemonSet", "name": "kube-proxy", "uid": "u1"}
                ]
            },
            "status": {"phase": "Running"}
        }))
        .unwrap();
        let info = pod_info(&pod);
        assert_eq!(info.key(), "kube-system/kube-proxy-abc");
        assert_eq!(info.owner_kinds, vec!["DaemonSet"]);
        assert!(info.mirror);
        assert!(info.terminating);
        assert!(!info.is_evictable());
    }

    #[test]
    fn workload_replicas_default_like_the_api_server() {
        let d: Deployment = serde_json::from_value(json!({
            "metadata": {"name": "api", "namespace": "web"},
            "spec": {"selector": {}, "template": {}},
            "status": {}
        }))
        .unwrap();
        let status = deployment_status(&d);
        assert_eq!((status.desired, status.ready), (1, 0));
        assert!(!status.is_satisfied());

        let s: StatefulSet = serde_json::from_value(json!({
            "metadata": {"name": "pg", "namespace": "db"},
            "spec": {"replicas": 3, "selector": {}, "serviceName": "pg", "template": {}},
            "status": {"replicas": 3, "readyReplicas": 3}
        }))
        .unwrap();
        assert!(statefulset_status(&s).is_satisfied());
    }

    #[test]
    fn rotation_taint_is_added_once() {
        let mut n = node(json!({
            "metadata": {"name": "n"},
            "spec": {"taints": [{"key": "dedicated", "value": "gpu", "effect": "NoSchedule"}]}
        }));
        let taints = with_rotation_taint(&n).unwrap();
        assert_eq!(taints.len(), 2);
        assert_eq!(taints[1].key, ROTATION_TAINT_KEY);

        n.spec.as_mut().unwrap().taints = Some(taints);
        assert!(with_rotation_taint(&n).is_none());
    }

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "denied".to_string(),
            reason: "Forbidden".to_string(),
            code,
        })
    }

    #[test]
    fn forbidden_maps_to_auth() {
        assert_eq!(map_kube_error("evict", api_error(403)).kind(), ErrorKind::Auth);
        assert_eq!(map_kube_error("evict", api_error(401)).kind(), ErrorKind::Auth);
        assert_eq!(map_kube_error("evict", api_error(500)).kind(), ErrorKind::Api);
    }
}
