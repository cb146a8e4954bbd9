//! noderoll-kube: Kubernetes side of a rotation run.
//!
//! # Components
//!
//! - **`cluster`**: `KubeCluster`, the `ClusterApi` over kube-rs: node
//!   cordon/taint/delete, pod listing and eviction, workload replicas,
//!   autoscaler scaling
//! - **`lease`**: `LeaseLock`, the `RunLock` over a `coordination.k8s.io/v1`
//!   Lease
//! - **`convert`**: object → view conversions and API error mapping

pub mod cluster;
pub mod convert;
pub mod lease;

pub use cluster::KubeCluster;
pub use lease::{LeaseLock, lease_name};
