//! noderoll-health: health gates between rotation steps.
//!
//! A replacement node must be Ready before the next node is touched, and the
//! whole cluster must settle before a run is declared done.
//!
//! # Architecture
//!
//! ```text
//! ClusterHealthMonitor
//!   ├── ClusterApi → nodes, Deployment/StatefulSet replicas
//!   ├── ScalingGroupApi → in-service instances per group (cluster scope)
//!   └── checker → HealthSnapshot (unready nodes, workloads, capacity gaps)
//! ```
//!
//! Polling checks first and sleeps between attempts, bounded by a
//! `RetryBudget` and the run `Deadline`.

pub mod checker;
pub mod monitor;

pub use checker::{HealthScope, HealthSnapshot};
pub use monitor::ClusterHealthMonitor;
