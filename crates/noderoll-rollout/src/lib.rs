//! noderoll-rollout: node-by-node cluster rotation.
//!
//! Finds worker nodes whose instances were launched from an older launch
//! version than their scaling group now uses, and replaces them one at a
//! time without letting workload availability drop.
//!
//! # Components
//!
//! - **`strategy`**: `OutdatedPredicate` (default `LaunchVersionMismatch`)
//! - **`inspector`**: node → instance → group mapping, `RotationPlan`
//! - **`drainer`**: cordon/taint and eviction with a retry budget
//! - **`replacer`**: terminate in group, wait for a Ready replacement
//! - **`controller`**: run state machine, cleanup, `RunResult`

pub mod controller;
pub mod drainer;
pub mod inspector;
pub mod replacer;
pub mod strategy;

pub use controller::{
    RollingUpdateOrchestrator, RotatedNode, RunFailure, RunPhase, RunResult, default_holder,
};
pub use drainer::{DrainReport, NodeDrainer};
pub use inspector::{ClusterStateInspector, RotationPlan};
pub use replacer::InstanceReplacer;
pub use strategy::{LaunchVersionMismatch, OutdatedPredicate};
