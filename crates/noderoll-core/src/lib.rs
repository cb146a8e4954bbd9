//! noderoll-core: shared vocabulary for node rotation runs.
//!
//! Holds the run configuration, the error taxonomy, the node and
//! scaling-group views, and the traits that separate the rotation engine
//! from the Kubernetes and cloud clients.
//!
//! # Components
//!
//! - **`config`**: `RunConfig` parsed from the flat key/value parameters
//! - **`error`**: `RollError` and its `ErrorKind`
//! - **`types`**: `NodeRecord`, `RetryBudget`, node/pod/group views
//! - **`deadline`**: cooperative run deadline
//! - **`api`**: `ClusterApi`, `ScalingGroupApi`, `RunLock`

pub mod api;
pub mod config;
pub mod deadline;
pub mod error;
pub mod types;

#[cfg(feature = "fake")]
pub mod fake;

pub use api::{ClusterApi, RunClaim, RunLock, ScalingGroupApi};
pub use config::{AutoscalerTarget, DrainOptions, RunConfig};
pub use deadline::Deadline;
pub use error::{ErrorKind, RollError, RollResult};
pub use types::*;
