//! noderoll-autoscale: keeps scalers out of the way during a rotation.
//!
//! Two pauses are taken before the first node is touched and released
//! during `Restoring`:
//!
//! ```text
//! AutoscalerPauseController::suspend()
//!     read live replicas of the autoscaler deployment
//!     (fallback: K8S_AUTOSCALER_REPLICAS)
//!     scale to 0 → AutoscalerPause { replicas }
//! AutoscalerPause::restore(self)
//!     scale back to the recorded replicas, at most once
//!
//! ScalingProcessPause::suspend(groups)
//!     suspend AZRebalance, AlarmNotification, ... on each group
//! SuspendedProcesses::restore(self)
//!     resume the same processes on the same groups
//! ```
//!
//! Both guards consume themselves on restore. Dropping one unrestored logs a
//! warning, since the cluster is left with its scaler off.

pub mod pause;
pub mod processes;

pub use pause::{AutoscalerPause, AutoscalerPauseController};
pub use processes::{ScalingProcessPause, SuspendedProcesses};
