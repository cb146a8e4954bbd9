//! Scaling-group boundary for noderoll, backed by the `aws` command-line
//! client.
//!
//! # Components
//!
//! - [`AwsCli`]: runs `aws ... --output json` as a child process and maps
//!   credential failures to `Auth` errors.
//! - [`AutoScalingGroups`]: implements `ScalingGroupApi`. Groups are found
//!   by their cluster tags, launch template versions like `$Latest` are
//!   resolved to numbers, and instance launch times come from EC2.
//!
//! The runner sits behind the [`AwsRunner`] trait so the group logic can be
//! driven from canned responses.

pub mod groups;
pub mod model;
pub mod runner;

pub use groups::AutoScalingGroups;
pub use runner::{AwsCli, AwsRunner};
