//! Outdated-node criteria.

use noderoll_core::LaunchVersion;

/// Decides whether an instance must be rotated.
pub trait OutdatedPredicate: Send + Sync {
    /// `instance` is the version the instance was launched from, `current`
    /// the version its group launches today.
    fn is_outdated(&self, instance: &LaunchVersion, current: &LaunchVersion) -> bool;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Outdated when the instance's launch version differs from the group's.
#[derive(Debug, Clone, Copy, Default)]
pub struct LaunchVersionMismatch;

impl OutdatedPredicate for LaunchVersionMismatch {
    fn is_outdated(&self, instance: &LaunchVersion, current: &LaunchVersion) -> bool {
        instance != current
    }

    fn name(&self) -> &'static str {
        "launch-version-mismatch"
    }
}
