//! Scaling-process pause: stop a group from rebalancing or reacting to
//! alarms while its instances are being replaced.

use std::sync::Arc;

use tracing::{info, warn};

use noderoll_core::{RollError, RollResult, ScalingGroupApi};

/// Replacement depends on the group launching new instances.
const NEVER_SUSPENDED: &str = "Launch";

pub struct ScalingProcessPause {
    groups: Arc<dyn ScalingGroupApi>,
    processes: Vec<String>,
}

impl ScalingProcessPause {
    pub fn new(groups: Arc<dyn ScalingGroupApi>, processes: Vec<String>) -> Self {
        let processes = processes
            .into_iter()
            .filter(|p| {
                let keep = p != NEVER_SUSPENDED;
                if !keep {
                    warn!("refusing to suspend the Launch process");
                }
                keep
            })
            .collect();
        Self { groups, processes }
    }

    /// Suspend the configured processes on each of `group_names`.
    ///
    /// If a group fails, the groups already suspended are resumed before the
    /// error is returned.
    pub async fn suspend(&self, group_names: &[String]) -> RollResult<SuspendedProcesses> {
        let mut suspended = SuspendedProcesses {
            groups: Arc::clone(&self.groups),
            processes: self.processes.clone(),
            suspended: Vec::new(),
        };
        if self.processes.is_empty() {
            return Ok(suspended);
        }

        for group in group_names {
            if let Err(e) = self.groups.suspend_processes(group, &self.processes).await {
                if let Err(undo) = suspended.resume_all().await {
                    warn!(error = %undo, "failed to resume processes after partial suspend");
                }
                return Err(e);
            }
            info!(%group, processes = %self.processes.join(","), "scaling processes suspended");
            suspended.suspended.push(group.clone());
        }
        Ok(suspended)
    }
}

/// Groups whose processes are suspended and must be resumed.
#[must_use = "suspended scaling processes must be restored"]
pub struct SuspendedProcesses {
    groups: Arc<dyn ScalingGroupApi>,
    processes: Vec<String>,
    suspended: Vec<String>,
}

impl SuspendedProcesses {
    pub fn groups(&self) -> &[String] {
        &self.suspended
    }

    /// Resume the processes on every suspended group.
    ///
    /// Every group is attempted; the first failure is returned.
    pub async fn restore(mut self) -> RollResult<()> {
        self.resume_all().await
    }

    async fn resume_all(&mut self) -> RollResult<()> {
        let mut first_error: Option<RollError> = None;
        for group in std::mem::take(&mut self.suspended) {
            match self.groups.resume_processes(&group, &self.processes).await {
                Ok(()) => info!(%group, "scaling processes resumed"),
                Err(e) => {
                    warn!(%group, error = %e, "failed to resume scaling processes");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for SuspendedProcesses {
    fn drop(&mut self) {
        if !self.suspended.is_empty() {
            warn!(
                groups = %self.suspended.join(","),
                processes = %self.processes.join(","),
                "scaling processes left suspended"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use noderoll_core::fake::{FakeCloud, lt};

    use super::*;

    fn processes(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn suspend_and_resume_each_group() {
        let fake = FakeCloud::new();
        fake.add_group("prod", "a", lt("1"));
        fake.add_group("prod", "b", lt("1"));
        let pause = ScalingProcessPause::new(
            Arc::new(fake.clone()),
            processes(&["AZRebalance", "ScheduledActions"]),
        );

        let suspended = pause.suspend(&["a".into(), "b".into()]).await.unwrap();
        assert_eq!(suspended.groups(), ["a", "b"]);
        suspended.restore().await.unwrap();

        assert_eq!(
            fake.events(),
            vec![
                "suspend-processes:a:AZRebalance,ScheduledActions",
                "suspend-processes:b:AZRebalance,ScheduledActions",
                "resume-processes:a:AZRebalance,ScheduledActions",
                "resume-processes:b:AZRebalance,ScheduledActions",
            ]
        );
    }

    #[tokio::test]
    async fn launch_is_never_suspended() {
        let fake = FakeCloud::new();
        let pause = ScalingProcessPause::new(
            Arc::new(fake.clone()),
            processes(&["Launch", "AZRebalance"]),
        );

        let suspended = pause.suspend(&["a".into()]).await.unwrap();
        suspended.restore().await.unwrap();
        assert_eq!(fake.events_with("suspend-processes:"), vec!["suspend-processes:a:AZRebalance"]);
    }

    #[tokio::test]
    async fn empty_process_list_touches_nothing() {
        let fake = FakeCloud::new();
        let pause = ScalingProcessPause::new(Arc::new(fake.clone()), Vec::new());

        let suspended = pause.suspend(&["a".into()]).await.unwrap();
        assert!(suspended.groups().is_empty());
        suspended.restore().await.unwrap();
        assert!(fake.events().is_empty());
    }
}
