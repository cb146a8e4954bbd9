//! Rolling update orchestrator: drives one rotation run end to end.
//!
//! ```text
//! Idle → Discovering → Suspending
//!      → {Cordoning → Draining → Replacing → NodeHealth} × N
//!      → ClusterHealth → Restoring → Done
//! ```
//!
//! Any failure moves the run to `Failed`. Once `Suspending` has succeeded,
//! `Restoring` runs exactly once on every path, including deadline expiry
//! and shutdown.

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use noderoll_autoscale::{
    AutoscalerPause, AutoscalerPauseController, ScalingProcessPause, SuspendedProcesses,
};
use noderoll_core::{
    ClusterApi, Deadline, ErrorKind, NodeRecord, RollError, RollResult, RunClaim, RunConfig,
    RunLock, ScalingGroupApi,
};
use noderoll_health::{ClusterHealthMonitor, HealthScope};

use crate::drainer::NodeDrainer;
use crate::inspector::{ClusterStateInspector, RotationPlan};
use crate::replacer::InstanceReplacer;
use crate::strategy::OutdatedPredicate;

/// Phase of a rotation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Discovering,
    Suspending,
    Cordoning,
    Draining,
    Replacing,
    NodeHealth,
    ClusterHealth,
    Restoring,
    Done,
    Failed,
}

impl RunPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Discovering => "discovering",
            Self::Suspending => "suspending",
            Self::Cordoning => "cordoning",
            Self::Draining => "draining",
            Self::Replacing => "replacing",
            Self::NodeHealth => "node_health",
            Self::ClusterHealth => "cluster_health",
            Self::Restoring => "restoring",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// Phases that act on a single node.
    pub fn is_per_node(self) -> bool {
        matches!(
            self,
            Self::Cordoning | Self::Draining | Self::Replacing | Self::NodeHealth
        )
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node that was replaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RotatedNode {
    pub node: String,
    pub instance_id: String,
    pub group: String,
    pub replacement: String,
}

/// Where and why a run failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunFailure {
    /// Node in progress when the error occurred.
    pub node: Option<String>,
    pub phase: RunPhase,
    pub kind: ErrorKind,
    pub message: String,
}

/// Terminal outcome of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub cluster: String,
    pub rotated: Vec<RotatedNode>,
    pub skipped: Vec<String>,
    pub failure: Option<RunFailure>,
    /// Set when restoring the autoscaler or scaling processes failed.
    pub restore_error: Option<String>,
    /// Every outdated node was rotated; a failure after this point is the
    /// final cluster health gate or cleanup.
    pub rotation_committed: bool,
    pub phases: Vec<RunPhase>,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    pub fn exit_code(&self) -> i32 {
        self.failure.as_ref().map_or(0, |f| f.kind.exit_code())
    }

    pub fn final_phase(&self) -> RunPhase {
        self.phases.last().copied().unwrap_or(RunPhase::Idle)
    }

    /// Emit the result as one structured event.
    pub fn log(&self) {
        let rotated: Vec<&str> = self.rotated.iter().map(|r| r.node.as_str()).collect();
        match &self.failure {
            None => info!(
                cluster = %self.cluster,
                rotated = ?rotated,
                skipped = ?self.skipped,
                phase = %self.final_phase(),
                "rotation run finished"
            ),
            Some(failure) => error!(
                cluster = %self.cluster,
                rotated = ?rotated,
                skipped = ?self.skipped,
                failed_node = failure.node.as_deref().unwrap_or("-"),
                error_kind = %failure.kind,
                phase = %failure.phase,
                rotation_committed = self.rotation_committed,
                restore_error = self.restore_error.as_deref().unwrap_or("-"),
                error = %failure.message,
                "rotation run failed"
            ),
        }
    }
}

/// Phase history and per-node progress of the run in flight.
#[derive(Debug, Default)]
struct Progress {
    phases: Vec<RunPhase>,
    node: Option<String>,
    rotated: Vec<RotatedNode>,
}

impl Progress {
    fn enter(&mut self, phase: RunPhase) {
        match &self.node {
            Some(node) if phase.is_per_node() => info!(%phase, %node, "entering phase"),
            _ => info!(%phase, "entering phase"),
        }
        self.phases.push(phase);
    }

    fn phase(&self) -> RunPhase {
        self.phases.last().copied().unwrap_or(RunPhase::Idle)
    }

    fn failure(&self, err: &RollError) -> RunFailure {
        let phase = self.phase();
        let node = self.node.clone().filter(|_| phase.is_per_node());
        error!(%phase, node = node.as_deref().unwrap_or("-"), error_kind = %err.kind(), error = %err, "run failed");
        RunFailure {
            node,
            phase,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Everything `Suspending` paused, released together at `Restoring`.
struct Pauses {
    autoscaler: AutoscalerPause,
    processes: SuspendedProcesses,
}

/// Drives a full rotation of one cluster.
pub struct RollingUpdateOrchestrator {
    cluster_name: String,
    holder: String,
    config: RunConfig,
    lock: Arc<dyn RunLock>,
    inspector: ClusterStateInspector,
    autoscaler: AutoscalerPauseController,
    processes: ScalingProcessPause,
    drainer: NodeDrainer,
    replacer: InstanceReplacer,
    health: ClusterHealthMonitor,
    shutdown: Option<watch::Receiver<bool>>,
}

impl RollingUpdateOrchestrator {
    pub fn new(
        cluster_name: impl Into<String>,
        config: RunConfig,
        cluster: Arc<dyn ClusterApi>,
        groups: Arc<dyn ScalingGroupApi>,
        lock: Arc<dyn RunLock>,
    ) -> Self {
        let cluster_name = cluster_name.into();
        let excluded = config.exclude_node_label_keys.clone();

        Self {
            inspector: ClusterStateInspector::new(Arc::clone(&cluster), Arc::clone(&groups))
                .with_excluded_labels(excluded.clone())
                .with_group_order(config.worker_group_order.clone()),
            autoscaler: AutoscalerPauseController::new(
                Arc::clone(&cluster),
                config.autoscaler.clone(),
            ),
            processes: ScalingProcessPause::new(
                Arc::clone(&groups),
                config.suspend_processes.clone(),
            ),
            drainer: NodeDrainer::new(
                Arc::clone(&cluster),
                config.drain.clone(),
                config.drain_budget,
            )
            .with_taint(config.taint_nodes),
            replacer: InstanceReplacer::new(
                Arc::clone(&cluster),
                Arc::clone(&groups),
                config.node_health,
            )
            .with_node_deletion(config.delete_drained_nodes),
            health: ClusterHealthMonitor::new(cluster)
                .with_capacity_check(groups, cluster_name.clone())
                .with_excluded_labels(excluded),
            holder: default_holder(),
            cluster_name,
            config,
            lock,
            shutdown: None,
        }
    }

    /// Identity recorded in the run lock.
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    pub fn with_predicate(mut self, predicate: Box<dyn OutdatedPredicate>) -> Self {
        self.inspector = self.inspector.with_predicate(predicate);
        self
    }

    /// Stop the rotation (and still restore) once `true` is sent.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Discovery only: what a run would rotate right now.
    pub async fn plan(&self) -> RollResult<RotationPlan> {
        self.inspector.inspect(&self.cluster_name).await
    }

    /// Execute one rotation run. Never returns early without restoring what
    /// it suspended.
    pub async fn run(&self) -> RunResult {
        let deadline = Deadline::after(self.config.run_deadline);
        let mut progress = Progress::default();
        progress.enter(RunPhase::Idle);

        progress.enter(RunPhase::Discovering);
        let claim = match self.lock.acquire(&self.cluster_name, &self.holder).await {
            Ok(claim) => claim,
            Err(e) => {
                let failure = progress.failure(&e);
                return self.conclude(progress, Vec::new(), Some(failure), None);
            }
        };
        info!(cluster = %self.cluster_name, holder = %self.holder, "run lock acquired");

        let plan = match self.inspector.inspect(&self.cluster_name).await {
            Ok(plan) => plan,
            Err(e) => {
                let failure = progress.failure(&e);
                self.release(&claim).await;
                return self.conclude(progress, Vec::new(), Some(failure), None);
            }
        };
        let skipped = plan.skipped();

        progress.enter(RunPhase::Suspending);
        let pauses = match self.suspend(&plan).await {
            Ok(pauses) => pauses,
            Err(e) => {
                let failure = progress.failure(&e);
                self.release(&claim).await;
                return self.conclude(progress, skipped, Some(failure), None);
            }
        };

        let outcome = {
            let rotation = tokio::time::timeout_at(
                deadline.instant(),
                self.rotate(&plan, &mut progress, &deadline),
            );
            tokio::select! {
                res = rotation => res.unwrap_or_else(|_| Err(RollError::DeadlineExceeded("rotation".to_string()))),
                _ = shutdown_requested(self.shutdown.clone()) => Err(RollError::Interrupted),
            }
        };
        let failure = outcome.err().map(|e| progress.failure(&e));

        progress.node = None;
        progress.enter(RunPhase::Restoring);
        let restore_error = self.restore(pauses).await;
        self.release(&claim).await;

        let failure = failure.or_else(|| {
            restore_error.as_ref().map(|e| RunFailure {
                node: None,
                phase: RunPhase::Restoring,
                kind: e.kind(),
                message: e.to_string(),
            })
        });
        self.conclude(progress, skipped, failure, restore_error)
    }

    async fn suspend(&self, plan: &RotationPlan) -> RollResult<Pauses> {
        let autoscaler = self.autoscaler.suspend().await?;
        match self.processes.suspend(&plan.outdated_groups()).await {
            Ok(processes) => Ok(Pauses {
                autoscaler,
                processes,
            }),
            Err(e) => {
                if let Err(undo) = autoscaler.restore().await {
                    error!(error = %undo, "failed to restore autoscaler after suspend failure");
                }
                Err(e)
            }
        }
    }

    async fn rotate(
        &self,
        plan: &RotationPlan,
        progress: &mut Progress,
        deadline: &Deadline,
    ) -> RollResult<()> {
        let outdated: Vec<&NodeRecord> = plan.outdated().collect();
        info!(cluster = %self.cluster_name, outdated = outdated.len(), "starting rotation");

        for (index, record) in outdated.iter().enumerate() {
            progress.node = Some(record.node_name.clone());

            progress.enter(RunPhase::Cordoning);
            self.drainer.cordon(record).await?;

            progress.enter(RunPhase::Draining);
            self.drainer.drain(record, deadline).await?;

            progress.enter(RunPhase::Replacing);
            let replacement = self.replacer.replace(record, deadline).await?;

            progress.enter(RunPhase::NodeHealth);
            self.health
                .await_healthy(
                    &HealthScope::Node(replacement.clone()),
                    self.config.node_health,
                    deadline,
                )
                .await?;

            info!(node = %record.node_name, instance = %record.instance_id, group = %record.group, %replacement, "node rotated");
            progress.rotated.push(RotatedNode {
                node: record.node_name.clone(),
                instance_id: record.instance_id.clone(),
                group: record.group.clone(),
                replacement,
            });
            progress.node = None;

            if index + 1 < outdated.len() {
                debug!(wait = ?self.config.between_nodes_wait, "waiting before next node");
                deadline
                    .sleep(self.config.between_nodes_wait, "between nodes")
                    .await?;
            }
        }

        progress.enter(RunPhase::ClusterHealth);
        self.health
            .await_healthy(&HealthScope::Cluster, self.config.cluster_health, deadline)
            .await?;
        Ok(())
    }

    /// Resume scaling processes, then the autoscaler. Both are attempted.
    async fn restore(&self, pauses: Pauses) -> Option<RollError> {
        let mut first: Option<RollError> = None;
        if let Err(e) = pauses.processes.restore().await {
            error!(error = %e, "failed to resume scaling processes");
            first.get_or_insert(e);
        }
        if let Err(e) = pauses.autoscaler.restore().await {
            error!(error = %e, "failed to restore autoscaler");
            first.get_or_insert(e);
        }
        first
    }

    async fn release(&self, claim: &RunClaim) {
        match self.lock.release(claim).await {
            Ok(()) => debug!(cluster = %claim.cluster, "run lock released"),
            Err(e) => warn!(cluster = %claim.cluster, error = %e, "failed to release run lock; it expires with the run deadline"),
        }
    }

    fn conclude(
        &self,
        mut progress: Progress,
        skipped: Vec<String>,
        failure: Option<RunFailure>,
        restore_error: Option<RollError>,
    ) -> RunResult {
        let rotation_committed = progress.phases.contains(&RunPhase::ClusterHealth)
            && failure
                .as_ref()
                .is_none_or(|f| matches!(f.phase, RunPhase::ClusterHealth | RunPhase::Restoring));
        progress.enter(if failure.is_some() {
            RunPhase::Failed
        } else {
            RunPhase::Done
        });

        RunResult {
            cluster: self.cluster_name.clone(),
            rotated: progress.rotated,
            skipped,
            failure,
            restore_error: restore_error.map(|e| e.to_string()),
            rotation_committed,
            phases: progress.phases,
        }
    }
}

/// Lease holder for this process: host (pod) name plus pid.
pub fn default_holder() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok());
    holder_for(host.as_deref(), std::process::id(), SystemTime::now())
}

/// Without a host name, the start time keeps holders on different machines
/// apart.
fn holder_for(host: Option<&str>, pid: u32, now: SystemTime) -> String {
    match host.map(str::trim).filter(|h| !h.is_empty()) {
        Some(host) => format!("{host}-{pid}"),
        None => {
            let nanos = now
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or_default();
            format!("noderoll-{pid}-{nanos:x}")
        }
    }
}

/// Resolves once shutdown is signalled; never, without a receiver or once
/// the sender is gone.
async fn shutdown_requested(shutdown: Option<watch::Receiver<bool>>) {
    let Some(mut rx) = shutdown else {
        return std::future::pending().await;
    };
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}
