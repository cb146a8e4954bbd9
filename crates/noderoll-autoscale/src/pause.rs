//! Autoscaler pause: scale the cluster autoscaler to zero and back.

use std::sync::Arc;

use tracing::{debug, info, warn};

use noderoll_core::{AutoscalerTarget, ClusterApi, RollError, RollResult};

/// Suspends the external autoscaler deployment for the duration of a run.
pub struct AutoscalerPauseController {
    cluster: Arc<dyn ClusterApi>,
    /// `None` when `K8S_AUTOSCALER_ENABLED` is false.
    target: Option<AutoscalerTarget>,
}

impl AutoscalerPauseController {
    pub fn new(cluster: Arc<dyn ClusterApi>, target: Option<AutoscalerTarget>) -> Self {
        Self { cluster, target }
    }

    /// Record the autoscaler's replica count and scale it to zero.
    ///
    /// The returned guard must be restored once the rotation ends, however it
    /// ends. A disabled feature or a missing deployment yields an inactive
    /// guard whose restore does nothing.
    pub async fn suspend(&self) -> RollResult<AutoscalerPause> {
        let Some(target) = &self.target else {
            debug!("autoscaler pause disabled");
            return Ok(AutoscalerPause::inactive());
        };
        let (namespace, name) = (target.namespace.as_str(), target.deployment.as_str());

        let replicas = match self.cluster.deployment_replicas(namespace, name).await {
            Ok(Some(replicas)) => replicas,
            Ok(None) => {
                warn!(%namespace, deployment = %name, "autoscaler deployment not found, nothing to pause");
                return Ok(AutoscalerPause::inactive());
            }
            Err(e @ RollError::Auth(_)) => return Err(e),
            Err(e) => match target.fallback_replicas {
                Some(fallback) => {
                    warn!(%namespace, deployment = %name, error = %e, fallback, "could not read autoscaler replicas, using fallback");
                    fallback
                }
                None => {
                    return Err(RollError::AutoscalerToggle(format!(
                        "reading replicas of {namespace}/{name}: {e}"
                    )));
                }
            },
        };

        if replicas == 0 {
            warn!(%namespace, deployment = %name, "autoscaler already scaled to zero");
        } else {
            scale(self.cluster.as_ref(), namespace, name, 0).await?;
        }
        info!(%namespace, deployment = %name, recorded = replicas, "autoscaler suspended");

        Ok(AutoscalerPause {
            active: Some(Paused {
                cluster: Arc::clone(&self.cluster),
                namespace: namespace.to_string(),
                deployment: name.to_string(),
                replicas,
            }),
        })
    }
}

struct Paused {
    cluster: Arc<dyn ClusterApi>,
    namespace: String,
    deployment: String,
    replicas: i32,
}

/// A suspended autoscaler, holding the replica count to restore.
#[must_use = "an autoscaler pause must be restored"]
pub struct AutoscalerPause {
    active: Option<Paused>,
}

impl AutoscalerPause {
    fn inactive() -> Self {
        Self { active: None }
    }

    /// Whether restoring will scale anything.
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Replica count observed at suspension.
    pub fn recorded_replicas(&self) -> Option<i32> {
        self.active.as_ref().map(|p| p.replicas)
    }

    /// Scale the autoscaler back to the recorded count.
    pub async fn restore(mut self) -> RollResult<()> {
        let Some(paused) = self.active.take() else {
            return Ok(());
        };
        scale(
            paused.cluster.as_ref(),
            &paused.namespace,
            &paused.deployment,
            paused.replicas,
        )
        .await?;
        info!(namespace = %paused.namespace, deployment = %paused.deployment, replicas = paused.replicas, "autoscaler restored");
        Ok(())
    }
}

impl Drop for AutoscalerPause {
    fn drop(&mut self) {
        if let Some(paused) = &self.active {
            warn!(
                namespace = %paused.namespace,
                deployment = %paused.deployment,
                replicas = paused.replicas,
                "autoscaler pause dropped without restore; scale it back manually"
            );
        }
    }
}

async fn scale(cluster: &dyn ClusterApi, namespace: &str, name: &str, replicas: i32) -> RollResult<()> {
    cluster
        .scale_deployment(namespace, name, replicas)
        .await
        .map_err(|e| match e {
            RollError::Auth(_) => e,
            other => RollError::AutoscalerToggle(format!(
                "scaling {namespace}/{name} to {replicas}: {other}"
            )),
        })
}
