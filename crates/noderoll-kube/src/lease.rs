//! Run lock using a Kubernetes Lease.
//!
//! One `coordination.k8s.io/v1` Lease per cluster, named
//! `noderoll-<cluster>`. Creating it claims the cluster; a live lease held by
//! someone else refuses the run.
//!
//! # Atomicity
//!
//! Creation is atomic (409 when it already exists). Taking over an expired
//! lease replaces it with the observed resourceVersion, and release deletes
//! with a resourceVersion precondition, so neither can clobber a claim that
//! changed in between.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::Client;
use kube::api::{Api, DeleteParams, PostParams, Preconditions};
use tracing::{debug, info, warn};

use noderoll_core::{RollError, RollResult, RunClaim, RunLock};

use crate::convert::{map_kube_error, status_code};

const LEASE_PREFIX: &str = "noderoll-";
const MAX_NAME_LEN: usize = 253;

/// Lease name for a cluster identifier, as a valid object name.
pub fn lease_name(cluster: &str) -> String {
    let sanitized: String = cluster
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '-' })
        .collect();
    let mut name = format!("{LEASE_PREFIX}{}", sanitized.trim_matches(|c| c == '-' || c == '.'));
    name.truncate(MAX_NAME_LEN);
    name.trim_end_matches(['-', '.']).to_string()
}

/// Whether a lease can be taken over at `now`. A lease with no holder or no
/// timing information counts as expired.
pub fn lease_expired(spec: Option<&LeaseSpec>, now: DateTime<Utc>) -> bool {
    let Some(spec) = spec else { return true };
    if spec.holder_identity.as_deref().is_none_or(str::is_empty) {
        return true;
    }
    let last = spec.renew_time.as_ref().or(spec.acquire_time.as_ref());
    match (last, spec.lease_duration_seconds) {
        (Some(t), Some(secs)) => now > t.0 + chrono::Duration::seconds(i64::from(secs)),
        _ => true,
    }
}

/// `RunLock` backed by a Lease in one namespace.
pub struct LeaseLock {
    client: Client,
    namespace: String,
    duration: Duration,
}

impl LeaseLock {
    /// `duration` should match the run deadline, so that a crashed run's
    /// claim expires when that run would have been cut off anyway.
    pub fn new(client: Client, namespace: impl Into<String>, duration: Duration) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            duration,
        }
    }

    fn api(&self) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn lease(&self, name: &str, holder: &str, resource_version: Option<String>, transitions: i32) -> Lease {
        let now = MicroTime(Utc::now());
        Lease {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace.clone()),
                resource_version,
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(holder.to_string()),
                lease_duration_seconds: Some(i32::try_from(self.duration.as_secs()).unwrap_or(i32::MAX)),
                acquire_time: Some(now.clone()),
                renew_time: Some(now),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }

    fn claim(cluster: &str, holder: &str, lease: &Lease) -> RunClaim {
        RunClaim {
            cluster: cluster.to_string(),
            holder: holder.to_string(),
            token: lease.metadata.resource_version.clone(),
        }
    }
}

#[async_trait]
impl RunLock for LeaseLock {
    async fn acquire(&self, cluster: &str, holder: &str) -> RollResult<RunClaim> {
        let api = self.api();
        let name = lease_name(cluster);

        match api.create(&PostParams::default(), &self.lease(&name, holder, None, 0)).await {
            Ok(created) => {
                info!(lease = %name, namespace = %self.namespace, %holder, "run lease created");
                return Ok(Self::claim(cluster, holder, &created));
            }
            Err(e) if status_code(&e) == Some(409) => {
                debug!(lease = %name, "run lease exists, checking holder");
            }
            Err(e) => return Err(map_kube_error("creating run lease", e)),
        }

        let existing = api
            .get(&name)
            .await
            .map_err(|e| map_kube_error("reading run lease", e))?;
        let spec = existing.spec.as_ref();
        let current_holder = spec
            .and_then(|s| s.holder_identity.clone())
            .unwrap_or_default();

        if !lease_expired(spec, Utc::now()) {
            return Err(RollError::ConcurrentRun {
                cluster: cluster.to_string(),
                holder: current_holder,
            });
        }

        let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0) + 1;
        let takeover = self.lease(
            &name,
            holder,
            existing.metadata.resource_version.clone(),
            transitions,
        );
        match api.replace(&name, &PostParams::default(), &takeover).await {
            Ok(replaced) => {
                warn!(lease = %name, previous = %current_holder, %holder, "took over expired run lease");
                Ok(Self::claim(cluster, holder, &replaced))
            }
            Err(e) if status_code(&e) == Some(409) => Err(RollError::ConcurrentRun {
                cluster: cluster.to_string(),
                holder: "another run took over the expired lease first".to_string(),
            }),
            Err(e) => Err(map_kube_error("taking over run lease", e)),
        }
    }

    async fn release(&self, claim: &RunClaim) -> RollResult<()> {
        let api = self.api();
        let name = lease_name(&claim.cluster);

        let lease = match api.get_opt(&name).await {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                debug!(lease = %name, "run lease already gone");
                return Ok(());
            }
            Err(e) => return Err(map_kube_error("reading run lease", e)),
        };
        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
        if holder != Some(claim.holder.as_str()) {
            warn!(lease = %name, holder = ?holder, "run lease was taken over, not releasing");
            return Ok(());
        }

        let params = DeleteParams {
            preconditions: Some(Preconditions {
                resource_version: lease.metadata.resource_version.clone(),
                uid: None,
            }),
            ..Default::default()
        };
        match api.delete(&name, &params).await {
            Ok(_) => {
                info!(lease = %name, "run lease released");
                Ok(())
            }
            Err(e) if matches!(status_code(&e), Some(404 | 409)) => {
                debug!(lease = %name, "run lease changed before release");
                Ok(())
            }
            Err(e) => Err(map_kube_error("deleting run lease", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(holder: Option<&str>, renewed_secs_ago: Option<i64>, duration: Option<i32>) -> LeaseSpec {
        LeaseSpec {
            holder_identity: holder.map(str::to_string),
            renew_time: renewed_secs_ago
                .map(|ago| MicroTime(Utc::now() - chrono::Duration::seconds(ago))),
            lease_duration_seconds: duration,
            ..Default::default()
        }
    }

    #[test]
    fn lease_names_are_valid_object_names() {
        assert_eq!(lease_name("prod-eu"), "noderoll-prod-eu");
        assert_eq!(lease_name("Prod_EU"), "noderoll-prod-eu");
        assert_eq!(
            lease_name("arn:aws:eks:us-east-1:123:cluster/prod"),
            "noderoll-arn-aws-eks-us-east-1-123-cluster-prod"
        );
        assert!(lease_name(&"x".repeat(400)).len() <= MAX_NAME_LEN);
    }

    #[test]
    fn live_lease_is_not_expired() {
        let s = spec(Some("run-a"), Some(10), Some(7200));
        assert!(!lease_expired(Some(&s), Utc::now()));
    }

    #[test]
    fn lease_past_its_duration_is_expired() {
        let s = spec(Some("run-a"), Some(7300), Some(7200));
        assert!(lease_expired(Some(&s), Utc::now()));
    }

    #[test]
    fn incomplete_lease_is_expired() {
        assert!(lease_expired(None, Utc::now()));
        assert!(lease_expired(Some(&spec(None, Some(1), Some(60))), Utc::now()));
        assert!(lease_expired(Some(&spec(Some(""), Some(1), Some(60))), Utc::now()));
        assert!(lease_expired(Some(&spec(Some("run-a"), None, Some(60))), Utc::now()));
        assert!(lease_expired(Some(&spec(Some("run-a"), Some(1), None)), Utc::now()));
    }
}
