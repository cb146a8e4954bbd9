use std::sync::Arc;

use anyhow::Context;
use kube::config::KubeConfigOptions;
use tokio::sync::watch;
use tracing::{error, info, warn};

use noderoll_asg::{AutoScalingGroups, AwsCli};
use noderoll_core::{ClusterApi, RunConfig, RunLock, ScalingGroupApi};
use noderoll_kube::{KubeCluster, LeaseLock};
use noderoll_rollout::RollingUpdateOrchestrator;

use crate::RunArgs;

/// Execute `noderoll run`. Returns the process exit code; `Err` is reserved
/// for failures to set up the clients.
pub async fn run(args: RunArgs) -> anyhow::Result<u8> {
    let config = match RunConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, error_kind = %e.kind(), "invalid configuration");
            return Ok(exit_code(e.kind().exit_code()));
        }
    };
    info!(
        cluster = %args.cluster,
        run_deadline_secs = config.run_deadline.as_secs(),
        autoscaler = config.autoscaler.is_some(),
        dry_run = config.dry_run,
        worker_group_order = ?config.worker_group_order,
        "configuration loaded"
    );

    let client = kube_client(args.context).await?;
    let cluster: Arc<dyn ClusterApi> = Arc::new(KubeCluster::new(client.clone()));
    let aws = AwsCli::new()
        .with_region(args.region)
        .with_profile(args.profile);
    let groups: Arc<dyn ScalingGroupApi> = Arc::new(AutoScalingGroups::new(Arc::new(aws)));
    let lock: Arc<dyn RunLock> = Arc::new(LeaseLock::new(
        client,
        config.lock_namespace.clone(),
        config.run_deadline,
    ));

    let plan_only = args.plan || config.dry_run;
    let orchestrator = RollingUpdateOrchestrator::new(&args.cluster, config, cluster, groups, lock);

    if plan_only {
        return match orchestrator.plan().await {
            Ok(plan) => {
                let outdated: Vec<_> = plan.outdated().map(|r| r.node_name.as_str()).collect();
                info!(
                    cluster = %args.cluster,
                    outdated = outdated.len(),
                    skipped = plan.skipped().len(),
                    nodes = ?outdated,
                    "rotation plan"
                );
                println!("{}", serde_json::to_string_pretty(&plan)?);
                Ok(0)
            }
            Err(e) => {
                error!(error = %e, error_kind = %e.kind(), "discovery failed");
                Ok(exit_code(e.kind().exit_code()))
            }
        };
    }

    let result = orchestrator.with_shutdown(shutdown_on_signal()).run().await;
    result.log();
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(exit_code(result.exit_code()))
}

fn exit_code(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}

/// Client for the named kubeconfig context, or the default
/// kubeconfig/in-cluster config without one.
async fn kube_client(context: Option<String>) -> anyhow::Result<kube::Client> {
    let Some(context) = context else {
        return kube::Client::try_default()
            .await
            .context("building Kubernetes client from kubeconfig or in-cluster config");
    };
    let options = KubeConfigOptions {
        context: Some(context.clone()),
        ..Default::default()
    };
    let config = kube::Config::from_kubeconfig(&options)
        .await
        .with_context(|| format!("loading kubeconfig context {context}"))?;
    info!(%context, "using kubeconfig context");
    kube::Client::try_from(config).context("building Kubernetes client")
}

/// Flips to `true` on SIGINT or SIGTERM.
fn shutdown_on_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        warn!("shutdown signal received, stopping rotation and restoring");
        let _ = tx.send(true);
    });
    rx
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM, only Ctrl-C stops the run");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
