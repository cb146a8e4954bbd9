//! `ScalingGroupApi` over the aws CLI.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use noderoll_core::{RollResult, ScalingGroup, ScalingGroupApi};

use crate::model::{
    AsgDescription, DescribeGroupsOutput, DescribeInstancesOutput, DescribeTemplatesOutput,
    TemplateIndex, to_scaling_group,
};
use crate::runner::{AwsRunner, parse};

/// Filters matching the tags that associate a group with an EKS cluster.
fn cluster_tag_filters(cluster: &str) -> [String; 2] {
    [
        format!("Name=tag-key,Values=kubernetes.io/cluster/{cluster}"),
        format!("Name=tag:eks:cluster-name,Values={cluster}"),
    ]
}

/// describe-instances accepts at most this many ids per call.
const INSTANCE_BATCH: usize = 100;

pub struct AutoScalingGroups {
    runner: Arc<dyn AwsRunner>,
}

impl AutoScalingGroups {
    pub fn new(runner: Arc<dyn AwsRunner>) -> Self {
        Self { runner }
    }

    async fn call(&self, args: &[&str]) -> RollResult<String> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.runner.run(&args).await
    }

    async fn describe(&self, extra: &[&str]) -> RollResult<Vec<AsgDescription>> {
        let mut args = vec!["autoscaling", "describe-auto-scaling-groups"];
        args.extend_from_slice(extra);
        let stdout = self.call(&args).await?;
        let out: DescribeGroupsOutput = parse("autoscaling describe-auto-scaling-groups", &stdout)?;
        Ok(out.auto_scaling_groups)
    }

    /// Describe every launch template the groups launch from.
    async fn templates(&self, groups: &[AsgDescription]) -> RollResult<TemplateIndex> {
        let mut ids = BTreeSet::new();
        let mut names = BTreeSet::new();
        for spec in groups.iter().filter_map(AsgDescription::template) {
            match (&spec.launch_template_id, &spec.launch_template_name) {
                (Some(id), _) => ids.insert(id.as_str()),
                (None, Some(name)) => names.insert(name.as_str()),
                (None, None) => false,
            };
        }

        let mut index = TemplateIndex::default();
        for (flag, keys) in [("--launch-template-ids", ids), ("--launch-template-names", names)] {
            if keys.is_empty() {
                continue;
            }
            let mut args = vec!["ec2", "describe-launch-templates", flag];
            args.extend(keys);
            let stdout = self.call(&args).await?;
            let out: DescribeTemplatesOutput = parse("ec2 describe-launch-templates", &stdout)?;
            for template in out.launch_templates {
                index.insert(template);
            }
        }
        Ok(index)
    }

    async fn launch_times(&self, groups: &[AsgDescription]) -> RollResult<HashMap<String, DateTime<Utc>>> {
        let ids: Vec<&str> = groups
            .iter()
            .flat_map(|g| &g.instances)
            .map(|i| i.instance_id.as_str())
            .collect();

        let mut times = HashMap::new();
        for batch in ids.chunks(INSTANCE_BATCH) {
            let mut args = vec!["ec2", "describe-instances", "--instance-ids"];
            args.extend_from_slice(batch);
            let stdout = self.call(&args).await?;
            let out: DescribeInstancesOutput = parse("ec2 describe-instances", &stdout)?;
            times.extend(
                out.reservations
                    .into_iter()
                    .flat_map(|r| r.instances)
                    .filter_map(|i| Some((i.instance_id, i.launch_time?))),
            );
        }
        Ok(times)
    }

    async fn convert(
        &self,
        groups: &[AsgDescription],
        launch_times: &HashMap<String, DateTime<Utc>>,
    ) -> RollResult<Vec<ScalingGroup>> {
        let templates = self.templates(groups).await?;
        groups
            .iter()
            .map(|g| to_scaling_group(g, &templates, launch_times))
            .collect()
    }
}

#[async_trait]
impl ScalingGroupApi for AutoScalingGroups {
    async fn cluster_groups(&self, cluster: &str) -> RollResult<Vec<ScalingGroup>> {
        let mut by_name = BTreeMap::new();
        for filter in cluster_tag_filters(cluster) {
            for group in self.describe(&["--filters", filter.as_str()]).await? {
                by_name.entry(group.auto_scaling_group_name.clone()).or_insert(group);
            }
        }
        let described: Vec<AsgDescription> = by_name.into_values().collect();
        info!(%cluster, groups = described.len(), "discovered scaling groups");

        let launch_times = self.launch_times(&described).await?;
        self.convert(&described, &launch_times).await
    }

    async fn describe_group(&self, name: &str) -> RollResult<Option<ScalingGroup>> {
        let described = self.describe(&["--auto-scaling-group-names", name]).await?;
        let Some(group) = described.into_iter().find(|g| g.auto_scaling_group_name == name) else {
            return Ok(None);
        };
        let mut converted = self.convert(std::slice::from_ref(&group), &HashMap::new()).await?;
        Ok(converted.pop())
    }

    async fn terminate_instance(&self, instance_id: &str) -> RollResult<()> {
        self.call(&[
            "autoscaling",
            "terminate-instance-in-auto-scaling-group",
            "--instance-id",
            instance_id,
            "--no-should-decrement-desired-capacity",
        ])
        .await?;
        info!(instance = %instance_id, "instance terminated");
        Ok(())
    }

    async fn suspend_processes(&self, group: &str, processes: &[String]) -> RollResult<()> {
        let mut args = vec![
            "autoscaling",
            "suspend-processes",
            "--auto-scaling-group-name",
            group,
            "--scaling-processes",
        ];
        args.extend(processes.iter().map(String::as_str));
        self.call(&args).await?;
        debug!(%group, ?processes, "scaling processes suspended");
        Ok(())
    }

    async fn resume_processes(&self, group: &str, processes: &[String]) -> RollResult<()> {
        let mut args = vec![
            "autoscaling",
            "resume-processes",
            "--auto-scaling-group-name",
            group,
            "--scaling-processes",
        ];
        args.extend(processes.iter().map(String::as_str));
        self.call(&args).await?;
        debug!(%group, ?processes, "scaling processes resumed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use noderoll_core::{ErrorKind, LaunchVersion, RollError};

    use super::*;

    const GROUPS: &str = include_str!("../tests/fixtures/describe_auto_scaling_groups.json");
    const TEMPLATES: &str = include_str!("../tests/fixtures/describe_launch_templates.json");
    const INSTANCES: &str = include_str!("../tests/fixtures/describe_instances.json");

    /// Answers each invocation by its `service operation` pair and records
    /// the arguments.
    #[derive(Default)]
    struct Scripted {
        responses: HashMap<String, RollResult<String>>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl Scripted {
        fn respond(mut self, operation: &str, out: &str) -> Self {
            self.responses.insert(operation.to_string(), Ok(out.to_string()));
            self
        }

        fn fail(mut self, operation: &str, err: RollError) -> Self {
            self.responses.insert(operation.to_string(), Err(err));
            self
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AwsRunner for Scripted {
        async fn run(&self, args: &[String]) -> RollResult<String> {
            self.calls.lock().unwrap().push(args.to_vec());
            let operation = args[..2].join(" ");
            match self.responses.get(&operation) {
                Some(Ok(out)) => Ok(out.clone()),
                Some(Err(e)) => Err(RollError::api(e.to_string())),
                None => Ok("{}".to_string()),
            }
        }
    }

    fn client(runner: Scripted) -> (AutoScalingGroups, Arc<Scripted>) {
        let runner = Arc::new(runner);
        (AutoScalingGroups::new(runner.clone()), runner)
    }

    fn full() -> Scripted {
        Scripted::default()
            .respond("autoscaling describe-auto-scaling-groups", GROUPS)
            .respond("ec2 describe-launch-templates", TEMPLATES)
            .respond("ec2 describe-instances", INSTANCES)
    }

    #[tokio::test]
    async fn cluster_groups_merges_both_tag_filters() {
        let (asg, runner) = client(full());
        let groups = asg.cluster_groups("prod").await.unwrap();

        // Both filters return the same two groups; each appears once.
        let names: Vec<_> = groups.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, ["eks-spot-b", "eks-workers-a"]);

        let calls = runner.calls();
        assert!(calls.iter().any(|c| c.contains(&"Name=tag-key,Values=kubernetes.io/cluster/prod".to_string())));
        assert!(calls.iter().any(|c| c.contains(&"Name=tag:eks:cluster-name,Values=prod".to_string())));
    }

    #[tokio::test]
    async fn cluster_groups_resolves_versions_and_launch_times() {
        let (asg, _) = client(full());
        let groups = asg.cluster_groups("prod").await.unwrap();

        let spot = groups.iter().find(|g| g.name == "eks-spot-b").unwrap();
        assert_eq!(
            spot.current_version,
            Some(LaunchVersion::LaunchTemplate {
                id: "lt-0spot0000000000".into(),
                version: "3".into()
            })
        );
        let instance = spot.instance("i-0bbb0000000000001").unwrap();
        assert!(instance.launched_at.is_some());
        assert_ne!(instance.version, spot.current_version);
    }

    #[tokio::test]
    async fn templates_are_described_once_per_call() {
        let (asg, runner) = client(full());
        asg.cluster_groups("prod").await.unwrap();

        let template_calls: Vec<_> = runner
            .calls()
            .into_iter()
            .filter(|c| c[1] == "describe-launch-templates")
            .collect();
        assert_eq!(template_calls.len(), 1);
        assert_eq!(
            template_calls[0][2..],
            ["--launch-template-ids", "lt-0spot0000000000", "lt-0workers00000000"]
        );
    }

    #[tokio::test]
    async fn describe_group_returns_none_for_unknown_group() {
        let (asg, _) = client(Scripted::default().respond(
            "autoscaling describe-auto-scaling-groups",
            r#"{"AutoScalingGroups": []}"#,
        ));
        assert!(asg.describe_group("gone").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn describe_group_skips_launch_times() {
        let (asg, runner) = client(full());
        let group = asg.describe_group("eks-workers-a").await.unwrap().unwrap();
        assert_eq!(group.instances.len(), 2);
        assert!(group.instances.iter().all(|i| i.launched_at.is_none()));
        assert!(!runner.calls().iter().any(|c| c[1] == "describe-instances"));
    }

    #[tokio::test]
    async fn terminate_keeps_desired_capacity() {
        let (asg, runner) = client(Scripted::default());
        asg.terminate_instance("i-0aaa0000000000001").await.unwrap();
        assert_eq!(
            runner.calls()[0],
            [
                "autoscaling",
                "terminate-instance-in-auto-scaling-group",
                "--instance-id",
                "i-0aaa0000000000001",
                "--no-should-decrement-desired-capacity"
            ]
        );
    }

    #[tokio::test]
    async fn process_calls_pass_every_process() {
        let (asg, runner) = client(Scripted::default());
        let processes = vec!["AZRebalance".to_string(), "AlarmNotification".to_string()];
        asg.suspend_processes("eks-workers-a", &processes).await.unwrap();
        asg.resume_processes("eks-workers-a", &processes).await.unwrap();

        let calls = runner.calls();
        assert_eq!(calls[0][1], "suspend-processes");
        assert_eq!(calls[1][1], "resume-processes");
        assert_eq!(calls[1][5..], ["AZRebalance", "AlarmNotification"]);
    }

    #[tokio::test]
    async fn runner_errors_propagate() {
        let (asg, _) = client(Scripted::default().fail(
            "autoscaling describe-auto-scaling-groups",
            RollError::api("Rate exceeded"),
        ));
        let err = asg.cluster_groups("prod").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Api);
    }
}
