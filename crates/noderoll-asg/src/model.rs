//! JSON shapes of the `aws` CLI responses we read, and their conversion to
//! `ScalingGroup`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use noderoll_core::{GroupInstance, LaunchVersion, RollError, RollResult, ScalingGroup};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DescribeGroupsOutput {
    #[serde(default)]
    pub auto_scaling_groups: Vec<AsgDescription>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AsgDescription {
    pub auto_scaling_group_name: String,
    pub desired_capacity: u32,
    pub launch_configuration_name: Option<String>,
    pub launch_template: Option<TemplateSpec>,
    pub mixed_instances_policy: Option<MixedInstancesPolicy>,
    #[serde(default)]
    pub instances: Vec<AsgInstance>,
}

impl AsgDescription {
    /// Launch template the group launches from, directly or through its
    /// mixed-instances policy.
    pub fn template(&self) -> Option<&TemplateSpec> {
        self.launch_template.as_ref().or_else(|| {
            self.mixed_instances_policy
                .as_ref()?
                .launch_template
                .as_ref()?
                .launch_template_specification
                .as_ref()
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MixedInstancesPolicy {
    pub launch_template: Option<MixedLaunchTemplate>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MixedLaunchTemplate {
    pub launch_template_specification: Option<TemplateSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TemplateSpec {
    pub launch_template_id: Option<String>,
    pub launch_template_name: Option<String>,
    /// A number, `$Latest` or `$Default`. Missing means `$Default`.
    pub version: Option<String>,
}

impl TemplateSpec {
    /// Id if known, else name.
    pub fn key(&self) -> Option<&str> {
        self.launch_template_id
            .as_deref()
            .or(self.launch_template_name.as_deref())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AsgInstance {
    pub instance_id: String,
    pub lifecycle_state: String,
    pub health_status: String,
    pub launch_configuration_name: Option<String>,
    pub launch_template: Option<TemplateSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DescribeTemplatesOutput {
    #[serde(default)]
    pub launch_templates: Vec<TemplateDescription>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TemplateDescription {
    pub launch_template_id: String,
    pub launch_template_name: String,
    pub default_version_number: i64,
    pub latest_version_number: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DescribeInstancesOutput {
    #[serde(default)]
    pub reservations: Vec<Reservation>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Reservation {
    #[serde(default)]
    pub instances: Vec<Ec2Instance>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Ec2Instance {
    pub instance_id: String,
    pub launch_time: Option<DateTime<Utc>>,
}

/// Launch templates by id and by name.
#[derive(Debug, Default)]
pub struct TemplateIndex {
    by_key: HashMap<String, TemplateDescription>,
}

impl TemplateIndex {
    pub fn insert(&mut self, template: TemplateDescription) {
        self.by_key
            .insert(template.launch_template_name.clone(), template.clone());
        self.by_key
            .insert(template.launch_template_id.clone(), template);
    }

    pub fn get(&self, key: &str) -> Option<&TemplateDescription> {
        self.by_key.get(key)
    }

    /// Resolve a template spec to a concrete id and version number.
    ///
    /// `$Latest` and `$Default` need the template to be indexed. Numeric
    /// versions pass through, with the id looked up when only a name is
    /// given.
    pub fn resolve(&self, spec: &TemplateSpec) -> RollResult<LaunchVersion> {
        let key = spec
            .key()
            .ok_or_else(|| RollError::discovery("launch template spec without id or name"))?;
        let described = self.get(key);

        let version = match spec.version.as_deref() {
            None | Some("$Default") => described
                .map(|t| t.default_version_number.to_string())
                .ok_or_else(|| unresolved(key, "$Default"))?,
            Some("$Latest") => described
                .map(|t| t.latest_version_number.to_string())
                .ok_or_else(|| unresolved(key, "$Latest"))?,
            Some(number) => number.to_string(),
        };
        let id = spec
            .launch_template_id
            .clone()
            .or_else(|| described.map(|t| t.launch_template_id.clone()))
            .unwrap_or_else(|| key.to_string());

        Ok(LaunchVersion::LaunchTemplate { id, version })
    }
}

fn unresolved(key: &str, version: &str) -> RollError {
    RollError::discovery(format!("cannot resolve {version} of launch template {key}"))
}

/// Convert a described group. Instances whose version cannot be resolved
/// keep `None`, which discovery reports against the node.
pub fn to_scaling_group(
    desc: &AsgDescription,
    templates: &TemplateIndex,
    launch_times: &HashMap<String, DateTime<Utc>>,
) -> RollResult<ScalingGroup> {
    let current_version = match (&desc.launch_configuration_name, desc.template()) {
        (Some(name), _) => Some(LaunchVersion::LaunchConfiguration { name: name.clone() }),
        (None, Some(spec)) => Some(templates.resolve(spec)?),
        (None, None) => None,
    };

    let instances = desc
        .instances
        .iter()
        .map(|i| GroupInstance {
            instance_id: i.instance_id.clone(),
            version: match (&i.launch_configuration_name, &i.launch_template) {
                (Some(name), _) => Some(LaunchVersion::LaunchConfiguration { name: name.clone() }),
                (None, Some(spec)) => templates.resolve(spec).ok(),
                (None, None) => None,
            },
            lifecycle_state: i.lifecycle_state.clone(),
            health_status: i.health_status.clone(),
            launched_at: launch_times.get(&i.instance_id).copied(),
        })
        .collect();

    Ok(ScalingGroup {
        name: desc.auto_scaling_group_name.clone(),
        current_version,
        desired_capacity: desc.desired_capacity,
        instances,
    })
}
