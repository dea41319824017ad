use super::config::ControllerConfig;
use super::naming::agent_pod_name;
use super::plugins::DiscoveredPlugins;
use super::types::{Error, Result};
use crate::crds::Workflow;
use k8s_openapi::api::core::v1::{Container, EnvVar, LocalObjectReference, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const LABEL_KEY_WORKFLOW: &str = "workflows.argoproj.io/workflow";
pub const LABEL_KEY_COMPLETED: &str = "workflows.argoproj.io/completed";
pub const LABEL_KEY_CONTROLLER_INSTANCE_ID: &str = "workflows.argoproj.io/controller-instanceid";

pub const ENV_VAR_WORKFLOW_NAME: &str = "ARGO_WORKFLOW_NAME";
pub const ENV_VAR_PLUGIN_ADDRESSES: &str = "ARGO_PLUGIN_ADDRESSES";

pub const MAIN_CONTAINER_NAME: &str = "main";
const EXECUTOR_COMMAND: &str = "argoexec";
const AGENT_SUBCOMMAND: &str = "agent";
const RESTART_POLICY_ON_FAILURE: &str = "OnFailure";

/// Builds the desired agent pod for a workflow
#[derive(Clone)]
pub struct AgentPodBuilder {
    config: Arc<ControllerConfig>,
}

impl AgentPodBuilder {
    pub fn new(config: Arc<ControllerConfig>) -> Self {
        Self { config }
    }

    pub fn build(&self, workflow: &Workflow, plugins: DiscoveredPlugins) -> Result<Pod> {
        let workflow_name = workflow.name_any();
        let namespace = workflow.namespace().ok_or(Error::MissingObjectKey)?;
        let owner = workflow
            .controller_owner_ref(&())
            .ok_or(Error::MissingObjectKey)?;

        let (mut containers, addresses) = plugins.into_parts();
        containers.push(Container {
            name: MAIN_CONTAINER_NAME.to_string(),
            image: Some(self.config.executor.image.reference()),
            command: Some(vec![EXECUTOR_COMMAND.to_string()]),
            args: Some(vec![AGENT_SUBCOMMAND.to_string()]),
            env: Some(vec![
                EnvVar {
                    name: ENV_VAR_WORKFLOW_NAME.to_string(),
                    value: Some(workflow_name.clone()),
                    ..Default::default()
                },
                EnvVar {
                    name: ENV_VAR_PLUGIN_ADDRESSES.to_string(),
                    value: Some(serde_json::to_string(&addresses)?),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        });

        Ok(Pod {
            metadata: ObjectMeta {
                name: Some(agent_pod_name(&workflow_name)),
                namespace: Some(namespace),
                labels: Some(self.labels(&workflow_name)),
                owner_references: Some(vec![owner]),
                ..Default::default()
            },
            spec: Some(PodSpec {
                restart_policy: Some(RESTART_POLICY_ON_FAILURE.to_string()),
                service_account_name: workflow
                    .spec
                    .service_account_name
                    .clone()
                    .filter(|sa| !sa.is_empty()),
                image_pull_secrets: image_pull_secrets(workflow),
                containers,
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn labels(&self, workflow_name: &str) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        // Allows filtering by pods related to a specific workflow
        labels.insert(LABEL_KEY_WORKFLOW.to_string(), workflow_name.to_string());
        labels.insert(LABEL_KEY_COMPLETED.to_string(), "false".to_string());
        if let Some(instance_id) = self.config.instance_id() {
            labels.insert(
                LABEL_KEY_CONTROLLER_INSTANCE_ID.to_string(),
                instance_id.to_string(),
            );
        }
        labels
    }
}

/// Named pull secrets only; a reference without a name is dropped
fn image_pull_secrets(workflow: &Workflow) -> Option<Vec<LocalObjectReference>> {
    let secrets: Vec<_> = workflow
        .spec
        .image_pull_secrets
        .iter()
        .flatten()
        .filter_map(|secret| secret.name.as_deref())
        .filter(|name| !name.is_empty())
        .map(|name| LocalObjectReference {
            name: name.to_string(),
        })
        .collect();

    (!secrets.is_empty()).then_some(secrets)
}
