//! `Workflow` Custom Resource (the subset of `argoproj.io/v1alpha1` the agent reconciler reads)

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Node types whose execution is delegated to the agent pod
pub const AGENT_NODE_TYPES: [&str; 2] = ["HTTP", "Plugin"];

/// Node phases after which a node no longer needs the agent
const FULFILLED_NODE_PHASES: [&str; 5] = ["Succeeded", "Failed", "Error", "Skipped", "Omitted"];

/// Reference to an image pull secret in the workflow's namespace
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
pub struct ImagePullSecretRef {
    /// Name of the secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// `Workflow` CRD, only the fields needed to run its agent pod
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(group = "argoproj.io", version = "v1alpha1", kind = "Workflow")]
#[kube(namespaced)]
#[kube(status = "WorkflowStatus")]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
pub struct WorkflowSpec {
    /// ServiceAccount the workflow's pods run as
    #[serde(default, rename = "serviceAccountName", skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    /// Pull secrets for private registries
    #[serde(default, rename = "imagePullSecrets", skip_serializing_if = "Option::is_none")]
    pub image_pull_secrets: Option<Vec<ImagePullSecretRef>>,
}

/// Status of the `Workflow`
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct WorkflowStatus {
    /// Workflow phase (Pending, Running, Succeeded, Failed, Error)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    /// Human-readable message about the current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Node statuses keyed by node id
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeStatus>,
}

/// Status of a single workflow node
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct NodeStatus {
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Node type (Pod, HTTP, Plugin, Steps, DAG, ...)
    #[serde(default, rename = "type")]
    pub node_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

impl NodeStatus {
    fn needs_agent(&self) -> bool {
        AGENT_NODE_TYPES.contains(&self.node_type.as_str())
            && !self
                .phase
                .as_deref()
                .is_some_and(|phase| FULFILLED_NODE_PHASES.contains(&phase))
    }
}

/// Pending work items that require the agent pod, keyed by node id
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TaskSet(BTreeSet<String>);

impl TaskSet {
    pub fn new<I, S>(node_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(node_ids.into_iter().map(Into::into).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl Workflow {
    /// Node ids of HTTP/Plugin nodes that have not reached a terminal phase
    pub fn pending_agent_tasks(&self) -> TaskSet {
        let Some(status) = &self.status else {
            return TaskSet::default();
        };
        TaskSet::new(
            status
                .nodes
                .values()
                .filter(|node| node.needs_agent())
                .map(|node| node.id.clone()),
        )
    }

    /// Whether the workflow already reached a terminal phase
    pub fn is_completed(&self) -> bool {
        matches!(
            self.status.as_ref().and_then(|s| s.phase.as_deref()),
            Some("Succeeded" | "Failed" | "Error")
        )
    }
}
