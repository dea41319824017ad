//! Agent pod lookup and idempotent creation
//!
//! The pod name is derived from the workflow name, so a lost create response
//! or a racing reconcile surfaces as `AlreadyExists` and is resolved by
//! fetching the existing pod instead of failing the pass.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, PostParams};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Client, ResourceExt};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::naming::agent_pod_name;
use super::plugins::PluginDiscovery;
use super::resources::AgentPodBuilder;
use super::types::{is_already_exists, Error, Result};
use crate::crds::Workflow;

/// Local, eventually consistent view of cluster pods
pub trait PodStore: Send + Sync {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<Pod>>;
}

impl PodStore for Store<Pod> {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<Pod>> {
        Store::get(self, &ObjectRef::new(name).within(namespace))
    }
}

/// Remote pod API
#[async_trait]
pub trait PodApi: Send + Sync {
    async fn create(&self, namespace: &str, pod: &Pod) -> Result<Pod, kube::Error>;

    async fn get(&self, namespace: &str, name: &str) -> Result<Pod, kube::Error>;
}

#[derive(Clone)]
pub struct KubePodApi {
    client: Client,
}

impl KubePodApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl PodApi for KubePodApi {
    async fn create(&self, namespace: &str, pod: &Pod) -> Result<Pod, kube::Error> {
        self.pods(namespace).create(&PostParams::default(), pod).await
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Pod, kube::Error> {
        self.pods(namespace).get(name).await
    }
}

/// Pod returned by [`AgentPodManager::ensure`]
#[derive(Debug, Clone)]
pub struct EnsuredPod {
    pub pod: Arc<Pod>,
    /// Whether this call submitted the pod
    pub created: bool,
}

pub struct AgentPodManager {
    store: Arc<dyn PodStore>,
    api: Arc<dyn PodApi>,
    discovery: PluginDiscovery,
    builder: AgentPodBuilder,
    /// Cluster-wide plugin scope
    controller_namespace: String,
}

impl AgentPodManager {
    pub fn new(
        store: Arc<dyn PodStore>,
        api: Arc<dyn PodApi>,
        discovery: PluginDiscovery,
        builder: AgentPodBuilder,
        controller_namespace: String,
    ) -> Self {
        Self {
            store,
            api,
            discovery,
            builder,
            controller_namespace,
        }
    }

    /// Return the workflow's agent pod, creating it on a cache miss
    #[instrument(skip_all, fields(workflow = %workflow.name_any()))]
    pub async fn ensure(&self, workflow: &Workflow) -> Result<EnsuredPod> {
        let namespace = workflow.namespace().ok_or(Error::MissingObjectKey)?;
        let pod_name = agent_pod_name(&workflow.name_any());

        if let Some(existing) = self.store.get(&namespace, &pod_name) {
            debug!(
                pod_name = %pod_name,
                pod_phase = ?existing.status.as_ref().and_then(|s| s.phase.as_deref()),
                "Skipped agent pod creation: already exists"
            );
            return Ok(EnsuredPod {
                pod: existing,
                created: false,
            });
        }

        let plugins = self
            .discovery
            .discover([self.controller_namespace.as_str(), namespace.as_str()])
            .await?;
        let pod = self.builder.build(workflow, plugins)?;

        debug!(pod_name = %pod_name, "Creating agent pod");
        match self.api.create(&namespace, &pod).await {
            Ok(created) => {
                info!(pod_name = %created.name_any(), "Created agent pod");
                Ok(EnsuredPod {
                    pod: Arc::new(created),
                    created: true,
                })
            }
            Err(e) if is_already_exists(&e) => {
                info!(pod_name = %pod_name, "Agent pod creation: already exists");
                let existing = self.api.get(&namespace, &pod_name).await?;
                Ok(EnsuredPod {
                    pod: Arc::new(existing),
                    created: false,
                })
            }
            Err(e) => {
                warn!(pod_name = %pod_name, "Failed to create agent pod: {}", e);
                Err(Error::PodCreate {
                    name: pod_name,
                    source: e,
                })
            }
        }
    }
}
