use crate::crds::Workflow;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Controller;
use kube::runtime::reflector::{self, ObjectRef};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, Instrument};

pub mod config;
pub mod controller;
pub mod naming;
pub mod plugins;
pub mod pods;
pub mod resources;
pub mod status;
pub mod types;

// Re-export commonly used items
pub use config::ControllerConfig;
pub use controller::{
    error_policy, reconcile_workflow, AgentPodReconciler, KubeWorkflowErrorSink,
    WorkflowErrorSink,
};
pub use naming::{agent_pod_name, is_agent_pod};
pub use plugins::{DiscoveredPlugins, KubePluginConfigLister, PluginConfigLister, PluginDiscovery};
pub use pods::{AgentPodManager, EnsuredPod, KubePodApi, PodApi, PodStore};
pub use resources::AgentPodBuilder;
pub use status::{assess_agent_pod_status, assess_pod, PodAssessment, WorkflowPhase};
pub use types::{Error, Result};

use resources::{LABEL_KEY_CONTROLLER_INSTANCE_ID, LABEL_KEY_WORKFLOW};

/// Shared state handed to every reconcile
pub struct Context {
    pub reconciler: AgentPodReconciler,
    pub config: Arc<ControllerConfig>,
}

impl Context {
    /// Wire the reconciler to the cluster
    pub fn new(
        client: Client,
        pod_store: Arc<dyn PodStore>,
        config: Arc<ControllerConfig>,
    ) -> Self {
        let discovery = PluginDiscovery::new(
            Arc::new(KubePluginConfigLister::new(client.clone())),
            config.agent.plugins,
        );
        let pods = AgentPodManager::new(
            pod_store,
            Arc::new(KubePodApi::new(client.clone())),
            discovery,
            AgentPodBuilder::new(config.clone()),
            config.namespace.clone(),
        );
        let reconciler =
            AgentPodReconciler::new(pods, Arc::new(KubeWorkflowErrorSink::new(client)));

        Self { reconciler, config }
    }
}

/// Label selector restricting a watch to this controller's instance
fn instance_selector(config: &ControllerConfig) -> String {
    match config.instance_id() {
        Some(id) => format!("{LABEL_KEY_CONTROLLER_INSTANCE_ID}={id}"),
        None => format!("!{LABEL_KEY_CONTROLLER_INSTANCE_ID}"),
    }
}

/// Route a pod event to the workflow owning it, if it is that workflow's agent pod
fn agent_pod_owner(pod: &Pod) -> Option<ObjectRef<Workflow>> {
    let workflow_name = pod.labels().get(LABEL_KEY_WORKFLOW)?;
    if !is_agent_pod(workflow_name, pod) {
        return None;
    }
    let namespace = pod.namespace()?;
    Some(ObjectRef::new(workflow_name).within(&namespace))
}

/// Main entry point for the agent pod controller
#[instrument(skip(client, config), fields(namespace = %config.namespace))]
pub async fn run_agent_controller(client: Client, config: Arc<ControllerConfig>) -> Result<()> {
    info!("Starting agent pod controller");

    let selector = instance_selector(&config);
    debug!(selector = %selector, "Using instance label selector");

    let pods_api: Api<Pod> = Api::all(client.clone());
    let pod_watch_config =
        watcher::Config::default().labels(&format!("{LABEL_KEY_WORKFLOW},{selector}"));

    // Pod cache consulted before every create
    let (pod_store, pod_writer) = reflector::store::<Pod>();
    let pod_reflector = reflector::reflector(
        pod_writer,
        watcher::watcher(pods_api.clone(), pod_watch_config.clone()),
    )
    .default_backoff()
    .applied_objects()
    .for_each(|event| async move {
        if let Err(e) = event {
            error!("Pod reflector error: {}", e);
        }
    });
    let reflector_handle =
        tokio::spawn(pod_reflector.instrument(tracing::info_span!("pod_reflector")));

    pod_store
        .wait_until_ready()
        .await
        .map_err(|e| Error::ConfigError(format!("pod cache never became ready: {e}")))?;
    info!("Pod cache synced");

    let context = Arc::new(Context::new(
        client.clone(),
        Arc::new(pod_store),
        config.clone(),
    ));

    let workflows: Api<Workflow> = Api::all(client);
    let workflow_watch_config = watcher::Config::default().labels(&selector);

    Controller::new(workflows, workflow_watch_config)
        .watches(pods_api, pod_watch_config, |pod| agent_pod_owner(&pod))
        .run(reconcile_workflow, error_policy, context)
        .for_each(|reconciliation_result| {
            let span = tracing::info_span!("agent_reconciliation_result");
            async move {
                match reconciliation_result {
                    Ok(workflow) => {
                        debug!(resource = ?workflow, "Workflow reconciliation successful");
                    }
                    Err(reconciliation_err) => {
                        error!(error = ?reconciliation_err, "Workflow reconciliation error");
                    }
                }
            }
            .instrument(span)
        })
        .await;

    reflector_handle.abort();
    info!("Agent pod controller shutting down");
    Ok(())
}
