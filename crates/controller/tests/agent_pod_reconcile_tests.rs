//! Agent pod reconcile scenarios
//!
//! Drives `AgentPodReconciler` against in-memory doubles of the pod cache,
//! the pod API and the plugin ConfigMap lister. The workflow error sink is a
//! mockall mock so each scenario can pin how often it fires.

#![allow(clippy::too_many_lines)]

use agent_controller::agent::config::ImageConfig;
use agent_controller::agent::resources::{ENV_VAR_PLUGIN_ADDRESSES, ENV_VAR_WORKFLOW_NAME};
use agent_controller::agent::{
    assess_pod, AgentPodBuilder, AgentPodManager, AgentPodReconciler, PluginConfigLister,
    PluginDiscovery, PodApi, PodStore, WorkflowErrorSink, WorkflowPhase,
};
use agent_controller::{
    agent_pod_name, ControllerConfig, Error, Result, TaskSet, Workflow, WorkflowSpec,
};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Container, Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::ErrorResponse;
use kube::ResourceExt;
use mockall::mock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

const CONTROLLER_NAMESPACE: &str = "argo";
const WORKFLOW_NAMESPACE: &str = "team";
const WORKFLOW_NAME: &str = "hello-world";

// ============================================================================
// Test doubles
// ============================================================================

#[derive(Default)]
struct FakePodStore {
    pods: Mutex<HashMap<(String, String), Arc<Pod>>>,
    lookups: AtomicUsize,
}

impl FakePodStore {
    fn insert(&self, pod: Pod) {
        let key = (pod.namespace().unwrap_or_default(), pod.name_any());
        self.pods.lock().unwrap().insert(key, Arc::new(pod));
    }
}

impl PodStore for FakePodStore {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<Pod>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.pods
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }
}

enum CreateBehavior {
    /// Accept the pod, and let the cache observe it when `sync_store` is set
    Accept { sync_store: Option<Arc<FakePodStore>> },
    /// Report `AlreadyExists`; `get` returns `existing`
    AlreadyExists { existing: Pod },
    /// Fail with an arbitrary API error
    Fail { code: u16 },
}

struct FakePodApi {
    behavior: CreateBehavior,
    created: Mutex<Vec<Pod>>,
    gets: AtomicUsize,
}

impl FakePodApi {
    fn new(behavior: CreateBehavior) -> Self {
        Self {
            behavior,
            created: Mutex::new(Vec::new()),
            gets: AtomicUsize::new(0),
        }
    }

    fn create_calls(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{reason} ({code})"),
        reason: reason.to_string(),
        code,
    })
}

#[async_trait]
impl PodApi for FakePodApi {
    async fn create(&self, _namespace: &str, pod: &Pod) -> Result<Pod, kube::Error> {
        self.created.lock().unwrap().push(pod.clone());
        match &self.behavior {
            CreateBehavior::Accept { sync_store } => {
                if let Some(store) = sync_store {
                    store.insert(pod.clone());
                }
                Ok(pod.clone())
            }
            CreateBehavior::AlreadyExists { .. } => Err(api_error(409, "AlreadyExists")),
            CreateBehavior::Fail { code } => Err(api_error(*code, "InternalError")),
        }
    }

    async fn get(&self, _namespace: &str, name: &str) -> Result<Pod, kube::Error> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            CreateBehavior::AlreadyExists { existing } if existing.name_any() == name => {
                Ok(existing.clone())
            }
            _ => Err(api_error(404, "NotFound")),
        }
    }
}

#[derive(Default)]
struct FakeLister {
    by_namespace: HashMap<String, Vec<ConfigMap>>,
    calls: Mutex<Vec<String>>,
}

impl FakeLister {
    fn with_plugin(mut self, namespace: &str, cm: ConfigMap) -> Self {
        self.by_namespace
            .entry(namespace.to_string())
            .or_default()
            .push(cm);
        self
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl PluginConfigLister for FakeLister {
    async fn list_plugin_configmaps(&self, namespace: &str) -> Result<Vec<ConfigMap>> {
        self.calls.lock().unwrap().push(namespace.to_string());
        Ok(self.by_namespace.get(namespace).cloned().unwrap_or_default())
    }
}

/// Lister whose calls never complete
struct StalledLister;

#[async_trait]
impl PluginConfigLister for StalledLister {
    async fn list_plugin_configmaps(&self, _namespace: &str) -> Result<Vec<ConfigMap>> {
        std::future::pending().await
    }
}

mock! {
    ErrorSink {}

    #[async_trait]
    impl WorkflowErrorSink for ErrorSink {
        async fn mark_error(&self, workflow: &Workflow, reason: &str) -> Result<()>;
    }
}

// ============================================================================
// Fixtures
// ============================================================================

fn controller_config() -> Arc<ControllerConfig> {
    let mut config = ControllerConfig::default();
    config.namespace = CONTROLLER_NAMESPACE.to_string();
    config.agent.plugins = true;
    config.executor.image = ImageConfig {
        repository: "quay.io/argoproj/argoexec".to_string(),
        tag: "v3.4.0".to_string(),
    };
    Arc::new(config)
}

fn workflow() -> Workflow {
    let mut workflow = Workflow::new(WORKFLOW_NAME, WorkflowSpec::default());
    workflow.metadata.namespace = Some(WORKFLOW_NAMESPACE.to_string());
    workflow.metadata.uid = Some("b3c2a1d0-0000-4000-8000-000000000042".to_string());
    workflow
}

fn one_task() -> TaskSet {
    TaskSet::new(["hello-world-3360587380"])
}

fn plugin_cm(name: &str, image: &str, address: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([
            ("image".to_string(), image.to_string()),
            ("address".to_string(), address.to_string()),
        ])),
        ..Default::default()
    }
}

fn agent_pod(phase: Option<&str>, message: Option<&str>) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(agent_pod_name(WORKFLOW_NAME)),
            namespace: Some(WORKFLOW_NAMESPACE.to_string()),
            ..Default::default()
        },
        status: Some(PodStatus {
            phase: phase.map(str::to_string),
            message: message.map(str::to_string),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn manager(
    store: Arc<dyn PodStore>,
    api: Arc<dyn PodApi>,
    lister: Arc<dyn PluginConfigLister>,
) -> AgentPodManager {
    let config = controller_config();
    AgentPodManager::new(
        store,
        api,
        PluginDiscovery::new(lister, config.agent.plugins),
        AgentPodBuilder::new(config.clone()),
        config.namespace.clone(),
    )
}

fn main_container(pod: &Pod) -> &Container {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.containers.last())
        .expect("pod has containers")
}

fn env_value<'a>(container: &'a Container, name: &str) -> Option<&'a str> {
    container
        .env
        .as_ref()?
        .iter()
        .find(|var| var.name == name)
        .and_then(|var| var.value.as_deref())
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn empty_task_set_touches_nothing() {
    let store = Arc::new(FakePodStore::default());
    let api = Arc::new(FakePodApi::new(CreateBehavior::Accept { sync_store: None }));
    let lister = Arc::new(FakeLister::default().with_plugin(
        CONTROLLER_NAMESPACE,
        plugin_cm("hello", "img1", "10.0.0.1:50051"),
    ));
    let mut sink = MockErrorSink::new();
    sink.expect_mark_error().never();

    let reconciler = AgentPodReconciler::new(
        manager(store.clone(), api.clone(), lister.clone()),
        Arc::new(sink),
    );

    reconciler
        .reconcile(&workflow(), &TaskSet::default())
        .await
        .unwrap();

    assert_eq!(api.create_calls(), 0);
    assert_eq!(lister.call_count(), 0);
    assert_eq!(store.lookups.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn plugins_from_both_scopes_become_ordered_sidecars() {
    let store = Arc::new(FakePodStore::default());
    let api = Arc::new(FakePodApi::new(CreateBehavior::Accept { sync_store: None }));
    let lister = Arc::new(
        FakeLister::default()
            .with_plugin(
                CONTROLLER_NAMESPACE,
                plugin_cm("cluster-plugin", "img1", "10.0.0.1:50051"),
            )
            .with_plugin(
                WORKFLOW_NAMESPACE,
                plugin_cm("team-plugin", "img2", "10.0.0.2:50051"),
            ),
    );
    let mut sink = MockErrorSink::new();
    sink.expect_mark_error().never();

    let reconciler = AgentPodReconciler::new(
        manager(store, api.clone(), lister),
        Arc::new(sink),
    );
    reconciler.reconcile(&workflow(), &one_task()).await.unwrap();

    let created = api.created.lock().unwrap();
    assert_eq!(created.len(), 1);
    let pod = &created[0];

    let containers = &pod.spec.as_ref().unwrap().containers;
    assert_eq!(containers.len(), 3);
    let images: Vec<_> = containers.iter().map(|c| c.image.as_deref()).collect();
    assert_eq!(
        images,
        vec![
            Some("img1"),
            Some("img2"),
            Some("quay.io/argoproj/argoexec:v3.4.0")
        ]
    );
    assert_eq!(containers[0].name, "cluster-plugin");
    assert_eq!(containers[1].name, "team-plugin");

    let main = main_container(pod);
    assert_eq!(main.name, "main");
    assert_eq!(env_value(main, ENV_VAR_WORKFLOW_NAME), Some(WORKFLOW_NAME));
    assert_eq!(
        env_value(main, ENV_VAR_PLUGIN_ADDRESSES),
        Some(r#"["10.0.0.1:50051","10.0.0.2:50051"]"#)
    );
}

#[tokio::test]
async fn failed_cached_pod_marks_workflow_once_and_succeeds() {
    let store = Arc::new(FakePodStore::default());
    store.insert(agent_pod(Some("Failed"), Some("OOMKilled")));
    let api = Arc::new(FakePodApi::new(CreateBehavior::Accept { sync_store: None }));
    let lister = Arc::new(FakeLister::default());

    let mut sink = MockErrorSink::new();
    sink.expect_mark_error()
        .withf(|wf, reason| wf.name_any() == WORKFLOW_NAME && reason.ends_with("OOMKilled"))
        .times(1)
        .returning(|_, _| Ok(()));

    let reconciler = AgentPodReconciler::new(
        manager(store.clone(), api.clone(), lister.clone()),
        Arc::new(sink),
    );
    reconciler.reconcile(&workflow(), &one_task()).await.unwrap();

    let cached = store
        .get(WORKFLOW_NAMESPACE, &agent_pod_name(WORKFLOW_NAME))
        .unwrap();
    let assessment = assess_pod(&cached).unwrap();
    assert_eq!(assessment.phase, WorkflowPhase::Failed);
    assert_eq!(assessment.message, "OOMKilled");

    // cache hit: neither discovery nor creation ran
    assert_eq!(api.create_calls(), 0);
    assert_eq!(lister.call_count(), 0);
}

#[tokio::test]
async fn unknown_pod_phase_is_reported_as_error() {
    let store = Arc::new(FakePodStore::default());
    store.insert(agent_pod(Some("Unknown"), None));
    let pod_name = agent_pod_name(WORKFLOW_NAME);

    let assessment = assess_pod(&agent_pod(Some("Unknown"), None)).unwrap();
    assert_eq!(assessment.phase, WorkflowPhase::Error);
    assert!(assessment.message.contains(&pod_name));
    assert!(assessment.message.contains("Unknown"));

    let mut sink = MockErrorSink::new();
    let expected_name = pod_name.clone();
    sink.expect_mark_error()
        .withf(move |_, reason| reason.contains(&expected_name) && reason.contains("Unknown"))
        .times(1)
        .returning(|_, _| Ok(()));

    let reconciler = AgentPodReconciler::new(
        manager(
            store,
            Arc::new(FakePodApi::new(CreateBehavior::Accept { sync_store: None })),
            Arc::new(FakeLister::default()),
        ),
        Arc::new(sink),
    );
    reconciler.reconcile(&workflow(), &one_task()).await.unwrap();
}

#[tokio::test]
async fn healthy_cached_pod_leaves_workflow_alone() {
    for phase in ["Pending", "Running", "Succeeded"] {
        let store = Arc::new(FakePodStore::default());
        store.insert(agent_pod(Some(phase), None));
        let mut sink = MockErrorSink::new();
        sink.expect_mark_error().never();

        let reconciler = AgentPodReconciler::new(
            manager(
                store,
                Arc::new(FakePodApi::new(CreateBehavior::Accept { sync_store: None })),
                Arc::new(FakeLister::default()),
            ),
            Arc::new(sink),
        );
        reconciler.reconcile(&workflow(), &one_task()).await.unwrap();
    }
}

#[tokio::test]
async fn ensure_is_idempotent_once_the_cache_catches_up() {
    let store = Arc::new(FakePodStore::default());
    let api = Arc::new(FakePodApi::new(CreateBehavior::Accept {
        sync_store: Some(store.clone()),
    }));
    let lister = Arc::new(FakeLister::default());
    let pods = manager(store, api.clone(), lister.clone());
    let wf = workflow();

    let first = pods.ensure(&wf).await.unwrap();
    let second = pods.ensure(&wf).await.unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.pod.name_any(), second.pod.name_any());
    assert_eq!(first.pod.spec, second.pod.spec);
    assert_eq!(api.create_calls(), 1);
    // discovery only runs on the creation path
    assert_eq!(lister.call_count(), 2);
}

#[tokio::test]
async fn creation_race_returns_the_existing_pod() {
    let existing = agent_pod(Some("Running"), None);
    let api = Arc::new(FakePodApi::new(CreateBehavior::AlreadyExists {
        existing: existing.clone(),
    }));
    let pods = manager(
        Arc::new(FakePodStore::default()),
        api.clone(),
        Arc::new(FakeLister::default()),
    );

    let ensured = pods.ensure(&workflow()).await.unwrap();

    assert!(!ensured.created);
    assert_eq!(*ensured.pod, existing);
    assert_eq!(api.create_calls(), 1);
    assert_eq!(api.gets.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_pod_found_after_creation_race_marks_workflow_once() {
    let api = Arc::new(FakePodApi::new(CreateBehavior::AlreadyExists {
        existing: agent_pod(Some("Failed"), Some("Evicted")),
    }));

    let mut sink = MockErrorSink::new();
    sink.expect_mark_error()
        .withf(|wf, reason| {
            wf.name_any() == WORKFLOW_NAME && reason == "agent pod failed with reason Evicted"
        })
        .times(1)
        .returning(|_, _| Ok(()));

    let reconciler = AgentPodReconciler::new(
        manager(
            Arc::new(FakePodStore::default()),
            api.clone(),
            Arc::new(FakeLister::default()),
        ),
        Arc::new(sink),
    );
    let result = reconciler.reconcile(&workflow(), &one_task()).await;

    assert!(result.is_ok(), "unexpected error: {result:?}");
    assert_eq!(api.create_calls(), 1);
    assert_eq!(api.gets.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn other_create_failures_surface_as_errors() {
    let pods = manager(
        Arc::new(FakePodStore::default()),
        Arc::new(FakePodApi::new(CreateBehavior::Fail { code: 500 })),
        Arc::new(FakeLister::default()),
    );

    match pods.ensure(&workflow()).await {
        Err(Error::PodCreate { name, source }) => {
            assert_eq!(name, agent_pod_name(WORKFLOW_NAME));
            assert!(matches!(source, kube::Error::Api(ae) if ae.code == 500));
        }
        other => panic!("expected PodCreate error, got {other:?}"),
    }
}

#[tokio::test]
async fn malformed_plugin_aborts_pass_without_creating() {
    let mut broken = plugin_cm("broken", "img", "10.0.0.9:50051");
    broken
        .data
        .as_mut()
        .unwrap()
        .insert("command".to_string(), "[unterminated".to_string());

    let api = Arc::new(FakePodApi::new(CreateBehavior::Accept { sync_store: None }));
    let mut sink = MockErrorSink::new();
    sink.expect_mark_error().never();

    let reconciler = AgentPodReconciler::new(
        manager(
            Arc::new(FakePodStore::default()),
            api.clone(),
            Arc::new(
                FakeLister::default()
                    .with_plugin(
                        CONTROLLER_NAMESPACE,
                        plugin_cm("good", "img1", "10.0.0.1:50051"),
                    )
                    .with_plugin(WORKFLOW_NAMESPACE, broken),
            ),
        ),
        Arc::new(sink),
    );

    let result = reconciler.reconcile(&workflow(), &one_task()).await;

    assert!(matches!(result, Err(Error::PluginParse { .. })));
    assert_eq!(api.create_calls(), 0);
}

#[tokio::test]
async fn shared_scope_is_listed_once() {
    let mut config = (*controller_config()).clone();
    config.namespace = WORKFLOW_NAMESPACE.to_string();
    let config = Arc::new(config);

    let lister = Arc::new(FakeLister::default().with_plugin(
        WORKFLOW_NAMESPACE,
        plugin_cm("only", "img1", "10.0.0.1:50051"),
    ));
    let api = Arc::new(FakePodApi::new(CreateBehavior::Accept { sync_store: None }));
    let pods = AgentPodManager::new(
        Arc::new(FakePodStore::default()),
        api.clone(),
        PluginDiscovery::new(lister.clone(), true),
        AgentPodBuilder::new(config),
        WORKFLOW_NAMESPACE.to_string(),
    );

    pods.ensure(&workflow()).await.unwrap();

    assert_eq!(lister.call_count(), 1);
    let created = api.created.lock().unwrap();
    assert_eq!(created[0].spec.as_ref().unwrap().containers.len(), 2);
}

#[tokio::test]
async fn cancelled_reconcile_returns_cancelled() {
    let mut sink = MockErrorSink::new();
    sink.expect_mark_error().never();
    let api = Arc::new(FakePodApi::new(CreateBehavior::Accept { sync_store: None }));

    let reconciler = AgentPodReconciler::new(
        manager(
            Arc::new(FakePodStore::default()),
            api.clone(),
            Arc::new(StalledLister),
        ),
        Arc::new(sink),
    );

    let token = CancellationToken::new();
    token.cancel();
    let result = reconciler
        .reconcile_with_cancellation(&workflow(), &one_task(), &token)
        .await;

    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(api.create_calls(), 0);
}

#[tokio::test]
async fn error_sink_failures_are_propagated() {
    let store = Arc::new(FakePodStore::default());
    store.insert(agent_pod(Some("Failed"), Some("Error")));
    let mut sink = MockErrorSink::new();
    sink.expect_mark_error()
        .times(1)
        .returning(|_, _| Err(Error::KubeError(api_error(503, "ServiceUnavailable"))));

    let reconciler = AgentPodReconciler::new(
        manager(
            store,
            Arc::new(FakePodApi::new(CreateBehavior::Accept { sync_store: None })),
            Arc::new(FakeLister::default()),
        ),
        Arc::new(sink),
    );

    let result = reconciler.reconcile(&workflow(), &one_task()).await;
    assert!(matches!(result, Err(Error::KubeError(_))));
}
