//! Agent Controller Configuration
//!
//! Controller-wide settings that shape every agent pod: the namespace used as
//! the cluster-wide plugin scope, the optional controller instance id, the
//! executor image and the plugin feature flag.

use k8s_openapi::api::core::v1::ConfigMap;
use kube::{api::Api, Client, ResourceExt};
use serde::{Deserialize, Serialize};

/// Key holding the YAML document in the controller's `ConfigMap`
pub const CONFIG_KEY: &str = "config.yaml";

/// Main controller configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Namespace the controller runs in; doubles as the cluster-wide plugin scope
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Controller instance id used to partition workflows between controllers
    #[serde(default, rename = "instanceID", skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,

    /// Executor configuration
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Agent configuration
    #[serde(default)]
    pub agent: AgentConfig,
}

/// Executor configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutorConfig {
    /// Image run by the agent pod's main container
    #[serde(default = "default_executor_image")]
    pub image: ImageConfig,
}

/// Agent configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AgentConfig {
    /// Whether `AgentPlugin` ConfigMaps are turned into sidecars
    #[serde(default)]
    pub plugins: bool,
}

/// Image configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ImageConfig {
    /// Image repository (e.g., "quay.io/argoproj/argoexec")
    pub repository: String,

    /// Image tag (e.g., "latest", "v3.4.0")
    pub tag: String,
}

impl ImageConfig {
    /// Returns `true` when both repository and tag are populated with real values.
    pub fn is_configured(&self) -> bool {
        let repo = self.repository.trim();
        let tag = self.tag.trim();

        !repo.is_empty()
            && repo != "MISSING_IMAGE_CONFIG"
            && !tag.is_empty()
            && tag != "MISSING_IMAGE_CONFIG"
    }

    /// Full image reference (`repository:tag`)
    pub fn reference(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

fn default_namespace() -> String {
    "argo".to_string()
}

fn default_executor_image() -> ImageConfig {
    ImageConfig {
        repository: "MISSING_IMAGE_CONFIG".to_string(),
        tag: "MISSING_IMAGE_CONFIG".to_string(),
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            image: default_executor_image(),
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.namespace.trim().is_empty() {
            return Err(anyhow::anyhow!("namespace must not be empty"));
        }

        if !self.executor.image.is_configured() {
            return Err(anyhow::anyhow!(
                "Executor image is not configured. Provide executor.image.repository and executor.image.tag."
            ));
        }

        Ok(())
    }

    /// Instance id, if one is configured and non-blank
    pub fn instance_id(&self) -> Option<&str> {
        self.instance_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    /// Load configuration from mounted `ConfigMap` file
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;

        serde_yaml::from_str(&config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))
    }

    /// Load configuration from a `ConfigMap` through the API
    pub async fn from_configmap(
        client: &Client,
        namespace: &str,
        name: &str,
    ) -> Result<Self, anyhow::Error> {
        let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
        let cm = api
            .get(name)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to fetch ConfigMap {namespace}/{name}: {e}"))?;
        Self::from_configmap_data(&cm)
    }

    /// Parse the `config.yaml` key of an already fetched `ConfigMap`
    pub fn from_configmap_data(cm: &ConfigMap) -> Result<Self, anyhow::Error> {
        let config_str = cm
            .data
            .as_ref()
            .and_then(|data| data.get(CONFIG_KEY))
            .ok_or_else(|| {
                anyhow::anyhow!("ConfigMap {} has no {CONFIG_KEY} key", cm.name_any())
            })?;

        serde_yaml::from_str(config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            instance_id: None,
            executor: ExecutorConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}
