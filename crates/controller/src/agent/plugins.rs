//! # Agent Plugin Discovery
//!
//! Plugins are registered as ConfigMaps labelled
//! `workflows.argoproj.io/configmap-type=AgentPlugin`, either in the
//! controller's namespace (cluster-wide) or in the workflow's namespace.
//! Every descriptor becomes one sidecar container in the agent pod plus one
//! entry in the address list handed to the main container.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Container};
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use serde_yaml::Value;
use std::sync::Arc;
use tracing::{debug, error};

use super::types::{Error, Result};

pub const CONFIGMAP_TYPE_LABEL: &str = "workflows.argoproj.io/configmap-type";
pub const AGENT_PLUGIN_CONFIGMAP_TYPE: &str = "AgentPlugin";

/// Lists plugin descriptor ConfigMaps in a namespace
#[async_trait]
pub trait PluginConfigLister: Send + Sync {
    async fn list_plugin_configmaps(&self, namespace: &str) -> Result<Vec<ConfigMap>>;
}

/// Lists `AgentPlugin` ConfigMaps through the API server
#[derive(Clone)]
pub struct KubePluginConfigLister {
    client: Client,
}

impl KubePluginConfigLister {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PluginConfigLister for KubePluginConfigLister {
    async fn list_plugin_configmaps(&self, namespace: &str) -> Result<Vec<ConfigMap>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default()
            .labels(&format!("{CONFIGMAP_TYPE_LABEL}={AGENT_PLUGIN_CONFIGMAP_TYPE}"));
        Ok(api.list(&params).await?.items)
    }
}

/// A validated plugin descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginDescriptor {
    pub name: String,
    pub command: Option<Vec<String>>,
    pub args: Option<Vec<String>>,
    pub image: String,
    pub address: String,
}

impl PluginDescriptor {
    fn sidecar(&self) -> Container {
        Container {
            name: self.name.clone(),
            image: Some(self.image.clone()),
            command: self.command.clone(),
            args: self.args.clone(),
            ..Default::default()
        }
    }
}

impl TryFrom<&ConfigMap> for PluginDescriptor {
    type Error = Error;

    fn try_from(cm: &ConfigMap) -> Result<Self> {
        let name = cm.name_any();
        let data = cm.data.as_ref();
        let field = |key: &str| data.and_then(|d| d.get(key));

        let parse_list = |key: &'static str| -> Result<Option<Vec<String>>> {
            field(key)
                .map(|raw| string_list(raw))
                .transpose()
                .map(Option::flatten)
                .map_err(|source| Error::PluginParse {
                    configmap: name.clone(),
                    field: key,
                    source,
                })
        };

        let command = parse_list("command")?;
        let args = parse_list("args")?;

        Ok(Self {
            image: field("image").cloned().unwrap_or_default(),
            address: field("address").cloned().unwrap_or_default(),
            name,
            command,
            args,
        })
    }
}

/// Parse a YAML/JSON list of strings
///
/// A blank or null document means no value. Anything that is not a sequence of
/// strings is rejected; scalars are never coerced.
fn string_list(raw: &str) -> std::result::Result<Option<Vec<String>>, serde_yaml::Error> {
    if raw.trim().is_empty() {
        return Ok(None);
    }

    match serde_yaml::from_str::<Value>(raw)? {
        Value::Null => Ok(None),
        Value::Sequence(items) => items
            .into_iter()
            .enumerate()
            .map(|(index, item)| match item {
                Value::String(s) => Ok(s),
                other => Err(serde::de::Error::custom(format!(
                    "element {index} is not a string: {other:?}"
                ))),
            })
            .collect::<std::result::Result<Vec<_>, serde_yaml::Error>>()
            .map(Some),
        other => Err(serde::de::Error::custom(format!(
            "expected a list of strings, found {other:?}"
        ))),
    }
}

/// Sidecars and their addresses, always the same length and in the same order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveredPlugins {
    sidecars: Vec<Container>,
    addresses: Vec<String>,
}

impl DiscoveredPlugins {
    fn push(&mut self, descriptor: &PluginDescriptor) {
        self.sidecars.push(descriptor.sidecar());
        self.addresses.push(descriptor.address.clone());
    }

    pub fn sidecars(&self) -> &[Container] {
        &self.sidecars
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    pub fn is_empty(&self) -> bool {
        self.sidecars.is_empty()
    }

    pub fn into_parts(self) -> (Vec<Container>, Vec<String>) {
        (self.sidecars, self.addresses)
    }
}

/// Discovers agent plugins across configuration scopes
#[derive(Clone)]
pub struct PluginDiscovery {
    lister: Arc<dyn PluginConfigLister>,
    enabled: bool,
}

impl PluginDiscovery {
    pub fn new(lister: Arc<dyn PluginConfigLister>, enabled: bool) -> Self {
        Self { lister, enabled }
    }

    /// Collect sidecars for every plugin found in `scopes`
    ///
    /// Scopes are visited in the order given with duplicates skipped; within a
    /// scope descriptors are ordered by ConfigMap name. A malformed descriptor
    /// fails the whole call.
    pub async fn discover<I, S>(&self, scopes: I) -> Result<DiscoveredPlugins>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut plugins = DiscoveredPlugins::default();
        if !self.enabled {
            return Ok(plugins);
        }

        let mut visited: Vec<String> = Vec::new();
        for scope in scopes {
            let namespace = scope.as_ref();
            if visited.iter().any(|seen| seen == namespace) {
                continue;
            }
            visited.push(namespace.to_string());

            let mut configmaps = self
                .lister
                .list_plugin_configmaps(namespace)
                .await
                .inspect_err(|e| error!(namespace, "Failed to list agent plugins: {}", e))?;
            configmaps.sort_by_key(|cm| cm.name_any());

            for cm in &configmaps {
                let descriptor = PluginDescriptor::try_from(cm)?;
                debug!(
                    namespace,
                    plugin = %descriptor.name,
                    command = ?descriptor.command,
                    args = ?descriptor.args,
                    image = %descriptor.image,
                    address = %descriptor.address,
                    "adding agent plugin sidecar"
                );
                plugins.push(&descriptor);
            }
        }

        Ok(plugins)
    }
}
