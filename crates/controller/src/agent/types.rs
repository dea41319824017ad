use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to parse {field} of plugin ConfigMap {configmap}: {source}")]
    PluginParse {
        configmap: String,
        field: &'static str,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("failed to create agent pod {name}: {source}")]
    PodCreate {
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Missing object key")]
    MissingObjectKey,

    #[error("reconcile cancelled")]
    Cancelled,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Whether a Kubernetes API error reports an `AlreadyExists` conflict
pub(crate) fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409 || ae.reason == "AlreadyExists")
}
