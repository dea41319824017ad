use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::fmt;

/// Terminal workflow phases an agent pod can push its workflow into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowPhase {
    Failed,
    Error,
}

impl fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed => write!(f, "Failed"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Outcome of assessing a settled agent pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodAssessment {
    pub phase: WorkflowPhase,
    pub message: String,
}

/// Map an agent pod phase to a workflow transition
///
/// `None` means the pod is healthy (or done) and the workflow is left alone.
/// Any phase outside the known set, including an empty one, is an error.
pub fn assess_agent_pod_status(
    pod_name: &str,
    phase: &str,
    message: &str,
) -> Option<PodAssessment> {
    match phase {
        "Succeeded" | "Running" | "Pending" => None,
        "Failed" => Some(PodAssessment {
            phase: WorkflowPhase::Failed,
            message: message.to_string(),
        }),
        other => Some(PodAssessment {
            phase: WorkflowPhase::Error,
            message: format!("Unexpected pod phase for {pod_name}: {other}"),
        }),
    }
}

/// Assess a pod object, reading name, phase and message from it
pub fn assess_pod(pod: &Pod) -> Option<PodAssessment> {
    let status = pod.status.as_ref();
    assess_agent_pod_status(
        &pod.name_any(),
        status.and_then(|s| s.phase.as_deref()).unwrap_or_default(),
        status.and_then(|s| s.message.as_deref()).unwrap_or_default(),
    )
}

/// Phase of a pod, when the pod has been observed by the kubelet at least once
pub fn settled_phase(pod: &Pod) -> Option<&str> {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .filter(|phase| !phase.is_empty())
}
