use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

const AGENT_NODE_NAME: &str = "agent";
const AGENT_POD_SUFFIX: &str = "-agent";

const FNV32_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV32_PRIME: u32 = 0x0100_0193;

/// Name of the agent pod for a workflow
///
/// Pure function of the workflow name; it is the idempotency key for pod
/// creation, so it must never incorporate time or randomness.
pub fn agent_pod_name(workflow_name: &str) -> String {
    format!(
        "{}{AGENT_POD_SUFFIX}",
        node_id(workflow_name, AGENT_NODE_NAME)
    )
}

/// Whether `pod` is the agent pod of `workflow_name`
pub fn is_agent_pod(workflow_name: &str, pod: &Pod) -> bool {
    pod.name_any() == agent_pod_name(workflow_name)
}

/// Node id of `node_name` within a workflow, matching the workflow controller's scheme
fn node_id(workflow_name: &str, node_name: &str) -> String {
    if node_name == workflow_name {
        workflow_name.to_string()
    } else {
        format!("{workflow_name}-{}", fnv32a(node_name.as_bytes()))
    }
}

fn fnv32a(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV32_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(FNV32_PRIME)
    })
}
