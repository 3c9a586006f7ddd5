//! Deterministic pod names and the labels that mark pods as ours.

use executor_core::ExecutionId;
use k8s_openapi::api::core::v1::Pod;

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const EXECUTION_ID_LABEL: &str = "script-agent/execution-id";
/// Holds the raw id; label values are too restricted to round-trip it.
pub const EXECUTION_ID_ANNOTATION: &str = "script-agent/execution-id";
pub const SCRIPT_CONTAINER: &str = "script";

const POD_NAME_PREFIX: &str = "script-";
const MAX_NAME_LEN: usize = 63;

/// The pod name for an execution. Stable across agent restarts so a pod can
/// be rediscovered from its execution id alone.
pub fn pod_name(id: &ExecutionId) -> String {
    let sanitized = sanitize(id.as_str());
    let budget = MAX_NAME_LEN - POD_NAME_PREFIX.len();
    if sanitized == id.as_str() && sanitized.len() <= budget {
        return format!("{}{}", POD_NAME_PREFIX, sanitized);
    }

    // Lossy mapping: disambiguate with a hash of the raw id.
    let suffix = format!("{:08x}", fnv1a(id.as_str().as_bytes()));
    let keep = budget - suffix.len() - 1;
    let head: String = sanitized.chars().take(keep).collect();
    let head = head.trim_end_matches('-');
    if head.is_empty() {
        format!("{}{}", POD_NAME_PREFIX, suffix)
    } else {
        format!("{}{}-{}", POD_NAME_PREFIX, head, suffix)
    }
}

/// A label-safe rendering of the execution id.
pub fn execution_label_value(id: &ExecutionId) -> String {
    let name = pod_name(id);
    name[POD_NAME_PREFIX.len()..].to_string()
}

pub fn managed_by_selector(agent_label: &str) -> String {
    format!("{}={}", MANAGED_BY_LABEL, agent_label)
}

/// The execution that owns `pod`, read from its annotation.
pub fn execution_id_of(pod: &Pod) -> Option<ExecutionId> {
    pod.metadata
        .annotations
        .as_ref()?
        .get(EXECUTION_ID_ANNOTATION)
        .map(|id| ExecutionId::from(id.clone()))
}

fn sanitize(raw: &str) -> String {
    let mapped: String = raw
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    mapped.trim_matches('-').to_string()
}

fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for b in bytes {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}
