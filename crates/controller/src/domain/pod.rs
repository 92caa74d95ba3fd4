use serde::{Deserialize, Serialize};

use super::gameserver::{GameServerPort, HealthCheck};
use super::key::ObjectKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeAddressKind {
    ExternalIp,
    InternalIp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    pub kind: NodeAddressKind,
    pub address: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodConditionKind {
    /// Container runtime reports the container exited non-zero and will not
    /// be retried by the substrate (CrashLoopBackOff exhausted, OOMKilled
    /// with no restart policy left, etc).
    NonRecoverableFailure,
}

/// Minimal projection of the substrate's pod object the reconciler and
/// health controller need: enough to tell when a pod has been scheduled,
/// where, and whether it is unrecoverably broken. Real field, label and
/// container layout live in `PodSpecTemplate` (see `reconciler::pod_spec`);
/// this is the *observed* counterpart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pod {
    pub key: ObjectKey,
    pub owner: Option<ObjectKey>,
    pub node_name: Option<String>,
    pub phase: PodPhase,
    pub conditions: Vec<PodConditionKind>,
    pub deletion_timestamp: Option<u64>,
}

impl Pod {
    pub fn is_scheduled(&self) -> bool {
        self.node_name.is_some()
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn has_non_recoverable_failure(&self) -> bool {
        self.conditions
            .contains(&PodConditionKind::NonRecoverableFailure)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub addresses: Vec<NodeAddress>,
}

impl Node {
    /// Prefer ExternalIP, fall back to InternalIP, per the Starting -> Scheduled
    /// transition's address-resolution rule.
    pub fn resolve_address(&self) -> Option<&str> {
        self.addresses
            .iter()
            .find(|a| a.kind == NodeAddressKind::ExternalIp)
            .or_else(|| {
                self.addresses
                    .iter()
                    .find(|a| a.kind == NodeAddressKind::InternalIp)
            })
            .map(|a| a.address.as_str())
    }
}

/// The SDK sidecar attached to every non-development pod, configured
/// process-wide (§10 Configuration: `sidecarImage`, `alwaysPullSidecar`,
/// `sidecarCPURequest`, `sidecarCPULimit`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarSpec {
    pub image: String,
    pub always_pull: bool,
    pub cpu_request: String,
    pub cpu_limit: String,
}

/// The desired pod shape the reconciler submits on create (§4.D
/// `Creating`): container image, ports (with host ports already filled in
/// by the Port Allocator), health probe, service account, SDK sidecar, and
/// an owner reference back to the game server. Distinct from [`Pod`], which
/// is the *observed* projection the substrate reports back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodSpecTemplate {
    pub key: ObjectKey,
    pub owner: ObjectKey,
    pub container_image: String,
    pub ports: Vec<GameServerPort>,
    pub health_check: HealthCheck,
    pub service_account: Option<String>,
    pub sidecar: SidecarSpec,
}
