use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::key::ObjectKey;

/// Marker the reconciler adds on first sight and strips only once no
/// controller-owned pod remains for the record.
pub const FINALIZER: &str = "gameservers.example.io/controller";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortPolicy {
    /// Host port is chosen by the Port Allocator from the configured range.
    Dynamic,
    /// Host port is fixed by the spec author and must not collide with any
    /// other static port on the same node.
    Static,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameServerPort {
    pub name: String,
    pub container_port: u16,
    pub policy: PortPolicy,
    /// Set by the spec author for `Static`, left `None` for `Dynamic` until
    /// the Port Allocator fills it in.
    pub host_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub initial_delay_seconds: u32,
    pub period_seconds: u32,
    pub failure_threshold: u32,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            initial_delay_seconds: 5,
            period_seconds: 5,
            failure_threshold: 3,
        }
    }
}

/// A direct address override used in local/dev setups where no pod is ever
/// created — the reconciler short-circuits straight to `Ready`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevAddress {
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameServerSpec {
    pub container_image: String,
    pub ports: Vec<GameServerPort>,
    pub health_check: HealthCheck,
    pub dev_address: Option<DevAddress>,
    pub service_account: Option<String>,
}

impl GameServerSpec {
    pub fn is_development(&self) -> bool {
        self.dev_address.is_some()
    }

    pub fn dynamic_port_count(&self) -> usize {
        self.ports
            .iter()
            .filter(|p| p.policy == PortPolicy::Dynamic)
            .count()
    }

    pub fn static_ports(&self) -> impl Iterator<Item = &GameServerPort> {
        self.ports.iter().filter(|p| p.policy == PortPolicy::Static)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameServerState {
    PortAllocation,
    Creating,
    Starting,
    Scheduled,
    RequestReady,
    Ready,
    Allocated,
    Shutdown,
    Unhealthy,
    Error,
}

impl GameServerState {
    /// Ordering used by invariant checks ("state >= Starting implies a pod
    /// exists"). Not a total application order — `Unhealthy`/`Error` are
    /// terminal side-states reachable from almost anywhere, not "later" in
    /// the happy-path sequence, so they are kept at the end only for this
    /// comparison's convenience and are never reached through `>=` guards
    /// in the pipeline itself.
    fn rank(self) -> u8 {
        match self {
            GameServerState::PortAllocation => 0,
            GameServerState::Creating => 1,
            GameServerState::Starting => 2,
            GameServerState::Scheduled => 3,
            GameServerState::RequestReady => 4,
            GameServerState::Ready => 5,
            GameServerState::Allocated => 6,
            GameServerState::Shutdown => 7,
            GameServerState::Unhealthy => 8,
            GameServerState::Error => 9,
        }
    }

    pub fn at_least(self, other: GameServerState) -> bool {
        self.rank() >= other.rank()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub name: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameServerStatus {
    pub state: Option<GameServerState>,
    pub node_name: Option<String>,
    pub address: Option<String>,
    pub ports: Vec<PortBinding>,
}

impl GameServerStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self.state, Some(GameServerState::Ready))
    }
}

impl Default for GameServerState {
    fn default() -> Self {
        GameServerState::PortAllocation
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub finalizers: Vec<String>,
    pub deletion_timestamp: Option<u64>,
    /// Opaque token bumped by the substrate on every successful write; used
    /// for optimistic-concurrency conflict detection and as the allocation
    /// engine's random seed source.
    pub resource_version: String,
}

impl ObjectMeta {
    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizers.iter().any(|f| f == FINALIZER)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameServer {
    pub key: ObjectKey,
    pub meta: ObjectMeta,
    pub spec: GameServerSpec,
    pub status: GameServerStatus,
}

impl GameServer {
    pub fn new(key: ObjectKey, spec: GameServerSpec) -> Self {
        Self {
            key,
            meta: ObjectMeta::default(),
            spec,
            status: GameServerStatus::default(),
        }
    }

    pub fn is_deleting(&self) -> bool {
        self.meta.is_deleting()
    }

    pub fn pod_name(&self) -> &str {
        &self.key.name
    }

    /// Invariant (§8.1): state >= Starting, no deletion timestamp => exactly
    /// one controller-owned pod with this name is expected to exist.
    pub fn expects_pod(&self) -> bool {
        !self.is_deleting()
            && !self.spec.is_development()
            && self
                .status
                .state
                .is_some_and(|s| s.at_least(GameServerState::Starting))
    }
}
