// The substrate collaborator interface (§6). This crate never talks to a
// real container orchestrator directly -- it is injected as a capability
// set (lister + mutator + watcher + event recorder), the way the teacher
// injects `Globals` and channel senders into each subsystem rather than a
// single monolithic client. This is the one polymorphic seam in the whole
// core; every other component takes concrete types.
pub mod fake;

use async_trait::async_trait;
use common::errors::SubstrateError;

use crate::domain::{AllocationPolicy, GameServer, Node, ObjectKey, Pod, PodSpecTemplate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSeverity {
    Normal,
    Warning,
}

/// `tls.crt` / `tls.key` and optional `ca.crt`, as fetched from a secret.
#[derive(Debug, Clone)]
pub struct TlsSecretData {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
    pub ca_pem: Option<Vec<u8>>,
}

/// Read access to substrate-managed objects. Snapshots, not live references:
/// callers that need freshness re-list.
#[async_trait]
pub trait Lister: Send + Sync {
    async fn get_game_server(&self, key: &ObjectKey) -> Result<GameServer, SubstrateError>;
    async fn list_game_servers(&self) -> Result<Vec<GameServer>, SubstrateError>;
    async fn get_pod(&self, key: &ObjectKey) -> Result<Pod, SubstrateError>;
    async fn list_pods(&self) -> Result<Vec<Pod>, SubstrateError>;
    async fn list_nodes(&self) -> Result<Vec<Node>, SubstrateError>;
    async fn list_allocation_policies(&self) -> Result<Vec<AllocationPolicy>, SubstrateError>;
    async fn get_tls_secret(&self, key: &ObjectKey) -> Result<TlsSecretData, SubstrateError>;
}

/// Writes. Every method takes/returns a full object so callers never mutate
/// in place; the fake (and a real client) is expected to bump
/// `resource_version` on every successful write and to fail with `Conflict`
/// when the caller's `resource_version` is stale.
#[async_trait]
pub trait Mutator: Send + Sync {
    async fn update_game_server(&self, gs: GameServer) -> Result<GameServer, SubstrateError>;
    async fn delete_game_server(&self, key: &ObjectKey) -> Result<(), SubstrateError>;
    /// Creating an already-existing pod (by key) is absorbed as success
    /// (§4.D `Creating`), the same idempotent-create convention used for
    /// retried reconcile passes.
    async fn create_pod(&self, pod: PodSpecTemplate) -> Result<Pod, SubstrateError>;
    async fn delete_pod(&self, key: &ObjectKey) -> Result<(), SubstrateError>;
}

/// `(object, severity, reason, message)` event recorder, consumed
/// out-of-process by whatever surfaces it to an operator (substrate event
/// stream, log aggregator, ...). The in-process log is a separate concern
/// (see `telemetry`).
pub trait EventRecorder: Send + Sync {
    fn record(&self, key: &ObjectKey, severity: EventSeverity, reason: &str, message: &str);
}

/// The full capability set injected into components that need substrate
/// access. Cheap to clone: every field is expected to be an `Arc` under the
/// hood (the fake stores one `Arc<Mutex<Store>>` behind all three traits).
pub struct Substrate {
    pub lister: std::sync::Arc<dyn Lister>,
    pub mutator: std::sync::Arc<dyn Mutator>,
    pub events: std::sync::Arc<dyn EventRecorder>,
}

impl Clone for Substrate {
    fn clone(&self) -> Self {
        Self {
            lister: self.lister.clone(),
            mutator: self.mutator.clone(),
            events: self.events.clone(),
        }
    }
}
