// In-memory stand-in for the substrate, used by unit and scenario tests.
// Mirrors the real collaborator's optimistic-concurrency and NotFound /
// AlreadyExists semantics closely enough to exercise the reconciler and
// allocation engine without a live cluster -- the seam the design notes
// (§9) call out as the reason to inject the substrate as a capability set.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::errors::SubstrateError;

use crate::domain::{AllocationPolicy, GameServer, Node, ObjectKey, Pod, PodSpecTemplate};

use super::{EventRecorder, EventSeverity, Lister, Mutator, Substrate, TlsSecretData};

fn now_epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub key: ObjectKey,
    pub severity: EventSeverity,
    pub reason: String,
    pub message: String,
}

#[derive(Default)]
struct Store {
    game_servers: HashMap<ObjectKey, GameServer>,
    pods: HashMap<ObjectKey, Pod>,
    nodes: Vec<Node>,
    policies: Vec<AllocationPolicy>,
    secrets: HashMap<ObjectKey, TlsSecretData>,
    events: Vec<RecordedEvent>,
    next_resource_version: u64,
}

pub struct FakeSubstrate {
    store: Arc<Mutex<Store>>,
}

impl FakeSubstrate {
    pub fn new() -> Self {
        Self {
            store: Arc::new(Mutex::new(Store::default())),
        }
    }

    pub fn capability_set(&self) -> Substrate {
        Substrate {
            lister: Arc::new(self.handle()),
            mutator: Arc::new(self.handle()),
            events: Arc::new(self.handle()),
        }
    }

    fn handle(&self) -> FakeHandle {
        FakeHandle {
            store: self.store.clone(),
        }
    }

    pub fn seed_game_server(&self, mut gs: GameServer) {
        let mut store = self.store.lock().unwrap();
        store.next_resource_version += 1;
        gs.meta.resource_version = store.next_resource_version.to_string();
        store.game_servers.insert(gs.key.clone(), gs);
    }

    pub fn seed_node(&self, node: Node) {
        self.store.lock().unwrap().nodes.push(node);
    }

    pub fn seed_policy(&self, policy: AllocationPolicy) {
        self.store.lock().unwrap().policies.push(policy);
    }

    pub fn seed_secret(&self, key: ObjectKey, secret: TlsSecretData) {
        self.store.lock().unwrap().secrets.insert(key, secret);
    }

    pub fn set_pod_scheduled(&self, key: &ObjectKey, node_name: &str) {
        let mut store = self.store.lock().unwrap();
        if let Some(pod) = store.pods.get_mut(key) {
            pod.node_name = Some(node_name.to_string());
        }
    }

    pub fn fail_pod(&self, key: &ObjectKey) {
        let mut store = self.store.lock().unwrap();
        if let Some(pod) = store.pods.get_mut(key) {
            pod.conditions
                .push(crate::domain::pod::PodConditionKind::NonRecoverableFailure);
        }
    }

    pub fn remove_node(&self, name: &str) {
        self.store.lock().unwrap().nodes.retain(|n| n.name != name);
    }

    pub fn get_game_server_sync(&self, key: &ObjectKey) -> Option<GameServer> {
        self.store.lock().unwrap().game_servers.get(key).cloned()
    }

    pub fn pod_exists(&self, key: &ObjectKey) -> bool {
        self.store.lock().unwrap().pods.contains_key(key)
    }

    pub fn events_snapshot(&self) -> Vec<RecordedEvent> {
        self.store.lock().unwrap().events.clone()
    }
}

impl Default for FakeSubstrate {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
struct FakeHandle {
    store: Arc<Mutex<Store>>,
}

#[async_trait]
impl Lister for FakeHandle {
    async fn get_game_server(&self, key: &ObjectKey) -> Result<GameServer, SubstrateError> {
        let store = self.store.lock().unwrap();
        store
            .game_servers
            .get(key)
            .cloned()
            .ok_or_else(|| SubstrateError::NotFound(key.to_string()))
    }

    async fn list_game_servers(&self) -> Result<Vec<GameServer>, SubstrateError> {
        Ok(self
            .store
            .lock()
            .unwrap()
            .game_servers
            .values()
            .cloned()
            .collect())
    }

    async fn get_pod(&self, key: &ObjectKey) -> Result<Pod, SubstrateError> {
        let store = self.store.lock().unwrap();
        store
            .pods
            .get(key)
            .cloned()
            .ok_or_else(|| SubstrateError::NotFound(key.to_string()))
    }

    async fn list_pods(&self) -> Result<Vec<Pod>, SubstrateError> {
        Ok(self.store.lock().unwrap().pods.values().cloned().collect())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, SubstrateError> {
        Ok(self.store.lock().unwrap().nodes.clone())
    }

    async fn list_allocation_policies(&self) -> Result<Vec<AllocationPolicy>, SubstrateError> {
        Ok(self.store.lock().unwrap().policies.clone())
    }

    async fn get_tls_secret(&self, key: &ObjectKey) -> Result<TlsSecretData, SubstrateError> {
        let store = self.store.lock().unwrap();
        store
            .secrets
            .get(key)
            .cloned()
            .ok_or_else(|| SubstrateError::NotFound(key.to_string()))
    }
}

#[async_trait]
impl Mutator for FakeHandle {
    async fn update_game_server(&self, gs: GameServer) -> Result<GameServer, SubstrateError> {
        let mut store = self.store.lock().unwrap();
        let current = store
            .game_servers
            .get(&gs.key)
            .ok_or_else(|| SubstrateError::NotFound(gs.key.to_string()))?;
        if !current.meta.resource_version.is_empty()
            && current.meta.resource_version != gs.meta.resource_version
        {
            return Err(SubstrateError::Conflict(format!(
                "stale resource_version for {}",
                gs.key
            )));
        }
        store.next_resource_version += 1;
        let mut updated = gs;
        updated.meta.resource_version = store.next_resource_version.to_string();
        // Mirrors a real substrate's garbage collection: once the last
        // finalizer clears on a record already marked for deletion, the
        // object is gone for good.
        if updated.meta.is_deleting() && updated.meta.finalizers.is_empty() {
            store.game_servers.remove(&updated.key);
            return Ok(updated);
        }
        store.game_servers.insert(updated.key.clone(), updated.clone());
        Ok(updated)
    }

    /// Sets the deletion timestamp (the substrate's half of a `kubectl
    /// delete`); actual removal waits for the reconciler to strip the
    /// finalizer, unless there is none to wait for.
    async fn delete_game_server(&self, key: &ObjectKey) -> Result<(), SubstrateError> {
        let mut store = self.store.lock().unwrap();
        let gs = store
            .game_servers
            .get_mut(key)
            .ok_or_else(|| SubstrateError::NotFound(key.to_string()))?;
        if gs.meta.has_finalizer() {
            gs.meta.deletion_timestamp = Some(now_epoch_secs());
            store.next_resource_version += 1;
            gs.meta.resource_version = store.next_resource_version.to_string();
        } else {
            store.game_servers.remove(key);
        }
        Ok(())
    }

    async fn create_pod(&self, spec: PodSpecTemplate) -> Result<Pod, SubstrateError> {
        let mut store = self.store.lock().unwrap();
        if store.pods.contains_key(&spec.key) {
            return Err(SubstrateError::AlreadyExists(spec.key.to_string()));
        }
        let pod = Pod {
            key: spec.key.clone(),
            owner: Some(spec.owner),
            node_name: None,
            phase: crate::domain::pod::PodPhase::Pending,
            conditions: vec![],
            deletion_timestamp: None,
        };
        store.pods.insert(pod.key.clone(), pod.clone());
        Ok(pod)
    }

    async fn delete_pod(&self, key: &ObjectKey) -> Result<(), SubstrateError> {
        let mut store = self.store.lock().unwrap();
        store
            .pods
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| SubstrateError::NotFound(key.to_string()))
    }
}

impl EventRecorder for FakeHandle {
    fn record(&self, key: &ObjectKey, severity: EventSeverity, reason: &str, message: &str) {
        self.store.lock().unwrap().events.push(RecordedEvent {
            key: key.clone(),
            severity,
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{GameServerSpec, GameServerState, HealthCheck};

    fn spec() -> GameServerSpec {
        GameServerSpec {
            container_image: "img".into(),
            ports: vec![],
            health_check: HealthCheck::default(),
            dev_address: None,
            service_account: None,
        }
    }

    #[tokio::test]
    async fn update_detects_conflict() {
        let fake = FakeSubstrate::new();
        let key = ObjectKey::new("default", "gs-1");
        fake.seed_game_server(GameServer::new(key.clone(), spec()));
        let caps = fake.capability_set();

        let mut gs = caps.lister.get_game_server(&key).await.unwrap();
        gs.status.state = Some(GameServerState::Creating);
        let updated = caps.mutator.update_game_server(gs.clone()).await.unwrap();
        assert_ne!(updated.meta.resource_version, gs.meta.resource_version);

        // Replaying the stale copy should now conflict.
        let stale = gs;
        let err = caps.mutator.update_game_server(stale).await.unwrap_err();
        assert!(matches!(err, SubstrateError::Conflict(_)));
    }

    #[tokio::test]
    async fn create_pod_is_idempotent_via_already_exists() {
        let fake = FakeSubstrate::new();
        let caps = fake.capability_set();
        let key = ObjectKey::new("default", "gs-1");
        let spec = PodSpecTemplate {
            key: key.clone(),
            owner: key.clone(),
            container_image: "img".into(),
            ports: vec![],
            health_check: crate::domain::HealthCheck::default(),
            service_account: None,
            sidecar: crate::domain::pod::SidecarSpec {
                image: "sdk-sidecar:latest".into(),
                always_pull: false,
                cpu_request: "100m".into(),
                cpu_limit: "200m".into(),
            },
        };
        caps.mutator.create_pod(spec.clone()).await.unwrap();
        let err = caps.mutator.create_pod(spec).await.unwrap_err();
        assert!(matches!(err, SubstrateError::AlreadyExists(_)));
    }
}
