// Component D (§4.D): the reconciler state machine. `reconcile` reads the
// current record, applies every guarded transition that matches in order,
// persisting after each step so a later failure only re-runs the
// transitions that have not yet taken effect (§4.D "pipeline semantics").
use std::sync::Arc;

use common::errors::ErrorKind;

use crate::domain::{pod::FINALIZER, GameServer, GameServerState, ObjectKey};
use crate::port_allocator::PortAllocator;
use crate::ready_cache::ReadyCache;
use crate::substrate::{EventSeverity, Substrate};

use super::pod_spec::build_pod_spec;

pub struct ReconcilerContext {
    pub substrate: Substrate,
    pub port_allocator: Arc<PortAllocator>,
    pub ready_cache: Arc<ReadyCache>,
    pub sidecar: crate::domain::pod::SidecarSpec,
    pub default_service_account: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileResult {
    /// Ran to a stable point; no further action needed until the next
    /// external event.
    Done,
    /// A transient or conflict error occurred; requeue with backoff.
    Requeue,
    /// The record is gone, or the work item is otherwise no longer
    /// actionable.
    Drop,
}

pub async fn reconcile(key: &ObjectKey, ctx: &ReconcilerContext) -> ReconcileResult {
    let gs = match ctx.substrate.lister.get_game_server(key).await {
        Ok(gs) => gs,
        Err(e) if e.kind() == ErrorKind::NotFound => return ReconcileResult::Drop,
        Err(e) if e.kind() == ErrorKind::Transient => return ReconcileResult::Requeue,
        Err(e) => {
            log::error!("{key}: unexpected error fetching game server: {e}");
            return ReconcileResult::Drop;
        }
    };

    match run_pipeline(gs, ctx).await {
        Ok(true) => ReconcileResult::Drop,
        Ok(false) => ReconcileResult::Done,
        Err(e) if matches!(e.kind(), ErrorKind::Conflict | ErrorKind::Transient) => ReconcileResult::Requeue,
        Err(e) => {
            log::warn!("{key}: reconcile step failed: {e}");
            ReconcileResult::Drop
        }
    }
}

/// Returns `Ok(true)` if the record was fully removed.
async fn run_pipeline(mut gs: GameServer, ctx: &ReconcilerContext) -> Result<bool, common::errors::SubstrateError> {
    if !gs.meta.has_finalizer() && !gs.is_deleting() {
        gs.meta.finalizers.push(FINALIZER.to_string());
        gs = ctx.substrate.mutator.update_game_server(gs).await?;
    }

    if gs.status.state.is_none() && !gs.is_deleting() {
        gs.status.state = Some(if gs.spec.dynamic_port_count() > 0 {
            GameServerState::PortAllocation
        } else {
            GameServerState::Creating
        });
        gs = ctx.substrate.mutator.update_game_server(gs).await?;
    }

    if gs.is_deleting() {
        return handle_deletion(gs, ctx).await;
    }

    if gs.spec.is_development() {
        return handle_development(gs, ctx).await;
    }

    match gs.status.state {
        Some(GameServerState::PortAllocation) => handle_port_allocation(gs, ctx).await,
        Some(GameServerState::Creating) => handle_creating(gs, ctx).await,
        Some(GameServerState::Starting) => handle_starting(gs, ctx).await,
        Some(GameServerState::RequestReady) => handle_request_ready(gs, ctx).await,
        Some(GameServerState::Ready) => {
            // Idempotent republish: makes a ready-cache rebuild unnecessary
            // after any reconcile pass observes a settled Ready record.
            ctx.ready_cache.add(gs);
            Ok(false)
        }
        Some(GameServerState::Shutdown) => handle_shutdown(gs, ctx).await,
        _ => Ok(false),
    }
}

async fn handle_deletion(mut gs: GameServer, ctx: &ReconcilerContext) -> Result<bool, common::errors::SubstrateError> {
    match ctx.substrate.lister.get_pod(&gs.key).await {
        Ok(pod) if !pod.is_deleting() => {
            match ctx.substrate.mutator.delete_pod(&gs.key).await {
                Ok(()) => Ok(false),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e),
            }
        }
        Ok(_) => Ok(false), // pod deletion already in flight; wait for it to disappear
        Err(e) if e.kind() == ErrorKind::NotFound => {
            // Pod is gone: release ports and strip the finalizer so the
            // substrate can complete the deletion it already started.
            ctx.port_allocator.deallocate(&gs);
            let _ = ctx.ready_cache.remove(&gs.key);
            gs.meta.finalizers.retain(|f| f != FINALIZER);
            ctx.substrate.mutator.update_game_server(gs).await?;
            Ok(true)
        }
        Err(e) => Err(e),
    }
}

async fn handle_development(mut gs: GameServer, ctx: &ReconcilerContext) -> Result<bool, common::errors::SubstrateError> {
    let Some(dev) = gs.spec.dev_address.clone() else {
        return Ok(false);
    };
    let already_settled = gs.status.state == Some(GameServerState::Ready)
        && gs.status.address.as_deref() == Some(dev.address.as_str());
    if already_settled {
        ctx.ready_cache.add(gs);
        return Ok(false);
    }
    gs.status.address = Some(dev.address);
    gs.status.ports = gs
        .spec
        .ports
        .iter()
        .map(|p| crate::domain::PortBinding {
            name: p.name.clone(),
            port: p.host_port.unwrap_or(p.container_port),
        })
        .collect();
    gs.status.state = Some(GameServerState::Ready);
    let updated = ctx.substrate.mutator.update_game_server(gs).await?;
    ctx.ready_cache.add(updated);
    Ok(false)
}

async fn handle_port_allocation(gs: GameServer, ctx: &ReconcilerContext) -> Result<bool, common::errors::SubstrateError> {
    let key = gs.key.clone();
    match ctx.port_allocator.allocate(gs) {
        Ok(mut updated) => {
            updated.status.state = Some(GameServerState::Creating);
            if let Err(e) = ctx.substrate.mutator.update_game_server(updated.clone()).await {
                // The ports were already reserved in memory; give them back
                // so a requeued pass doesn't allocate a second set on top.
                ctx.port_allocator.deallocate(&updated);
                return Err(e);
            }
            Ok(false)
        }
        Err(e) => {
            log::warn!("{key}: port allocation failed: {e}");
            let mut errored = ctx.substrate.lister.get_game_server(&key).await?;
            errored.status.state = Some(GameServerState::Error);
            ctx.substrate.mutator.update_game_server(errored).await?;
            ctx.substrate.events.record(
                &key,
                EventSeverity::Warning,
                "PortAllocationFailed",
                &e.to_string(),
            );
            Ok(false)
        }
    }
}

async fn handle_creating(mut gs: GameServer, ctx: &ReconcilerContext) -> Result<bool, common::errors::SubstrateError> {
    let key = gs.key.clone();
    let spec = build_pod_spec(&gs, &ctx.sidecar, &ctx.default_service_account);
    match ctx.substrate.mutator.create_pod(spec).await {
        Ok(_) | Err(common::errors::SubstrateError::AlreadyExists(_)) => {
            gs.status.state = Some(GameServerState::Starting);
            ctx.substrate.mutator.update_game_server(gs).await?;
            Ok(false)
        }
        Err(e @ common::errors::SubstrateError::Invalid(_)) => {
            log::warn!("{key}: invalid pod spec: {e}");
            let mut errored = ctx.substrate.lister.get_game_server(&key).await?;
            errored.status.state = Some(GameServerState::Error);
            ctx.substrate.mutator.update_game_server(errored).await?;
            ctx.substrate.events.record(
                &key,
                EventSeverity::Warning,
                "InvalidPodSpec",
                &e.to_string(),
            );
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

async fn handle_starting(mut gs: GameServer, ctx: &ReconcilerContext) -> Result<bool, common::errors::SubstrateError> {
    let pod = match ctx.substrate.lister.get_pod(&gs.key).await {
        Ok(pod) => pod,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if !pod.is_scheduled() {
        return Ok(false);
    }
    let node_name = pod.node_name.clone().expect("is_scheduled implies Some");
    let nodes = ctx.substrate.lister.list_nodes().await?;
    let Some(node) = nodes.iter().find(|n| n.name == node_name) else {
        return Ok(false);
    };
    let Some(address) = node.resolve_address() else {
        return Ok(false);
    };
    gs.status.node_name = Some(node_name);
    gs.status.address = Some(address.to_string());
    gs.status.state = Some(GameServerState::Scheduled);
    ctx.substrate.mutator.update_game_server(gs).await?;
    Ok(false)
}

async fn handle_request_ready(mut gs: GameServer, ctx: &ReconcilerContext) -> Result<bool, common::errors::SubstrateError> {
    if gs.status.address.is_none() {
        if let Ok(pod) = ctx.substrate.lister.get_pod(&gs.key).await {
            if let Some(node_name) = &pod.node_name {
                let nodes = ctx.substrate.lister.list_nodes().await?;
                if let Some(node) = nodes.iter().find(|n| &n.name == node_name) {
                    if let Some(address) = node.resolve_address() {
                        gs.status.address = Some(address.to_string());
                    }
                }
            }
        }
    }
    gs.status.state = Some(GameServerState::Ready);
    let updated = ctx.substrate.mutator.update_game_server(gs).await?;
    ctx.ready_cache.add(updated);
    Ok(false)
}

async fn handle_shutdown(gs: GameServer, ctx: &ReconcilerContext) -> Result<bool, common::errors::SubstrateError> {
    let _ = ctx.ready_cache.remove(&gs.key);
    match ctx.substrate.mutator.delete_game_server(&gs.key).await {
        Ok(()) => Ok(false),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{GameServerPort, GameServerSpec, HealthCheck, Node, NodeAddress, NodeAddressKind, PortPolicy};
    use crate::substrate::fake::FakeSubstrate;

    fn ctx(fake: &FakeSubstrate) -> ReconcilerContext {
        ReconcilerContext {
            substrate: fake.capability_set(),
            port_allocator: Arc::new(PortAllocator::new(7000, 7010)),
            ready_cache: Arc::new(ReadyCache::new()),
            sidecar: crate::domain::pod::SidecarSpec {
                image: "sdk-sidecar:latest".into(),
                always_pull: false,
                cpu_request: "100m".into(),
                cpu_limit: "200m".into(),
            },
            default_service_account: "sdk-default".into(),
        }
    }

    fn dynamic_port_spec() -> GameServerSpec {
        GameServerSpec {
            container_image: "img".into(),
            ports: vec![GameServerPort {
                name: "game".into(),
                container_port: 7654,
                policy: PortPolicy::Dynamic,
                host_port: None,
            }],
            health_check: HealthCheck::default(),
            dev_address: None,
            service_account: None,
        }
    }

    #[tokio::test]
    async fn happy_path_dynamic_port_reaches_ready() {
        let fake = FakeSubstrate::new();
        let key = ObjectKey::new("default", "gs-1");
        fake.seed_game_server(GameServer::new(key.clone(), dynamic_port_spec()));
        fake.seed_node(Node {
            name: "node-a".into(),
            addresses: vec![NodeAddress {
                kind: NodeAddressKind::ExternalIp,
                address: "10.0.0.1".into(),
            }],
        });
        let ctx = ctx(&fake);
        ctx.port_allocator.add_node("node-a");

        // PortAllocation -> Creating
        assert_eq!(reconcile(&key, &ctx).await, ReconcileResult::Done);
        let gs = fake.get_game_server_sync(&key).unwrap();
        assert_eq!(gs.status.state, Some(GameServerState::Creating));
        assert_eq!(gs.status.ports.len(), 1);

        // Creating -> Starting
        assert_eq!(reconcile(&key, &ctx).await, ReconcileResult::Done);
        assert!(fake.pod_exists(&key));
        let gs = fake.get_game_server_sync(&key).unwrap();
        assert_eq!(gs.status.state, Some(GameServerState::Starting));

        // Still unscheduled: Starting is a no-op until the pod lands.
        assert_eq!(reconcile(&key, &ctx).await, ReconcileResult::Done);
        let gs = fake.get_game_server_sync(&key).unwrap();
        assert_eq!(gs.status.state, Some(GameServerState::Starting));

        fake.set_pod_scheduled(&key, "node-a");
        assert_eq!(reconcile(&key, &ctx).await, ReconcileResult::Done);
        let gs = fake.get_game_server_sync(&key).unwrap();
        assert_eq!(gs.status.state, Some(GameServerState::Scheduled));
        assert_eq!(gs.status.address.as_deref(), Some("10.0.0.1"));

        // SDK signals ready.
        let mut gs = fake.get_game_server_sync(&key).unwrap();
        gs.status.state = Some(GameServerState::RequestReady);
        fake.capability_set().mutator.update_game_server(gs).await.unwrap();
        assert_eq!(reconcile(&key, &ctx).await, ReconcileResult::Done);
        let gs = fake.get_game_server_sync(&key).unwrap();
        assert_eq!(gs.status.state, Some(GameServerState::Ready));
        assert_eq!(ctx.ready_cache.len(), 1);
    }

    #[tokio::test]
    async fn port_exhaustion_moves_to_error() {
        let fake = FakeSubstrate::new();
        let key = ObjectKey::new("default", "gs-1");
        fake.seed_game_server(GameServer::new(key.clone(), dynamic_port_spec()));
        let ctx = ReconcilerContext {
            port_allocator: Arc::new(PortAllocator::new(7000, 7000)),
            ..ctx(&fake)
        };
        // node-a's single port is already taken.
        ctx.port_allocator.add_node("node-a");
        ctx.port_allocator
            .allocate(GameServer::new(ObjectKey::new("default", "other"), dynamic_port_spec()))
            .unwrap();

        assert_eq!(reconcile(&key, &ctx).await, ReconcileResult::Done);
        let gs = fake.get_game_server_sync(&key).unwrap();
        assert_eq!(gs.status.state, Some(GameServerState::Error));
    }

    #[tokio::test]
    async fn deletion_with_running_pod_waits_for_pod_removal() {
        let fake = FakeSubstrate::new();
        let key = ObjectKey::new("default", "gs-1");
        let mut gs = GameServer::new(key.clone(), dynamic_port_spec());
        gs.status.state = Some(GameServerState::Ready);
        gs.meta.finalizers.push(FINALIZER.to_string());
        fake.seed_game_server(gs);
        let ctx = ctx(&fake);
        ctx.port_allocator.add_node("node-a");

        let spec = build_pod_spec(&fake.get_game_server_sync(&key).unwrap(), &ctx.sidecar, "sdk");
        fake.capability_set().mutator.create_pod(spec).await.unwrap();

        fake.capability_set().mutator.delete_game_server(&key).await.unwrap();
        assert_eq!(reconcile(&key, &ctx).await, ReconcileResult::Done);
        assert!(!fake.pod_exists(&key), "pod delete should have been issued");
        let gs = fake.get_game_server_sync(&key).unwrap();
        assert!(gs.meta.has_finalizer(), "finalizer must survive until the pod is gone");

        assert_eq!(reconcile(&key, &ctx).await, ReconcileResult::Drop);
        assert!(fake.get_game_server_sync(&key).is_none());
    }
}
