// Component C (§4.C): observes pod/node health and preempts unhealthy game
// servers into the `Unhealthy` terminal state, bypassing the normal
// reconciler pipeline. Structured as a `Runnable` the same way the
// teacher's monitor subsystems are, so it restarts cleanly on panic under
// `AutoThread`.
use std::collections::HashSet;
use std::sync::Arc;

use crate::domain::{GameServer, GameServerState};
use crate::ready_cache::ReadyCache;
use crate::substrate::{EventSeverity, Substrate};

/// Applies the health-transition bypass rule (§4.C): `Shutdown` is already
/// terminal and never re-marked; `Allocated` is preserved as a source state
/// (it becomes `Unhealthy`, never implicitly `Ready` again) but is the only
/// non-bypassed state that still transitions.
pub fn should_mark_unhealthy(gs: &GameServer) -> bool {
    if gs.is_deleting() {
        return false;
    }
    match gs.status.state {
        Some(GameServerState::Shutdown) | Some(GameServerState::Unhealthy) => false,
        Some(_) => true,
        None => false,
    }
}

pub struct HealthController {
    substrate: Substrate,
    ready_cache: Arc<ReadyCache>,
}

impl HealthController {
    pub fn new(substrate: Substrate, ready_cache: Arc<ReadyCache>) -> Self {
        Self { substrate, ready_cache }
    }

    /// One sweep: lists pods and nodes, and transitions every game server
    /// whose backing pod has a non-recoverable failure, or whose node has
    /// disappeared, to `Unhealthy`.
    pub async fn sweep(&self) -> anyhow::Result<usize> {
        let pods = self.substrate.lister.list_pods().await?;
        let nodes = self.substrate.lister.list_nodes().await?;
        let live_nodes: HashSet<&str> = nodes.iter().map(|n| n.name.as_str()).collect();
        let game_servers = self.substrate.lister.list_game_servers().await?;

        let mut transitioned = 0;
        for gs in game_servers {
            if !should_mark_unhealthy(&gs) {
                continue;
            }
            let pod = pods.iter().find(|p| p.key == gs.key);
            let pod_unhealthy = pod.is_some_and(|p| p.has_non_recoverable_failure());
            let node_gone = gs
                .status
                .node_name
                .as_ref()
                .is_some_and(|n| !live_nodes.contains(n.as_str()));
            if !pod_unhealthy && !node_gone {
                continue;
            }
            self.mark_unhealthy(gs, pod_unhealthy, node_gone).await?;
            transitioned += 1;
        }
        Ok(transitioned)
    }

    async fn mark_unhealthy(
        &self,
        mut gs: GameServer,
        pod_unhealthy: bool,
        node_gone: bool,
    ) -> anyhow::Result<()> {
        let reason = match (pod_unhealthy, node_gone) {
            (true, _) => "PodUnhealthy",
            (_, true) => "NodeLost",
            _ => unreachable!("caller only invokes on one of these"),
        };
        gs.status.state = Some(GameServerState::Unhealthy);
        let key = gs.key.clone();
        // Best-effort: the server may never have been Ready (e.g. it was
        // already Allocated), in which case there is nothing to evict.
        let _ = self.ready_cache.remove(&key);
        self.substrate.mutator.update_game_server(gs).await?;
        self.substrate.events.record(
            &key,
            EventSeverity::Warning,
            reason,
            "health controller marked game server unhealthy",
        );
        log::warn!("{key}: marked Unhealthy ({reason})");
        Ok(())
    }
}

impl HealthController {
    /// Wraps the sweep loop in `AutoThread` and starts it as a subsystem,
    /// the same shape `ReconcilerEngine::spawn` and `AllocationEngine::spawn`
    /// use so `main` never has to know which components auto-restart.
    pub fn spawn(self: Arc<Self>, subsys: &tokio_graceful_shutdown::SubsystemHandle) {
        use crate::basic_types::{AutoThread, Runnable};
        let auto = AutoThread::<HealthControllerThread, Arc<HealthController>>::new("health-controller".into(), self);
        let subsys = subsys.clone();
        tokio::spawn(async move {
            if let Err(e) = auto.run(subsys).await {
                log::error!("health controller subsystem exited: {e:#}");
            }
        });
    }
}

#[async_trait::async_trait]
impl crate::basic_types::Runnable<Arc<HealthController>> for HealthControllerThread {
    fn new(name: String, params: Arc<HealthController>) -> Self {
        Self { name, controller: params }
    }

    async fn run(self, subsys: tokio_graceful_shutdown::SubsystemHandle) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = subsys.on_shutdown_requested() => {
                    log::info!("{} shutting down", self.name);
                    return Ok(());
                }
                _ = interval.tick() => {
                    match self.controller.sweep().await {
                        Ok(0) => {}
                        Ok(n) => log::info!("{}: marked {n} game server(s) unhealthy", self.name),
                        Err(e) => log::error!("{}: health sweep failed: {e:#}", self.name),
                    }
                }
            }
        }
    }
}

pub struct HealthControllerThread {
    name: String,
    controller: Arc<HealthController>,
}

impl Clone for HealthControllerThread {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            controller: self.controller.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::pod::SidecarSpec;
    use crate::domain::{GameServerSpec, HealthCheck, Node, NodeAddress, NodeAddressKind, ObjectKey};
    use crate::reconciler::pod_spec::build_pod_spec;
    use crate::substrate::fake::FakeSubstrate;

    fn spec() -> GameServerSpec {
        GameServerSpec {
            container_image: "img".into(),
            ports: vec![],
            health_check: HealthCheck::default(),
            dev_address: None,
            service_account: None,
        }
    }

    fn sidecar() -> SidecarSpec {
        SidecarSpec {
            image: "sdk-sidecar:latest".into(),
            always_pull: false,
            cpu_request: "100m".into(),
            cpu_limit: "200m".into(),
        }
    }

    #[tokio::test]
    async fn pod_failure_marks_unhealthy() {
        let fake = FakeSubstrate::new();
        let key = ObjectKey::new("default", "gs-1");
        let mut gs = GameServer::new(key.clone(), spec());
        gs.status.state = Some(GameServerState::Ready);
        gs.status.node_name = Some("node-a".into());
        fake.seed_game_server(gs);
        fake.seed_node(Node {
            name: "node-a".into(),
            addresses: vec![NodeAddress {
                kind: NodeAddressKind::ExternalIp,
                address: "10.0.0.1".into(),
            }],
        });
        let caps = fake.capability_set();
        let spec = build_pod_spec(&fake.get_game_server_sync(&key).unwrap(), &sidecar(), "sdk-default");
        caps.mutator.create_pod(spec).await.unwrap();
        fake.set_pod_scheduled(&key, "node-a");
        fake.fail_pod(&key);

        let controller = HealthController::new(caps, Arc::new(ReadyCache::new()));
        let n = controller.sweep().await.unwrap();
        assert_eq!(n, 1);
        let updated = fake.get_game_server_sync(&key).unwrap();
        assert_eq!(updated.status.state, Some(GameServerState::Unhealthy));
    }

    #[tokio::test]
    async fn node_loss_marks_unhealthy() {
        let fake = FakeSubstrate::new();
        let key = ObjectKey::new("default", "gs-1");
        let mut gs = GameServer::new(key.clone(), spec());
        gs.status.state = Some(GameServerState::Allocated);
        gs.status.node_name = Some("node-gone".into());
        fake.seed_game_server(gs);
        let controller = HealthController::new(fake.capability_set(), Arc::new(ReadyCache::new()));
        let n = controller.sweep().await.unwrap();
        assert_eq!(n, 1);
        let updated = fake.get_game_server_sync(&key).unwrap();
        assert_eq!(updated.status.state, Some(GameServerState::Unhealthy));
    }

    #[test]
    fn shutdown_is_never_reclassified() {
        let mut gs = GameServer::new(
            ObjectKey::new("default", "gs-1"),
            spec(),
        );
        gs.status.state = Some(GameServerState::Shutdown);
        assert!(!should_mark_unhealthy(&gs));
    }
}
