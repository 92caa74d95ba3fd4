// Component E (§4.E): the batched matchmaker. A single driver task serves
// a bounded FIFO of pending requests against a cached, periodically
// refreshed snapshot of the Ready cache, handing each match off to the
// update-worker pool for the (slower) persistence step. Structured as a
// `Runnable` so it restarts under `AutoThread` like every other long-lived
// subsystem.
pub mod remote;
pub mod retry;
pub mod worker_pool;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_graceful_shutdown::SubsystemHandle;

use common::errors::AllocationError;

use crate::domain::{AllocationPolicy, GameServer, GameServerAllocation, GameServerAllocationStatus};
use crate::ready_cache::{self, find_match, ReadyCache};
use crate::substrate::Substrate;

use worker_pool::UpdateJob;

/// Refresh threshold and idle timeout from the batching loop pseudocode
/// (§4.E).
const REFRESH_THRESHOLD: u32 = 100;
const BATCH_WAIT: Duration = Duration::from_millis(500);
const TOP_N_WINDOW: usize = 100;

struct PendingRequest {
    request: crate::domain::AllocationRequest,
    reply: oneshot::Sender<Result<GameServerAllocationStatus, AllocationError>>,
}

/// Handle used by callers (the allocation HTTP endpoint, the retry
/// wrapper) to submit requests to the driver loop.
#[derive(Clone)]
pub struct AllocationHandle {
    pending: mpsc::Sender<PendingRequest>,
}

impl AllocationHandle {
    /// A single attempt, with no retry. Callers that want the §4.E retry
    /// policy should go through [`allocate_with_retry`].
    pub async fn allocate_once(
        &self,
        request: crate::domain::AllocationRequest,
    ) -> Result<GameServerAllocationStatus, AllocationError> {
        let (reply, rx) = oneshot::channel();
        self.pending
            .send(PendingRequest { request, reply })
            .await
            .map_err(|_| AllocationError::Shutdown)?;
        rx.await.map_err(|_| AllocationError::Shutdown)?
    }
}

/// Wraps a single-attempt allocate in the 5-step/10ms/jitter-0.1 retry
/// policy, resyncing the ready cache once if every attempt is contended.
pub async fn allocate_with_retry(
    handle: &AllocationHandle,
    substrate: &Substrate,
    ready_cache: &ReadyCache,
    request: crate::domain::AllocationRequest,
) -> Result<GameServerAllocationStatus, AllocationError> {
    retry::retry_on_contention(
        || {
            let request = request.clone();
            async move { handle.allocate_once(request).await }
        },
        async {
            if let Err(e) = ready_cache::rebuild(substrate, ready_cache).await {
                log::error!("ready cache resync after contention exhaustion failed: {e:#}");
            }
        },
    )
    .await
}

/// Top-level entry point also used by the webhook's multi-cluster path:
/// allocate locally if no multi-cluster flag is set, otherwise consult
/// allocation policies and fan out to remote clusters, falling back to a
/// local attempt if a policy names the local cluster.
pub async fn allocate(
    handle: &AllocationHandle,
    substrate: &Substrate,
    ready_cache: &ReadyCache,
    local_cluster_name: &str,
    request: crate::domain::AllocationRequest,
) -> Result<GameServerAllocationStatus, AllocationError> {
    if !request.multi_cluster {
        return allocate_with_retry(handle, substrate, ready_cache, request).await;
    }
    let policies = substrate
        .lister
        .list_allocation_policies()
        .await
        .map_err(|_| AllocationError::NoReady)?;
    let has_local = policies_include_local(&policies, local_cluster_name);
    if has_local {
        if let Ok(status) =
            allocate_with_retry(handle, substrate, ready_cache, request.as_local_forward()).await
        {
            return Ok(status);
        }
    }
    let envelope = GameServerAllocation {
        request: request.clone(),
        status: None,
    };
    match remote::allocate_remote(substrate, local_cluster_name, &policies, &envelope).await {
        Ok(allocation) => allocation.status.ok_or(AllocationError::NoReady),
        Err(e) => Err(e),
    }
}

fn policies_include_local(policies: &[AllocationPolicy], local_cluster_name: &str) -> bool {
    policies
        .iter()
        .flat_map(|p| p.connections.iter())
        .any(|c| c.is_local(local_cluster_name))
}

pub struct AllocationEngine {
    substrate: Substrate,
    ready_cache: Arc<ReadyCache>,
    update_workers: usize,
}

impl AllocationEngine {
    pub fn new(substrate: Substrate, ready_cache: Arc<ReadyCache>, update_workers: usize) -> Self {
        Self {
            substrate,
            ready_cache,
            update_workers,
        }
    }

    /// Spawns the driver loop and worker pool, returning a handle callers
    /// use to submit requests. The returned join handle resolves when the
    /// subsystem is told to shut down.
    pub fn spawn(self, subsys: &SubsystemHandle) -> AllocationHandle {
        let (pending_tx, pending_rx) = mpsc::channel(1024);
        let (update_tx, update_rx) = mpsc::channel(1024);

        worker_pool::spawn_workers(
            self.update_workers,
            update_rx,
            self.substrate.clone(),
            self.ready_cache.clone(),
        );

        let ready_cache = self.ready_cache.clone();
        let subsys_clone = subsys.clone();
        tokio::spawn(async move {
            driver_loop(subsys_clone, pending_rx, update_tx, ready_cache).await;
        });

        AllocationHandle { pending: pending_tx }
    }
}

async fn driver_loop(
    subsys: SubsystemHandle,
    mut pending: mpsc::Receiver<PendingRequest>,
    update_tx: mpsc::Sender<UpdateJob>,
    ready_cache: Arc<ReadyCache>,
) {
    let mut cached_list: Vec<GameServer> = Vec::new();
    let mut processed_in_batch: u32 = 0;

    loop {
        tokio::select! {
            _ = subsys.on_shutdown_requested() => {
                log::info!("allocation engine driver shutting down");
                return;
            }
            maybe_req = pending.recv() => {
                let Some(PendingRequest { request, reply }) = maybe_req else {
                    log::info!("allocation engine: pending channel closed");
                    return;
                };
                if processed_in_batch >= REFRESH_THRESHOLD {
                    cached_list.clear();
                    processed_in_batch = 0;
                }
                if cached_list.is_empty() {
                    cached_list = ready_cache.list_sorted();
                }
                let Some(match_idx) = find_match(&request, &cached_list, TOP_N_WINDOW) else {
                    let _ = reply.send(Err(AllocationError::NoReady));
                    continue;
                };
                let gs = cached_list.remove(match_idx);
                match ready_cache.remove(&gs.key) {
                    Err(_) => {
                        let _ = reply.send(Err(AllocationError::Contention));
                        continue;
                    }
                    Ok(gs) => {
                        let job = UpdateJob { request, gs, reply };
                        if update_tx.send(job).await.is_err() {
                            log::error!("allocation engine: update-worker channel closed");
                            return;
                        }
                        processed_in_batch += 1;
                    }
                }
            }
            _ = tokio::time::sleep(BATCH_WAIT), if !cached_list.is_empty() => {
                cached_list.clear();
                processed_in_batch = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{GameServerSpec, GameServerState, HealthCheck, LabelSelector, MetadataPatch, ObjectKey};
    use crate::substrate::fake::FakeSubstrate;
    use tokio_graceful_shutdown::Toplevel;

    fn spec() -> GameServerSpec {
        GameServerSpec {
            container_image: "img".into(),
            ports: vec![],
            health_check: HealthCheck::default(),
            dev_address: None,
            service_account: None,
        }
    }

    fn ready_gs(name: &str) -> GameServer {
        let mut gs = GameServer::new(ObjectKey::new("default", name), spec());
        gs.status.state = Some(GameServerState::Ready);
        gs.status.node_name = Some("node-a".into());
        gs.status.address = Some("10.0.0.1".into());
        gs
    }

    #[tokio::test]
    async fn contention_among_many_requests_never_double_allocates() {
        let fake = FakeSubstrate::new();
        for i in 0..10 {
            fake.seed_game_server(ready_gs(&format!("gs-{i}")));
        }
        let caps = fake.capability_set();
        let ready_cache = Arc::new(ReadyCache::new());
        ready_cache::rebuild(&caps, &ready_cache).await.unwrap();

        let result = Toplevel::new()
            .start("driver", move |subsys| {
                let ready_cache = ready_cache.clone();
                let caps = caps.clone();
                async move {
                    let engine = AllocationEngine::new(caps, ready_cache, 4);
                    let handle = engine.spawn(&subsys);

                    let mut join_set = tokio::task::JoinSet::new();
                    for i in 0..50 {
                        let handle = handle.clone();
                        join_set.spawn(async move {
                            let request = crate::domain::AllocationRequest {
                                id: format!("req-{i}"),
                                required: LabelSelector::default(),
                                preferred: vec![],
                                metadata_patch: MetadataPatch::default(),
                                multi_cluster: false,
                            };
                            handle.allocate_once(request).await
                        });
                    }
                    let mut allocated_keys = std::collections::HashSet::new();
                    let mut ok_count = 0;
                    while let Some(res) = join_set.join_next().await {
                        if let Ok(Ok(status)) = res {
                            ok_count += 1;
                            assert!(allocated_keys.insert(status.game_server));
                        }
                    }
                    assert_eq!(ok_count, 10);
                    Ok::<(), anyhow::Error>(())
                }
            })
            .handle_shutdown_requests(Duration::from_millis(200))
            .await;
        result.unwrap();
    }
}
