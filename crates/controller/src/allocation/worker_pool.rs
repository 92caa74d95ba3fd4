// The update-worker pool (§4.E): a fixed set of workers apply the
// reservation's metadata patch and persist the `Allocated` transition
// concurrently, so the serialized matcher's hot path stays cheap. Modeled
// on the teacher's worker-pool pattern of dispatching `(request, payload)`
// pairs with a oneshot reply channel.
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};

use common::errors::AllocationError;

use crate::domain::{AllocationRequest, GameServer, GameServerAllocationStatus};
use crate::ready_cache::ReadyCache;
use crate::substrate::Substrate;

pub struct UpdateJob {
    pub request: AllocationRequest,
    pub gs: GameServer,
    pub reply: oneshot::Sender<Result<GameServerAllocationStatus, AllocationError>>,
}

pub fn spawn_workers(
    count: usize,
    rx: mpsc::Receiver<UpdateJob>,
    substrate: Substrate,
    ready_cache: Arc<ReadyCache>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let rx = Arc::new(Mutex::new(rx));
    (0..count)
        .map(|worker_id| {
            let rx = rx.clone();
            let substrate = substrate.clone();
            let ready_cache = ready_cache.clone();
            tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    let Some(job) = job else {
                        log::info!("allocation update-worker {worker_id}: channel closed, exiting");
                        return;
                    };
                    process_job(&substrate, &ready_cache, job).await;
                }
            })
        })
        .collect()
}

async fn process_job(substrate: &Substrate, ready_cache: &ReadyCache, job: UpdateJob) {
    let UpdateJob { request, gs, reply } = job;
    let key = gs.key.clone();
    let original = gs.clone();
    let patched = ready_cache.patch_and_allocate(gs, &request);
    match substrate.mutator.update_game_server(patched).await {
        Ok(committed) => {
            if let Some(node) = &committed.status.node_name {
                ready_cache.record_allocated_on_node(node);
            }
            let status = GameServerAllocationStatus {
                game_server: committed.key.clone(),
                address: committed.status.address.clone().unwrap_or_default(),
                ports: committed.status.ports.clone(),
                metadata: request.metadata_patch.clone(),
            };
            let _ = reply.send(Ok(status));
        }
        Err(err) => {
            log::warn!("{key}: allocation patch failed ({err}), restoring to ready cache");
            ready_cache.restore(original);
            let _ = reply.send(Err(AllocationError::Contention));
        }
    }
}
