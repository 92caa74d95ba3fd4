// Component D (§4.D, §5): wires the three work queues to the pipeline and
// exposes the whole thing as a `Runnable` subsystem, the same shape as the
// health controller and allocation engine so `main.rs` starts every
// long-lived piece the same way.
pub mod admission;
pub mod pipeline;
pub mod pod_spec;
pub mod queue;

use std::sync::Arc;

use tokio_graceful_shutdown::SubsystemHandle;

use crate::domain::{GameServer, GameServerState, ObjectKey};
use pipeline::{ReconcileResult, ReconcilerContext};
use queue::WorkQueue;

/// Picks the queue a key belongs in from the record's current state (§5).
/// Deletion takes priority over state: a record mid-deletion always goes to
/// `deletion` regardless of which state it was in when the delete arrived.
fn route(gs: &GameServer) -> QueueName {
    if gs.is_deleting() {
        return QueueName::Deletion;
    }
    match gs.status.state {
        Some(GameServerState::Shutdown) => QueueName::Deletion,
        Some(GameServerState::PortAllocation) | Some(GameServerState::Creating) => QueueName::Creation,
        _ => QueueName::General,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueName {
    Creation,
    Deletion,
    General,
}

pub struct ReconcilerQueues {
    creation: Arc<WorkQueue<ObjectKey>>,
    deletion: Arc<WorkQueue<ObjectKey>>,
    general: Arc<WorkQueue<ObjectKey>>,
}

impl ReconcilerQueues {
    pub fn new() -> Self {
        Self {
            creation: WorkQueue::new(),
            deletion: WorkQueue::new(),
            general: WorkQueue::new(),
        }
    }

    /// Entry point for every external signal that should trigger a
    /// reconcile: a watch event on the record itself, or a pod-driven event
    /// naming it. Looked up against `ctx` to route by current state, since
    /// the caller (a watch handler) only has the key.
    pub async fn enqueue(&self, key: ObjectKey, ctx: &ReconcilerContext) {
        let queue = match ctx.substrate.lister.get_game_server(&key).await {
            Ok(gs) => route(&gs),
            Err(_) => QueueName::General,
        };
        match queue {
            QueueName::Creation => self.creation.enqueue(key),
            QueueName::Deletion => self.deletion.enqueue(key),
            QueueName::General => self.general.enqueue(key),
        }
    }
}

impl Default for ReconcilerQueues {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs `worker_count` pollers against one queue until the subsystem is
/// told to stop. Mirrors the update-worker pool's shared-receiver shape but
/// each queue keeps its own `WorkQueue` rather than a raw channel, since
/// de-duplication lives there.
async fn run_queue_workers(
    subsys: SubsystemHandle,
    name: &'static str,
    queue: Arc<WorkQueue<ObjectKey>>,
    ctx: Arc<ReconcilerContext>,
    worker_count: usize,
) {
    let mut handles = Vec::with_capacity(worker_count);
    for worker_id in 0..worker_count {
        let queue = queue.clone();
        let ctx = ctx.clone();
        let subsys = subsys.clone();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = subsys.on_shutdown_requested() => return,
                    dequeued = queue.dequeue() => {
                        let Some(key) = dequeued else { return };
                        match pipeline::reconcile(&key, &ctx).await {
                            ReconcileResult::Done => queue.finish_ok(key),
                            ReconcileResult::Requeue => queue.finish_retry(key),
                            ReconcileResult::Drop => queue.finish_drop(key),
                        }
                    }
                }
            }
        }));
    }
    log::info!("{name} queue: {worker_count} worker(s) started");
    for handle in handles {
        let _ = handle.await;
    }
}

pub struct ReconcilerEngine {
    ctx: Arc<ReconcilerContext>,
    queues: Arc<ReconcilerQueues>,
    workers_per_queue: usize,
}

impl ReconcilerEngine {
    pub fn new(ctx: ReconcilerContext, queues: Arc<ReconcilerQueues>, workers_per_queue: usize) -> Self {
        Self {
            ctx: Arc::new(ctx),
            queues,
            workers_per_queue,
        }
    }

    pub fn spawn(self, subsys: &SubsystemHandle) {
        for (name, queue) in [
            ("creation", self.queues.creation.clone()),
            ("deletion", self.queues.deletion.clone()),
            ("general", self.queues.general.clone()),
        ] {
            let subsys = subsys.clone();
            let ctx = self.ctx.clone();
            let workers = self.workers_per_queue;
            tokio::spawn(run_queue_workers(subsys, name, queue, ctx, workers));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{GameServerSpec, HealthCheck};

    fn gs_with_state(state: Option<GameServerState>) -> GameServer {
        let mut gs = GameServer::new(
            ObjectKey::new("default", "gs-1"),
            GameServerSpec {
                container_image: "img".into(),
                ports: vec![],
                health_check: HealthCheck::default(),
                dev_address: None,
                service_account: None,
            },
        );
        gs.status.state = state;
        gs
    }

    #[test]
    fn routes_port_allocation_and_creating_to_creation_queue() {
        assert_eq!(route(&gs_with_state(Some(GameServerState::PortAllocation))), QueueName::Creation);
        assert_eq!(route(&gs_with_state(Some(GameServerState::Creating))), QueueName::Creation);
    }

    #[test]
    fn routes_shutdown_to_deletion_queue() {
        assert_eq!(route(&gs_with_state(Some(GameServerState::Shutdown))), QueueName::Deletion);
    }

    #[test]
    fn deletion_timestamp_always_wins_over_state() {
        let mut gs = gs_with_state(Some(GameServerState::Ready));
        gs.meta.deletion_timestamp = Some(1);
        assert_eq!(route(&gs), QueueName::Deletion);
    }

    #[test]
    fn everything_else_routes_to_general() {
        assert_eq!(route(&gs_with_state(Some(GameServerState::Starting))), QueueName::General);
        assert_eq!(route(&gs_with_state(None)), QueueName::General);
    }
}
