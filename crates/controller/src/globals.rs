// Shared state bundle handed to every subsystem (§10), modeled on the
// teacher's `Globals` struct: a small set of independently-locked
// components behind `Arc`, cloned by reference count into each thread
// rather than passed around piecemeal. Unlike the teacher's daemon, none
// of these components need an *outer* lock -- the port table already
// guards itself with a mutex and the ready cache with a `RwLock` -- so
// `Globals` here is just the bag of handles, not a `SafeGlobals` behind one
// more lock.
use std::sync::Arc;

use crate::allocation::AllocationHandle;
use crate::config::Config;
use crate::domain::pod::SidecarSpec;
use crate::port_allocator::PortAllocator;
use crate::rate_limiter::RateLimiter;
use crate::ready_cache::ReadyCache;
use crate::reconciler::ReconcilerQueues;
use crate::substrate::Substrate;

#[derive(Clone)]
pub struct Globals {
    pub substrate: Substrate,
    pub port_allocator: Arc<PortAllocator>,
    pub ready_cache: Arc<ReadyCache>,
    pub queues: Arc<ReconcilerQueues>,
    pub config: Arc<Config>,
    pub sidecar: SidecarSpec,
    /// Set once the allocation engine's driver loop is spawned; `None`
    /// only during the brief window between process start and the
    /// `Toplevel` subsystem wiring in `main`.
    pub allocation: Arc<tokio::sync::OnceCell<AllocationHandle>>,
    /// Guards the HTTP surfaces (webhook + allocation endpoint) from a
    /// misbehaving or compromised caller flooding the reconciler queues.
    pub http_rate_limiter: Arc<RateLimiter>,
}

impl Globals {
    pub fn new(substrate: Substrate, config: Config) -> Self {
        let sidecar = SidecarSpec {
            image: config.sidecar_image.clone(),
            always_pull: config.always_pull_sidecar,
            cpu_request: config.sidecar_cpu_request.clone(),
            cpu_limit: config.sidecar_cpu_limit.clone(),
        };
        Self {
            substrate,
            port_allocator: Arc::new(PortAllocator::new(config.min_port, config.max_port)),
            ready_cache: Arc::new(ReadyCache::new()),
            queues: Arc::new(ReconcilerQueues::new()),
            http_rate_limiter: Arc::new(
                RateLimiter::new(config.http_max_qps, config.http_max_qpm)
                    .expect("http rate limits fit the token bucket's bit fields"),
            ),
            config: Arc::new(config),
            sidecar,
            allocation: Arc::new(tokio::sync::OnceCell::new()),
        }
    }

    /// Rebuilds the port table and ready cache from observed state; called
    /// once at startup so a restarted controller never double-allocates a
    /// port or a Ready server (§6 "controller is stateless").
    pub async fn reconcile_startup(&self) -> anyhow::Result<()> {
        let nodes = self.substrate.lister.list_nodes().await?;
        let game_servers = self.substrate.lister.list_game_servers().await?;
        self.port_allocator.reconcile_startup(&nodes, &game_servers);
        crate::ready_cache::rebuild(&self.substrate, &self.ready_cache).await?;
        Ok(())
    }

    pub fn allocation_handle(&self) -> Option<AllocationHandle> {
        self.allocation.get().cloned()
    }
}
