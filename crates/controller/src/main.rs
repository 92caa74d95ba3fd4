// main.rs does:
//  - Validate command line.
//  - Logging setup.
//  - Top level subsystem starting:
//     - Reconciler queues (creation, deletion, general)
//     - Allocation engine (driver + update-worker pool)
//     - Health controller
//     - Webhook HTTP server (/mutate, /validate)
//     - Allocation HTTP server (remote-cluster forwarding target)
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use env_logger::{Builder, Env};
use tokio_graceful_shutdown::{SubsystemHandle, Toplevel};

use gameserver_controller::config::{Command, Config};
use gameserver_controller::globals::Globals;
use gameserver_controller::health_controller::HealthController;
use gameserver_controller::substrate::fake::FakeSubstrate;
use gameserver_controller::{allocation, reconciler, webhook};

impl Command {
    pub async fn execute(self) -> Result<()> {
        match self {
            Command::Run(config) => run(config).await,
        }
    }
}

async fn run(config: Config) -> Result<()> {
    let queue_workers = config.queue_workers;
    let update_workers = config.update_workers;
    let webhook_bind = config.webhook_bind.clone();
    let allocation_bind = config.allocation_bind.clone();

    // No live substrate client exists for this binary; it is driven through
    // the same capability-set seam the fake serves tests through.
    let substrate = FakeSubstrate::new().capability_set();
    let globals = Globals::new(substrate, config);
    globals.reconcile_startup().await?;

    Toplevel::new()
        .start("reconciler", {
            let globals = globals.clone();
            move |subsys| reconciler_subsystem(subsys, globals, queue_workers)
        })
        .start("allocation-engine", {
            let globals = globals.clone();
            move |subsys| allocation_subsystem(subsys, globals, update_workers)
        })
        .start("health-controller", {
            let globals = globals.clone();
            move |subsys| async move {
                let controller = Arc::new(HealthController::new(globals.substrate.clone(), globals.ready_cache.clone()));
                controller.spawn(&subsys);
                subsys.on_shutdown_requested().await;
                Ok(())
            }
        })
        .start("webhook-server", {
            let globals = globals.clone();
            move |subsys| http_server(subsys, webhook_bind, webhook::webhook_router(globals))
        })
        .start("allocation-server", {
            let globals = globals.clone();
            move |subsys| http_server(subsys, allocation_bind, webhook::allocation_router(globals))
        })
        .catch_signals()
        .handle_shutdown_requests(std::time::Duration::from_millis(1000))
        .await
        .map_err(Into::into)
}

async fn reconciler_subsystem(subsys: SubsystemHandle, globals: Globals, workers_per_queue: usize) -> Result<()> {
    let ctx = reconciler::pipeline::ReconcilerContext {
        substrate: globals.substrate.clone(),
        port_allocator: globals.port_allocator.clone(),
        ready_cache: globals.ready_cache.clone(),
        sidecar: globals.sidecar.clone(),
        default_service_account: globals.config.sdk_service_account.clone(),
    };
    reconciler::ReconcilerEngine::new(ctx, globals.queues.clone(), workers_per_queue).spawn(&subsys);
    subsys.on_shutdown_requested().await;
    Ok(())
}

async fn allocation_subsystem(subsys: SubsystemHandle, globals: Globals, update_workers: usize) -> Result<()> {
    let engine = allocation::AllocationEngine::new(globals.substrate.clone(), globals.ready_cache.clone(), update_workers);
    let handle = engine.spawn(&subsys);
    globals
        .allocation
        .set(handle)
        .map_err(|_| anyhow::anyhow!("allocation engine started twice"))?;
    subsys.on_shutdown_requested().await;
    Ok(())
}

async fn http_server(subsys: SubsystemHandle, bind: String, router: axum::Router) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    log::info!("listening on {bind}");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            subsys.on_shutdown_requested().await;
        })
        .await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    #[cfg(windows)]
    colored::control::set_virtual_terminal(true).unwrap();

    let cmd = Command::parse();
    let log_filter = match &cmd {
        Command::Run(config) => config.log_filter.clone(),
    };
    Builder::from_env(Env::default().default_filter_or(log_filter)).init();

    match cmd.execute().await {
        Ok(_) => (),
        Err(err) => {
            println!("{}", err.to_string().red());
            std::process::exit(1);
        }
    }
}
