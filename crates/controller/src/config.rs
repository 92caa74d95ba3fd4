// Process-wide configuration (§6, §10). A `clap::Parser` struct with `env`
// fallbacks on every field, the way the teacher's `main.rs` wires its
// `Command` enum -- but this binary has one real mode of operation, so it
// is a flat struct behind a single `run` subcommand rather than an enum of
// subcommands.
use clap::{Args, Parser};

#[derive(Parser)]
#[clap(
    name = "gameserver-controller",
    about = "Orchestrates game-server pods: port allocation, health, and matchmaking allocation",
    rename_all = "kebab-case",
    author,
    version
)]
pub enum Command {
    #[clap(name = "run")]
    Run(Config),
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    /// Lowest host port handed out by the Port Allocator.
    #[clap(long, env = "GAMESERVER_MIN_PORT", default_value_t = 7000)]
    pub min_port: u16,

    /// Highest host port handed out by the Port Allocator (inclusive).
    #[clap(long, env = "GAMESERVER_MAX_PORT", default_value_t = 8000)]
    pub max_port: u16,

    #[clap(long, env = "GAMESERVER_SIDECAR_IMAGE", default_value = "gameserver-sdk-sidecar:latest")]
    pub sidecar_image: String,

    #[clap(long, env = "GAMESERVER_SIDECAR_ALWAYS_PULL")]
    pub always_pull_sidecar: bool,

    #[clap(long, env = "GAMESERVER_SIDECAR_CPU_REQUEST", default_value = "100m")]
    pub sidecar_cpu_request: String,

    #[clap(long, env = "GAMESERVER_SIDECAR_CPU_LIMIT", default_value = "200m")]
    pub sidecar_cpu_limit: String,

    #[clap(long, env = "GAMESERVER_SDK_SERVICE_ACCOUNT", default_value = "gameserver-sdk")]
    pub sdk_service_account: String,

    /// Local cluster name, used to decide which allocation-policy
    /// connections are "local" versus remote forwards.
    #[clap(long, env = "GAMESERVER_CLUSTER_NAME", default_value = "default")]
    pub cluster_name: String,

    /// Worker count per reconciler queue (creation, deletion, general).
    #[clap(long, env = "GAMESERVER_QUEUE_WORKERS", default_value_t = 4)]
    pub queue_workers: usize,

    /// Update-worker pool size for the allocation engine's persistence step.
    #[clap(long, env = "GAMESERVER_UPDATE_WORKERS", default_value_t = 4)]
    pub update_workers: usize,

    #[clap(long, env = "GAMESERVER_WEBHOOK_BIND", default_value = "0.0.0.0:8443")]
    pub webhook_bind: String,

    #[clap(long, env = "GAMESERVER_ALLOCATION_BIND", default_value = "0.0.0.0:8444")]
    pub allocation_bind: String,

    #[clap(long, env = "GAMESERVER_LOG_FILTER", default_value = "info")]
    pub log_filter: String,

    /// Per-process cap on admission/allocation HTTP requests per second.
    /// 0 disables the limit.
    #[clap(long, env = "GAMESERVER_HTTP_MAX_QPS", default_value_t = 200)]
    pub http_max_qps: u32,

    /// Per-process cap on admission/allocation HTTP requests per minute.
    /// 0 disables the limit.
    #[clap(long, env = "GAMESERVER_HTTP_MAX_QPM", default_value_t = 6000)]
    pub http_max_qpm: u32,
}
