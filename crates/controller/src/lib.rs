pub mod allocation;
pub(crate) mod basic_types;
pub mod app_error;
pub mod config;
pub mod domain;
pub mod globals;
pub mod health_controller;
pub mod port_allocator;
pub mod rate_limiter;
pub mod ready_cache;
pub mod reconciler;
pub mod substrate;
pub mod webhook;
