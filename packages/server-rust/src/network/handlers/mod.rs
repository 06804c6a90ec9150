//! HTTP handler definitions for the storinfo server.
//!
//! This module defines `AppState` (the shared state carried through axum
//! extractors) and re-exports all handler functions for convenient access
//! when building the router.

pub mod flush;
pub mod health;
pub mod storage_nodes;

pub use flush::flush_handler;
pub use health::{health_handler, liveness_handler, readiness_handler};
pub use storage_nodes::{
    get_eligible_handler, get_operator_handler, list_eligible_handler, list_operator_handler,
    not_found_handler, poll_handler,
};

use std::sync::Arc;
use std::time::Instant;

use super::{NetworkConfig, ServiceLifecycle};
use crate::cache::UtilizationCache;

/// Shared application state passed to all axum handlers via `State` extraction.
///
/// Holds `Arc` references to shared resources so cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    /// The utilization cache every API route reads from.
    pub cache: Arc<UtilizationCache>,
    /// Health state and in-flight tracking; owns the same cache.
    pub lifecycle: Arc<ServiceLifecycle>,
    /// Network configuration (bind address, CORS, timeouts).
    pub config: Arc<NetworkConfig>,
    /// Server process start time, used for uptime calculation.
    pub start_time: Instant,
}
