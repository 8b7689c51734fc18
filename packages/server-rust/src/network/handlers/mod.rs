//! HTTP handler definitions for the kvstore server.
//!
//! This module defines `AppState` (the shared state carried through axum
//! extractors) and re-exports all handler functions for building the router.

pub mod health;
pub mod records;

pub use health::{health_handler, liveness_handler, readiness_handler};
pub use records::{
    create_record, delete_record, empty_key, get_record, list_all_records, list_records,
    restore_record, update_record,
};

use std::sync::Arc;
use std::time::Instant;

use super::{NetworkConfig, ShutdownController};
use crate::admission::RateLimiter;
use crate::service::RecordService;

/// Shared application state passed to all axum handlers via `State` extraction.
///
/// Holds `Arc` references to shared resources so cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    /// Record operations.
    pub records: RecordService,
    /// Per-client admission control; exposed here for health reporting.
    pub limiter: Arc<RateLimiter>,
    /// Lifecycle state and in-flight tracking.
    pub shutdown: Arc<ShutdownController>,
    /// Network configuration.
    pub config: Arc<NetworkConfig>,
    /// Server process start time, used for uptime calculation.
    pub start_time: Instant,
}
