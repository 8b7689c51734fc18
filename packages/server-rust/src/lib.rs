//! `kvstore` server: HTTP API over a pooled backend repository with
//! per-client admission control.

pub mod admission;
pub mod backend;
pub mod config;
pub mod metrics;
pub mod network;
pub mod pool;
pub mod repository;
pub mod service;
pub mod telemetry;
pub mod traits;

pub use admission::{RateLimitConfig, RateLimiter};
pub use config::ServerArgs;
pub use network::NetworkModule;
pub use pool::{ConnectionPool, PoolConfig};
pub use repository::Repository;
pub use service::{RecordService, ServiceConfig};
pub use traits::RecordRepository;
