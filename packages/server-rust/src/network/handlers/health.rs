//! Health, liveness, and readiness endpoint handlers.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;
use tracing::warn;

use super::AppState;

/// Detailed health as JSON. Always 200; `state` carries the lifecycle.
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "state": state.shutdown.health_state().as_str(),
        "in_flight": state.shutdown.in_flight_count(),
        "rate_limit_buckets": state.limiter.len(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

/// Liveness probe: the process is up.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe: 200 only while serving and the backend answers a ping.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if !state.shutdown.is_accepting() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    match state.records.ping().await {
        Ok(()) => StatusCode::OK,
        Err(err) => {
            warn!(code = err.code(), "readiness ping failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use kvstore_core::ManualClock;

    use super::*;
    use crate::admission::{RateLimitConfig, RateLimiter};
    use crate::backend::{MemoryConnector, MemorySpace};
    use crate::network::{NetworkConfig, ShutdownController};
    use crate::pool::PoolConfig;
    use crate::repository::Repository;
    use crate::service::{RecordService, ServiceConfig};

    async fn test_state() -> (AppState, Arc<MemorySpace>) {
        let space = Arc::new(MemorySpace::new());
        let repo = Repository::open(
            &MemoryConnector::new(Arc::clone(&space)),
            PoolConfig {
                size: 1,
                acquire_timeout: Duration::from_secs(1),
            },
            Arc::new(ManualClock::new(1_700_000_000)),
        )
        .await
        .unwrap();
        let state = AppState {
            records: RecordService::new(Arc::new(repo), ServiceConfig::default()),
            limiter: Arc::new(RateLimiter::new(RateLimitConfig::default())),
            shutdown: Arc::new(ShutdownController::new()),
            config: Arc::new(NetworkConfig::default()),
            start_time: Instant::now(),
        };
        (state, space)
    }

    #[tokio::test]
    async fn health_reports_state_and_counters() {
        let (state, _space) = test_state().await;
        state.shutdown.set_ready();
        let _guard = state.shutdown.in_flight_guard();

        let json = health_handler(State(state)).await.0;
        assert_eq!(json["state"], "ready");
        assert_eq!(json["in_flight"], 1);
        assert_eq!(json["rate_limit_buckets"], 0);
        assert!(json["uptime_secs"].is_number());
    }

    #[tokio::test]
    async fn liveness_always_ok() {
        assert_eq!(liveness_handler().await, StatusCode::OK);
    }

    #[tokio::test]
    async fn readiness_follows_lifecycle() {
        let (state, _space) = test_state().await;
        assert_eq!(
            readiness_handler(State(state.clone())).await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        state.shutdown.set_ready();
        assert_eq!(readiness_handler(State(state.clone())).await, StatusCode::OK);

        state.shutdown.trigger_shutdown();
        assert_eq!(
            readiness_handler(State(state)).await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn readiness_fails_when_backend_does() {
        let (state, space) = test_state().await;
        state.shutdown.set_ready();
        space.inject_failures(1);
        assert_eq!(
            readiness_handler(State(state.clone())).await,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(readiness_handler(State(state)).await, StatusCode::OK);
    }
}
