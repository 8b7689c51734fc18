//! Network module with deferred startup lifecycle.
//!
//! `new()` assembles shared state, `start()` binds the TCP listener, and
//! `serve()` accepts connections until the shutdown future resolves, then
//! drains in-flight requests.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::{NetworkConfig, TlsConfig};
use super::handlers::{
    create_record, delete_record, empty_key, get_record, health_handler, list_all_records,
    list_records, liveness_handler, readiness_handler, restore_record, update_record, AppState,
};
use super::middleware::{build_http_layers, track_in_flight};
use super::shutdown::ShutdownController;
use crate::admission::{RateLimitLayer, RateLimiter};
use crate::service::RecordService;

/// Assembles the full router for the given state.
///
/// Routes:
/// - `GET /health`, `GET /health/live`, `GET /health/ready`
/// - `POST /api/v1/kv`, `GET /api/v1/kv`, `GET /api/v1/kv/all`
/// - `GET | PUT | DELETE /api/v1/kv/{key}`, and `/api/v1/kv/` (400 `invalid_key`)
/// - `POST /api/v1/kv/{key}/restore`
///
/// The API routes sit behind in-flight tracking and admission control;
/// the health routes only get the transport layers.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/v1/kv", post(create_record).get(list_records))
        .route("/api/v1/kv/all", get(list_all_records))
        .route("/api/v1/kv/", get(empty_key).put(empty_key).delete(empty_key))
        .route(
            "/api/v1/kv/{key}",
            get(get_record).put(update_record).delete(delete_record),
        )
        .route("/api/v1/kv/{key}/restore", post(restore_record))
        .layer(RateLimitLayer::new(Arc::clone(&state.limiter)))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state.shutdown),
            track_in_flight,
        ));

    let layers = build_http_layers(&state.config);

    Router::new()
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .merge(api)
        .layer(layers)
        .with_state(state)
}

/// Owns the HTTP server lifecycle.
pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    records: RecordService,
    limiter: Arc<RateLimiter>,
    shutdown: Arc<ShutdownController>,
    start_time: Instant,
}

impl NetworkModule {
    /// Creates the module without binding any port.
    #[must_use]
    pub fn new(config: NetworkConfig, records: RecordService, limiter: Arc<RateLimiter>) -> Self {
        Self {
            config,
            listener: None,
            records,
            limiter,
            shutdown: Arc::new(ShutdownController::new()),
            start_time: Instant::now(),
        }
    }

    /// Shared lifecycle controller, for signal handlers and tests.
    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    fn state(&self) -> AppState {
        AppState {
            records: self.records.clone(),
            limiter: Arc::clone(&self.limiter),
            shutdown: Arc::clone(&self.shutdown),
            config: Arc::new(self.config.clone()),
            start_time: self.start_time,
        }
    }

    /// The router this module serves.
    pub fn router(&self) -> Router {
        build_router(self.state())
    }

    /// Binds the TCP listener and returns the bound port (which differs
    /// from the configured one when that is 0).
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        info!(host = %self.config.host, port, "TCP listener bound");

        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves until `shutdown` resolves, then drains in-flight requests.
    ///
    /// When `shutdown` fires the state moves to `Draining` (readiness turns
    /// 503, API routes refuse new requests); after the listener stops, up to
    /// `drain_timeout` is spent waiting for requests still in flight.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called, TLS material cannot be
    /// loaded, or the server hits a fatal I/O error.
    pub async fn serve(
        mut self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow::anyhow!("start() must be called before serve()"))?;
        let router = self.router();
        let controller = Arc::clone(&self.shutdown);
        let signal = {
            let controller = Arc::clone(&controller);
            async move {
                shutdown.await;
                info!("shutdown requested, draining");
                controller.trigger_shutdown();
            }
        };

        controller.set_ready();

        match &self.config.tls {
            Some(tls) => serve_tls(listener, router, tls, signal).await?,
            None => serve_plain(listener, router, signal).await?,
        }

        controller.trigger_shutdown();
        if controller.wait_for_drain(self.config.drain_timeout).await {
            info!("all in-flight requests drained");
        } else {
            warn!(
                remaining = controller.in_flight_count(),
                "drain timeout expired with in-flight requests remaining"
            );
        }
        Ok(())
    }
}

async fn serve_plain(
    listener: TcpListener,
    router: Router,
    signal: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    info!("serving plain HTTP");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(signal)
    .await?;
    Ok(())
}

/// Serves TLS using `axum-server` with rustls, reusing the bound listener.
async fn serve_tls(
    listener: TcpListener,
    router: Router,
    tls: &TlsConfig,
    signal: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    use axum_server::tls_rustls::RustlsConfig;

    let rustls_config = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
        .await
        .map_err(|e| anyhow::anyhow!("failed to load TLS certificates: {e}"))?;

    let addr = listener.local_addr()?;
    let std_listener = listener.into_std()?;
    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();

    tokio::spawn(async move {
        signal.await;
        shutdown_handle.graceful_shutdown(None);
    });

    info!(%addr, "serving TLS");

    axum_server::from_tcp_rustls(std_listener, rustls_config)
        .handle(handle)
        .serve(router.into_make_service_with_connect_info::<SocketAddr>())
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use kvstore_core::ManualClock;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::admission::RateLimitConfig;
    use crate::backend::{MemoryConnector, MemorySpace};
    use crate::network::HealthState;
    use crate::pool::PoolConfig;
    use crate::repository::Repository;
    use crate::service::ServiceConfig;

    async fn module(config: NetworkConfig) -> NetworkModule {
        let repo = Repository::open(
            &MemoryConnector::new(Arc::new(MemorySpace::new())),
            PoolConfig::default(),
            Arc::new(ManualClock::new(1_700_000_000)),
        )
        .await
        .unwrap();
        NetworkModule::new(
            config,
            RecordService::new(Arc::new(repo), ServiceConfig::default()),
            Arc::new(RateLimiter::new(RateLimitConfig::default())),
        )
    }

    fn local() -> NetworkConfig {
        NetworkConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..NetworkConfig::default()
        }
    }

    #[tokio::test]
    async fn new_does_not_bind() {
        let module = module(local()).await;
        assert!(module.listener.is_none());
        assert_eq!(
            module.shutdown_controller().health_state(),
            HealthState::Starting
        );
    }

    #[tokio::test]
    async fn start_binds_to_os_assigned_port() {
        let mut module = module(local()).await;
        let port = module.start().await.unwrap();
        assert!(port > 0);
        assert!(module.listener.is_some());
    }

    #[tokio::test]
    async fn serve_without_start_is_an_error() {
        let module = module(local()).await;
        let err = module.serve(std::future::pending::<()>()).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn serves_until_shutdown_then_stops() {
        let mut module = module(local()).await;
        let port = module.start().await.unwrap();
        let controller = module.shutdown_controller();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let server = tokio::spawn(module.serve(async {
            let _ = rx.await;
        }));

        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        stream
            .write_all(b"GET /health/live HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert_eq!(controller.health_state(), HealthState::Ready);

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(controller.health_state(), HealthState::Stopped);
    }
}
