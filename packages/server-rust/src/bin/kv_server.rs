//! `kv-server`: HTTP key-value record store.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use kvstore_core::SystemClock;
use kvstore_server::admission::{BucketSweeper, RateLimiter};
use kvstore_server::backend::{MemoryConnector, MemorySpace};
use kvstore_server::config::{BackendKind, ServerArgs};
use kvstore_server::{metrics, telemetry, NetworkModule, RecordRepository, RecordService, Repository};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ServerArgs::parse();
    telemetry::init_tracing(args.environment)?;
    args.validate()?;
    metrics::register();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        backend = ?args.backend,
        pool_size = args.pool_size,
        "starting kv-server"
    );

    let repo = open_repository(&args).await?;
    let records = RecordService::new(repo, args.service());
    let limiter = Arc::new(RateLimiter::new(args.rate_limit()));
    let mut sweeper = BucketSweeper::spawn(Arc::clone(&limiter));

    let mut network = NetworkModule::new(args.network(), records.clone(), limiter);
    let port = network.start().await.context("failed to bind listener")?;
    info!(port, "listening");

    let served = network.serve(shutdown_signal()).await;

    sweeper.stop().await;
    records.close().await;
    info!("kv-server stopped");
    served
}

async fn open_repository(args: &ServerArgs) -> anyhow::Result<Arc<dyn RecordRepository>> {
    let clock = Arc::new(SystemClock);
    match args.backend {
        BackendKind::Memory => {
            let connector = MemoryConnector::new(Arc::new(MemorySpace::new()));
            let repo = Repository::open(&connector, args.pool(), clock)
                .await
                .context("failed to open memory backend")?;
            Ok(Arc::new(repo))
        }
        BackendKind::Postgres => open_postgres(args, clock).await,
    }
}

#[cfg(feature = "postgres")]
async fn open_postgres(
    args: &ServerArgs,
    clock: Arc<SystemClock>,
) -> anyhow::Result<Arc<dyn RecordRepository>> {
    use kvstore_server::backend::postgres::PgConnector;

    let url = args
        .database_url
        .as_deref()
        .context("KV_DATABASE_URL is required for the postgres backend")?;
    let connector = PgConnector::new(url);
    connector
        .migrate()
        .await
        .context("failed to prepare postgres schema")?;
    let repo = Repository::open(&connector, args.pool(), clock)
        .await
        .context("failed to open postgres pool")?;
    Ok(Arc::new(repo))
}

#[cfg(not(feature = "postgres"))]
async fn open_postgres(
    _args: &ServerArgs,
    _clock: Arc<SystemClock>,
) -> anyhow::Result<Arc<dyn RecordRepository>> {
    anyhow::bail!("kv-server was built without the `postgres` feature")
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl-C"),
        () = terminate => info!("received SIGTERM"),
    }
}
