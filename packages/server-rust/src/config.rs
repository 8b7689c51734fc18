//! Process configuration: command-line flags with environment fallbacks.
//!
//! [`ServerArgs`] is the flat, user-facing surface; the accessor methods
//! split it into the per-component config structs each module owns.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::admission::RateLimitConfig;
use crate::network::{NetworkConfig, TlsConfig};
use crate::pool::{PoolConfig, DEFAULT_POOL_SIZE};
use crate::service::{ServiceConfig, DEFAULT_MAX_VALUE_BYTES};

/// Deployment environment; selects the log format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Environment {
    Development,
    Production,
}

/// Which store backs the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// In-process store; contents are lost on exit.
    Memory,
    /// PostgreSQL through `sqlx` (requires the `postgres` feature).
    Postgres,
}

/// Configuration errors detected before anything is started.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("KV_DATABASE_URL is required for the postgres backend")]
    MissingDatabaseUrl,
    #[error("pool size must be at least 1")]
    EmptyPool,
    #[error("burst must be at least 1")]
    ZeroBurst,
    #[error("max_buckets must be at least 1")]
    ZeroBuckets,
}

/// Key-value record server.
#[derive(Debug, Clone, Parser)]
#[command(name = "kv-server", version, about = "Key-value record store over HTTP")]
pub struct ServerArgs {
    /// Bind address.
    #[arg(long, env = "KV_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Listen port; 0 lets the OS choose.
    #[arg(long, env = "KV_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Deployment environment.
    #[arg(long, env = "KV_ENV", value_enum, default_value_t = Environment::Development)]
    pub environment: Environment,

    /// Storage backend.
    #[arg(long, env = "KV_BACKEND", value_enum, default_value_t = BackendKind::Memory)]
    pub backend: BackendKind,

    /// Connection string for the postgres backend.
    #[arg(long, env = "KV_DATABASE_URL")]
    pub database_url: Option<String>,

    /// Backend connections opened at startup.
    #[arg(long, env = "KV_POOL_SIZE", default_value_t = DEFAULT_POOL_SIZE)]
    pub pool_size: usize,

    /// Longest wait for an idle backend connection, in milliseconds.
    #[arg(long, env = "KV_POOL_ACQUIRE_TIMEOUT_MS", default_value_t = 5_000)]
    pub pool_acquire_timeout_ms: u64,

    /// Tokens added to each client's bucket per second.
    #[arg(long, env = "KV_RATE", default_value_t = 100)]
    pub rate: u32,

    /// Bucket capacity per client.
    #[arg(long, env = "KV_BURST", default_value_t = 200)]
    pub burst: u32,

    /// Upper bound on tracked client identities.
    #[arg(long, env = "KV_MAX_BUCKETS", default_value_t = 100_000)]
    pub max_buckets: usize,

    /// Seconds a bucket may sit unused before it can be evicted.
    #[arg(long, env = "KV_BUCKET_IDLE_SECS", default_value_t = 600)]
    pub bucket_idle_secs: u64,

    /// Seconds between idle bucket sweeps.
    #[arg(long, env = "KV_SWEEP_INTERVAL_SECS", default_value_t = 60)]
    pub sweep_interval_secs: u64,

    /// Largest accepted record value, in bytes.
    #[arg(long, env = "KV_MAX_VALUE_BYTES", default_value_t = DEFAULT_MAX_VALUE_BYTES)]
    pub max_value_bytes: usize,

    /// Per-request processing limit, in seconds.
    #[arg(long, env = "KV_REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    pub request_timeout_secs: u64,

    /// How long shutdown waits for in-flight requests, in seconds.
    #[arg(long, env = "KV_DRAIN_TIMEOUT_SECS", default_value_t = 30)]
    pub drain_timeout_secs: u64,

    /// Allowed CORS origins, comma separated; `*` allows any.
    #[arg(long, env = "KV_CORS_ORIGINS", value_delimiter = ',', default_value = "*")]
    pub cors_origins: Vec<String>,

    /// PEM certificate chain; enables TLS together with `--tls-key`.
    #[arg(long, env = "KV_TLS_CERT", requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key.
    #[arg(long, env = "KV_TLS_KEY", requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,
}

impl ServerArgs {
    /// Rejects combinations that would fail later at startup.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend == BackendKind::Postgres && self.database_url.is_none() {
            return Err(ConfigError::MissingDatabaseUrl);
        }
        if self.pool_size == 0 {
            return Err(ConfigError::EmptyPool);
        }
        if self.burst == 0 {
            return Err(ConfigError::ZeroBurst);
        }
        if self.max_buckets == 0 {
            return Err(ConfigError::ZeroBuckets);
        }
        Ok(())
    }

    #[must_use]
    pub fn network(&self) -> NetworkConfig {
        let tls = match (&self.tls_cert, &self.tls_key) {
            (Some(cert_path), Some(key_path)) => Some(TlsConfig {
                cert_path: cert_path.clone(),
                key_path: key_path.clone(),
            }),
            _ => None,
        };
        NetworkConfig {
            host: self.host.clone(),
            port: self.port,
            tls,
            cors_origins: self.cors_origins.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
            ..NetworkConfig::default()
        }
    }

    #[must_use]
    pub fn pool(&self) -> PoolConfig {
        PoolConfig {
            size: self.pool_size,
            acquire_timeout: Duration::from_millis(self.pool_acquire_timeout_ms),
        }
    }

    #[must_use]
    pub fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            rate: self.rate,
            burst: self.burst,
            max_buckets: self.max_buckets,
            idle_ttl: Duration::from_secs(self.bucket_idle_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
        }
    }

    #[must_use]
    pub fn service(&self) -> ServiceConfig {
        ServiceConfig {
            max_value_bytes: self.max_value_bytes,
        }
    }
}
