//! Listener settings consumed by [`super::NetworkModule`].

use std::path::PathBuf;
use std::time::Duration;

/// Everything the HTTP front end needs to bind and serve.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub host: String,
    /// `0` binds an ephemeral port; [`super::NetworkModule::start`] reports it.
    pub port: u16,
    /// Serve HTTPS instead of plain HTTP when set.
    pub tls: Option<TlsConfig>,
    /// Origins echoed by the CORS layer; `*` matches all.
    pub cors_origins: Vec<String>,
    /// Requests running longer are answered with 408.
    pub request_timeout: Duration,
    /// Upper bound on the wait for in-flight requests after shutdown starts.
    pub drain_timeout: Duration,
    /// Bodies above this size get 413 before any handler runs.
    pub max_body_bytes: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            tls: None,
            cors_origins: vec!["*".to_string()],
            request_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(30),
            max_body_bytes: 2 * 1024 * 1024,
        }
    }
}

/// PEM files for the rustls acceptor. Both paths are required.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}
