//! Fixed-size connection pool over a [`Connector`].
//!
//! All `size` connections are opened eagerly by [`ConnectionPool::open`]; the
//! pool never reconnects. Idle connections sit in a LIFO stack whose length is
//! mirrored by the permits of a [`Semaphore`], so waiting for a connection is
//! waiting for a permit and is bounded by `acquire_timeout`.
//!
//! A [`PooledConnection`] guard returns its connection on drop, which covers
//! success, error, panic unwind and cancellation of the borrowing future.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use kvstore_core::KvError;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::backend::{BackendConnection, BackendError, Connector};
use crate::metrics as kv_metrics;

/// Default number of backend connections.
pub const DEFAULT_POOL_SIZE: usize = 10;

/// Default bound on waiting for an idle connection.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// PoolConfig / PoolError
// ---------------------------------------------------------------------------

/// Pool sizing and wait bounds.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of connections opened at startup. Must be at least 1.
    pub size: usize,
    /// Longest time `acquire` waits for an idle connection.
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_POOL_SIZE,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }
}

/// Failures of the pool itself.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("pool size must be at least 1")]
    InvalidSize,
    #[error("failed to open pool connection: {0}")]
    Connect(#[source] BackendError),
    #[error("timed out waiting for a pooled connection")]
    Timeout,
    #[error("connection pool is closed")]
    Closed,
}

impl From<PoolError> for KvError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Timeout => KvError::PoolTimeout,
            PoolError::Closed => KvError::PoolClosed,
            PoolError::InvalidSize | PoolError::Connect(_) => KvError::Database,
        }
    }
}

// ---------------------------------------------------------------------------
// ConnectionPool
// ---------------------------------------------------------------------------

struct IdleSet<C> {
    closed: bool,
    conns: Vec<C>,
}

struct PoolInner<C> {
    config: PoolConfig,
    idle: Mutex<IdleSet<C>>,
    /// One permit per connection in `idle`.
    permits: Semaphore,
    in_use: AtomicUsize,
}

/// Bounded pool of backend connections. Cheap to clone.
pub struct ConnectionPool<K: Connector> {
    inner: Arc<PoolInner<K::Connection>>,
}

impl<K: Connector> Clone for ConnectionPool<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: Connector> std::fmt::Debug for ConnectionPool<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("size", &self.size())
            .field("idle", &self.idle_count())
            .field("in_use", &self.in_use())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<K: Connector> ConnectionPool<K> {
    /// Opens `config.size` connections through `connector`.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidSize`] for a zero size, or
    /// [`PoolError::Connect`] if any connection fails to open. In the latter
    /// case every connection opened so far is closed before returning.
    pub async fn open(connector: &K, config: PoolConfig) -> Result<Self, PoolError> {
        if config.size == 0 {
            return Err(PoolError::InvalidSize);
        }

        let mut conns = Vec::with_capacity(config.size);
        for i in 0..config.size {
            match connector.connect().await {
                Ok(conn) => conns.push(conn),
                Err(err) => {
                    warn!(
                        opened = i,
                        size = config.size,
                        error = %err,
                        "pool construction failed, closing opened connections"
                    );
                    for conn in conns {
                        conn.close();
                    }
                    return Err(PoolError::Connect(err));
                }
            }
        }

        info!(
            size = config.size,
            acquire_timeout_ms = u64::try_from(config.acquire_timeout.as_millis()).unwrap_or(u64::MAX),
            "connection pool opened"
        );

        let permits = Semaphore::new(conns.len());
        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                idle: Mutex::new(IdleSet {
                    closed: false,
                    conns,
                }),
                permits,
                in_use: AtomicUsize::new(0),
            }),
        })
    }

    /// Borrows a connection, waiting up to `acquire_timeout` for one to
    /// become idle.
    ///
    /// # Errors
    ///
    /// [`PoolError::Closed`] if the pool is closed (immediately, or while
    /// waiting); [`PoolError::Timeout`] if no connection became idle in time.
    pub async fn acquire(&self) -> Result<PooledConnection<K>, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }

        let started = tokio::time::Instant::now();
        let permit =
            match tokio::time::timeout(self.inner.config.acquire_timeout, self.inner.permits.acquire())
                .await
            {
                Err(_elapsed) => {
                    kv_metrics::pool_acquire_timeout();
                    debug!(
                        in_use = self.in_use(),
                        "timed out waiting for a pooled connection"
                    );
                    return Err(PoolError::Timeout);
                }
                Ok(Err(_semaphore_closed)) => return Err(PoolError::Closed),
                Ok(Ok(permit)) => permit,
            };
        // The permit stands for one entry in `idle`; it is restored by
        // `release` when a connection is pushed back.
        permit.forget();

        let conn = {
            let mut idle = self.inner.idle.lock();
            if idle.closed {
                None
            } else {
                idle.conns.pop()
            }
        };
        let Some(conn) = conn else {
            return Err(PoolError::Closed);
        };

        self.inner.in_use.fetch_add(1, Ordering::SeqCst);
        kv_metrics::pool_acquire_wait(started.elapsed());
        Ok(PooledConnection {
            conn: Some(conn),
            pool: self.clone(),
        })
    }

    /// Returns a connection to the idle set.
    ///
    /// If the pool is closed or the idle set is already full, the connection
    /// is closed instead.
    pub fn release(&self, conn: K::Connection) {
        let rejected = {
            let mut idle = self.inner.idle.lock();
            if idle.closed || idle.conns.len() >= self.inner.config.size {
                Some(conn)
            } else {
                idle.conns.push(conn);
                None
            }
        };

        match rejected {
            Some(conn) => {
                debug!("closing released connection");
                conn.close();
            }
            None => self.inner.permits.add_permits(1),
        }
    }

    /// Runs `f` with a borrowed connection. The connection is returned to the
    /// pool exactly once, on every exit path, before this returns.
    ///
    /// # Errors
    ///
    /// Acquisition failures are converted into `E`; otherwise returns
    /// whatever `f` returns.
    pub async fn execute<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut K::Connection) -> BoxFuture<'c, Result<T, E>>,
        E: From<PoolError>,
    {
        let mut conn = self.acquire().await?;
        let result = f(&mut *conn).await;
        drop(conn);
        result
    }

    /// Closes the pool. Idempotent.
    ///
    /// Waiters are woken with [`PoolError::Closed`]; idle connections are
    /// closed now and borrowed ones as they are released.
    pub fn close(&self) {
        let drained = {
            let mut idle = self.inner.idle.lock();
            if idle.closed {
                return;
            }
            idle.closed = true;
            std::mem::take(&mut idle.conns)
        };
        self.inner.permits.close();

        let count = drained.len();
        for conn in drained {
            conn.close();
        }
        info!(
            closed_idle = count,
            in_use = self.in_use(),
            "connection pool closed"
        );
    }

    /// Configured number of connections.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.config.size
    }

    /// Connections currently idle.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().conns.len()
    }

    /// Connections currently borrowed.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.inner.in_use.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.idle.lock().closed
    }
}

// ---------------------------------------------------------------------------
// PooledConnection
// ---------------------------------------------------------------------------

/// A borrowed connection. Returned to its pool on drop.
pub struct PooledConnection<K: Connector> {
    conn: Option<K::Connection>,
    pool: ConnectionPool<K>,
}

impl<K: Connector> std::fmt::Debug for PooledConnection<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection").finish_non_exhaustive()
    }
}

impl<K: Connector> PooledConnection<K> {
    /// Takes the connection out of the pool's accounting.
    ///
    /// The pool stays one connection short until the caller hands it back
    /// with [`ConnectionPool::release`]. Closing the returned connection
    /// discards it for good.
    #[must_use]
    pub fn detach(mut self) -> K::Connection {
        self.pool.inner.in_use.fetch_sub(1, Ordering::SeqCst);
        // `conn` is always `Some` until drop or detach.
        match self.conn.take() {
            Some(conn) => conn,
            None => unreachable!("pooled connection taken twice"),
        }
    }
}

impl<K: Connector> Deref for PooledConnection<K> {
    type Target = K::Connection;

    fn deref(&self) -> &Self::Target {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<K: Connector> DerefMut for PooledConnection<K> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<K: Connector> Drop for PooledConnection<K> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.inner.in_use.fetch_sub(1, Ordering::SeqCst);
            self.pool.release(conn);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
