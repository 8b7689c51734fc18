//! Backend capability: the narrow set of keyed operations the repository
//! needs from the external store.
//!
//! The repository never sees a concrete driver. It talks to a
//! [`BackendConnection`] lent by the [`ConnectionPool`](crate::pool::ConnectionPool),
//! which in turn opens connections through a [`Connector`]. Rows travel as
//! positional [`Tuple`]s of msgpack values, matching the layout in [`field`].
//!
//! Implementations:
//! - [`memory`]: in-process space, the default backend and the test double
//! - `postgres` (feature `postgres`): one `sqlx` connection per pool slot

use async_trait::async_trait;

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::{ConnectionStats, MemoryConnection, MemoryConnector, MemorySpace};

/// A stored row: positional msgpack values, see [`field`] for the layout.
pub type Tuple = Vec<rmpv::Value>;

/// Field positions within a stored [`Tuple`].
pub mod field {
    pub const KEY: usize = 0;
    pub const VALUE: usize = 1;
    pub const CREATED_AT: usize = 2;
    pub const UPDATED_AT: usize = 3;
    pub const DELETED_AT: usize = 4;
    pub const IS_DELETED: usize = 5;
    /// Number of fields in a well-formed tuple.
    pub const COUNT: usize = 6;
}

/// Which rows a [`Select`] or count addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// Primary index, equality on the key.
    Key(String),
    /// Primary index, every row in key order.
    All,
    /// Secondary index partitioned by the `is_deleted` flag, in key order.
    Deleted(bool),
}

/// A windowed read over one index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Select {
    pub selector: Selector,
    pub offset: u64,
    pub limit: u64,
}

impl Select {
    /// Point lookup by primary key.
    #[must_use]
    pub fn by_key(key: &str) -> Self {
        Self {
            selector: Selector::Key(key.to_string()),
            offset: 0,
            limit: 1,
        }
    }

    /// Paginated scan over the given selector.
    #[must_use]
    pub fn page(selector: Selector, offset: u64, limit: u64) -> Self {
        Self {
            selector,
            offset,
            limit,
        }
    }
}

/// Field assignment applied by [`BackendConnection::update`].
#[derive(Debug, Clone, PartialEq)]
pub struct Assign {
    pub field: usize,
    pub value: rmpv::Value,
}

impl Assign {
    #[must_use]
    pub fn new(field: usize, value: impl Into<rmpv::Value>) -> Self {
        Self {
            field,
            value: value.into(),
        }
    }
}

/// Precondition checked atomically with an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    /// Apply unconditionally.
    None,
    /// Apply only if the stored `is_deleted` flag equals the given value.
    DeletedIs(bool),
}

/// Result of a keyed update.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// The update ran; carries the row as stored afterwards.
    Applied(Tuple),
    /// No row with that key.
    Missing,
    /// The row exists but the [`Guard`] did not hold; nothing changed.
    GuardFailed,
}

/// Failures reported by a backend connection.
///
/// These never cross the repository boundary; they are logged there and
/// collapsed into the domain taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("failed to connect to backend: {0}")]
    Connect(String),
    #[error("duplicate key: {key}")]
    Conflict { key: String },
    #[error("backend protocol error: {0}")]
    Protocol(String),
    #[error("backend i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("backend connection is closed")]
    Closed,
}

/// One live connection to the backend store.
///
/// Every method is a single round trip and is atomic per key on the backend.
/// Connections are not shared: the pool hands each one to a single task at a
/// time, hence `&mut self`.
#[async_trait]
pub trait BackendConnection: Send + 'static {
    /// Insert a new row. Fails with [`BackendError::Conflict`] if the key exists.
    async fn insert(&mut self, tuple: Tuple) -> Result<Tuple, BackendError>;

    /// Read the rows addressed by `query`, in key order.
    async fn select(&mut self, query: &Select) -> Result<Vec<Tuple>, BackendError>;

    /// Count the rows addressed by `selector`.
    async fn count(&mut self, selector: &Selector) -> Result<u64, BackendError>;

    /// Apply field assignments to the row with `key` if `guard` holds.
    async fn update(
        &mut self,
        key: &str,
        ops: &[Assign],
        guard: Guard,
    ) -> Result<UpdateOutcome, BackendError>;

    /// Insert or fully overwrite a row.
    async fn replace(&mut self, tuple: Tuple) -> Result<Tuple, BackendError>;

    /// Cheap round trip used by readiness checks.
    async fn ping(&mut self) -> Result<(), BackendError>;

    /// Close the connection, releasing backend resources.
    fn close(self)
    where
        Self: Sized;
}

/// Opens new backend connections for the pool.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: BackendConnection;

    /// Establish one ready-to-use connection.
    async fn connect(&self) -> Result<Self::Connection, BackendError>;
}

/// Builds a tuple in the canonical field order.
#[must_use]
pub fn tuple(
    key: &str,
    value: &str,
    created_at: impl Into<rmpv::Value>,
    updated_at: impl Into<rmpv::Value>,
    deleted_at: impl Into<rmpv::Value>,
    is_deleted: bool,
) -> Tuple {
    vec![
        rmpv::Value::from(key),
        rmpv::Value::from(value),
        created_at.into(),
        updated_at.into(),
        deleted_at.into(),
        rmpv::Value::Boolean(is_deleted),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuple_uses_canonical_layout() {
        let t = tuple("k", "v", 1u32, 2u32, 0u32, false);
        assert_eq!(t.len(), field::COUNT);
        assert_eq!(t[field::KEY].as_str(), Some("k"));
        assert_eq!(t[field::VALUE].as_str(), Some("v"));
        assert_eq!(t[field::CREATED_AT].as_u64(), Some(1));
        assert_eq!(t[field::UPDATED_AT].as_u64(), Some(2));
        assert_eq!(t[field::DELETED_AT].as_u64(), Some(0));
        assert_eq!(t[field::IS_DELETED].as_bool(), Some(false));
    }

    #[test]
    fn select_by_key_is_a_point_read() {
        let q = Select::by_key("a");
        assert_eq!(q.selector, Selector::Key("a".to_string()));
        assert_eq!(q.offset, 0);
        assert_eq!(q.limit, 1);
    }
}
