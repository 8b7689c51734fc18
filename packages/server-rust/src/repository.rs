//! Record repository over a pooled backend.
//!
//! Every operation borrows one connection through
//! [`ConnectionPool::execute`], so multi-step protocols (hard delete,
//! restore) run on a single connection. Backend failures are logged here
//! and collapsed into [`KvError::Database`]; pool exhaustion and closure
//! surface as [`KvError::PoolTimeout`] and [`KvError::PoolClosed`].
//!
//! Rows are decoded by [`decode_record`], a total function over
//! [`Tuple`]s: anything it does not recognise is a decode error, never a
//! panic or a silently defaulted field.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kvstore_core::clock::from_unix_secs;
use kvstore_core::{ClockSource, KvError, KvResult, Page, PageRequest, Record};
use tracing::{debug, error};

use crate::backend::{
    field, tuple, Assign, BackendConnection, BackendError, Connector, Guard, Select, Selector,
    Tuple, UpdateOutcome,
};
use crate::pool::{ConnectionPool, PoolConfig, PoolError};
use crate::traits::RecordRepository;

// ---------------------------------------------------------------------------
// Tuple decoding
// ---------------------------------------------------------------------------

/// Why a stored tuple could not be turned into a [`Record`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("expected {expected} fields, found {found}")]
    Arity { expected: usize, found: usize },
    #[error("field `{field}` is not a {expected}")]
    FieldType {
        field: &'static str,
        expected: &'static str,
    },
    #[error("field `{field}` holds a negative timestamp")]
    NegativeTimestamp { field: &'static str },
    #[error("field `{field}` holds an out-of-range timestamp")]
    TimestampRange { field: &'static str },
    #[error("deletion flag is {is_deleted} but deleted_at is {deleted_at}")]
    DeletionMismatch { is_deleted: bool, deleted_at: u64 },
}

fn string_field(tuple: &Tuple, idx: usize, name: &'static str) -> Result<String, DecodeError> {
    tuple[idx]
        .as_str()
        .map(str::to_owned)
        .ok_or(DecodeError::FieldType {
            field: name,
            expected: "string",
        })
}

/// Seconds since the epoch from any msgpack integer width or signedness.
fn epoch_secs(tuple: &Tuple, idx: usize, name: &'static str) -> Result<u64, DecodeError> {
    let value = &tuple[idx];
    if let Some(secs) = value.as_u64() {
        return Ok(secs);
    }
    match value.as_i64() {
        Some(_) => Err(DecodeError::NegativeTimestamp { field: name }),
        None => Err(DecodeError::FieldType {
            field: name,
            expected: "integer",
        }),
    }
}

fn timestamp(secs: u64, name: &'static str) -> Result<DateTime<Utc>, DecodeError> {
    i64::try_from(secs)
        .ok()
        .and_then(from_unix_secs)
        .ok_or(DecodeError::TimestampRange { field: name })
}

/// Decodes a stored tuple into a [`Record`].
///
/// Layout: `[key, value, created_at, updated_at, deleted_at, is_deleted]`.
/// A zero `deleted_at` means "not deleted" and is only accepted together with
/// a false flag; a set flag requires a non-zero timestamp.
///
/// # Errors
///
/// Returns a [`DecodeError`] for wrong arity, wrong field types, negative or
/// unrepresentable timestamps, or a flag/timestamp mismatch.
pub fn decode_record(tuple: &Tuple) -> Result<Record, DecodeError> {
    if tuple.len() != field::COUNT {
        return Err(DecodeError::Arity {
            expected: field::COUNT,
            found: tuple.len(),
        });
    }

    let key = string_field(tuple, field::KEY, "key")?;
    let value = string_field(tuple, field::VALUE, "value")?;
    let created_at = timestamp(
        epoch_secs(tuple, field::CREATED_AT, "created_at")?,
        "created_at",
    )?;
    let updated_at = timestamp(
        epoch_secs(tuple, field::UPDATED_AT, "updated_at")?,
        "updated_at",
    )?;
    let deleted_secs = epoch_secs(tuple, field::DELETED_AT, "deleted_at")?;
    let is_deleted = tuple[field::IS_DELETED]
        .as_bool()
        .ok_or(DecodeError::FieldType {
            field: "is_deleted",
            expected: "boolean",
        })?;

    let deleted_at = match (is_deleted, deleted_secs) {
        (false, 0) => None,
        (true, secs) if secs != 0 => Some(timestamp(secs, "deleted_at")?),
        (is_deleted, deleted_at) => {
            return Err(DecodeError::DeletionMismatch {
                is_deleted,
                deleted_at,
            })
        }
    };

    Ok(Record {
        key,
        value,
        created_at,
        updated_at,
        deleted_at,
        is_deleted,
    })
}

fn decoded(op: &'static str, tuple: &Tuple) -> KvResult<Record> {
    decode_record(tuple).map_err(|err| {
        error!(op, error = %err, "stored record failed to decode");
        KvError::Database
    })
}

fn backend_failure(op: &'static str, err: &BackendError) -> KvError {
    error!(op, error = %err, "backend operation failed");
    KvError::Database
}

#[allow(clippy::cast_sign_loss)]
fn secs_of(ts: DateTime<Utc>) -> u64 {
    ts.timestamp().max(0) as u64
}

async fn fetch_one<C: BackendConnection>(
    conn: &mut C,
    op: &'static str,
    query: &Select,
) -> KvResult<Option<Tuple>> {
    conn.select(query)
        .await
        .map(|mut rows| rows.pop())
        .map_err(|err| backend_failure(op, &err))
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

/// [`RecordRepository`] over a [`ConnectionPool`].
pub struct Repository<K: Connector> {
    pool: ConnectionPool<K>,
    clock: Arc<dyn ClockSource>,
}

impl<K: Connector> Repository<K> {
    #[must_use]
    pub fn new(pool: ConnectionPool<K>, clock: Arc<dyn ClockSource>) -> Self {
        Self { pool, clock }
    }

    /// Opens a pool through `connector` and wraps it.
    ///
    /// # Errors
    ///
    /// Propagates [`PoolError`] from opening the pool.
    pub async fn open(
        connector: &K,
        config: PoolConfig,
        clock: Arc<dyn ClockSource>,
    ) -> Result<Self, PoolError> {
        let pool = ConnectionPool::open(connector, config).await?;
        Ok(Self::new(pool, clock))
    }

    /// The underlying pool, for observability.
    #[must_use]
    pub fn pool(&self) -> &ConnectionPool<K> {
        &self.pool
    }

    fn now(&self) -> KvResult<u64> {
        let secs = self.clock.now_secs();
        match u64::try_from(secs) {
            Ok(secs) if secs > 0 => Ok(secs),
            _ => {
                error!(secs, "clock reads before the Unix epoch");
                Err(KvError::Database)
            }
        }
    }

    async fn list_by(&self, op: &'static str, selector: Selector, page: PageRequest) -> KvResult<Page<Record>> {
        let query = Select::page(
            selector.clone(),
            u64::try_from(page.offset).unwrap_or(0),
            u64::try_from(page.limit).unwrap_or(0),
        );
        let (rows, total) = self
            .pool
            .execute(move |conn| {
                Box::pin(async move {
                    let rows = conn
                        .select(&query)
                        .await
                        .map_err(|err| backend_failure(op, &err))?;
                    let total = conn
                        .count(&selector)
                        .await
                        .map_err(|err| backend_failure(op, &err))?;
                    Ok::<_, KvError>((rows, total))
                })
            })
            .await?;

        let items = rows
            .iter()
            .map(|row| decoded(op, row))
            .collect::<KvResult<Vec<_>>>()?;
        Ok(Page {
            items,
            total,
            limit: page.limit,
            offset: page.offset,
        })
    }
}

#[async_trait]
impl<K: Connector> RecordRepository for Repository<K> {
    async fn create(&self, key: &str, value: &str) -> KvResult<Record> {
        let now = self.now()?;
        let row = tuple(key, value, now, now, 0u64, false);
        let stored = self
            .pool
            .execute(move |conn| {
                Box::pin(async move {
                    conn.insert(row).await.map_err(|err| match err {
                        BackendError::Conflict { .. } => KvError::KeyAlreadyExists,
                        other => backend_failure("create", &other),
                    })
                })
            })
            .await?;
        debug!(key, "record created");
        decoded("create", &stored)
    }

    async fn get(&self, key: &str) -> KvResult<Record> {
        let record = self.get_including_deleted(key).await?;
        if record.is_deleted {
            return Err(KvError::KeyNotFound);
        }
        Ok(record)
    }

    async fn get_including_deleted(&self, key: &str) -> KvResult<Record> {
        let query = Select::by_key(key);
        let row = self
            .pool
            .execute(move |conn| Box::pin(async move { fetch_one(conn, "get", &query).await }))
            .await?;
        match row {
            Some(row) => decoded("get", &row),
            None => Err(KvError::KeyNotFound),
        }
    }

    async fn update(&self, key: &str, value: &str) -> KvResult<Record> {
        let now = self.now()?;
        let key = key.to_owned();
        let ops = [
            Assign::new(field::VALUE, value),
            Assign::new(field::UPDATED_AT, now),
        ];
        let outcome = self
            .pool
            .execute(move |conn| {
                Box::pin(async move {
                    conn.update(&key, &ops, Guard::DeletedIs(false))
                        .await
                        .map_err(|err| backend_failure("update", &err))
                })
            })
            .await?;
        match outcome {
            UpdateOutcome::Applied(row) => decoded("update", &row),
            UpdateOutcome::Missing | UpdateOutcome::GuardFailed => Err(KvError::KeyNotFound),
        }
    }

    async fn soft_delete(&self, key: &str) -> KvResult<()> {
        let now = self.now()?;
        let key = key.to_owned();
        let ops = [
            Assign::new(field::UPDATED_AT, now),
            Assign::new(field::DELETED_AT, now),
            Assign::new(field::IS_DELETED, true),
        ];
        let outcome = self
            .pool
            .execute(move |conn| {
                Box::pin(async move {
                    conn.update(&key, &ops, Guard::None)
                        .await
                        .map_err(|err| backend_failure("soft_delete", &err))
                })
            })
            .await?;
        match outcome {
            UpdateOutcome::Applied(_) => Ok(()),
            UpdateOutcome::Missing | UpdateOutcome::GuardFailed => Err(KvError::KeyNotFound),
        }
    }

    async fn delete(&self, key: &str) -> KvResult<Record> {
        let now = self.now()?;
        let query = Select::by_key(key);
        // Read-then-replace without a guard: an update landing between the
        // two round trips is overwritten with the value read here.
        let stored = self
            .pool
            .execute(move |conn| {
                Box::pin(async move {
                    let current = fetch_one(conn, "delete", &query)
                        .await?
                        .ok_or(KvError::KeyNotFound)?;
                    let current = decoded("delete", &current)?;
                    let row = tuple(
                        &current.key,
                        &current.value,
                        secs_of(current.created_at),
                        secs_of(current.updated_at),
                        now,
                        true,
                    );
                    conn.replace(row)
                        .await
                        .map_err(|err| backend_failure("delete", &err))
                })
            })
            .await?;
        decoded("delete", &stored)
    }

    async fn restore(&self, key: &str) -> KvResult<Record> {
        let now = self.now()?;
        let query = Select::by_key(key);
        let key = key.to_owned();
        let ops = [
            Assign::new(field::UPDATED_AT, now),
            Assign::new(field::DELETED_AT, 0u64),
            Assign::new(field::IS_DELETED, false),
        ];
        let outcome = self
            .pool
            .execute(move |conn| {
                Box::pin(async move {
                    let current = fetch_one(conn, "restore", &query)
                        .await?
                        .ok_or(KvError::KeyNotFound)?;
                    if !decoded("restore", &current)?.is_deleted {
                        return Err(KvError::NotDeleted);
                    }
                    conn.update(&key, &ops, Guard::DeletedIs(true))
                        .await
                        .map_err(|err| backend_failure("restore", &err))
                })
            })
            .await?;
        match outcome {
            UpdateOutcome::Applied(row) => decoded("restore", &row),
            UpdateOutcome::GuardFailed => Err(KvError::NotDeleted),
            UpdateOutcome::Missing => Err(KvError::KeyNotFound),
        }
    }

    async fn list(&self, page: PageRequest) -> KvResult<Page<Record>> {
        self.list_by("list", Selector::Deleted(false), page).await
    }

    async fn list_including_deleted(&self, page: PageRequest) -> KvResult<Page<Record>> {
        self.list_by("list_including_deleted", Selector::All, page)
            .await
    }

    async fn ping(&self) -> KvResult<()> {
        self.pool
            .execute(|conn| {
                Box::pin(async move {
                    conn.ping()
                        .await
                        .map_err(|err| backend_failure("ping", &err))
                })
            })
            .await
    }

    async fn close(&self) {
        self.pool.close();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
