//! In-process backend: a single ordered space shared by all connections.
//!
//! [`MemorySpace`] mirrors the persisted layout of the external store: a
//! primary index on `key` and a secondary index partitioned by the
//! `is_deleted` flag, both iterated in key order. [`MemoryConnector`] hands
//! out [`MemoryConnection`]s over one shared space, which makes it both the
//! ephemeral production backend and the test double for the repository.
//!
//! Fault injection hooks ([`MemorySpace::inject_failures`],
//! [`MemoryConnector::refuse_after`]) let tests exercise the failure paths
//! of the pool and repository without a live store.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::trace;

use super::{
    field, Assign, BackendConnection, BackendError, Connector, Guard, Select, Selector, Tuple,
    UpdateOutcome,
};

#[derive(Debug, Default)]
struct SpaceState {
    rows: BTreeMap<String, Tuple>,
    live: BTreeSet<String>,
    deleted: BTreeSet<String>,
}

impl SpaceState {
    fn index_for(&mut self, flag: bool) -> &mut BTreeSet<String> {
        if flag {
            &mut self.deleted
        } else {
            &mut self.live
        }
    }

    fn reindex(&mut self, key: &str, old: Option<bool>, new: bool) {
        if let Some(old) = old {
            if old == new {
                return;
            }
            self.index_for(old).remove(key);
        }
        self.index_for(new).insert(key.to_string());
    }
}

/// Ordered in-memory space with a primary and a deleted-flag index.
#[derive(Debug, Default)]
pub struct MemorySpace {
    state: RwLock<SpaceState>,
    pending_failures: AtomicU32,
}

impl MemorySpace {
    /// Creates a new, empty space.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` requests (on any connection) fail with an
    /// I/O error, as a dropped backend link would.
    pub fn inject_failures(&self, count: u32) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Number of stored rows, live and soft-deleted.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().rows.len()
    }

    /// Returns `true` if no rows are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().rows.is_empty()
    }

    /// Raw stored row, bypassing any connection. Used by tests to inspect
    /// or seed exact wire values.
    #[must_use]
    pub fn raw(&self, key: &str) -> Option<Tuple> {
        self.state.read().rows.get(key).cloned()
    }

    /// Stores a raw row, bypassing validation of timestamp fields.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Protocol`] if the tuple has no string key or
    /// no boolean deletion flag.
    pub fn put_raw(&self, tuple: Tuple) -> Result<(), BackendError> {
        let (key, flag) = identity_of(&tuple)?;
        let mut state = self.state.write();
        let old = state.rows.insert(key.clone(), tuple).map(|t| flag_of(&t));
        state.reindex(&key, old.flatten(), flag);
        Ok(())
    }

    fn check_fault(&self) -> Result<(), BackendError> {
        let taken = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if taken.is_ok() {
            return Err(BackendError::Io(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "injected backend failure",
            )));
        }
        Ok(())
    }

    fn insert(&self, tuple: Tuple) -> Result<Tuple, BackendError> {
        let (key, flag) = identity_of(&tuple)?;
        let mut state = self.state.write();
        if state.rows.contains_key(&key) {
            return Err(BackendError::Conflict { key });
        }
        state.rows.insert(key.clone(), tuple.clone());
        state.reindex(&key, None, flag);
        Ok(tuple)
    }

    fn select(&self, query: &Select) -> Vec<Tuple> {
        let state = self.state.read();
        let offset = usize::try_from(query.offset).unwrap_or(usize::MAX);
        let limit = usize::try_from(query.limit).unwrap_or(usize::MAX);
        match &query.selector {
            Selector::Key(key) => state
                .rows
                .get(key)
                .into_iter()
                .skip(offset)
                .take(limit)
                .cloned()
                .collect(),
            Selector::All => state.rows.values().skip(offset).take(limit).cloned().collect(),
            Selector::Deleted(flag) => {
                let index = if *flag { &state.deleted } else { &state.live };
                index
                    .iter()
                    .skip(offset)
                    .take(limit)
                    .filter_map(|k| state.rows.get(k).cloned())
                    .collect()
            }
        }
    }

    fn count(&self, selector: &Selector) -> u64 {
        let state = self.state.read();
        let n = match selector {
            Selector::Key(key) => usize::from(state.rows.contains_key(key)),
            Selector::All => state.rows.len(),
            Selector::Deleted(true) => state.deleted.len(),
            Selector::Deleted(false) => state.live.len(),
        };
        n as u64
    }

    fn update(&self, key: &str, ops: &[Assign], guard: Guard) -> Result<UpdateOutcome, BackendError> {
        for op in ops {
            if op.field == field::KEY || op.field >= field::COUNT {
                return Err(BackendError::Protocol(format!(
                    "field {} cannot be updated",
                    op.field
                )));
            }
            if op.field == field::IS_DELETED && op.value.as_bool().is_none() {
                return Err(BackendError::Protocol(
                    "is_deleted must be a boolean".to_string(),
                ));
            }
        }

        let mut state = self.state.write();
        let Some(row) = state.rows.get_mut(key) else {
            return Ok(UpdateOutcome::Missing);
        };
        let old_flag = flag_of(row);
        if let Guard::DeletedIs(expected) = guard {
            if old_flag != Some(expected) {
                return Ok(UpdateOutcome::GuardFailed);
            }
        }
        if row.len() < field::COUNT {
            row.resize(field::COUNT, rmpv::Value::Nil);
        }
        for op in ops {
            row[op.field] = op.value.clone();
        }
        let updated = row.clone();
        if let Some(new_flag) = flag_of(&updated) {
            state.reindex(key, old_flag, new_flag);
        }
        Ok(UpdateOutcome::Applied(updated))
    }

    fn replace(&self, tuple: Tuple) -> Result<Tuple, BackendError> {
        let (key, flag) = identity_of(&tuple)?;
        let mut state = self.state.write();
        let old = state
            .rows
            .insert(key.clone(), tuple.clone())
            .and_then(|t| flag_of(&t));
        state.reindex(&key, old, flag);
        Ok(tuple)
    }
}

fn flag_of(tuple: &Tuple) -> Option<bool> {
    tuple.get(field::IS_DELETED).and_then(rmpv::Value::as_bool)
}

fn identity_of(tuple: &Tuple) -> Result<(String, bool), BackendError> {
    let key = tuple
        .get(field::KEY)
        .and_then(rmpv::Value::as_str)
        .ok_or_else(|| BackendError::Protocol("tuple has no string key".to_string()))?;
    let flag = flag_of(tuple)
        .ok_or_else(|| BackendError::Protocol("tuple has no boolean is_deleted".to_string()))?;
    Ok((key.to_string(), flag))
}

/// Counters shared between a connector and the connections it opened.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl ConnectionStats {
    /// Connections opened so far.
    #[must_use]
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Connections closed (or dropped) so far.
    #[must_use]
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Connections currently open.
    #[must_use]
    pub fn open(&self) -> usize {
        self.opened().saturating_sub(self.closed())
    }
}

/// Opens [`MemoryConnection`]s over a shared [`MemorySpace`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    space: Arc<MemorySpace>,
    stats: Arc<ConnectionStats>,
    next_id: Arc<AtomicU64>,
    refuse_after: Option<usize>,
}

impl MemoryConnector {
    #[must_use]
    pub fn new(space: Arc<MemorySpace>) -> Self {
        Self {
            space,
            stats: Arc::new(ConnectionStats::default()),
            next_id: Arc::new(AtomicU64::new(1)),
            refuse_after: None,
        }
    }

    /// Refuses every connection attempt after the first `n` succeed.
    #[must_use]
    pub fn refuse_after(mut self, n: usize) -> Self {
        self.refuse_after = Some(n);
        self
    }

    /// The space shared by all connections from this connector.
    #[must_use]
    pub fn space(&self) -> Arc<MemorySpace> {
        Arc::clone(&self.space)
    }

    /// Open/close counters for connections from this connector.
    #[must_use]
    pub fn stats(&self) -> Arc<ConnectionStats> {
        Arc::clone(&self.stats)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<MemoryConnection, BackendError> {
        if let Some(limit) = self.refuse_after {
            if self.stats.opened() >= limit {
                return Err(BackendError::Connect(format!(
                    "connection refused after {limit} connections"
                )));
            }
        }
        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        trace!(connection_id = id, "memory backend connection opened");
        Ok(MemoryConnection {
            id,
            space: Arc::clone(&self.space),
            stats: Arc::clone(&self.stats),
        })
    }
}

/// A connection to a [`MemorySpace`]. Closing is counted on drop.
#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    space: Arc<MemorySpace>,
    stats: Arc<ConnectionStats>,
}

impl MemoryConnection {
    /// Identifier assigned by the connector, unique per connector.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.stats.closed.fetch_add(1, Ordering::SeqCst);
        trace!(connection_id = self.id, "memory backend connection closed");
    }
}

#[async_trait]
impl BackendConnection for MemoryConnection {
    async fn insert(&mut self, tuple: Tuple) -> Result<Tuple, BackendError> {
        self.space.check_fault()?;
        self.space.insert(tuple)
    }

    async fn select(&mut self, query: &Select) -> Result<Vec<Tuple>, BackendError> {
        self.space.check_fault()?;
        Ok(self.space.select(query))
    }

    async fn count(&mut self, selector: &Selector) -> Result<u64, BackendError> {
        self.space.check_fault()?;
        Ok(self.space.count(selector))
    }

    async fn update(
        &mut self,
        key: &str,
        ops: &[Assign],
        guard: Guard,
    ) -> Result<UpdateOutcome, BackendError> {
        self.space.check_fault()?;
        self.space.update(key, ops, guard)
    }

    async fn replace(&mut self, tuple: Tuple) -> Result<Tuple, BackendError> {
        self.space.check_fault()?;
        self.space.replace(tuple)
    }

    async fn ping(&mut self) -> Result<(), BackendError> {
        self.space.check_fault()
    }

    fn close(self) {
        drop(self);
    }
}
