use async_trait::async_trait;
use kvstore_core::{KvResult, Page, PageRequest, Record};

/// Persistence operations over records, independent of the backend driver.
/// Implementations: [`Repository`](crate::repository::Repository) over any
/// pooled [`Connector`](crate::backend::Connector); test doubles.
#[async_trait]
pub trait RecordRepository: Send + Sync {
    /// Insert a new live record stamped with the current time.
    async fn create(&self, key: &str, value: &str) -> KvResult<Record>;

    /// Fetch a live record. Soft-deleted records are reported as missing.
    async fn get(&self, key: &str) -> KvResult<Record>;

    /// Fetch a record whether or not it is soft-deleted.
    async fn get_including_deleted(&self, key: &str) -> KvResult<Record>;

    /// Replace the value of a live record and bump `updated_at`.
    async fn update(&self, key: &str, value: &str) -> KvResult<Record>;

    /// Flag a record as deleted in place.
    async fn soft_delete(&self, key: &str) -> KvResult<()>;

    /// Read the record and rewrite it as deleted. Returns the stored result.
    async fn delete(&self, key: &str) -> KvResult<Record>;

    /// Bring a soft-deleted record back to life.
    async fn restore(&self, key: &str) -> KvResult<Record>;

    /// Live records in key order.
    async fn list(&self, page: PageRequest) -> KvResult<Page<Record>>;

    /// All records in key order, soft-deleted ones included.
    async fn list_including_deleted(&self, page: PageRequest) -> KvResult<Page<Record>>;

    /// Round trip to the backend on one pooled connection.
    async fn ping(&self) -> KvResult<()>;

    /// Release all backend connections. Idempotent.
    async fn close(&self);
}
