//! Record service: input validation and orchestration over a repository.

use std::sync::Arc;

use kvstore_core::{KvError, KvResult, Page, PageRequest, Record};
use tracing::debug;

use super::config::ServiceConfig;
use crate::metrics as kv_metrics;
use crate::traits::RecordRepository;

/// Thin layer between the HTTP handlers and the [`RecordRepository`].
///
/// Validates keys and values, applies pagination defaults, and re-reads
/// records after operations whose repository call returns nothing useful.
/// Repository errors are passed through unchanged.
#[derive(Clone)]
pub struct RecordService {
    repo: Arc<dyn RecordRepository>,
    config: ServiceConfig,
}

impl RecordService {
    #[must_use]
    pub fn new(repo: Arc<dyn RecordRepository>, config: ServiceConfig) -> Self {
        Self { repo, config }
    }

    /// Backend round trip, for readiness checks.
    pub async fn ping(&self) -> KvResult<()> {
        self.repo.ping().await
    }

    /// Closes the repository's backend connections.
    pub async fn close(&self) {
        self.repo.close().await;
    }

    fn check_key(key: &str) -> KvResult<()> {
        if key.is_empty() {
            return Err(KvError::InvalidKey);
        }
        Ok(())
    }

    fn check_value(&self, value: &str) -> KvResult<()> {
        if value.is_empty() {
            return Err(KvError::InvalidValue {
                reason: "value is required".to_string(),
            });
        }
        if value.len() > self.config.max_value_bytes {
            return Err(KvError::InvalidValue {
                reason: format!(
                    "value is {} bytes, limit is {}",
                    value.len(),
                    self.config.max_value_bytes
                ),
            });
        }
        Ok(())
    }

    pub async fn create(&self, key: &str, value: &str) -> KvResult<Record> {
        Self::check_key(key)?;
        self.check_value(value)?;
        record_outcome("create", self.repo.create(key, value).await)
    }

    pub async fn get(&self, key: &str) -> KvResult<Record> {
        Self::check_key(key)?;
        record_outcome("get", self.repo.get(key).await)
    }

    pub async fn update(&self, key: &str, value: &str) -> KvResult<Record> {
        Self::check_key(key)?;
        self.check_value(value)?;
        record_outcome("update", self.repo.update(key, value).await)
    }

    /// Soft-deletes and returns the record in its deleted state.
    pub async fn soft_delete(&self, key: &str) -> KvResult<Record> {
        Self::check_key(key)?;
        let result = match self.repo.soft_delete(key).await {
            Ok(()) => self.repo.get_including_deleted(key).await,
            Err(err) => Err(err),
        };
        record_outcome("soft_delete", result)
    }

    /// Hard delete; the repository's result is returned as is.
    pub async fn delete(&self, key: &str) -> KvResult<Record> {
        Self::check_key(key)?;
        record_outcome("delete", self.repo.delete(key).await)
    }

    /// Restores and returns the live record.
    pub async fn restore(&self, key: &str) -> KvResult<Record> {
        Self::check_key(key)?;
        let result = match self.repo.restore(key).await {
            Ok(_) => self.repo.get(key).await,
            Err(err) => Err(err),
        };
        record_outcome("restore", result)
    }

    pub async fn list(&self, page: PageRequest) -> KvResult<Page<Record>> {
        let page = page.normalized();
        record_outcome("list", self.repo.list(page).await)
    }

    pub async fn list_including_deleted(&self, page: PageRequest) -> KvResult<Page<Record>> {
        let page = page.normalized();
        record_outcome(
            "list_including_deleted",
            self.repo.list_including_deleted(page).await,
        )
    }
}

fn record_outcome<T>(op: &'static str, result: KvResult<T>) -> KvResult<T> {
    match &result {
        Ok(_) => kv_metrics::request(op, "ok"),
        Err(err) => {
            debug!(op, code = err.code(), "record operation failed");
            kv_metrics::request(op, err.code());
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use kvstore_core::ManualClock;

    use super::*;
    use crate::backend::{MemoryConnector, MemorySpace};
    use crate::pool::PoolConfig;
    use crate::repository::Repository;

    async fn service_with(config: ServiceConfig) -> RecordService {
        let repo = Repository::open(
            &MemoryConnector::new(Arc::new(MemorySpace::new())),
            PoolConfig {
                size: 2,
                acquire_timeout: Duration::from_secs(5),
            },
            Arc::new(ManualClock::new(1_700_000_000)),
        )
        .await
        .unwrap();
        RecordService::new(Arc::new(repo), config)
    }

    async fn service() -> RecordService {
        service_with(ServiceConfig::default()).await
    }

    /// Records the page requests it receives; everything else fails.
    #[derive(Default)]
    struct PageSpy {
        seen: Mutex<Vec<PageRequest>>,
    }

    #[async_trait]
    impl RecordRepository for PageSpy {
        async fn create(&self, _: &str, _: &str) -> KvResult<Record> {
            Err(KvError::Database)
        }
        async fn get(&self, _: &str) -> KvResult<Record> {
            Err(KvError::Database)
        }
        async fn get_including_deleted(&self, _: &str) -> KvResult<Record> {
            Err(KvError::Database)
        }
        async fn update(&self, _: &str, _: &str) -> KvResult<Record> {
            Err(KvError::Database)
        }
        async fn soft_delete(&self, _: &str) -> KvResult<()> {
            Err(KvError::PoolTimeout)
        }
        async fn delete(&self, _: &str) -> KvResult<Record> {
            Err(KvError::Database)
        }
        async fn restore(&self, _: &str) -> KvResult<Record> {
            Err(KvError::Database)
        }
        async fn list(&self, page: PageRequest) -> KvResult<Page<Record>> {
            self.seen.lock().unwrap().push(page);
            Ok(Page {
                items: Vec::new(),
                total: 0,
                limit: page.limit,
                offset: page.offset,
            })
        }
        async fn list_including_deleted(&self, page: PageRequest) -> KvResult<Page<Record>> {
            self.list(page).await
        }
        async fn ping(&self) -> KvResult<()> {
            Ok(())
        }
        async fn close(&self) {}
    }

    #[tokio::test]
    async fn empty_key_is_rejected_everywhere() {
        let svc = service().await;
        assert_eq!(svc.create("", "v").await, Err(KvError::InvalidKey));
        assert_eq!(svc.get("").await, Err(KvError::InvalidKey));
        assert_eq!(svc.update("", "v").await, Err(KvError::InvalidKey));
        assert_eq!(svc.soft_delete("").await, Err(KvError::InvalidKey));
        assert_eq!(svc.delete("").await, Err(KvError::InvalidKey));
        assert_eq!(svc.restore("").await, Err(KvError::InvalidKey));
    }

    #[tokio::test]
    async fn empty_value_is_rejected_after_the_key() {
        let svc = service().await;
        assert!(matches!(
            svc.create("a", "").await,
            Err(KvError::InvalidValue { .. })
        ));
        assert!(matches!(
            svc.update("a", "").await,
            Err(KvError::InvalidValue { .. })
        ));
        assert_eq!(svc.create("", "").await, Err(KvError::InvalidKey));
        assert_eq!(svc.update("", "").await, Err(KvError::InvalidKey));
        assert_eq!(svc.get("a").await, Err(KvError::KeyNotFound));
    }

    #[tokio::test]
    async fn oversized_value_is_rejected() {
        let svc = service_with(ServiceConfig { max_value_bytes: 4 }).await;
        assert!(svc.create("a", "1234").await.is_ok());
        assert!(matches!(
            svc.create("b", "12345").await,
            Err(KvError::InvalidValue { .. })
        ));
        assert!(matches!(
            svc.update("a", "12345").await,
            Err(KvError::InvalidValue { .. })
        ));
        assert_eq!(svc.get("a").await.unwrap().value, "1234");
    }

    #[tokio::test]
    async fn soft_delete_returns_deleted_record() {
        let svc = service().await;
        svc.create("a", "v1").await.unwrap();

        let deleted = svc.soft_delete("a").await.unwrap();
        assert!(deleted.is_deleted);
        assert!(deleted.deleted_at.is_some());
        assert_eq!(svc.get("a").await, Err(KvError::KeyNotFound));
    }

    #[tokio::test]
    async fn restore_returns_live_record() {
        let svc = service().await;
        svc.create("a", "v1").await.unwrap();
        svc.soft_delete("a").await.unwrap();

        let restored = svc.restore("a").await.unwrap();
        assert!(!restored.is_deleted);
        assert_eq!(restored.value, "v1");
        assert_eq!(svc.restore("a").await, Err(KvError::NotDeleted));
    }

    #[tokio::test]
    async fn errors_pass_through_unchanged() {
        let svc = RecordService::new(Arc::new(PageSpy::default()), ServiceConfig::default());
        assert_eq!(svc.soft_delete("a").await, Err(KvError::PoolTimeout));
        assert_eq!(svc.get("a").await, Err(KvError::Database));
    }

    #[tokio::test]
    async fn list_applies_defaults() {
        let spy = Arc::new(PageSpy::default());
        let svc = RecordService::new(spy.clone(), ServiceConfig::default());

        svc.list(PageRequest::new(0, -3)).await.unwrap();
        svc.list_including_deleted(PageRequest::new(-1, 4))
            .await
            .unwrap();
        svc.list(PageRequest::new(500, 2)).await.unwrap();

        let seen = spy.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                PageRequest::new(10, 0),
                PageRequest::new(10, 4),
                PageRequest::new(500, 2),
            ]
        );
    }
}
