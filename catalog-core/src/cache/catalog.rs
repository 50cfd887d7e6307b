//! Catalog queries on top of the generic [`QueryCache`].
//!
//! One cache instance holds both query kinds, so a single invalidation
//! pattern set covers everything a mutation can change.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::instrument;

use super::query_cache::{EntrySnapshot, QueryCache, QueryKey};
use crate::{
    error::{SyncError, SyncResult},
    model::{
        file::{FileRecord, StorageStats},
        filter::FilterCriteria,
    },
    service::SharedFileService,
};

/// Value stored under a catalog query key.
#[derive(Debug, Clone, PartialEq)]
pub enum CatalogValue {
    Files(Arc<Vec<FileRecord>>),
    Stats(StorageStats),
}

pub type CatalogCache = QueryCache<CatalogValue>;

/// Cached reads of the remote catalog.
#[derive(Debug, Clone)]
pub struct CatalogQueries {
    cache: CatalogCache,
    service: SharedFileService,
}

impl CatalogQueries {
    pub fn new(cache: CatalogCache, service: SharedFileService) -> Self {
        Self { cache, service }
    }

    #[must_use]
    pub const fn cache(&self) -> &CatalogCache {
        &self.cache
    }

    #[must_use]
    pub fn service(&self) -> &SharedFileService {
        &self.service
    }

    /// Records matching `criteria`, newest first.
    #[instrument(skip(self), fields(criteria = %criteria.cache_key()))]
    pub async fn files(&self, criteria: &FilterCriteria) -> SyncResult<Arc<Vec<FileRecord>>> {
        let key = QueryKey::files(criteria);
        let label = key.to_string();
        let service = Arc::clone(&self.service);
        let criteria = criteria.normalized();

        let fetcher = move || {
            let service = Arc::clone(&service);
            let criteria = criteria.clone();
            let label = label.clone();
            async move {
                service
                    .list(&criteria)
                    .await
                    .map(|files| CatalogValue::Files(Arc::new(files)))
                    .map_err(|e| SyncError::transient_fetch(label, e))
            }
        };

        match self.cache.read(key.clone(), fetcher).await? {
            CatalogValue::Files(files) => Ok(files),
            CatalogValue::Stats(_) => Err(mismatch(&key)),
        }
    }

    #[instrument(skip(self))]
    pub async fn storage_stats(&self) -> SyncResult<StorageStats> {
        let key = QueryKey::storage_stats();
        let label = key.to_string();
        let service = Arc::clone(&self.service);

        let fetcher = move || {
            let service = Arc::clone(&service);
            let label = label.clone();
            async move {
                service
                    .storage_stats()
                    .await
                    .map(CatalogValue::Stats)
                    .map_err(|e| SyncError::transient_fetch(label, e))
            }
        };

        match self.cache.read(key.clone(), fetcher).await? {
            CatalogValue::Stats(stats) => Ok(stats),
            CatalogValue::Files(_) => Err(mismatch(&key)),
        }
    }

    pub fn watch_files(&self, criteria: &FilterCriteria) -> watch::Receiver<EntrySnapshot<CatalogValue>> {
        self.cache.subscribe(&QueryKey::files(criteria))
    }

    pub fn watch_storage_stats(&self) -> watch::Receiver<EntrySnapshot<CatalogValue>> {
        self.cache.subscribe(&QueryKey::storage_stats())
    }
}

fn mismatch(key: &QueryKey) -> SyncError {
    SyncError::transient_fetch(key, "cached value has the wrong kind")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{MemoryFileService, memory::ServiceCall};
    use crate::error::ServiceError;

    fn queries() -> (CatalogQueries, Arc<MemoryFileService>) {
        let svc = Arc::new(MemoryFileService::new());
        let q = CatalogQueries::new(CatalogCache::new(), svc.clone());
        (q, svc)
    }

    #[tokio::test]
    async fn test_files_are_cached_per_criteria() {
        let (q, svc) = queries();
        svc.seed("a.txt", "a");
        svc.seed("b.pdf", "bb");

        let all = q.files(&FilterCriteria::new()).await.unwrap();
        assert_eq!(all.len(), 2);
        q.files(&FilterCriteria::new()).await.unwrap();
        assert_eq!(svc.calls(ServiceCall::List), 1);

        let mut pdfs = FilterCriteria::new();
        pdfs.file_type = Some("pdf".into());
        let only_pdf = q.files(&pdfs).await.unwrap();
        assert_eq!(only_pdf.len(), 1);
        assert_eq!(svc.calls(ServiceCall::List), 2);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_transient_and_keyed() {
        let (q, svc) = queries();
        svc.fail(ServiceCall::StorageStats, ServiceError::Status { status: 503, body: "busy".into() });

        let err = q.storage_stats().await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("storage_stats"));

        // The listing is unaffected.
        assert!(q.files(&FilterCriteria::new()).await.is_ok());

        svc.clear_failure(ServiceCall::StorageStats);
        assert_eq!(q.storage_stats().await.unwrap().total_files, 0);
    }
}
