//! In-process [`FileService`] with the collaborator's observable behavior:
//! content-level deduplication, newest-first listing, server-side filtering
//! and recomputed statistics. Call counters, optional latency and failure
//! injection make it usable as a test double.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::debug;

use super::{FileService, ServiceResult, UploadPayload};
use crate::{
    error::ServiceError,
    model::{
        file::{FileId, FileRecord, StorageStats},
        filter::FilterCriteria,
        selection::type_tag,
    },
};

/// Which call a counter or injected failure applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceCall {
    Upload,
    List,
    Delete,
    StorageStats,
    FetchBlob,
}

#[derive(Debug)]
struct Stored {
    record: FileRecord,
    content: Bytes,
    // Id of the record whose content this one reuses.
    original: Option<FileId>,
    // Insertion order; ties on `uploaded_at` still list newest first.
    seq: u64,
}

#[derive(Debug, Default)]
struct Catalog {
    files: Vec<Stored>,
    next_seq: u64,
}

impl Catalog {
    fn stats(&self) -> StorageStats {
        let total_files = self.files.len() as u64;
        let unique_files = self.files.iter().filter(|f| f.original.is_none()).count() as u64;
        let total_size: u64 = self.files.iter().map(|f| f.record.size).sum();
        let actual_size: u64 = self
            .files
            .iter()
            .filter(|f| f.original.is_none())
            .map(|f| f.record.size)
            .sum();

        StorageStats {
            total_files,
            unique_files,
            duplicates: total_files - unique_files,
            total_size,
            actual_size: Some(actual_size),
            saved_size: total_size - actual_size,
            last_updated: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryFileService {
    catalog: Mutex<Catalog>,
    calls: Mutex<HashMap<ServiceCall, usize>>,
    failures: Mutex<HashMap<ServiceCall, ServiceError>>,
    latency: Mutex<Option<Duration>>,
    next_id: AtomicUsize,
}

impl MemoryFileService {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency` before it touches the catalog.
    #[must_use]
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock() = Some(latency);
        self
    }

    /// Make every subsequent `call` fail with `error` until cleared.
    pub fn fail(&self, call: ServiceCall, error: ServiceError) {
        self.failures.lock().insert(call, error);
    }

    pub fn clear_failure(&self, call: ServiceCall) {
        self.failures.lock().remove(&call);
    }

    /// How many times `call` has been made, including failed attempts.
    #[must_use]
    pub fn calls(&self, call: ServiceCall) -> usize {
        self.calls.lock().get(&call).copied().unwrap_or(0)
    }

    /// Insert content directly, bypassing counters and failures.
    pub fn seed(&self, name: &str, content: impl Into<Bytes>) -> FileRecord {
        self.store(None, name, content.into())
    }

    /// Like [`seed`](Self::seed) with a caller-chosen id.
    pub fn seed_with_id(&self, id: &str, name: &str, content: impl Into<Bytes>) -> FileRecord {
        self.store(Some(FileId::from(id)), name, content.into())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.catalog.lock().files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn enter(&self, call: ServiceCall) -> ServiceResult<()> {
        *self.calls.lock().entry(call).or_default() += 1;

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        match self.failures.lock().get(&call) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn store(&self, id: Option<FileId>, name: &str, content: Bytes) -> FileRecord {
        let id = id.unwrap_or_else(|| {
            let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
            FileId::new(n.to_string())
        });
        let file_type = type_tag(name);

        let mut catalog = self.catalog.lock();

        let original = catalog
            .files
            .iter()
            .find(|f| f.original.is_none() && f.content == content);

        let (locator, original_id, original_filename) = match original {
            Some(orig) => (
                orig.record.locator.clone(),
                Some(orig.record.id.clone()),
                Some(orig.record.name.clone()),
            ),
            None => (format!("/media/uploads/{id}.{file_type}"), None, None),
        };

        let record = FileRecord {
            id,
            name: name.to_owned(),
            locator,
            size: content.len() as u64,
            file_type,
            uploaded_at: Utc::now(),
            is_duplicate: original_id.is_some(),
            original_filename,
        };

        let seq = catalog.next_seq;
        catalog.next_seq += 1;
        catalog.files.push(Stored {
            record: record.clone(),
            content,
            original: original_id,
            seq,
        });

        debug!(file_id = %record.id, is_duplicate = record.is_duplicate, "Stored file");
        record
    }
}

#[async_trait]
impl FileService for MemoryFileService {
    async fn upload(&self, payload: UploadPayload) -> ServiceResult<FileRecord> {
        self.enter(ServiceCall::Upload).await?;
        Ok(self.store(None, &payload.file_name, payload.content))
    }

    async fn list(&self, criteria: &FilterCriteria) -> ServiceResult<Vec<FileRecord>> {
        self.enter(ServiceCall::List).await?;

        let catalog = self.catalog.lock();
        let mut matching: Vec<&Stored> = catalog
            .files
            .iter()
            .filter(|f| criteria.matches(&f.record))
            .collect();
        matching.sort_by(|a, b| {
            b.record
                .uploaded_at
                .cmp(&a.record.uploaded_at)
                .then(b.seq.cmp(&a.seq))
        });

        Ok(matching.into_iter().map(|f| f.record.clone()).collect())
    }

    async fn delete(&self, id: &FileId) -> ServiceResult<()> {
        self.enter(ServiceCall::Delete).await?;

        let mut catalog = self.catalog.lock();
        let Some(pos) = catalog.files.iter().position(|f| &f.record.id == id) else {
            return Err(ServiceError::NotFound(format!("file {id}")));
        };
        catalog.files.remove(pos);

        // Duplicates of a deleted original keep its content and become unique.
        for f in &mut catalog.files {
            if f.original.as_ref() == Some(id) {
                f.original = None;
                f.record.is_duplicate = false;
                f.record.original_filename = None;
            }
        }

        Ok(())
    }

    async fn storage_stats(&self) -> ServiceResult<StorageStats> {
        self.enter(ServiceCall::StorageStats).await?;
        Ok(self.catalog.lock().stats())
    }

    async fn fetch_blob(&self, locator: &str) -> ServiceResult<Bytes> {
        self.enter(ServiceCall::FetchBlob).await?;

        self.catalog
            .lock()
            .files
            .iter()
            .find(|f| f.record.locator == locator)
            .map(|f| f.content.clone())
            .ok_or_else(|| ServiceError::NotFound(locator.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::filter::FilterField;

    #[tokio::test]
    async fn test_duplicate_content_shares_storage() {
        let svc = MemoryFileService::new();
        let a = svc.upload(UploadPayload::new("a.txt", "same")).await.unwrap();
        let b = svc.upload(UploadPayload::new("b.txt", "same")).await.unwrap();
        let c = svc.upload(UploadPayload::new("c.txt", "other")).await.unwrap();

        assert!(!a.is_duplicate);
        assert!(b.is_duplicate);
        assert_eq!(b.original_filename.as_deref(), Some("a.txt"));
        assert_eq!(b.locator, a.locator);
        assert!(!c.is_duplicate);

        let stats = svc.storage_stats().await.unwrap();
        assert_eq!((stats.total_files, stats.unique_files, stats.duplicates), (3, 2, 1));
        assert_eq!(stats.total_size, 13);
        assert_eq!(stats.actual_size, Some(9));
        assert_eq!(stats.saved_size, 4);
        assert_eq!(stats.total_size - stats.saved_size, 9);
        stats.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn test_list_is_newest_first_and_filtered() {
        let svc = MemoryFileService::new();
        svc.seed("report.pdf", "1");
        svc.seed("photo.png", "22");
        svc.seed("report-final.PDF", "333");

        let all = svc.list(&FilterCriteria::new()).await.unwrap();
        let names: Vec<_> = all.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["report-final.PDF", "photo.png", "report.pdf"]);

        let mut criteria = FilterCriteria::new();
        criteria.set_file_name("REPORT");
        let hits = svc.list(&criteria).await.unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn test_type_filter_is_exact() {
        let svc = MemoryFileService::new();
        svc.seed("a.pdf", "1");
        let upper = svc.seed("b.PDF", "22");
        assert_eq!(upper.file_type, "PDF");

        let mut criteria = FilterCriteria::new();
        criteria.set_field(FilterField::FileType, "PDF").unwrap();
        let hits = svc.list(&criteria).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "b.PDF");

        criteria.set_field(FilterField::FileType, "pdf").unwrap();
        let hits = svc.list(&criteria).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "a.pdf");
    }

    #[tokio::test]
    async fn test_deleting_original_promotes_duplicates() {
        let svc = MemoryFileService::new();
        let a = svc.seed("a.txt", "same");
        let b = svc.seed("b.txt", "same");

        svc.delete(&a.id).await.unwrap();
        let left = svc.list(&FilterCriteria::new()).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, b.id);
        assert!(!left[0].is_duplicate);
        assert_eq!(svc.fetch_blob(&b.locator).await.unwrap(), Bytes::from_static(b"same"));

        assert!(matches!(
            svc.delete(&a.id).await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failure_injection_and_counters() {
        let svc = MemoryFileService::new();
        svc.fail(ServiceCall::List, ServiceError::Network("down".into()));

        assert!(svc.list(&FilterCriteria::new()).await.is_err());
        svc.clear_failure(ServiceCall::List);
        assert!(svc.list(&FilterCriteria::new()).await.is_ok());

        assert_eq!(svc.calls(ServiceCall::List), 2);
        assert_eq!(svc.calls(ServiceCall::Upload), 0);
    }
}
