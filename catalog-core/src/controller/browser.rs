//! ``src/controller/browser.rs``
//! ============================================================================
//! # Catalog Browser: filters, debounced search, cached reads
//!
//! Owns the current [`FilterCriteria`] and publishes it on a watch channel.
//! Search-box text goes through a debouncer and lands in `file_name` once the
//! user pauses; filter-panel edits apply immediately. Reads are keyed by the
//! criteria current at call time, so every distinct filter set gets its own
//! cache entry.

use std::{path::PathBuf, sync::Arc};

use tokio::sync::watch;
use tracing::{debug, info, instrument};

use crate::{
    cache::{
        catalog::{CatalogCache, CatalogQueries, CatalogValue},
        query_cache::EntrySnapshot,
    },
    config::Config,
    error::SyncResult,
    model::{
        file::{FileId, FileRecord, StorageStats},
        filter::{FilterCriteria, FilterField},
    },
    service::SharedFileService,
    sync::{
        download::{DirectorySaveTarget, DownloadExecutor},
        mutation::MutationCoordinator,
    },
    util::debounce::{DebounceConfig, Debouncer},
};

#[derive(Debug)]
pub struct CatalogBrowser {
    queries: CatalogQueries,
    mutations: MutationCoordinator,
    downloads: DownloadExecutor,
    criteria: Arc<watch::Sender<FilterCriteria>>,
    search: Debouncer<String>,
}

impl CatalogBrowser {
    /// Wire a browser from explicit parts. `queries` and `mutations` must
    /// share one cache.
    pub fn new(
        queries: CatalogQueries,
        mutations: MutationCoordinator,
        downloads: DownloadExecutor,
        search: DebounceConfig,
    ) -> Self {
        let (tx, _rx) = watch::channel(FilterCriteria::default());
        let criteria = Arc::new(tx);

        let sink = Arc::clone(&criteria);
        let search = Debouncer::new(search, move |text: String| {
            sink.send_if_modified(|c| {
                let before = c.file_name.clone();
                c.set_file_name(&text);
                debug!(file_name = ?c.file_name, "Search term applied");
                before != c.file_name
            });
        });

        Self {
            queries,
            mutations,
            downloads,
            criteria,
            search,
        }
    }

    /// Build the default wiring from configuration.
    pub fn from_config(service: SharedFileService, cache: CatalogCache, config: &Config) -> Self {
        let target = Arc::new(DirectorySaveTarget::new(config.download.directory.clone()));
        Self::new(
            CatalogQueries::new(cache.clone(), Arc::clone(&service)),
            MutationCoordinator::new(cache, Arc::clone(&service)),
            DownloadExecutor::new(service, target),
            config.search.clone(),
        )
    }

    /* ---------------------------- filters ---------------------------- */

    /// Search-box keystroke. Applied after the debounce delay.
    pub fn search(&self, text: impl Into<String>) {
        self.search.schedule(text.into());
    }

    /// Apply a pending search term now (e.g. on Enter).
    pub fn flush_search(&self) -> bool {
        self.search.flush()
    }

    /// Filter-panel edit. Invalid input is rejected and changes nothing.
    pub fn set_field(&self, field: FilterField, raw: &str) -> SyncResult<()> {
        let mut next = self.criteria.borrow().clone();
        next.set_field(field, raw)?;
        self.replace_criteria(next);
        Ok(())
    }

    /// Replace the criteria wholesale.
    pub fn set_criteria(&self, criteria: FilterCriteria) {
        self.replace_criteria(criteria.normalized());
    }

    /// Reset every filter, dropping any search term still being debounced.
    pub fn clear_filters(&self) {
        self.search.cancel();
        self.replace_criteria(FilterCriteria::default());
        info!("Filters cleared");
    }

    fn replace_criteria(&self, next: FilterCriteria) {
        self.criteria.send_if_modified(|c| {
            if *c == next {
                false
            } else {
                *c = next;
                true
            }
        });
    }

    #[must_use]
    pub fn criteria(&self) -> FilterCriteria {
        self.criteria.borrow().clone()
    }

    pub fn watch_criteria(&self) -> watch::Receiver<FilterCriteria> {
        self.criteria.subscribe()
    }

    /* ----------------------------- reads ----------------------------- */

    /// Listing under the current criteria.
    pub async fn files(&self) -> SyncResult<Arc<Vec<FileRecord>>> {
        let criteria = self.criteria();
        self.queries.files(&criteria).await
    }

    pub async fn storage_stats(&self) -> SyncResult<StorageStats> {
        self.queries.storage_stats().await
    }

    /// Observe the listing entry for the current criteria.
    pub fn watch_files(&self) -> watch::Receiver<EntrySnapshot<CatalogValue>> {
        self.queries.watch_files(&self.criteria())
    }

    pub fn watch_storage_stats(&self) -> watch::Receiver<EntrySnapshot<CatalogValue>> {
        self.queries.watch_storage_stats()
    }

    /* ---------------------------- actions ---------------------------- */

    #[instrument(skip(self))]
    pub async fn delete(&self, id: FileId) -> SyncResult<()> {
        self.mutations.delete(id).await
    }

    pub async fn download(&self, record: &FileRecord) -> SyncResult<PathBuf> {
        self.downloads.download_record(record).await
    }

    #[must_use]
    pub fn is_deleting(&self) -> bool {
        self.mutations.is_pending()
    }

    #[must_use]
    pub fn is_downloading(&self) -> bool {
        self.downloads.is_pending()
    }

    #[must_use]
    pub const fn queries(&self) -> &CatalogQueries {
        &self.queries
    }

    /// Teardown: no debounced search fires after this.
    pub fn shutdown(&self) {
        if self.search.cancel() {
            debug!("Pending search dropped on shutdown");
        }
    }
}
