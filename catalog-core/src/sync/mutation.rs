//! ``src/sync/mutation.rs``
//! ============================================================================
//! # Mutation Coordinator: server-mutating operations with invalidation
//!
//! Every mutation is a single attempt. On success the coordinator marks the
//! query kinds the mutation can affect as stale *before* handing the result
//! back, so any read the caller issues afterwards fetches fresh data. A
//! failure is returned to the caller only and invalidates nothing.
//!
//! Mutations on different targets run concurrently; mutations on the same
//! target (file id for deletes, file name for uploads) run one at a time.

use std::{fmt, sync::Arc};

use compact_str::{CompactString, format_compact};
use dashmap::DashMap;
use tokio::{sync::Mutex as AsyncMutex, sync::watch, time::Instant};
use tracing::{Instrument, info, instrument, warn};

use crate::{
    cache::{
        catalog::CatalogCache,
        query_cache::{KeyPattern, QueryKind},
    },
    error::{SyncError, SyncResult},
    model::file::{FileId, FileRecord},
    service::{SharedFileService, UploadPayload},
    util::pending::PendingFlag,
};

/// A server-mutating operation.
#[derive(Debug, Clone)]
pub enum Mutation {
    Upload(UploadPayload),
    Delete(FileId),
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

impl Mutation {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Upload(_) => "upload",
            Self::Delete(_) => "delete",
        }
    }

    /// Identity used to serialize mutations that touch the same thing.
    #[must_use]
    pub fn target(&self) -> CompactString {
        match self {
            Self::Upload(payload) => format_compact!("name:{}", payload.file_name),
            Self::Delete(id) => format_compact!("id:{id}"),
        }
    }

    /// Cache entries made stale by a successful run.
    #[must_use]
    pub const fn invalidates(&self) -> [KeyPattern; 2] {
        // Both operations change the listing and the dedup figures.
        [
            KeyPattern::Kind(QueryKind::Files),
            KeyPattern::Kind(QueryKind::StorageStats),
        ]
    }
}

/// What a successful mutation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    Uploaded(FileRecord),
    Deleted(FileId),
}

type TargetLocks = DashMap<CompactString, Arc<AsyncMutex<()>>>;

/// Runs mutations against the collaborator and keeps the cache consistent.
/// Clones share the cache, pending flag and target locks.
#[derive(Debug, Clone)]
pub struct MutationCoordinator {
    cache: CatalogCache,
    service: SharedFileService,
    pending: PendingFlag,
    locks: Arc<TargetLocks>,
}

impl MutationCoordinator {
    pub fn new(cache: CatalogCache, service: SharedFileService) -> Self {
        Self {
            cache,
            service,
            pending: PendingFlag::new(),
            locks: Arc::new(DashMap::new()),
        }
    }

    /// True while any mutation started by this coordinator is running.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending.is_pending()
    }

    pub fn watch_pending(&self) -> watch::Receiver<bool> {
        self.pending.subscribe()
    }

    #[must_use]
    pub const fn cache(&self) -> &CatalogCache {
        &self.cache
    }

    /// Run one attempt of `mutation`.
    ///
    /// The attempt runs on its own task. Once started it completes, and its
    /// invalidation lands, even if the caller stops awaiting the result.
    #[instrument(skip(self, mutation), fields(operation = mutation.kind(), target = %mutation.target(), operation_id))]
    pub async fn mutate(&self, mutation: Mutation) -> SyncResult<MutationOutcome> {
        let operation_id = nanoid::nanoid!(10);
        tracing::Span::current().record("operation_id", operation_id.as_str());

        let kind = mutation.kind();
        let pending = self.pending.begin();
        let coordinator = self.clone();

        let handle = tokio::spawn(
            async move {
                let result = coordinator.run(mutation, &operation_id).await;
                drop(pending);
                result
            }
            .instrument(tracing::Span::current()),
        );

        match handle.await {
            Ok(result) => result,
            Err(e) => Err(SyncError::mutation(
                kind,
                format!("mutation task ended abnormally: {e}"),
            )),
        }
    }

    async fn run(&self, mutation: Mutation, operation_id: &str) -> SyncResult<MutationOutcome> {
        let target = mutation.target();
        let kind = mutation.kind();
        let patterns = mutation.invalidates();

        let lock = self.target_lock(&target);
        let result = {
            let _held = lock.lock().await;
            let started = Instant::now();

            info!(
                marker = "MUTATION_OPERATION",
                operation_type = "mutation_start",
                operation_id,
                operation = kind,
                target = %target,
                "Mutation started"
            );

            let result = self.execute(mutation).await;

            match &result {
                Ok(_) => {
                    // Invalidate while still holding the target: the caller
                    // must not observe the result before the cache is stale.
                    let invalidated: usize =
                        patterns.iter().map(|p| self.cache.invalidate(p)).sum();
                    info!(
                        marker = "MUTATION_OPERATION",
                        operation_type = "mutation_success",
                        operation_id,
                        operation = kind,
                        invalidated,
                        duration_ms = started.elapsed().as_millis(),
                        "Mutation succeeded"
                    );
                }
                Err(e) => warn!(
                    marker = "MUTATION_OPERATION",
                    operation_type = "mutation_failure",
                    operation_id,
                    operation = kind,
                    error = %e,
                    duration_ms = started.elapsed().as_millis(),
                    "Mutation failed, cache left untouched"
                ),
            }

            result
        };

        drop(lock);
        self.release_target(&target);
        result
    }

    /// Upload a payload, returning the created record.
    pub async fn upload(&self, payload: UploadPayload) -> SyncResult<FileRecord> {
        match self.mutate(Mutation::Upload(payload)).await? {
            MutationOutcome::Uploaded(record) => Ok(record),
            MutationOutcome::Deleted(_) => Err(SyncError::mutation("upload", "unexpected outcome")),
        }
    }

    pub async fn delete(&self, id: FileId) -> SyncResult<()> {
        self.mutate(Mutation::Delete(id)).await.map(|_| ())
    }

    async fn execute(&self, mutation: Mutation) -> SyncResult<MutationOutcome> {
        let kind = mutation.kind();
        let outcome = match mutation {
            Mutation::Upload(payload) => self.service.upload(payload).await.map(MutationOutcome::Uploaded),
            Mutation::Delete(id) => self.service.delete(&id).await.map(|()| MutationOutcome::Deleted(id)),
        };
        outcome.map_err(|e| SyncError::mutation(kind, e))
    }

    fn target_lock(&self, target: &CompactString) -> Arc<AsyncMutex<()>> {
        Arc::clone(
            self.locks
                .entry(target.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .value(),
        )
    }

    // Drop the lock entry once nobody else holds or waits on it.
    fn release_target(&self, target: &CompactString) {
        self.locks
            .remove_if(target, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Number of targets with a mutation running or queued.
    #[must_use]
    pub fn active_targets(&self) -> usize {
        self.locks.len()
    }
}
