//! `src/cache/query_cache.rs`
//! ============================================================================
//! # Query Cache: keyed async read results with invalidation
//!
//! A shared, cloneable cache of asynchronous read results:
//! - Structured keys (query kind + normalized criteria); new criteria means a
//!   new key, never an in-place edit of an existing entry
//! - Request coalescing: one fetch in flight per key, shared by every reader
//! - Invalidation marks entries stale without fetching; the next read does
//! - Fetch errors live on their entry only and leave it stale for retry
//! - Watch-based observers per key for re-rendering dependent views
//!
//! Each entry carries a generation counter. Invalidation bumps it; a fetch
//! that started under an older generation still stores its value, but the
//! value stays stale and readers that joined it fetch again.
//!
//! Entries nobody is using (no fetch in flight, no reader, no observer) are
//! evicted once unread for `time_to_idle`, or oldest-read first whenever the
//! cache grows past `max_entries`.

use std::{
    fmt,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use compact_str::{CompactString, ToCompactString};
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::{sync::watch, time::Instant};
use tracing::{debug, info, instrument, warn};

use crate::{
    config::CacheConfig,
    error::{SyncError, SyncResult},
    model::filter::FilterCriteria,
};

/// What a cached query reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    Files,
    StorageStats,
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Files => "files",
            Self::StorageStats => "storage_stats",
        })
    }
}

/// Cache key: query kind plus normalized criteria.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    kind: QueryKind,
    criteria: CompactString,
}

impl QueryKey {
    pub fn new(kind: QueryKind, criteria: impl Into<CompactString>) -> Self {
        Self {
            kind,
            criteria: criteria.into(),
        }
    }

    /// File listing under the given filters.
    #[must_use]
    pub fn files(criteria: &FilterCriteria) -> Self {
        Self::new(QueryKind::Files, criteria.cache_key())
    }

    #[must_use]
    pub fn storage_stats() -> Self {
        Self::new(QueryKind::StorageStats, CompactString::default())
    }

    #[must_use]
    pub const fn kind(&self) -> QueryKind {
        self.kind
    }

    #[must_use]
    pub fn criteria(&self) -> &str {
        &self.criteria
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.criteria.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}?{}", self.kind, self.criteria)
        }
    }
}

/// Selects the entries an invalidation applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPattern {
    Exact(QueryKey),
    Kind(QueryKind),
    All,
}

impl KeyPattern {
    #[must_use]
    pub fn matches(&self, key: &QueryKey) -> bool {
        match self {
            Self::Exact(k) => k == key,
            Self::Kind(kind) => key.kind == *kind,
            Self::All => true,
        }
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(k) => write!(f, "{k}"),
            Self::Kind(kind) => write!(f, "{kind}/*"),
            Self::All => f.write_str("*"),
        }
    }
}

/// Observable view of one cache entry.
#[derive(Debug, Clone)]
pub struct EntrySnapshot<V> {
    /// Last successfully fetched value, kept through failed refetches.
    pub value: Option<V>,
    pub is_loading: bool,
    pub error: Option<SyncError>,
    pub is_stale: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

impl<V> Default for EntrySnapshot<V> {
    fn default() -> Self {
        Self {
            value: None,
            is_loading: false,
            error: None,
            is_stale: true,
            updated_at: None,
        }
    }
}

/// Cache statistics for monitoring and debugging
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    loads: AtomicU64,
    load_failures: AtomicU64,
    invalidations: AtomicU64,
    evictions: AtomicU64,
    total_load_time_ns: AtomicU64,
}

impl CacheStats {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    fn record_invalidations(&self, n: u64) {
        self.invalidations.fetch_add(n, Ordering::Relaxed);
    }

    fn record_evictions(&self, n: u64) {
        self.evictions.fetch_add(n, Ordering::Relaxed);
    }

    #[expect(clippy::cast_possible_truncation, reason = "Expected accuracy")]
    fn record_load(&self, duration: Duration, success: bool) {
        self.loads.fetch_add(1, Ordering::Relaxed);
        self.total_load_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);

        if !success {
            self.load_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        let loads = self.loads.load(Ordering::Relaxed);
        let total_load_time_ns = self.total_load_time_ns.load(Ordering::Relaxed);

        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            loads,
            load_failures: self.load_failures.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            average_load_time: if loads > 0 {
                Duration::from_nanos(total_load_time_ns / loads)
            } else {
                Duration::ZERO
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub loads: u64,
    pub load_failures: u64,
    pub invalidations: u64,
    pub evictions: u64,
    pub average_load_time: Duration,
}

impl CacheStatsSnapshot {
    #[expect(clippy::cast_precision_loss, reason = "Expected precision loss")]
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses + self.coalesced;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    #[expect(clippy::cast_precision_loss, reason = "Expected precision loss")]
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        if self.loads == 0 {
            0.0
        } else {
            self.load_failures as f64 / self.loads as f64
        }
    }
}

type SharedFetch<V> = Shared<BoxFuture<'static, SyncResult<V>>>;

struct InFlight<V> {
    generation: u64,
    future: SharedFetch<V>,
}

struct EntryState<V> {
    value: Option<V>,
    error: Option<SyncError>,
    // Bumped by invalidation.
    generation: u64,
    // Generation the current value was fetched under, None after a failure.
    fresh_generation: Option<u64>,
    fetched_at: Option<Instant>,
    updated_at: Option<DateTime<Utc>>,
    in_flight: Option<InFlight<V>>,
    last_read: Instant,
    // Orders reads that share an `Instant`.
    read_seq: u64,
}

impl<V: Clone> EntryState<V> {
    fn is_fresh(&self, stale_after: Option<Duration>) -> bool {
        if self.value.is_none() || self.fresh_generation != Some(self.generation) {
            return false;
        }
        match (stale_after, self.fetched_at) {
            (Some(limit), Some(at)) => at.elapsed() < limit,
            _ => true,
        }
    }

    fn snapshot(&self, stale_after: Option<Duration>) -> EntrySnapshot<V> {
        EntrySnapshot {
            value: self.value.clone(),
            is_loading: self.in_flight.is_some(),
            error: self.error.clone(),
            is_stale: !self.is_fresh(stale_after),
            updated_at: self.updated_at,
        }
    }
}

struct Slot<V> {
    state: Mutex<EntryState<V>>,
    tx: watch::Sender<EntrySnapshot<V>>,
}

impl<V: Clone> Slot<V> {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(EntrySnapshot::default());
        Self {
            state: Mutex::new(EntryState {
                value: None,
                error: None,
                generation: 0,
                fresh_generation: None,
                fetched_at: None,
                updated_at: None,
                in_flight: None,
                last_read: Instant::now(),
                read_seq: 0,
            }),
            tx,
        }
    }

    // Only the entry map still references the slot.
    fn is_idle(self: &Arc<Self>) -> bool {
        Arc::strong_count(self) == 1
            && self.tx.receiver_count() == 0
            && self.state.lock().in_flight.is_none()
    }

    fn publish(&self, state: &EntryState<V>, stale_after: Option<Duration>) {
        self.tx.send_replace(state.snapshot(stale_after));
    }

    // Store a finished fetch. Replaces the whole value, never merges.
    fn complete(&self, generation: u64, result: &SyncResult<V>, stale_after: Option<Duration>) {
        let mut state = self.state.lock();
        if state
            .in_flight
            .as_ref()
            .is_some_and(|f| f.generation == generation)
        {
            state.in_flight = None;
        }

        match result {
            Ok(value) => {
                state.value = Some(value.clone());
                state.error = None;
                state.fresh_generation = Some(generation);
                state.fetched_at = Some(Instant::now());
                state.updated_at = Some(Utc::now());
            }
            Err(e) => {
                state.error = Some(e.clone());
                state.fresh_generation = None;
            }
        }

        self.publish(&state, stale_after);
    }
}

struct Inner<V> {
    entries: DashMap<QueryKey, Arc<Slot<V>>>,
    reads: AtomicU64,
    config: CacheConfig,
    stats: Arc<CacheStats>,
}

/// Shared query cache. Clones are handles to the same cache.
pub struct QueryCache<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for QueryCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

enum ReadStep<V> {
    Hit(V),
    Await(u64, SharedFetch<V>),
}

impl<V> QueryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create a new cache with custom configuration
    #[must_use]
    pub fn with_config(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                reads: AtomicU64::new(0),
                config,
                stats: Arc::new(CacheStats::default()),
            }),
        }
    }

    /// Create cache with default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    fn slot(&self, key: &QueryKey) -> Arc<Slot<V>> {
        let mut created = false;
        let slot = Arc::clone(
            self.inner
                .entries
                .entry(key.clone())
                .or_insert_with(|| {
                    created = true;
                    Arc::new(Slot::new())
                })
                .value(),
        );

        if created {
            self.evict_idle();
        }
        slot
    }

    /// Drop idle entries past `time_to_idle`, then the least recently read
    /// idle entries while the cache holds more than `max_entries`.
    ///
    /// Entries with a fetch in flight, an active reader or a live observer
    /// are never evicted. Returns how many entries were removed.
    pub fn evict_idle(&self) -> usize {
        let config = &self.inner.config;
        let now = Instant::now();

        let mut idle: Vec<(Instant, u64, QueryKey)> = self
            .inner
            .entries
            .iter()
            .filter_map(|entry| {
                let slot = entry.value();
                if slot.tx.receiver_count() > 0 || Arc::strong_count(slot) > 1 {
                    return None;
                }
                let state = slot.state.lock();
                state
                    .in_flight
                    .is_none()
                    .then(|| (state.last_read, state.read_seq, entry.key().clone()))
            })
            .collect();

        let remove = |key: &QueryKey| {
            self.inner
                .entries
                .remove_if(key, |_, slot| slot.is_idle())
                .is_some()
        };

        let mut evicted = 0;
        if let Some(ttl) = config.time_to_idle {
            idle.retain(|(last_read, _, key)| {
                if now.saturating_duration_since(*last_read) >= ttl && remove(key) {
                    evicted += 1;
                    false
                } else {
                    true
                }
            });
        }

        if self.inner.entries.len() > config.max_entries {
            idle.sort_by_key(|(_, seq, _)| *seq);
            for (_, _, key) in &idle {
                if self.inner.entries.len() <= config.max_entries {
                    break;
                }
                if remove(key) {
                    evicted += 1;
                }
            }
        }

        if evicted > 0 {
            self.record(|s| s.record_evictions(evicted as u64));
            debug!(
                marker = "CACHE_OPERATION",
                operation_type = "evict",
                evicted,
                entries = self.inner.entries.len(),
                "Idle entries evicted"
            );
        }
        evicted
    }

    /// Return the cached value for `key`, fetching it if absent or stale.
    ///
    /// `fetcher` is only called when this read has to start a fetch; reads
    /// arriving while one is in flight await that same fetch. The fetch runs
    /// on its own task, so it completes even if every reader goes away.
    #[instrument(skip(self, fetcher), fields(cache_key = %key))]
    pub async fn read<F, Fut>(&self, key: QueryKey, fetcher: F) -> SyncResult<V>
    where
        F: Fn() -> Fut + Send,
        Fut: Future<Output = SyncResult<V>> + Send + 'static,
    {
        let slot = self.slot(&key);
        let stale_after = self.inner.config.stale_after;

        loop {
            let step = {
                let mut state = slot.state.lock();
                state.last_read = Instant::now();
                state.read_seq = self.inner.reads.fetch_add(1, Ordering::Relaxed) + 1;

                let fresh = if state.is_fresh(stale_after) {
                    state.value.clone()
                } else {
                    None
                };

                if let Some(value) = fresh {
                    self.record(|s| s.record_hit());
                    debug!(
                        marker = "CACHE_OPERATION",
                        operation_type = "cache_hit",
                        cache_key = %key,
                        "Fresh cached value"
                    );
                    ReadStep::Hit(value)
                } else if let Some(in_flight) = &state.in_flight {
                    self.record(|s| s.record_coalesced());
                    debug!(
                        marker = "CACHE_OPERATION",
                        operation_type = "fetch_coalesced",
                        cache_key = %key,
                        generation = in_flight.generation,
                        "Joining in-flight fetch"
                    );
                    ReadStep::Await(in_flight.generation, in_flight.future.clone())
                } else {
                    self.record(|s| s.record_miss());
                    let generation = state.generation;
                    let future = self.spawn_fetch(&key, &slot, generation, fetcher());
                    state.in_flight = Some(InFlight {
                        generation,
                        future: future.clone(),
                    });
                    slot.publish(&state, stale_after);
                    ReadStep::Await(generation, future)
                }
            };

            let (generation, future) = match step {
                ReadStep::Hit(value) => return Ok(value),
                ReadStep::Await(generation, future) => (generation, future),
            };

            let result = future.await;

            if slot.state.lock().generation == generation {
                return result;
            }

            debug!(
                marker = "CACHE_OPERATION",
                operation_type = "fetch_superseded",
                cache_key = %key,
                generation,
                "Entry invalidated during fetch, reading again"
            );
        }
    }

    fn spawn_fetch<Fut>(
        &self,
        key: &QueryKey,
        slot: &Arc<Slot<V>>,
        generation: u64,
        fetch: Fut,
    ) -> SharedFetch<V>
    where
        Fut: Future<Output = SyncResult<V>> + Send + 'static,
    {
        let stale_after = self.inner.config.stale_after;
        let stats = self.inner.config.enable_stats.then(|| Arc::clone(&self.inner.stats));
        let task_slot = Arc::clone(slot);
        let task_key = key.clone();

        info!(
            marker = "CACHE_OPERATION",
            operation_type = "fetch_start",
            cache_key = %key,
            generation,
            "Starting fetch"
        );

        let handle = tokio::spawn(async move {
            let started = Instant::now();
            let result = fetch.await;
            let elapsed = started.elapsed();

            if let Some(stats) = &stats {
                stats.record_load(elapsed, result.is_ok());
            }

            match &result {
                Ok(_) => info!(
                    marker = "CACHE_OPERATION",
                    operation_type = "fetch_success",
                    cache_key = %task_key,
                    load_duration_ms = elapsed.as_millis(),
                    "Fetch succeeded, storing result"
                ),
                Err(e) => warn!(
                    marker = "CACHE_OPERATION",
                    operation_type = "fetch_failure",
                    cache_key = %task_key,
                    load_duration_ms = elapsed.as_millis(),
                    error = %e,
                    "Fetch failed, entry left stale"
                ),
            }

            task_slot.complete(generation, &result, stale_after);
            result
        });

        let join_slot = Arc::clone(slot);
        let join_key = key.to_compact_string();
        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => {
                    let result = Err(SyncError::transient_fetch(
                        join_key,
                        format!("fetch task ended abnormally: {e}"),
                    ));
                    join_slot.complete(generation, &result, stale_after);
                    result
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Mark every matching entry stale. Never fetches.
    #[instrument(skip(self), fields(pattern = %pattern))]
    pub fn invalidate(&self, pattern: &KeyPattern) -> usize {
        let stale_after = self.inner.config.stale_after;
        let mut count = 0;

        for entry in &self.inner.entries {
            if !pattern.matches(entry.key()) {
                continue;
            }
            let slot = entry.value();
            let mut state = slot.state.lock();
            state.generation = state.generation.wrapping_add(1);
            slot.publish(&state, stale_after);
            count += 1;
        }

        self.record(|s| s.record_invalidations(count as u64));
        info!(
            marker = "CACHE_OPERATION",
            operation_type = "invalidate",
            pattern = %pattern,
            invalidated = count,
            "Entries marked stale"
        );

        count
    }

    /// Observe an entry; creates an empty one if the key is new.
    pub fn subscribe(&self, key: &QueryKey) -> watch::Receiver<EntrySnapshot<V>> {
        self.slot(key).tx.subscribe()
    }

    /// Current state of an entry without fetching.
    #[must_use]
    pub fn peek(&self, key: &QueryKey) -> Option<EntrySnapshot<V>> {
        let stale_after = self.inner.config.stale_after;
        self.inner
            .entries
            .get(key)
            .map(|slot| slot.state.lock().snapshot(stale_after))
    }

    /// True when a fresh value is cached for `key`.
    #[must_use]
    pub fn is_fresh(&self, key: &QueryKey) -> bool {
        self.peek(key).is_some_and(|s| !s.is_stale)
    }

    /// Drop every entry. Fetches already in flight finish into detached entries.
    pub fn clear(&self) {
        self.inner.entries.clear();
        info!("Query cache cleared");
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    fn record(&self, f: impl FnOnce(&CacheStats)) {
        if self.inner.config.enable_stats {
            f(&self.inner.stats);
        }
    }

    /// Get cache statistics snapshot
    #[must_use]
    pub fn stats(&self) -> CacheStatsSnapshot {
        if self.inner.config.enable_stats {
            self.inner.stats.snapshot()
        } else {
            CacheStatsSnapshot::default()
        }
    }

    /// Log cache statistics for debugging
    pub fn log_stats(&self) {
        if !self.inner.config.enable_stats {
            debug!("Cache statistics are disabled");
            return;
        }

        let stats = self.stats();
        info!(
            marker = "CACHE_OPERATION",
            operation_type = "cache_stats",
            entries = self.len(),
            hits = stats.hits,
            misses = stats.misses,
            coalesced = stats.coalesced,
            loads = stats.loads,
            invalidations = stats.invalidations,
            evictions = stats.evictions,
            hit_rate = format!("{:.2}%", stats.hit_rate() * 100.0),
            failure_rate = format!("{:.2}%", stats.failure_rate() * 100.0),
            average_load_time = ?stats.average_load_time,
            "Query cache statistics"
        );
    }
}

impl<V> Default for QueryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

// Implement Debug manually to avoid exposing internal cache state
impl<V> fmt::Debug for QueryCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache")
            .field("config", &self.inner.config)
            .field("entries", &self.inner.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use std::sync::atomic::AtomicUsize;
    use tokio::{sync::Notify, time::sleep};

    fn counting_fetcher(
        calls: &Arc<AtomicUsize>,
    ) -> impl Fn() -> BoxFuture<'static, SyncResult<u32>> + Send + use<> {
        let calls = Arc::clone(calls);
        move || {
            let calls = Arc::clone(&calls);
            async move {
                sleep(Duration::from_millis(20)).await;
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(u32::try_from(n).unwrap_or(u32::MAX))
            }
            .boxed()
        }
    }

    fn files_key(name: &str) -> QueryKey {
        let mut c = FilterCriteria::new();
        c.set_file_name(name);
        QueryKey::files(&c)
    }

    #[tokio::test]
    async fn test_fresh_value_is_served_without_fetch() {
        let cache = QueryCache::<u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = QueryKey::storage_stats();

        assert_eq!(cache.read(key.clone(), counting_fetcher(&calls)).await.unwrap(), 1);
        assert_eq!(cache.read(key.clone(), counting_fetcher(&calls)).await.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert!(cache.is_fresh(&key));
    }

    #[tokio::test]
    async fn test_concurrent_reads_share_one_fetch() {
        let cache = QueryCache::<u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = files_key("report");

        let reads = (0..16).map(|_| cache.read(key.clone(), counting_fetcher(&calls)));
        let results = join_all(reads).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.into_iter().all(|r| r.unwrap() == 1));
        assert_eq!(cache.stats().coalesced, 15);
    }

    #[tokio::test]
    async fn test_invalidation_forces_refetch() {
        let cache = QueryCache::<u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = files_key("");

        assert_eq!(cache.read(key.clone(), counting_fetcher(&calls)).await.unwrap(), 1);
        assert_eq!(cache.invalidate(&KeyPattern::Exact(key.clone())), 1);

        let snap = cache.peek(&key).unwrap();
        assert!(snap.is_stale);
        assert_eq!(snap.value, Some(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1, "invalidate must not fetch");

        assert_eq!(cache.read(key.clone(), counting_fetcher(&calls)).await.unwrap(), 2);
        assert!(cache.is_fresh(&key));
    }

    #[tokio::test]
    async fn test_criteria_change_selects_new_entry() {
        let cache = QueryCache::<u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let a = cache.read(files_key("a"), counting_fetcher(&calls)).await.unwrap();
        let b = cache.read(files_key("b"), counting_fetcher(&calls)).await.unwrap();
        let a_again = cache.read(files_key("a"), counting_fetcher(&calls)).await.unwrap();

        assert_eq!((a, b, a_again), (1, 2, 1));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_kind_pattern_only_touches_that_kind() {
        let cache = QueryCache::<u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for key in [files_key("a"), files_key("b"), QueryKey::storage_stats()] {
            cache.read(key, counting_fetcher(&calls)).await.unwrap();
        }

        assert_eq!(cache.invalidate(&KeyPattern::Kind(QueryKind::Files)), 2);
        assert!(!cache.is_fresh(&files_key("a")));
        assert!(!cache.is_fresh(&files_key("b")));
        assert!(cache.is_fresh(&QueryKey::storage_stats()));

        assert_eq!(cache.invalidate(&KeyPattern::All), 3);
        assert!(!cache.is_fresh(&QueryKey::storage_stats()));
    }

    #[tokio::test]
    async fn test_fetch_error_stays_on_its_key_and_retries() {
        let cache = QueryCache::<u32>::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let key = files_key("flaky");

        let fetcher = {
            let attempts = Arc::clone(&attempts);
            move || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(SyncError::transient_fetch("files", "connection reset"))
                    } else {
                        Ok(7)
                    }
                }
            }
        };

        let other_calls = Arc::new(AtomicUsize::new(0));
        cache
            .read(QueryKey::storage_stats(), counting_fetcher(&other_calls))
            .await
            .unwrap();

        let err = cache.read(key.clone(), fetcher.clone()).await.unwrap_err();
        assert!(err.is_retryable());

        let snap = cache.peek(&key).unwrap();
        assert!(snap.is_stale);
        assert!(snap.error.is_some());
        assert!(!snap.is_loading);

        let stats_snap = cache.peek(&QueryKey::storage_stats()).unwrap();
        assert!(stats_snap.error.is_none());
        assert!(!stats_snap.is_stale);

        assert_eq!(cache.read(key.clone(), fetcher).await.unwrap(), 7);
        let snap = cache.peek(&key).unwrap();
        assert!(snap.error.is_none());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_refetch_keeps_last_known_value() {
        let cache = QueryCache::<u32>::new();
        let key = QueryKey::storage_stats();

        cache.read(key.clone(), || async { Ok(3) }).await.unwrap();
        cache.invalidate(&KeyPattern::Exact(key.clone()));

        let result = cache
            .read(key.clone(), || async {
                Err(SyncError::transient_fetch("storage_stats", "503"))
            })
            .await;
        assert!(result.is_err());

        let snap = cache.peek(&key).unwrap();
        assert_eq!(snap.value, Some(3));
        assert!(snap.is_stale);
    }

    #[tokio::test]
    async fn test_invalidation_during_fetch_is_not_lost() {
        let cache = QueryCache::<u32>::new();
        let key = files_key("race");
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());

        let fetcher = {
            let calls = Arc::clone(&calls);
            let gate = Arc::clone(&gate);
            move || {
                let calls = Arc::clone(&calls);
                let gate = Arc::clone(&gate);
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n == 1 {
                        gate.notified().await;
                    }
                    Ok(u32::try_from(n).unwrap_or(u32::MAX))
                }
            }
        };

        let reader = {
            let cache = cache.clone();
            let key = key.clone();
            let fetcher = fetcher.clone();
            tokio::spawn(async move { cache.read(key, fetcher).await })
        };

        while calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert!(cache.peek(&key).unwrap().is_loading);

        cache.invalidate(&KeyPattern::Kind(QueryKind::Files));
        gate.notify_one();

        assert_eq!(reader.await.unwrap().unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(cache.is_fresh(&key));
    }

    #[tokio::test]
    async fn test_observers_see_loading_then_value() {
        let cache = QueryCache::<u32>::new();
        let key = QueryKey::storage_stats();
        let mut rx = cache.subscribe(&key);
        assert!(rx.borrow().value.is_none());

        let calls = Arc::new(AtomicUsize::new(0));
        let read = {
            let cache = cache.clone();
            let key = key.clone();
            let fetcher = counting_fetcher(&calls);
            tokio::spawn(async move { cache.read(key, fetcher).await })
        };

        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().is_loading);

        read.await.unwrap().unwrap();
        let snap = rx.borrow_and_update().clone();
        assert_eq!(snap.value, Some(1));
        assert!(!snap.is_loading);
        assert!(!snap.is_stale);
        assert!(snap.updated_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_based_staleness() {
        let cache = QueryCache::<u32>::with_config(CacheConfig {
            stale_after: Some(Duration::from_secs(1)),
            ..CacheConfig::default()
        });
        let calls = Arc::new(AtomicUsize::new(0));
        let key = QueryKey::storage_stats();

        cache.read(key.clone(), counting_fetcher(&calls)).await.unwrap();
        sleep(Duration::from_millis(500)).await;
        cache.read(key.clone(), counting_fetcher(&calls)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(cache.read(key, counting_fetcher(&calls)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_distinct_keys_are_bounded_by_max_entries() {
        let cache = QueryCache::<u32>::with_config(CacheConfig {
            max_entries: 8,
            ..CacheConfig::default()
        });

        for i in 0..500 {
            cache.read(files_key(&format!("term-{i}")), || async { Ok(1) }).await.unwrap();
            assert!(cache.len() <= 8, "{} entries after {i}", cache.len());
        }

        // Oldest entries went first.
        assert!(cache.peek(&files_key("term-499")).is_some());
        assert!(cache.peek(&files_key("term-0")).is_none());
        assert_eq!(cache.stats().evictions, 492);
    }

    #[tokio::test]
    async fn test_observed_and_loading_entries_survive_eviction() {
        let cache = QueryCache::<u32>::with_config(CacheConfig {
            max_entries: 1,
            ..CacheConfig::default()
        });
        let watched = files_key("watched");
        let _rx = cache.subscribe(&watched);

        let gate = Arc::new(Notify::new());
        let loading = files_key("loading");
        let reader = {
            let cache = cache.clone();
            let gate = Arc::clone(&gate);
            let key = loading.clone();
            tokio::spawn(async move {
                cache
                    .read(key, move || {
                        let gate = Arc::clone(&gate);
                        async move {
                            gate.notified().await;
                            Ok(5)
                        }
                    })
                    .await
            })
        };
        while !cache.peek(&loading).is_some_and(|s| s.is_loading) {
            tokio::task::yield_now().await;
        }

        cache.read(files_key("other"), || async { Ok(1) }).await.unwrap();
        cache.evict_idle();
        assert!(cache.peek(&watched).is_some());
        assert!(cache.peek(&loading).is_some());
        assert!(cache.peek(&files_key("other")).is_none());

        gate.notify_one();
        assert_eq!(reader.await.unwrap().unwrap(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unread_entries_expire_after_idle_time() {
        let cache = QueryCache::<u32>::with_config(CacheConfig {
            time_to_idle: Some(Duration::from_secs(60)),
            ..CacheConfig::default()
        });

        cache.read(files_key("old"), || async { Ok(1) }).await.unwrap();
        sleep(Duration::from_secs(30)).await;
        cache.read(QueryKey::storage_stats(), || async { Ok(2) }).await.unwrap();
        assert_eq!(cache.len(), 2);

        sleep(Duration::from_secs(45)).await;
        assert_eq!(cache.evict_idle(), 1);
        assert!(cache.peek(&files_key("old")).is_none());
        assert!(cache.peek(&QueryKey::storage_stats()).is_some());
    }

    #[test]
    fn test_key_display() {
        assert_eq!(QueryKey::storage_stats().to_string(), "storage_stats");
        assert_eq!(files_key("x").to_string(), "files?file_name=x");
        assert_eq!(files_key("").to_string(), "files");
        assert_eq!(KeyPattern::Kind(QueryKind::Files).to_string(), "files/*");
    }
}
