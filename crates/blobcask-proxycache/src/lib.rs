//! LRU-governed proxy cache over a pair of blob stores.
//!
//! [`ProxyCache`] keeps a fast, bounded *cache* backend in front of an
//! authoritative *origin* backend. Reads consult the cache first and fall
//! back to the origin, repopulating the cache in the background; writes go
//! to both tiers. An in-memory LRU index tracks what the cache holds, and a
//! single-flight background cleaner evicts the oldest entries whenever the
//! tracked bytes exceed the configured ceiling.
//!
//! ```text
//! client ops
//!     |
//!     v
//! ProxyCache ---- LRU index + StatsReceiver + cache_bytes (one mutex)
//!     |                                           ^
//!     +--> cache  (fast, bounded)    <-- cleaner -+
//!     |
//!     +--> origin (authoritative)
//! ```
//!
//! The index is process-lifetime only: a restart starts with
//! `cache_bytes = 0` and never scans pre-existing cache contents, so a
//! populated cache is re-accounted lazily as refs are touched again.

use std::collections::HashSet;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use blobcask_core::BlobRead;
use blobcask_core::BlobRef;
use blobcask_core::BlobSource;
use blobcask_core::BlobStore;
use blobcask_core::BlobStoreError;
use blobcask_core::SizedRef;
use blobcask_core::StatsReceiver;
use blobcask_core::join_all;
use bytes::Bytes;
use lru::LruCache;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::instrument;
use tracing::warn;

pub use blobcask_core::constants::DEFAULT_MAX_CACHE_BYTES;

/// Delay before the origin is consulted during a stat fan-out.
///
/// If the warm cache index answers everything within this window the origin
/// is never contacted.
pub const ORIGIN_STAT_DELAY: Duration = Duration::from_millis(50);

/// One LRU index entry.
struct CacheEntry {
    sb: SizedRef,
    touched: Instant,
    /// Known only through a stat; the blob's bytes are not counted against
    /// the cache budget until a blob touch promotes the entry.
    stat_only: bool,
}

/// Engine state guarded by the one coarse mutex.
struct EngineState {
    /// Most-recently-touched entries at the front.
    lru: LruCache<BlobRef, CacheEntry>,
    /// Sum of non-stat-only entry sizes.
    cache_bytes: i64,
    is_cleaning: bool,
    last_clean_finished: Option<Instant>,
}

struct Inner {
    origin: Arc<dyn BlobStore>,
    cache: Arc<dyn BlobStore>,
    stats: Arc<StatsReceiver>,
    max_cache_bytes: i64,
    state: Mutex<EngineState>,
    shutdown: CancellationToken,
}

/// A caching blob store: a bounded cache tier in front of an authoritative
/// origin tier.
///
/// Clones share the same engine. Background work (cache repopulation, stat
/// upkeep, eviction) is fire-and-forget; its failures are logged, never
/// surfaced, because correctness rests on the origin.
#[derive(Clone)]
pub struct ProxyCache {
    inner: Arc<Inner>,
}

impl ProxyCache {
    /// Cache `origin` through `cache`, evicting past `max_cache_bytes`.
    ///
    /// Backends are shared by reference; the engine does not own their
    /// lifetimes.
    pub fn new(
        max_cache_bytes: i64,
        cache: Arc<dyn BlobStore>,
        origin: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                origin,
                cache,
                stats: Arc::new(StatsReceiver::new()),
                max_cache_bytes,
                state: Mutex::new(EngineState {
                    lru: LruCache::unbounded(),
                    cache_bytes: 0,
                    is_cleaning: false,
                    last_clean_finished: None,
                }),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// The origin backend.
    pub fn origin(&self) -> Arc<dyn BlobStore> {
        Arc::clone(&self.inner.origin)
    }

    /// The cache backend.
    pub fn cache(&self) -> Arc<dyn BlobStore> {
        Arc::clone(&self.inner.cache)
    }

    /// The warm stat index: what the cache is known to contain.
    pub fn stats(&self) -> Arc<StatsReceiver> {
        Arc::clone(&self.inner.stats)
    }

    /// The configured cache byte ceiling.
    pub fn max_cache_bytes(&self) -> i64 {
        self.inner.max_cache_bytes
    }

    /// Bytes currently accounted to the cache.
    pub async fn cache_bytes(&self) -> i64 {
        self.inner.state.lock().await.cache_bytes
    }

    /// When the last cleaner pass finished, if any has.
    pub async fn last_clean_finished(&self) -> Option<Instant> {
        self.inner.state.lock().await.last_clean_finished
    }

    /// Stop background work. In-flight foreground operations complete
    /// normally; pending repopulations and cleaner passes exit early.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

impl Inner {
    /// Record that the cache holds `sb` and that it was just used.
    async fn touch_blob(this: &Arc<Inner>, sb: SizedRef) {
        {
            let mut state = this.state.lock().await;
            match state.lru.peek(&sb.blob_ref) {
                None => state.cache_bytes += i64::from(sb.size),
                // promotion from stat-only accounts the size exactly once
                Some(entry) if entry.stat_only => state.cache_bytes += i64::from(sb.size),
                Some(_) => {}
            }
            state.lru.put(
                sb.blob_ref,
                CacheEntry {
                    sb,
                    touched: Instant::now(),
                    stat_only: false,
                },
            );
        }
        debug!(blob_ref = %sb.blob_ref, size = sb.size, "touched blob");

        let stat = Arc::clone(this);
        tokio::spawn(async move {
            Inner::touch_stat(&stat, sb).await;
        });
        Inner::clean_cache(this);
    }

    /// Record that `sb` was observed via a stat, keeping the stat shadow
    /// index consistent without charging the cache budget.
    async fn touch_stat(this: &Arc<Inner>, sb: SizedRef) {
        {
            let mut state = this.state.lock().await;
            if state.lru.peek(&sb.blob_ref).is_none() {
                state.lru.put(
                    sb.blob_ref,
                    CacheEntry {
                        sb,
                        touched: Instant::now(),
                        stat_only: true,
                    },
                );
                this.stats.receive_ref(&sb.blob_ref, sb.size);
            } else {
                // a stat is still a touch, but must not demote a cached entry
                state.lru.promote(&sb.blob_ref);
            }
        }
        debug!(blob_ref = %sb.blob_ref, "touched stat");
        Inner::clean_cache(this);
    }

    /// Trigger the single-flight cleaner.
    fn clean_cache(this: &Arc<Inner>) {
        let this = Arc::clone(this);
        tokio::spawn(async move {
            {
                let mut state = this.state.lock().await;
                if state.is_cleaning {
                    return;
                }
                state.is_cleaning = true;
            }

            this.clean_pass().await;

            let mut state = this.state.lock().await;
            state.is_cleaning = false;
            state.last_clean_finished = Some(Instant::now());
        });
    }

    /// Evict oldest entries until the cache is back under budget.
    ///
    /// The mutex is released around each cache remove; observers see an
    /// entry either fully present or fully removed.
    async fn clean_pass(&self) {
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }

            let entry = {
                let mut state = self.state.lock().await;
                if state.cache_bytes <= self.max_cache_bytes {
                    return;
                }
                debug!(
                    cache_bytes = state.cache_bytes,
                    max_cache_bytes = self.max_cache_bytes,
                    "cache over budget"
                );
                match state.lru.pop_lru() {
                    Some((_, entry)) => entry,
                    None => return,
                }
            };

            if let Err(error) = self.cache.remove_blobs(&[entry.sb.blob_ref]).await {
                warn!(
                    blob_ref = %entry.sb.blob_ref,
                    %error,
                    "could not remove oldest blob; aborting clean pass"
                );
                let mut state = self.state.lock().await;
                let br = entry.sb.blob_ref;
                state.lru.put(br, entry);
                // back to the old end of the index, where it came from
                state.lru.demote(&br);
                return;
            }

            if let Err(error) = self.stats.remove_blobs(&[entry.sb.blob_ref]).await {
                warn!(
                    blob_ref = %entry.sb.blob_ref,
                    %error,
                    "could not drop evicted blob from stats; aborting clean pass"
                );
                return;
            }

            let mut state = self.state.lock().await;
            if !entry.stat_only {
                state.cache_bytes -= i64::from(entry.sb.size);
            }
            debug!(
                blob_ref = %entry.sb.blob_ref,
                idle = ?entry.touched.elapsed(),
                "evicted blob"
            );
        }
    }
}

/// Multiplex stat answers from the warm index and the hedged origin query,
/// emitting each requested ref at most once.
async fn consume_stats(
    inner: Arc<Inner>,
    dest: mpsc::Sender<SizedRef>,
    mut hits: mpsc::Receiver<SizedRef>,
    mut misses: mpsc::Receiver<SizedRef>,
    want: usize,
) -> Result<(), BlobStoreError> {
    if want == 0 {
        return Ok(());
    }

    let mut seen: HashSet<BlobRef> = HashSet::new();
    let mut more_hits = true;
    let mut more_misses = true;
    while more_hits || more_misses {
        let sb = tokio::select! {
            hit = hits.recv(), if more_hits => match hit {
                Some(sb) => {
                    debug!(blob_ref = %sb.blob_ref, "stat answered by cache index");
                    sb
                }
                None => {
                    more_hits = false;
                    continue;
                }
            },
            miss = misses.recv(), if more_misses => match miss {
                Some(sb) => {
                    debug!(blob_ref = %sb.blob_ref, "stat answered by origin");
                    sb
                }
                None => {
                    more_misses = false;
                    continue;
                }
            },
        };

        Inner::touch_stat(&inner, sb).await;

        if seen.insert(sb.blob_ref) {
            if dest.send(sb).await.is_err() {
                // the caller stopped listening; nothing left to report
                return Ok(());
            }
        }
        if seen.len() == want {
            return Ok(());
        }
    }

    Err(BlobStoreError::StatIncomplete)
}

#[async_trait]
impl BlobStore for ProxyCache {
    /// Cache first; origin on miss, with background repopulation.
    ///
    /// A not-found from the origin surfaces unchanged so callers can still
    /// distinguish missing blobs from I/O failures.
    #[instrument(skip(self))]
    async fn fetch(&self, br: &BlobRef) -> Result<(BlobRead, u32), BlobStoreError> {
        match self.inner.cache.fetch(br).await {
            Ok((rc, size)) => {
                Inner::touch_blob(&self.inner, SizedRef::new(*br, size)).await;
                return Ok((rc, size));
            }
            Err(error) if !error.is_not_found() => {
                warn!(blob_ref = %br, %error, "cache fetch failed; falling back to origin");
            }
            Err(_) => {}
        }

        let (mut rc, size) = self.inner.origin.fetch(br).await?;

        // Slurp the body so the caller gets an immediate reader while the
        // cache is repopulated in the background. Bodies are bounded by the
        // 16 MiB blob convention.
        let mut body = Vec::with_capacity(size as usize);
        rc.read_to_end(&mut body).await?;
        let body = Bytes::from(body);

        let inner = Arc::clone(&self.inner);
        let br = *br;
        let copy = body.clone();
        tokio::spawn(async move {
            if inner.shutdown.is_cancelled() {
                return;
            }
            let mut source = Cursor::new(copy);
            match inner.cache.receive_blob(&br, &mut source).await {
                // touch with the size the cache actually stored
                Ok(sb) => Inner::touch_blob(&inner, sb).await,
                Err(error) => {
                    warn!(blob_ref = %br, %error, "populating cache from origin failed");
                }
            }
        });

        Ok((Box::new(Cursor::new(body)) as BlobRead, size))
    }

    /// Write to the cache, then to the origin. The origin's sized ref is
    /// returned; a cache failure aborts before the origin is attempted.
    #[instrument(skip(self, source))]
    async fn receive_blob(
        &self,
        br: &BlobRef,
        source: BlobSource<'_>,
    ) -> Result<SizedRef, BlobStoreError> {
        // Slurp the whole blob before replicating; bounded by the 16 MiB
        // blob convention.
        let mut body = Vec::new();
        source.read_to_end(&mut body).await?;
        let body = Bytes::from(body);

        self.inner
            .cache
            .receive_blob(br, &mut Cursor::new(body.clone()))
            .await?;
        let sb = self
            .inner
            .origin
            .receive_blob(br, &mut Cursor::new(body))
            .await?;
        Inner::touch_blob(&self.inner, sb).await;
        Ok(sb)
    }

    /// Answer from the warm index immediately; hedge the origin 50 ms
    /// behind it. Each requested ref is emitted at most once, in arrival
    /// order.
    #[instrument(skip(self, dest, blobs), fields(want = blobs.len()))]
    async fn stat_blobs(
        &self,
        dest: mpsc::Sender<SizedRef>,
        blobs: &[BlobRef],
    ) -> Result<(), BlobStoreError> {
        let want = blobs.len();
        let (hit_tx, hit_rx) = mpsc::channel(want.max(1));
        let (miss_tx, miss_rx) = mpsc::channel(want.max(1));
        let hedge = CancellationToken::new();

        let mut tasks: JoinSet<Result<(), BlobStoreError>> = JoinSet::new();

        let stats = Arc::clone(&self.inner.stats);
        let refs = blobs.to_vec();
        tasks.spawn(async move { stats.stat_blobs(hit_tx, &refs).await });

        let origin = Arc::clone(&self.inner.origin);
        let refs = blobs.to_vec();
        let hedge_fire = hedge.clone();
        tasks.spawn(async move {
            tokio::select! {
                // the cache index answered everything first
                _ = hedge_fire.cancelled() => Ok(()),
                _ = tokio::time::sleep(ORIGIN_STAT_DELAY) => {
                    origin.stat_blobs(miss_tx, &refs).await
                }
            }
        });

        let inner = Arc::clone(&self.inner);
        tasks.spawn(async move {
            // stops a not-yet-fired origin query on every exit path
            let _stop_hedge = hedge.drop_guard();
            consume_stats(inner, dest, hit_rx, miss_rx, want).await
        });

        join_all(tasks).await
    }

    /// Fan out to cache and origin in parallel; first error wins.
    ///
    /// The LRU is deliberately not updated here: a stale entry merely
    /// delays eviction of an already-removed blob, and later touches
    /// reconcile the index.
    async fn remove_blobs(&self, blobs: &[BlobRef]) -> Result<(), BlobStoreError> {
        let mut tasks = JoinSet::new();

        let cache = Arc::clone(&self.inner.cache);
        let refs = blobs.to_vec();
        tasks.spawn(async move { cache.remove_blobs(&refs).await });

        let origin = Arc::clone(&self.inner.origin);
        let refs = blobs.to_vec();
        tasks.spawn(async move { origin.remove_blobs(&refs).await });

        join_all(tasks).await
    }

    /// Enumeration is authoritative, so it goes to the origin only.
    async fn enumerate_blobs(
        &self,
        cancel: CancellationToken,
        dest: mpsc::Sender<SizedRef>,
        after: &str,
        limit: usize,
    ) -> Result<(), BlobStoreError> {
        self.inner.origin.enumerate_blobs(cancel, dest, after, limit).await
    }
}

#[cfg(test)]
impl ProxyCache {
    /// The invariant the index maintains: tracked bytes equal the sum of
    /// non-stat-only entry sizes.
    async fn assert_accounting(&self) {
        let state = self.inner.state.lock().await;
        let sum: i64 = state
            .lru
            .iter()
            .filter(|(_, entry)| !entry.stat_only)
            .map(|(_, entry)| i64::from(entry.sb.size))
            .sum();
        assert_eq!(state.cache_bytes, sum, "cache_bytes drifted from the LRU");
    }

    async fn lru_len(&self) -> usize {
        self.inner.state.lock().await.lru.len()
    }
}
