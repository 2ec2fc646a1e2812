//! Block cache with single-flight loads and byte-budget eviction.
//!
//! One cache entry exists per block id at any time. A lookup for a
//! missing block atomically inserts a `Loading` entry and takes the
//! load obligation; concurrent lookups find the entry and sleep on its
//! rendezvous. Decodes run on the worker pool. Ready buffers are
//! immutable and shared by reference count; an entry may only be
//! evicted while its pin count is zero.

use crate::pool::{CancelFlag, JobPriority, WorkerPool};
use crate::{BlockBuf, BlockSource};
use parking_lot::{Condvar, Mutex};
use sfs_error::{Result, SfsError};
use sfs_types::{BlockId, TidyConfig, TidyStrategy};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Number of power-of-two microsecond buckets in the decode latency
/// histogram. Bucket `i` counts decodes that took `< 2^i` µs.
pub const LATENCY_BUCKETS: usize = 16;

/// Sleep granularity of the tidy timer thread, bounding shutdown
/// latency.
const TIDY_TIMER_STEP: Duration = Duration::from_millis(50);

/// Host query for whether a buffer's pages are resident in RAM.
///
/// Used by the `BlockSwappedOut` tidy strategy to drop buffers the
/// kernel has already paged out. Hosts without a probe degrade to the
/// expiry-time strategy.
pub trait ResidencyProbe: Send + Sync {
    /// `Some(false)` when the pages backing `buf` have been swapped
    /// out, `None` when the host cannot tell.
    fn is_resident(&self, buf: &[u8]) -> Option<bool>;
}

/// Cache construction options.
#[derive(Clone)]
pub struct CacheOptions {
    pub budget_bytes: u64,
    pub tidy: TidyConfig,
    pub residency_probe: Option<Arc<dyn ResidencyProbe>>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            budget_bytes: 512 << 20,
            tidy: TidyConfig::default(),
            residency_probe: None,
        }
    }
}

impl fmt::Debug for CacheOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheOptions")
            .field("budget_bytes", &self.budget_bytes)
            .field("tidy", &self.tidy)
            .field("residency_probe", &self.residency_probe.is_some())
            .finish()
    }
}

/// Cloneable record of a failed load, handed to every waiter.
///
/// `SfsError` itself is not `Clone` (it may wrap an `io::Error`), so
/// the failure is stored in this reduced form and rebuilt per waiter.
#[derive(Debug, Clone)]
enum LoadFailure {
    Corrupt { block: u64, detail: String },
    UnsupportedCodec(u8),
    Cancelled,
    Io(String),
}

impl LoadFailure {
    fn from_error(err: &SfsError) -> Self {
        match err {
            SfsError::CorruptBlock { block, detail } => Self::Corrupt {
                block: *block,
                detail: detail.clone(),
            },
            SfsError::UnsupportedCodec(raw) => Self::UnsupportedCodec(*raw),
            SfsError::Cancelled => Self::Cancelled,
            other => Self::Io(other.to_string()),
        }
    }

    fn to_error(&self) -> SfsError {
        match self {
            Self::Corrupt { block, detail } => SfsError::CorruptBlock {
                block: *block,
                detail: detail.clone(),
            },
            Self::UnsupportedCodec(raw) => SfsError::UnsupportedCodec(*raw),
            Self::Cancelled => SfsError::Cancelled,
            Self::Io(detail) => SfsError::Io(std::io::Error::other(detail.clone())),
        }
    }
}

#[derive(Debug)]
enum EntryState {
    Loading,
    Ready(BlockBuf),
    Failed(LoadFailure),
}

/// One cache slot. Present in the map exactly while loading or ready.
struct CacheEntry {
    block: BlockId,
    state: Mutex<EntryState>,
    ready: Condvar,
    /// Outstanding futures and handles. An entry is evictable only at
    /// zero; transitions from zero happen under the cache map lock.
    pins: AtomicUsize,
    /// Logical recency clock value of the last access.
    last_access: AtomicU64,
    /// Milliseconds since cache epoch at the last access (expiry tidy).
    last_access_ms: AtomicU64,
}

impl CacheEntry {
    fn new(block: BlockId) -> Self {
        Self {
            block,
            state: Mutex::new(EntryState::Loading),
            ready: Condvar::new(),
            pins: AtomicUsize::new(0),
            last_access: AtomicU64::new(0),
            last_access_ms: AtomicU64::new(0),
        }
    }

    fn ready_len(&self) -> Option<u64> {
        match &*self.state.lock() {
            EntryState::Ready(buf) => Some(buf.len() as u64),
            _ => None,
        }
    }

    fn ready_buf(&self) -> Option<BlockBuf> {
        match &*self.state.lock() {
            EntryState::Ready(buf) => Some(buf.clone()),
            _ => None,
        }
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    decode_latency: [AtomicU64; LATENCY_BUCKETS],
}

impl Counters {
    fn record_latency(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        let bucket = (64 - micros.leading_zeros() as usize).min(LATENCY_BUCKETS - 1);
        self.decode_latency[bucket].fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot of cache statistics.
///
/// All counters are monotonically increasing for the lifetime of the
/// cache; the resident figures reflect the instant of the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub resident_blocks: usize,
    pub resident_bytes: u64,
    pub budget_bytes: u64,
    /// Bucket `i` counts decodes finishing in `< 2^i` microseconds.
    pub decode_latency_us: [u64; LATENCY_BUCKETS],
}

impl CacheStats {
    /// Cache hit ratio in the range [0.0, 1.0].
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Multi-line text rendering used by the perfmon xattr.
    #[must_use]
    pub fn summarize(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        let _ = writeln!(out, "block cache:");
        let _ = writeln!(out, "  hits:       {}", self.hits);
        let _ = writeln!(out, "  misses:     {}", self.misses);
        let _ = writeln!(out, "  hit ratio:  {:.1}%", self.hit_ratio() * 100.0);
        let _ = writeln!(out, "  evictions:  {}", self.evictions);
        let _ = writeln!(
            out,
            "  resident:   {} blocks / {} bytes (budget {})",
            self.resident_blocks, self.resident_bytes, self.budget_bytes
        );
        let _ = writeln!(out, "  decode latency (count < 2^i us):");
        for (i, count) in self.decode_latency_us.iter().enumerate() {
            if *count > 0 {
                let _ = writeln!(out, "    <2^{i:<2} us: {count}");
            }
        }
        out
    }
}

struct CacheState {
    entries: HashMap<BlockId, Arc<CacheEntry>>,
    resident_bytes: u64,
    budget_bytes: u64,
    tidy: TidyConfig,
    residency_probe: Option<Arc<dyn ResidencyProbe>>,
    /// Set once `BlockSwappedOut` degraded to `ExpiryTime`.
    swap_degraded: bool,
}

struct CacheInner {
    source: Arc<dyn BlockSource>,
    pool: Arc<WorkerPool>,
    state: Mutex<CacheState>,
    counters: Counters,
    /// Logical recency clock; incremented on every touch.
    clock: AtomicU64,
    epoch: Instant,
    /// Shared flag for all background work; cancelled at shutdown.
    bg_cancel: CancelFlag,
}

impl CacheInner {
    fn touch(&self, entry: &CacheEntry) {
        let tick = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        entry.last_access.store(tick, Ordering::Relaxed);
        let ms = u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX);
        entry.last_access_ms.store(ms, Ordering::Relaxed);
    }

    /// Perform the decode for an entry this thread holds the load
    /// obligation for, then publish the result to all waiters.
    fn run_load(&self, entry: &Arc<CacheEntry>, cancel: &CancelFlag) {
        let started = Instant::now();
        match self.source.load(entry.block, cancel) {
            Ok(buf) => {
                self.counters.record_latency(started.elapsed());
                let len = buf.len() as u64;
                trace!(
                    target: "sfs::block::cache",
                    event = "block_ready",
                    block = entry.block.0,
                    bytes = len,
                    decode_us = started.elapsed().as_micros() as u64
                );

                *entry.state.lock() = EntryState::Ready(buf);
                entry.ready.notify_all();

                let over_budget = {
                    let mut state = self.state.lock();
                    // The entry may have been dropped by a concurrent
                    // shutdown; only account for it while it is mapped.
                    if state.entries.contains_key(&entry.block) {
                        state.resident_bytes += len;
                    }
                    state.resident_bytes > state.budget_bytes
                };
                if over_budget {
                    self.evict_to_budget();
                }
            }
            Err(err) => {
                debug!(
                    target: "sfs::block::cache",
                    event = "block_load_failed",
                    block = entry.block.0,
                    error = %err
                );
                self.fail_entry(entry, LoadFailure::from_error(&err));
            }
        }
    }

    /// Remove a failed entry and wake its waiters with the error.
    ///
    /// The entry leaves the map, so a subsequent request retries the
    /// decode — failures are not cached.
    fn fail_entry(&self, entry: &Arc<CacheEntry>, failure: LoadFailure) {
        self.state.lock().entries.remove(&entry.block);
        *entry.state.lock() = EntryState::Failed(failure);
        entry.ready.notify_all();
    }

    /// Synchronous eviction pass bringing resident bytes under budget.
    fn evict_to_budget(&self) {
        let mut state = self.state.lock();
        if state.resident_bytes <= state.budget_bytes {
            return;
        }
        let candidates = eviction_order(&state);
        for block in candidates {
            if state.resident_bytes <= state.budget_bytes {
                break;
            }
            self.evict_one(&mut state, block);
        }
    }

    /// Evict `block` if it is still present, ready and unpinned.
    fn evict_one(&self, state: &mut CacheState, block: BlockId) {
        let Some(entry) = state.entries.get(&block) else {
            return;
        };
        // Pins only rise from zero under the map lock we hold.
        if entry.pins.load(Ordering::Acquire) != 0 {
            return;
        }
        let Some(len) = entry.ready_len() else {
            return;
        };
        state.entries.remove(&block);
        state.resident_bytes = state.resident_bytes.saturating_sub(len);
        self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        trace!(
            target: "sfs::block::cache",
            event = "block_evicted",
            block = block.0,
            bytes = len
        );
    }

    /// One periodic tidy pass, run as a background pool job.
    fn run_tidy_pass(&self) {
        let strategy = {
            let state = self.state.lock();
            if state.tidy.strategy == TidyStrategy::BlockSwappedOut
                && state.residency_probe.is_none()
            {
                drop(state);
                self.degrade_swap_strategy();
                TidyStrategy::ExpiryTime
            } else {
                state.tidy.strategy
            }
        };

        match strategy {
            TidyStrategy::None => {}
            TidyStrategy::ExpiryTime => self.tidy_expired(),
            TidyStrategy::BlockSwappedOut => self.tidy_swapped_out(),
        }
    }

    fn degrade_swap_strategy(&self) {
        let mut state = self.state.lock();
        if !state.swap_degraded {
            state.swap_degraded = true;
            warn!(
                target: "sfs::block::cache",
                event = "tidy_swap_unsupported",
                fallback = "time"
            );
        }
    }

    fn tidy_expired(&self) {
        let now_ms = u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX);
        let mut state = self.state.lock();
        let max_age_ms = u64::try_from(state.tidy.max_age.as_millis()).unwrap_or(u64::MAX);
        let expired: Vec<BlockId> = eviction_order(&state)
            .into_iter()
            .filter(|block| {
                state.entries.get(block).is_some_and(|entry| {
                    now_ms.saturating_sub(entry.last_access_ms.load(Ordering::Relaxed))
                        >= max_age_ms
                })
            })
            .collect();
        for block in expired {
            self.evict_one(&mut state, block);
        }
    }

    fn tidy_swapped_out(&self) {
        // Probe buffers outside the map lock; buffers are immutable
        // and the clone is reference-counted.
        let (probe, buffers) = {
            let state = self.state.lock();
            let Some(probe) = state.residency_probe.clone() else {
                return;
            };
            let buffers: Vec<(BlockId, BlockBuf)> = state
                .entries
                .values()
                .filter_map(|entry| entry.ready_buf().map(|buf| (entry.block, buf)))
                .collect();
            (probe, buffers)
        };

        let mut swapped = Vec::new();
        for (block, buf) in buffers {
            match probe.is_resident(buf.as_slice()) {
                Some(false) => swapped.push(block),
                Some(true) => {}
                None => {
                    self.degrade_swap_strategy();
                    self.tidy_expired();
                    return;
                }
            }
        }

        let mut state = self.state.lock();
        for block in swapped {
            self.evict_one(&mut state, block);
        }
    }

    fn stats(&self) -> CacheStats {
        let (resident_blocks, resident_bytes, budget_bytes) = {
            let state = self.state.lock();
            let blocks = state
                .entries
                .values()
                .filter(|entry| entry.ready_len().is_some())
                .count();
            (blocks, state.resident_bytes, state.budget_bytes)
        };
        let mut decode_latency_us = [0_u64; LATENCY_BUCKETS];
        for (slot, counter) in decode_latency_us
            .iter_mut()
            .zip(self.counters.decode_latency.iter())
        {
            *slot = counter.load(Ordering::Relaxed);
        }
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            resident_blocks,
            resident_bytes,
            budget_bytes,
            decode_latency_us,
        }
    }
}

/// Deterministic eviction order over the current entries: least
/// recently accessed first; ties broken by smaller pin count, then
/// larger block id.
fn eviction_order(state: &CacheState) -> Vec<BlockId> {
    let mut order: Vec<(u64, usize, Reverse<u32>)> = state
        .entries
        .values()
        .map(|entry| {
            (
                entry.last_access.load(Ordering::Relaxed),
                entry.pins.load(Ordering::Relaxed),
                Reverse(entry.block.0),
            )
        })
        .collect();
    order.sort_unstable();
    order
        .into_iter()
        .map(|(_, _, Reverse(block))| BlockId(block))
        .collect()
}

// ── Futures and handles ─────────────────────────────────────────────────────

/// Pinned reference to a ready block buffer.
///
/// Dropping the handle unpins the entry; the buffer itself stays alive
/// as long as any clone of it exists.
pub struct BlockHandle {
    entry: Arc<CacheEntry>,
    buf: BlockBuf,
}

impl BlockHandle {
    /// Build a handle that takes over an already-counted pin.
    fn adopt(entry: Arc<CacheEntry>, buf: BlockBuf) -> Self {
        Self { entry, buf }
    }

    #[must_use]
    pub fn block(&self) -> BlockId {
        self.entry.block
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.buf.as_slice()
    }
}

impl Clone for BlockHandle {
    fn clone(&self) -> Self {
        self.entry.pins.fetch_add(1, Ordering::AcqRel);
        Self {
            entry: Arc::clone(&self.entry),
            buf: self.buf.clone(),
        }
    }
}

impl Drop for BlockHandle {
    fn drop(&mut self) {
        self.entry.pins.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for BlockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockHandle")
            .field("block", &self.entry.block)
            .field("len", &self.buf.len())
            .finish()
    }
}

/// Pending cache lookup: wait for the result or poll it.
///
/// Holds a pin on the entry so it cannot be evicted between lookup and
/// wait.
pub struct BlockFuture {
    entry: Arc<CacheEntry>,
    pin_held: bool,
}

impl BlockFuture {
    #[must_use]
    pub fn block(&self) -> BlockId {
        self.entry.block
    }

    /// Whether `wait` would return without blocking.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        !matches!(&*self.entry.state.lock(), EntryState::Loading)
    }

    /// Block until the load finishes; returns the handle or the load
    /// error.
    pub fn wait(mut self) -> Result<BlockHandle> {
        let mut state = self.entry.state.lock();
        loop {
            match &*state {
                EntryState::Ready(buf) => {
                    let buf = buf.clone();
                    drop(state);
                    // The handle takes over this future's pin.
                    self.pin_held = false;
                    return Ok(BlockHandle::adopt(Arc::clone(&self.entry), buf));
                }
                EntryState::Failed(failure) => {
                    let err = failure.to_error();
                    drop(state);
                    return Err(err);
                }
                EntryState::Loading => self.entry.ready.wait(&mut state),
            }
        }
    }
}

impl Drop for BlockFuture {
    fn drop(&mut self) {
        if self.pin_held {
            self.entry.pins.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl fmt::Debug for BlockFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockFuture")
            .field("block", &self.entry.block)
            .field("ready", &self.is_ready())
            .finish()
    }
}

// ── Tidy timer ──────────────────────────────────────────────────────────────

/// Periodic timer submitting tidy jobs on the worker pool.
struct TidyTimer {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl TidyTimer {
    fn start(inner: Arc<CacheInner>, interval: Duration) -> Option<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let join = thread::Builder::new()
            .name("sfs-cache-tidy".to_owned())
            .spawn(move || loop {
                let mut slept = Duration::ZERO;
                while slept < interval {
                    if stop_flag.load(Ordering::Acquire) {
                        return;
                    }
                    let step = TIDY_TIMER_STEP.min(interval - slept);
                    thread::sleep(step);
                    slept += step;
                }

                let pass = Arc::clone(&inner);
                let cancel = inner.bg_cancel.clone();
                let submitted = inner.pool.try_submit(JobPriority::Background, cancel, move || {
                    pass.run_tidy_pass();
                });
                if !submitted {
                    trace!(
                        target: "sfs::block::cache",
                        event = "tidy_pass_skipped",
                        reason = "pool busy"
                    );
                }
            });

        match join {
            Ok(join) => Some(Self {
                stop,
                join: Some(join),
            }),
            Err(err) => {
                warn!(
                    target: "sfs::block::cache",
                    event = "tidy_timer_spawn_failed",
                    error = %err
                );
                None
            }
        }
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for TidyTimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── The cache ───────────────────────────────────────────────────────────────

/// Keyed store of decompressed blocks.
pub struct BlockCache {
    inner: Arc<CacheInner>,
    tidy_timer: Mutex<Option<TidyTimer>>,
    shut_down: AtomicBool,
}

impl BlockCache {
    #[must_use]
    pub fn new(
        source: Arc<dyn BlockSource>,
        pool: Arc<WorkerPool>,
        options: CacheOptions,
    ) -> Arc<Self> {
        let inner = Arc::new(CacheInner {
            source,
            pool,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                resident_bytes: 0,
                budget_bytes: options.budget_bytes,
                tidy: options.tidy,
                residency_probe: options.residency_probe,
                swap_degraded: false,
            }),
            counters: Counters::default(),
            clock: AtomicU64::new(0),
            epoch: Instant::now(),
            bg_cancel: CancelFlag::new(),
        });
        let cache = Arc::new(Self {
            inner,
            tidy_timer: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        });
        cache.set_tidy(options.tidy);
        cache
    }

    /// Blocking lookup: returns a pinned handle to the ready block.
    pub fn get(&self, block: BlockId, priority: JobPriority) -> Result<BlockHandle> {
        self.get_async(block, priority)?.wait()
    }

    /// Non-blocking lookup: returns a future-like token.
    ///
    /// Exactly one decode runs per missing block no matter how many
    /// concurrent lookups race here; losers attach to the winner's
    /// entry.
    pub fn get_async(&self, block: BlockId, priority: JobPriority) -> Result<BlockFuture> {
        if block.0 >= self.inner.source.num_blocks() {
            return Err(SfsError::InvalidArgument("block id out of range"));
        }

        let entry = {
            let mut state = self.inner.state.lock();
            if let Some(entry) = state.entries.get(&block).cloned() {
                self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                self.inner.touch(&entry);
                entry.pins.fetch_add(1, Ordering::AcqRel);
                return Ok(BlockFuture {
                    entry,
                    pin_held: true,
                });
            }

            self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
            let entry = Arc::new(CacheEntry::new(block));
            self.inner.touch(&entry);
            entry.pins.fetch_add(1, Ordering::AcqRel);
            state.entries.insert(block, Arc::clone(&entry));
            entry
        };

        // This thread won the insert race and owns the load. Submit
        // outside the map lock: a full queue must not stall other
        // lookups, and workers need the lock to finish loads.
        let cancel = match priority {
            JobPriority::Foreground => CancelFlag::new(),
            JobPriority::Background => self.inner.bg_cancel.clone(),
        };
        let job_inner = Arc::clone(&self.inner);
        let job_entry = Arc::clone(&entry);
        let job_cancel = cancel.clone();
        if let Err(err) = self.inner.pool.submit(priority, cancel, move || {
            job_inner.run_load(&job_entry, &job_cancel);
        }) {
            self.inner.fail_entry(&entry, LoadFailure::Cancelled);
            entry.pins.fetch_sub(1, Ordering::AcqRel);
            return Err(err);
        }

        Ok(BlockFuture {
            entry,
            pin_held: true,
        })
    }

    /// Best-effort background load; never blocks.
    pub fn prefetch(&self, block: BlockId) {
        if self.shut_down.load(Ordering::Acquire) || block.0 >= self.inner.source.num_blocks() {
            return;
        }

        let mut state = self.inner.state.lock();
        if state.entries.contains_key(&block) {
            return;
        }

        let entry = Arc::new(CacheEntry::new(block));
        self.inner.touch(&entry);
        state.entries.insert(block, Arc::clone(&entry));

        let job_inner = Arc::clone(&self.inner);
        let job_entry = Arc::clone(&entry);
        let cancel = self.inner.bg_cancel.clone();
        let job_cancel = cancel.clone();
        let submitted = self
            .inner
            .pool
            .try_submit(JobPriority::Background, cancel, move || {
                job_inner.run_load(&job_entry, &job_cancel);
            });
        if !submitted {
            // Still under the map lock, so no lookup has seen the entry.
            state.entries.remove(&block);
            trace!(
                target: "sfs::block::cache",
                event = "prefetch_dropped",
                block = block.0,
                reason = "pool busy"
            );
        }
    }

    /// Change the byte budget and evict down to it.
    pub fn set_budget(&self, bytes: u64) {
        self.inner.state.lock().budget_bytes = bytes;
        debug!(
            target: "sfs::block::cache",
            event = "budget_changed",
            bytes
        );
        self.inner.evict_to_budget();
    }

    /// Resize the worker pool.
    pub fn set_workers(&self, n: usize) {
        self.inner.pool.set_workers(n);
    }

    /// Replace the tidy configuration, restarting the timer.
    pub fn set_tidy(&self, config: TidyConfig) {
        let mut timer = self.tidy_timer.lock();
        if let Some(old) = timer.take() {
            drop(old);
        }
        self.inner.state.lock().tidy = config;

        if self.shut_down.load(Ordering::Acquire) {
            return;
        }
        if config.strategy != TidyStrategy::None && !config.interval.is_zero() {
            *timer = TidyTimer::start(Arc::clone(&self.inner), config.interval);
            debug!(
                target: "sfs::block::cache",
                event = "tidy_timer_started",
                strategy = ?config.strategy,
                interval_ms = config.interval.as_millis() as u64
            );
        }
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.inner.stats()
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.inner.source.block_size()
    }

    #[must_use]
    pub fn num_blocks(&self) -> u32 {
        self.inner.source.num_blocks()
    }

    #[must_use]
    pub fn decompressed_len(&self, block: BlockId) -> u64 {
        self.inner.source.decompressed_len(block)
    }

    /// Stop the tidy timer, cancel background work, drain foreground
    /// loads and drop every entry. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(timer) = self.tidy_timer.lock().take() {
            drop(timer);
        }
        self.inner.bg_cancel.cancel();
        self.inner.pool.shutdown();

        // Anything still loading was a background job that got
        // dropped; wake its waiters with a cancellation.
        let orphans: Vec<Arc<CacheEntry>> = {
            let mut state = self.inner.state.lock();
            state.resident_bytes = 0;
            state.entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in orphans {
            let mut st = entry.state.lock();
            if matches!(&*st, EntryState::Loading) {
                *st = EntryState::Failed(LoadFailure::Cancelled);
                drop(st);
                entry.ready.notify_all();
            }
        }
        debug!(target: "sfs::block::cache", event = "cache_shut_down");
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("BlockCache")
            .field("resident_blocks", &stats.resident_blocks)
            .field("resident_bytes", &stats.resident_bytes)
            .field("budget_bytes", &stats.budget_bytes)
            .finish()
    }
}
