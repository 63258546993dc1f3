//! Byte-budgeted page cache.
//!
//! All extracted page data passes through here. Entries are RAM-backed up to
//! the configured budget, spilling to temp files for oversized pages. The
//! budget counters are the only cross-job shared mutable state besides the
//! index catalog; both live behind one short-held mutex, and all actual byte
//! I/O happens outside the lock.
//!
//! Flow is transactional: `reserve` books budget and returns a ticket,
//! `commit` attaches the payload, and an uncommitted ticket returns its
//! reservation when dropped - a cancelled job can never leave a half-visible
//! entry behind.
//!
//! Backpressure: when eviction cannot free enough room, background callers
//! get `WouldBlock` and are expected to pause until [`MemoryPool::wait_for_capacity`]
//! fires. Page-serving callers never block; they fall back to temp-file
//! backing instead.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::config::{available_ram_percent, EngineConfig};

/// Cache key: one entry of one archive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub archive: PathBuf,
    pub entry: usize,
}

impl PageKey {
    pub fn new(archive: impl Into<PathBuf>, entry: usize) -> Self {
        Self {
            archive: archive.into(),
            entry,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Backing {
    Memory(Arc<Vec<u8>>),
    TempFile(PathBuf),
}

/// Who is asking for budget. Background callers yield under pressure;
/// page-serving callers do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    Page,
    Background,
}

/// What to store under a committed ticket.
pub enum Payload {
    Bytes(Vec<u8>),
    File(PathBuf),
}

pub enum Reservation {
    Granted(Ticket),
    /// The key is already cached; nothing to do.
    AlreadyCached,
    /// Budget exhausted and nothing evictable. Background callers should
    /// pause and retry after `wait_for_capacity`.
    WouldBlock,
}

/// A booked slice of budget. Dropping without committing returns the
/// reservation.
pub struct Ticket {
    shared: Arc<PoolShared>,
    key: PageKey,
    size: u64,
    in_memory: bool,
    committed: bool,
}

impl Ticket {
    /// True when the entry must be written to a temp file (oversized page or
    /// budget fallback) rather than held in RAM.
    pub fn wants_file(&self) -> bool {
        !self.in_memory
    }

    pub fn key(&self) -> &PageKey {
        &self.key
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if !self.committed {
            if self.in_memory {
                let mut st = self.shared.lock_state();
                st.reserved = st.reserved.saturating_sub(self.size);
            }
            self.shared.freed.notify_waiters();
        }
    }
}

/// Pinned view of a cached entry. The entry cannot be evicted while a guard
/// is alive; the pin is released on drop.
pub struct PoolGuard {
    shared: Arc<PoolShared>,
    key: PageKey,
    backing: Backing,
}

impl PoolGuard {
    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        match &self.backing {
            Backing::Memory(b) => Some(b),
            Backing::TempFile(_) => None,
        }
    }

    pub fn temp_path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Memory(_) => None,
            Backing::TempFile(p) => Some(p),
        }
    }

    /// Materialize the page bytes whatever the backing.
    pub async fn read(&self) -> std::io::Result<Vec<u8>> {
        match &self.backing {
            Backing::Memory(b) => Ok(b.as_ref().clone()),
            Backing::TempFile(p) => tokio::fs::read(p).await,
        }
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        let mut st = self.shared.lock_state();
        if let Some(entry) = st.entries.get_mut(&self.key) {
            entry.pins = entry.pins.saturating_sub(1);
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolStats {
    pub entry_count: usize,
    pub used_bytes: u64,
    pub reserved_bytes: u64,
    pub limit_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct PoolEntry {
    backing: Backing,
    size: u64,
    last_access: u64,
    pins: u32,
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<PageKey, PoolEntry>,
    /// Committed memory-backed bytes.
    used_memory: u64,
    /// Reserved-but-uncommitted memory bytes.
    reserved: u64,
    tick: u64,
}

struct PoolShared {
    limit_bytes: AtomicU64,
    large_page_threshold: AtomicU64,
    pressure_floor: u8,
    state: Mutex<PoolState>,
    freed: Notify,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl PoolShared {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[derive(Clone)]
pub struct MemoryPool {
    shared: Arc<PoolShared>,
}

impl MemoryPool {
    pub fn new(limit_bytes: u64, large_page_threshold: u64, pressure_floor: u8) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                limit_bytes: AtomicU64::new(limit_bytes),
                large_page_threshold: AtomicU64::new(large_page_threshold),
                pressure_floor,
                state: Mutex::new(PoolState::default()),
                freed: Notify::new(),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
            }),
        }
    }

    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self::new(
            cfg.resolved_budget(),
            cfg.large_page_threshold,
            cfg.memory_pressure_floor,
        )
    }

    pub fn limit_bytes(&self) -> u64 {
        self.shared.limit_bytes.load(Ordering::Relaxed)
    }

    /// Adjust the budget; takes effect on the next reservation decision.
    pub fn set_limit_bytes(&self, limit: u64) {
        self.shared.limit_bytes.store(limit, Ordering::Relaxed);
    }

    /// Book budget for an entry about to be produced.
    pub fn reserve(&self, key: PageKey, size: u64, urgency: Urgency) -> Reservation {
        let limit = self.shared.limit_bytes.load(Ordering::Relaxed);
        let threshold = self.shared.large_page_threshold.load(Ordering::Relaxed);

        let mut st = self.shared.lock_state();
        if st.entries.contains_key(&key) {
            return Reservation::AlreadyCached;
        }

        // Oversized pages never compete for RAM budget.
        if size >= threshold {
            return Reservation::Granted(self.ticket(key, size, false));
        }

        // Crossing 80% of the budget triggers eviction back under it.
        let soft = limit / 10 * 8;
        if st.used_memory + st.reserved + size > soft {
            let target = soft.saturating_sub(st.reserved + size);
            self.evict_lru(&mut st, target);
        }

        if st.used_memory + st.reserved + size <= limit {
            st.reserved += size;
            return Reservation::Granted(self.ticket(key, size, true));
        }

        match urgency {
            Urgency::Background => Reservation::WouldBlock,
            // Page serving must not stall on budget; spill to disk instead.
            Urgency::Page => Reservation::Granted(self.ticket(key, size, false)),
        }
    }

    fn ticket(&self, key: PageKey, size: u64, in_memory: bool) -> Ticket {
        Ticket {
            shared: Arc::clone(&self.shared),
            key,
            size,
            in_memory,
            committed: false,
        }
    }

    /// Evict least-recently-used, unpinned, memory-backed entries until
    /// committed memory fits `target`, or nothing evictable remains.
    fn evict_lru(&self, st: &mut PoolState, target: u64) {
        while st.used_memory > target {
            let victim = st
                .entries
                .iter()
                .filter(|(_, e)| e.pins == 0 && matches!(e.backing, Backing::Memory(_)))
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone());

            let Some(key) = victim else { break };
            if let Some(entry) = st.entries.remove(&key) {
                st.used_memory = st.used_memory.saturating_sub(entry.size);
                self.shared.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Evicted {}#{} ({} bytes)",
                    key.archive.display(),
                    key.entry,
                    entry.size
                );
            }
        }
    }

    /// Attach the produced payload to a reservation, making the entry
    /// visible to `get`.
    pub fn commit(&self, mut ticket: Ticket, payload: Payload) {
        ticket.committed = true;
        let key = ticket.key.clone();

        let mut st = self.shared.lock_state();
        if ticket.in_memory {
            st.reserved = st.reserved.saturating_sub(ticket.size);
        }

        let (backing, size, counts_toward_budget) = match payload {
            Payload::Bytes(bytes) => {
                let size = bytes.len() as u64;
                (Backing::Memory(Arc::new(bytes)), size, true)
            }
            Payload::File(path) => (Backing::TempFile(path), ticket.size, false),
        };

        if counts_toward_budget {
            st.used_memory += size;
        }
        st.tick += 1;
        let tick = st.tick;
        st.entries.insert(
            key,
            PoolEntry {
                backing,
                size,
                last_access: tick,
                pins: 0,
            },
        );

        // Actual size can differ from the reservation; settle up if the
        // commit itself pushed usage over the line.
        if counts_toward_budget {
            let soft = self.shared.limit_bytes.load(Ordering::Relaxed) / 10 * 8;
            if st.used_memory + st.reserved > soft {
                let target = soft.saturating_sub(st.reserved);
                self.evict_lru(&mut st, target);
            }
        }
    }

    /// Presence probe that neither pins nor touches hit/miss counters.
    pub fn contains(&self, key: &PageKey) -> bool {
        self.shared.lock_state().entries.contains_key(key)
    }

    /// Fetch and pin an entry. Refreshes its LRU position.
    pub fn get(&self, key: &PageKey) -> Option<PoolGuard> {
        let mut st = self.shared.lock_state();
        st.tick += 1;
        let tick = st.tick;
        match st.entries.get_mut(key) {
            Some(entry) => {
                entry.last_access = tick;
                entry.pins += 1;
                self.shared.hits.fetch_add(1, Ordering::Relaxed);
                Some(PoolGuard {
                    shared: Arc::clone(&self.shared),
                    key: key.clone(),
                    backing: entry.backing.clone(),
                })
            }
            None => {
                self.shared.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert an already-on-disk entry (staged by pre-extraction) without
    /// budget cost.
    pub fn adopt_file(&self, key: PageKey, path: PathBuf, size: u64) {
        let mut st = self.shared.lock_state();
        st.tick += 1;
        let tick = st.tick;
        st.entries.insert(
            key,
            PoolEntry {
                backing: Backing::TempFile(path),
                size,
                last_access: tick,
                pins: 0,
            },
        );
    }

    /// Drop every entry belonging to one archive. Entries are unlinked from
    /// the index immediately; temp-file deletion happens on a spawned task so
    /// close returns within its latency bound.
    pub fn release_archive(&self, archive: &Path) {
        let mut files = Vec::new();
        {
            let mut st = self.shared.lock_state();
            let keys: Vec<PageKey> = st
                .entries
                .keys()
                .filter(|k| k.archive == archive)
                .cloned()
                .collect();
            for key in keys {
                if let Some(entry) = st.entries.remove(&key) {
                    match entry.backing {
                        Backing::Memory(_) => {
                            st.used_memory = st.used_memory.saturating_sub(entry.size);
                        }
                        Backing::TempFile(path) => files.push(path),
                    }
                }
            }
        }
        self.shared.freed.notify_waiters();

        if files.is_empty() {
            return;
        }
        debug!(
            "Releasing {} temp-backed entries for {}",
            files.len(),
            archive.display()
        );
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                for path in files {
                    let _ = tokio::fs::remove_file(&path).await;
                }
            });
        } else {
            for path in files {
                let _ = std::fs::remove_file(&path);
            }
        }
    }

    /// Resolves once capacity may have been freed (eviction, release, or an
    /// aborted reservation). Callers re-attempt their reservation after this.
    pub async fn wait_for_capacity(&self) {
        self.shared.freed.notified().await;
    }

    /// Probe system RAM and force-evict half the unpinned entries when
    /// available memory drops below the configured floor.
    pub fn check_memory_pressure(&self) -> bool {
        let available = available_ram_percent();
        if available >= self.shared.pressure_floor as u64 {
            return false;
        }

        let mut st = self.shared.lock_state();
        let evictable: Vec<PageKey> = {
            let mut candidates: Vec<(&PageKey, u64)> = st
                .entries
                .iter()
                .filter(|(_, e)| e.pins == 0 && matches!(e.backing, Backing::Memory(_)))
                .map(|(k, e)| (k, e.last_access))
                .collect();
            candidates.sort_by_key(|(_, last_access)| *last_access);
            candidates
                .iter()
                .take(candidates.len().div_ceil(2))
                .map(|(k, _)| (*k).clone())
                .collect()
        };

        if evictable.is_empty() {
            return false;
        }
        warn!(
            "Memory pressure: {}% available < {}% floor, evicting {} entries",
            available,
            self.shared.pressure_floor,
            evictable.len()
        );
        for key in evictable {
            if let Some(entry) = st.entries.remove(&key) {
                st.used_memory = st.used_memory.saturating_sub(entry.size);
                self.shared.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        drop(st);
        self.shared.freed.notify_waiters();
        true
    }

    pub fn stats(&self) -> PoolStats {
        let st = self.shared.lock_state();
        PoolStats {
            entry_count: st.entries.len(),
            used_bytes: st.used_memory,
            reserved_bytes: st.reserved,
            limit_bytes: self.shared.limit_bytes.load(Ordering::Relaxed),
            hits: self.shared.hits.load(Ordering::Relaxed),
            misses: self.shared.misses.load(Ordering::Relaxed),
            evictions: self.shared.evictions.load(Ordering::Relaxed),
        }
    }
}
