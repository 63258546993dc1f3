//! Engine facade and per-archive session lifecycle.
//!
//! One [`Engine`] owns the shared pieces (memory pool, index store, job
//! engine, progress plumbing); each open archive gets a [`Session`] holding
//! its progressive entry table, its temp dir, and a lazily opened read-only
//! page handle. Opening a new archive makes it the active one: the previous
//! archive's jobs are cancelled, except a running pre-extraction, which is
//! paused so its checkpoint stays warm.
//!
//! The page path is: pool hit, else (solid) wait for the pre-extraction
//! cursor, else an on-demand read on the page handle, committed to the pool,
//! followed by a preload window of the next few pages.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::EngineConfig;
use crate::error::{retry_once, EngineError, Result};
use crate::extract::{staged_file_name, Checkpoint, PreExtract};
use crate::fingerprint::ArchiveFingerprint;
use crate::index::builder::IndexBuilder;
use crate::index::store::IndexStore;
use crate::index::IndexRecord;
use crate::jobs::engine::{JobEngine, SchedulerStats};
use crate::jobs::progress::{self, ProgressEvent, ProgressPayload, ProgressSender};
use crate::jobs::{priority, Job, JobKind, JobState};
use crate::pool::{MemoryPool, PageKey, Payload, PoolStats, Reservation, Urgency};
use crate::reader::{ArchiveReader, EntryMeta, ReaderFactory, SystemReaderFactory};

/// What `open_archive` can tell the caller immediately.
#[derive(Debug, Clone)]
pub struct OpenSummary {
    /// True when a valid cached index was found (no scan job needed).
    pub from_cache: bool,
    /// Known once the index is (already) available.
    pub entry_count: Option<usize>,
    pub solid: Option<bool>,
}

struct Session {
    archive: PathBuf,
    temp_dir: PathBuf,
    /// Progressive entry table, filled batch by batch during a scan.
    entries: Arc<RwLock<Vec<EntryMeta>>>,
    solid: AtomicBool,
    index_ready: watch::Sender<bool>,
    scanned: watch::Sender<usize>,
    cursor: Arc<watch::Sender<Option<usize>>>,
    /// Second read-only handle used for on-demand page reads; opened lazily.
    page_reader: tokio::sync::Mutex<Option<Box<dyn ArchiveReader>>>,
    /// Keep the channels open so sends store their value even with no
    /// subscriber (`watch::Sender::send` is a no-op on a closed channel).
    _index_ready_rx: watch::Receiver<bool>,
    _scanned_rx: watch::Receiver<usize>,
    _cursor_rx: watch::Receiver<Option<usize>>,
}

impl Session {
    fn new(archive: PathBuf, temp_dir: PathBuf) -> Self {
        let (index_ready, _index_ready_rx) = watch::channel(false);
        let (scanned, _scanned_rx) = watch::channel(0usize);
        let (cursor, _cursor_rx) = watch::channel(None);
        Self {
            archive,
            temp_dir,
            entries: Arc::new(RwLock::new(Vec::new())),
            solid: AtomicBool::new(false),
            index_ready,
            scanned,
            cursor: Arc::new(cursor),
            page_reader: tokio::sync::Mutex::new(None),
            _index_ready_rx,
            _scanned_rx,
            _cursor_rx,
        }
    }

    fn read_entries(&self) -> std::sync::RwLockReadGuard<'_, Vec<EntryMeta>> {
        match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn known_count(&self) -> usize {
        self.read_entries().len()
    }

    fn entry(&self, index: usize) -> Option<EntryMeta> {
        self.read_entries().get(index).cloned()
    }

    fn is_ready(&self) -> bool {
        *self.index_ready.borrow()
    }

    fn is_solid(&self) -> bool {
        self.solid.load(Ordering::Relaxed)
    }

    /// Drop any partial scan output before a restart.
    fn reset_entries(&self) {
        let mut guard = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.clear();
        drop(guard);
        let _ = self.scanned.send(0);
    }

    fn extend_entries(&self, batch: Vec<EntryMeta>) {
        let mut guard = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.extend(batch);
    }

    /// Install the authoritative index and flip readiness.
    fn set_complete(&self, record: &IndexRecord) {
        {
            let mut guard = match self.entries.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *guard = record.entries.clone();
        }
        self.solid.store(record.solid, Ordering::Relaxed);
        let _ = self.scanned.send(record.entry_count());
        let _ = self.index_ready.send(true);
    }

    /// On-demand read of one entry on the page handle.
    async fn read_page(&self, factory: &Arc<dyn ReaderFactory>, index: usize) -> Result<Vec<u8>> {
        let mut slot = self.page_reader.lock().await;
        if slot.is_none() {
            let archive = self.archive.clone();
            let factory = Arc::clone(factory);
            let reader = tokio::task::spawn_blocking(move || factory.open(&archive))
                .await
                .map_err(|e| EngineError::Io(std::io::Error::other(e)))?
                .map_err(EngineError::reader)?;
            *slot = Some(reader);
        }
        let Some(mut reader) = slot.take() else {
            return Err(EngineError::Reader("page reader unavailable".into()));
        };
        let (reader, data) = tokio::task::spawn_blocking(move || {
            let data = reader.read_entry(index);
            (reader, data)
        })
        .await
        .map_err(|e| EngineError::Io(std::io::Error::other(e)))?;
        *slot = Some(reader);
        data.map_err(EngineError::reader)
    }
}

fn scan_key(archive: &Path) -> String {
    format!("scan:{}", archive.display())
}

fn pre_key(archive: &Path) -> String {
    format!("preextract:{}", archive.display())
}

fn preload_key(archive: &Path, index: usize) -> String {
    format!("preload:{}:{}", archive.display(), index)
}

pub struct Engine {
    config: EngineConfig,
    pool: MemoryPool,
    store: Arc<IndexStore>,
    jobs: JobEngine,
    factory: Arc<dyn ReaderFactory>,
    temp_root: PathBuf,
    sessions: Mutex<HashMap<PathBuf, Arc<Session>>>,
    active: Mutex<Option<PathBuf>>,
    progress: ProgressSender,
    progress_out: broadcast::Sender<ProgressEvent>,
}

impl Engine {
    /// Must be called inside a tokio runtime (workers and the progress
    /// aggregator are spawned here).
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_factory(config, Arc::new(SystemReaderFactory))
    }

    /// Seam for tests and embedders with their own archive access.
    pub fn with_factory(config: EngineConfig, factory: Arc<dyn ReaderFactory>) -> Result<Self> {
        let store = match &config.index_db_path {
            Some(path) => IndexStore::open(path, config.index_cache_ceiling)?,
            None => IndexStore::in_memory(config.index_cache_ceiling)?,
        };

        let temp_root = config
            .temp_root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("pagevault"));
        std::fs::create_dir_all(&temp_root)?;
        sweep_stale_temp_dirs(&temp_root);

        let (progress, progress_rx) = progress::channel();
        let progress_out = progress::spawn_aggregator(progress_rx, 256);
        let jobs = JobEngine::new(config.worker_count, progress.clone());
        let pool = MemoryPool::from_config(&config);

        info!(
            "Engine started: budget {} bytes, {} workers, temp root {}",
            pool.limit_bytes(),
            config.worker_count.max(1),
            temp_root.display()
        );

        Ok(Self {
            config,
            pool,
            store: Arc::new(store),
            jobs,
            factory,
            temp_root,
            sessions: Mutex::new(HashMap::new()),
            active: Mutex::new(None),
            progress,
            progress_out,
        })
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<PathBuf, Arc<Session>>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Open an archive and make it the active one. A cached index makes the
    /// first page servable immediately; otherwise a scan job starts. Solid
    /// archives additionally get a pre-extraction job once indexed.
    pub fn open_archive(&self, path: &Path) -> Result<OpenSummary> {
        let fingerprint = ArchiveFingerprint::compute(path)?;
        self.switch_active(path);

        if let Some(session) = self.lock_sessions().get(path).cloned() {
            // Reopened without closing: revive its pre-extraction, and
            // restart the scan if the previous one was cancelled or failed
            // before finishing (scans always restart from zero).
            if !session.is_ready() && !self.jobs.has_live_job(&scan_key(path)) {
                session.reset_entries();
                self.enqueue_scan(&session, fingerprint);
            }
            self.jobs.resume_pre_extract(path);
            return Ok(OpenSummary {
                from_cache: session.is_ready(),
                entry_count: session.is_ready().then(|| session.known_count()),
                solid: session.is_ready().then(|| session.is_solid()),
            });
        }

        let temp_dir = self.temp_root.join(fingerprint.dir_name());
        std::fs::create_dir_all(&temp_dir)?;
        let session = Arc::new(Session::new(path.to_path_buf(), temp_dir));

        let summary = match self.store.lookup(path)? {
            Some(record) => {
                debug!(
                    "Index cache hit for {} ({} entries)",
                    path.display(),
                    record.entry_count()
                );
                session.set_complete(&record);
                if record.solid {
                    self.enqueue_pre_extract(&session);
                }
                OpenSummary {
                    from_cache: true,
                    entry_count: Some(record.entry_count()),
                    solid: Some(record.solid),
                }
            }
            None => {
                self.enqueue_scan(&session, fingerprint);
                OpenSummary {
                    from_cache: false,
                    entry_count: None,
                    solid: None,
                }
            }
        };

        self.lock_sessions().insert(path.to_path_buf(), session);
        Ok(summary)
    }

    /// Cancel the previously active archive's jobs (pre-extraction is paused
    /// instead) and record the new active archive.
    fn switch_active(&self, path: &Path) {
        let previous = {
            let mut active = match self.active.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            active.replace(path.to_path_buf())
        };
        if let Some(previous) = previous {
            if previous.as_path() != path {
                debug!(
                    "Active archive {} -> {}",
                    previous.display(),
                    path.display()
                );
                self.jobs.cancel_archive(&previous, true);
            }
        }
    }

    fn enqueue_scan(&self, session: &Arc<Session>, fingerprint: ArchiveFingerprint) {
        let builder = IndexBuilder::from_config(&self.config);
        let factory = Arc::clone(&self.factory);
        let store = Arc::clone(&self.store);
        let session = Arc::clone(session);
        let progress = self.progress.clone();
        let jobs = self.jobs.clone();
        let pool = self.pool.clone();
        let archive = session.archive.clone();

        self.jobs.enqueue(Job::new(
            JobKind::Scan,
            archive.clone(),
            priority::SCAN_ACTIVE,
            scan_key(&archive),
            move |cx| async move {
                let record = {
                    let ctrl = cx.ctrl.clone();
                    let session = Arc::clone(&session);
                    let progress = progress.clone();
                    let archive = archive.clone();
                    let factory = Arc::clone(&factory);
                    let job_id = cx.id;
                    tokio::task::spawn_blocking(move || {
                        let mut reader = factory.open(&archive).map_err(EngineError::reader)?;
                        builder.run(reader.as_mut(), &fingerprint, &ctrl, |batch| {
                            session.extend_entries(batch.entries);
                            let _ = session.scanned.send(batch.scanned);
                            progress.emit(
                                job_id,
                                &archive,
                                ProgressPayload::Scanned {
                                    scanned: batch.scanned,
                                    estimated_total: batch.estimated_total,
                                },
                            );
                        })
                    })
                    .await
                    .map_err(|e| EngineError::Io(std::io::Error::other(e)))??
                };

                // Persistence failure does not discard a finished scan:
                // retry once, then serve the session uncached.
                if let Err(first) = store.put(&record) {
                    warn!("Index persist failed, retrying once: {first}");
                    if let Err(e) = store.put(&record) {
                        warn!("Index for {} not persisted: {}", archive.display(), e);
                    }
                }
                if record.solid {
                    enqueue_pre_extract_with(&jobs, &session, pool, progress, factory);
                }
                session.set_complete(&record);
                Ok(())
            },
        ));
    }

    fn enqueue_pre_extract(&self, session: &Arc<Session>) {
        enqueue_pre_extract_with(
            &self.jobs,
            session,
            self.pool.clone(),
            self.progress.clone(),
            Arc::clone(&self.factory),
        );
    }

    /// Close the archive: cancel its jobs, drop its cache entries, and remove
    /// its temp dir. Unknown paths are a no-op.
    pub fn close_archive(&self, path: &Path) {
        let session = self.lock_sessions().remove(path);
        {
            let mut active = match self.active.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if active.as_deref() == Some(path) {
                *active = None;
            }
        }

        self.jobs.cancel_archive(path, false);
        self.pool.release_archive(path);

        let Some(session) = session else {
            return;
        };
        // Rename the dir aside first so an immediate reopen can recreate it
        // without racing the deletion; cancelled jobs may still be dropping
        // files inside, so deletion retries briefly.
        let doomed = {
            let name = session
                .temp_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "session".into());
            self.temp_root.join(format!("{name}.closing"))
        };
        let doomed = if std::fs::rename(&session.temp_dir, &doomed).is_ok() {
            doomed
        } else {
            session.temp_dir.clone()
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                for _ in 0..5 {
                    if std::fs::remove_dir_all(&doomed).is_ok() || !doomed.exists() {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                warn!("Could not remove session temp dir {}", doomed.display());
            });
        } else {
            let _ = std::fs::remove_dir_all(&doomed);
        }
        info!("Closed {}", path.display());
    }

    /// Fetch one page's bytes, extracting on demand if needed.
    pub async fn request_page(&self, path: &Path, index: usize) -> Result<Vec<u8>> {
        let session = self
            .lock_sessions()
            .get(path)
            .cloned()
            .ok_or_else(|| EngineError::SessionNotFound(path.to_path_buf()))?;

        self.wait_indexed(&session, index).await?;

        let key = PageKey::new(path, index);
        if session.is_solid() {
            self.await_cursor(&session, index, &key).await;
        }

        if let Some(guard) = self.pool.get(&key) {
            let bytes = guard.read().await?;
            self.enqueue_preloads(&session, index);
            return Ok(bytes);
        }

        // On-demand path: read on the page handle as a page-urgency unit.
        let Some(entry) = session.entry(index) else {
            return Err(EngineError::PageOutOfRange {
                index,
                count: session.known_count(),
            });
        };
        let data = match self.pool.reserve(key.clone(), entry.size, Urgency::Page) {
            Reservation::AlreadyCached => match self.pool.get(&key) {
                Some(guard) => guard.read().await?,
                None => session.read_page(&self.factory, index).await?,
            },
            Reservation::Granted(ticket) => {
                let data = session.read_page(&self.factory, index).await?;
                if ticket.wants_file() {
                    let staged = session.temp_dir.join(staged_file_name(index));
                    retry_once(|| std::fs::write(&staged, &data))?;
                    self.pool.commit(ticket, Payload::File(staged));
                } else {
                    self.pool.commit(ticket, Payload::Bytes(data.clone()));
                }
                data
            }
            // Page urgency never blocks; WouldBlock is unreachable, but serve
            // the page uncached rather than fail if that ever changes.
            Reservation::WouldBlock => session.read_page(&self.factory, index).await?,
        };

        self.enqueue_preloads(&session, index);
        Ok(data)
    }

    /// Wait until `index` is inside the scanned range. Bumps the scan to page
    /// priority while a page request is blocked on it.
    async fn wait_indexed(&self, session: &Arc<Session>, index: usize) -> Result<()> {
        let key = scan_key(&session.archive);
        loop {
            if session.known_count() > index {
                return Ok(());
            }
            if session.is_ready() {
                return Err(EngineError::PageOutOfRange {
                    index,
                    count: session.known_count(),
                });
            }
            if !self.jobs.has_live_job(&key) {
                // The scan can finish between the checks above and here;
                // re-read before declaring the session dead.
                if session.known_count() > index {
                    return Ok(());
                }
                if session.is_ready() {
                    return Err(EngineError::PageOutOfRange {
                        index,
                        count: session.known_count(),
                    });
                }
                return Err(EngineError::Reader(format!(
                    "index scan of {} did not complete",
                    session.archive.display()
                )));
            }
            self.jobs.bump_key(&key, priority::PAGE);
            let mut scanned = session.scanned.subscribe();
            let _ = tokio::time::timeout(Duration::from_millis(50), scanned.changed()).await;
        }
    }

    /// For solid archives, wait for the pre-extraction cursor to pass `index`.
    /// Falls through (to an on-demand read) when pre-extraction is absent,
    /// finished, or paused.
    async fn await_cursor(&self, session: &Arc<Session>, index: usize, key: &PageKey) {
        let job_key = pre_key(&session.archive);
        let mut cursor = session.cursor.subscribe();
        loop {
            if self.pool.contains(key) {
                return;
            }
            if cursor.borrow().is_some_and(|c| c >= index) {
                return;
            }
            let advancing = self
                .jobs
                .handle_for_key(&job_key)
                .is_some_and(|h| matches!(h.state(), JobState::Queued | JobState::Running));
            if !advancing {
                return;
            }
            let _ = tokio::time::timeout(Duration::from_millis(100), cursor.changed()).await;
        }
    }

    /// Queue reads for the next `preload_window` pages. Skipped for solid
    /// archives, where pre-extraction is already doing this in order.
    fn enqueue_preloads(&self, session: &Arc<Session>, index: usize) {
        if session.is_solid() || self.config.preload_window == 0 {
            return;
        }
        let count = session.known_count();
        for i in (index + 1)..=(index + self.config.preload_window) {
            if i >= count {
                break;
            }
            let key = PageKey::new(&session.archive, i);
            if self.pool.contains(&key) {
                continue;
            }
            let job_key = preload_key(&session.archive, i);
            if self.jobs.has_live_job(&job_key) {
                continue;
            }

            let session = Arc::clone(session);
            let pool = self.pool.clone();
            let factory = Arc::clone(&self.factory);
            self.jobs.enqueue(Job::new(
                JobKind::PagePreload,
                session.archive.clone(),
                priority::PAGE,
                job_key,
                move |cx| async move {
                    cx.ctrl.checkpoint().await?;
                    let Some(entry) = session.entry(i) else {
                        return Ok(());
                    };
                    match pool.reserve(key, entry.size, Urgency::Background) {
                        Reservation::AlreadyCached => Ok(()),
                        // Preloads are best-effort; never wait for capacity.
                        Reservation::WouldBlock => Ok(()),
                        Reservation::Granted(ticket) => {
                            let data = session.read_page(&factory, i).await?;
                            if ticket.wants_file() {
                                let staged = session.temp_dir.join(staged_file_name(i));
                                retry_once(|| std::fs::write(&staged, &data))?;
                                pool.commit(ticket, Payload::File(staged));
                            } else {
                                pool.commit(ticket, Payload::Bytes(data));
                            }
                            Ok(())
                        }
                    }
                },
            ));
        }
    }

    /// Cancel all jobs for an archive. No-op when none exist.
    pub fn cancel(&self, path: &Path) {
        self.jobs.cancel_archive(path, false);
    }

    pub fn pause_pre_extraction(&self, path: &Path) -> bool {
        self.jobs.pause_pre_extract(path)
    }

    pub fn resume_pre_extraction(&self, path: &Path) -> bool {
        self.jobs.resume_pre_extract(path)
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress_out.subscribe()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.jobs.stats()
    }

    /// Force-evict cache entries when system memory runs low. Returns whether
    /// anything was evicted.
    pub fn check_memory_pressure(&self) -> bool {
        self.pool.check_memory_pressure()
    }

    /// Stop all workers and cancel outstanding jobs.
    pub fn shutdown(&self) {
        self.jobs.shutdown();
    }
}

fn enqueue_pre_extract_with(
    jobs: &JobEngine,
    session: &Arc<Session>,
    pool: MemoryPool,
    progress: ProgressSender,
    factory: Arc<dyn ReaderFactory>,
) {
    let job = PreExtract {
        archive: session.archive.clone(),
        temp_dir: session.temp_dir.clone(),
        factory,
        entries: Arc::clone(&session.entries),
        index_ready: session.index_ready.subscribe(),
        pool,
        cursor: Arc::clone(&session.cursor),
        progress,
    };
    jobs.enqueue(Job::new(
        JobKind::PreExtract,
        session.archive.clone(),
        priority::PRE_EXTRACT_ACTIVE,
        pre_key(&session.archive),
        move |cx| job.run(cx),
    ));
}

/// Remove leftover session temp dirs from interrupted runs, keeping any with
/// a live pre-extraction checkpoint (those resume instead).
fn sweep_stale_temp_dirs(temp_root: &Path) {
    let mut removed = 0usize;
    for entry in WalkDir::new(temp_root)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if !entry.file_type().is_dir() {
            continue;
        }
        // Tombstones from interrupted closes are never resumable.
        let closing = path.extension().is_some_and(|e| e == "closing");
        if !closing && Checkpoint::path_in(path).exists() {
            debug!("Keeping {} (resumable checkpoint)", path.display());
            continue;
        }
        if std::fs::remove_dir_all(path).is_ok() {
            removed += 1;
        }
    }
    if removed > 0 {
        info!("Swept {} stale session temp dir(s)", removed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BudgetSpec;
    use crate::testutil::MemoryReaderFactory;
    use std::io::Write;

    fn page_content(i: usize) -> Vec<u8> {
        format!("page-{i}-content-padding-padding").into_bytes()
    }

    fn write_zip(path: &Path, pages: usize) {
        let file = std::fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for i in 0..pages {
            zip.start_file(format!("pages/{i:04}.png"), options).unwrap();
            zip.write_all(&page_content(i)).unwrap();
        }
        zip.finish().unwrap();
    }

    fn config(root: &Path) -> EngineConfig {
        EngineConfig {
            memory_budget: BudgetSpec::Bytes(10 * 1024 * 1024),
            temp_root: Some(root.join("pv-tmp")),
            worker_count: 2,
            ..Default::default()
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..300 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 3s");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_open_scan_and_serve_first_page() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("book.cbz");
        write_zip(&archive, 6);
        let engine = Engine::new(config(dir.path())).unwrap();

        let summary = engine.open_archive(&archive).unwrap();
        assert!(!summary.from_cache);

        let bytes = engine.request_page(&archive, 0).await.unwrap();
        assert_eq!(bytes, page_content(0));

        // The preload window warms the pages after the requested one.
        wait_for(|| engine.pool_stats().entry_count >= 3).await;
        engine.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reopen_hits_index_cache() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("book.cbz");
        write_zip(&archive, 6);
        let engine = Engine::new(config(dir.path())).unwrap();

        engine.open_archive(&archive).unwrap();
        engine.request_page(&archive, 5).await.unwrap();
        // The record lands in the store when the scan job finishes.
        wait_for(|| {
            let stats = engine.scheduler_stats();
            stats.running == 0 && stats.queued == 0
        })
        .await;
        engine.close_archive(&archive);

        let summary = engine.open_archive(&archive).unwrap();
        assert!(summary.from_cache);
        assert_eq!(summary.entry_count, Some(6));
        assert_eq!(summary.solid, Some(false));

        // Servable without any scan job.
        let bytes = engine.request_page(&archive, 2).await.unwrap();
        assert_eq!(bytes, page_content(2));
        engine.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_modified_archive_triggers_rescan() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("book.cbz");
        write_zip(&archive, 6);
        let engine = Engine::new(config(dir.path())).unwrap();

        engine.open_archive(&archive).unwrap();
        engine.request_page(&archive, 0).await.unwrap();
        wait_for(|| {
            let stats = engine.scheduler_stats();
            stats.running == 0 && stats.queued == 0
        })
        .await;
        engine.close_archive(&archive);

        // Rewrite with fewer pages: size changes, fingerprint mismatches.
        write_zip(&archive, 4);
        let summary = engine.open_archive(&archive).unwrap();
        assert!(!summary.from_cache);

        assert_eq!(
            engine.request_page(&archive, 3).await.unwrap(),
            page_content(3)
        );
        assert!(matches!(
            engine.request_page(&archive, 5).await,
            Err(EngineError::PageOutOfRange { index: 5, count: 4 })
        ));
        engine.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_solid_archive_served_through_pre_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("book.cb7");
        std::fs::write(&archive, b"container bytes for fingerprint").unwrap();

        let factory = MemoryReaderFactory::new(8, 64, true);
        let log = factory.read_log();
        let engine = Engine::with_factory(config(dir.path()), Arc::new(factory)).unwrap();

        engine.open_archive(&archive).unwrap();
        let bytes = engine.request_page(&archive, 7).await.unwrap();
        assert_eq!(bytes, vec![7u8; 64]);

        // Pre-extraction walked the archive exactly once, in order; the page
        // request rode its cursor instead of decompressing again.
        assert_eq!(*log.lock().unwrap(), (0..8).collect::<Vec<_>>());
        engine.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pause_and_resume_pre_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("book.cb7");
        std::fs::write(&archive, b"container bytes").unwrap();

        let factory =
            MemoryReaderFactory::new(30, 64, true).with_read_delay(Duration::from_millis(10));
        let engine = Engine::with_factory(config(dir.path()), Arc::new(factory)).unwrap();
        engine.open_archive(&archive).unwrap();

        // The pre-extraction job appears once the scan finishes.
        wait_for(|| engine.pause_pre_extraction(&archive)).await;
        wait_for(|| engine.scheduler_stats().paused >= 1).await;

        assert!(engine.resume_pre_extraction(&archive));
        wait_for(|| {
            let stats = engine.scheduler_stats();
            stats.running == 0 && stats.queued == 0 && stats.paused == 0
        })
        .await;

        assert_eq!(
            engine.request_page(&archive, 29).await.unwrap(),
            vec![29u8; 64]
        );
        engine.shutdown();
    }

    /// Occupy one worker slot until `release` is notified.
    fn hold_worker(engine: &Engine, release: &Arc<tokio::sync::Notify>) -> crate::jobs::engine::JobHandle {
        let gate = Arc::clone(release);
        engine.jobs.enqueue(Job::new(
            JobKind::PagePreload,
            "/books/gate.cbz",
            priority::PAGE,
            "gate",
            move |_cx| async move {
                gate.notified().await;
                Ok(())
            },
        ))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reopen_restarts_cancelled_scan() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.cbz");
        let b = dir.path().join("b.cbz");
        write_zip(&a, 6);
        write_zip(&b, 4);
        let mut cfg = config(dir.path());
        cfg.worker_count = 1;
        let engine = Engine::new(cfg).unwrap();

        // Hold the only worker so a's scan is still queued when b takes over.
        let release = Arc::new(tokio::sync::Notify::new());
        let hold = hold_worker(&engine, &release);
        wait_for(|| hold.state() == JobState::Running).await;

        engine.open_archive(&a).unwrap();
        engine.open_archive(&b).unwrap();
        assert!(!engine.jobs.has_live_job(&scan_key(&a)));

        // Reopening a starts a fresh scan rather than leaving the session
        // permanently half-indexed.
        engine.open_archive(&a).unwrap();
        release.notify_waiters();
        assert_eq!(engine.request_page(&a, 5).await.unwrap(), page_content(5));
        engine.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_scan_survives_index_persist_failure() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("book.cbz");
        write_zip(&archive, 5);
        let mut cfg = config(dir.path());
        cfg.worker_count = 1;
        let engine = Engine::new(cfg).unwrap();

        // Break the catalog only after open_archive's lookup has run.
        let release = Arc::new(tokio::sync::Notify::new());
        let hold = hold_worker(&engine, &release);
        wait_for(|| hold.state() == JobState::Running).await;

        engine.open_archive(&archive).unwrap();
        engine.store.break_catalog();
        release.notify_waiters();

        // The scan completes and the session serves pages uncached.
        assert_eq!(
            engine.request_page(&archive, 4).await.unwrap(),
            page_content(4)
        );
        engine.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unknown_archive_operations() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(config(dir.path())).unwrap();
        let ghost = dir.path().join("never-opened.cbz");

        assert!(matches!(
            engine.request_page(&ghost, 0).await,
            Err(EngineError::SessionNotFound(_))
        ));
        // Both are idempotent no-ops.
        engine.cancel(&ghost);
        engine.close_archive(&ghost);
        engine.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_startup_sweeps_stale_temp_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("pv-tmp");

        let stale = root.join("old-session-aa-bb");
        std::fs::create_dir_all(&stale).unwrap();
        std::fs::write(stale.join("000001.page"), b"leftover").unwrap();

        let resumable = root.join("warm-session-cc-dd");
        std::fs::create_dir_all(&resumable).unwrap();
        Checkpoint {
            job_id: 9,
            last_completed_index: 3,
        }
        .write(&resumable)
        .unwrap();

        let engine = Engine::new(config(dir.path())).unwrap();
        assert!(!stale.exists());
        assert!(resumable.exists());
        engine.shutdown();
    }
}
