//! Priority job engine.
//!
//! A single dispatcher task pulls the highest-priority runnable job off a
//! binary heap and spawns it onto the runtime; a semaphore bounds how many
//! jobs execute at once. FIFO order within a priority comes from a
//! monotonically increasing sequence number.
//!
//! Two rules shape what "runnable" means:
//! - per archive, at most one `Scan` or `PreExtract` runs at a time (both
//!   want sequential access to the same container);
//! - a job whose dedupe key is re-enqueued is cancelled in favor of the new
//!   one, so stale work for a superseded request never runs to completion.

use serde::Serialize;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, warn};

use super::progress::{ProgressPayload, ProgressSender};
use super::{Job, JobContext, JobControl, JobKind, JobState};
use crate::error::EngineError;

/// Snapshot of scheduler occupancy.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SchedulerStats {
    pub queued: usize,
    pub running: usize,
    pub paused: usize,
    pub workers: usize,
}

/// Reference to an enqueued job; stays valid after the job finishes (control
/// operations become no-ops then).
#[derive(Clone)]
pub struct JobHandle {
    id: u64,
    kind: JobKind,
    archive: PathBuf,
    ctrl: JobControl,
}

impl JobHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn archive(&self) -> &Path {
        &self.archive
    }

    pub fn state(&self) -> JobState {
        self.ctrl.state()
    }

    pub fn control(&self) -> &JobControl {
        &self.ctrl
    }
}

struct QueuedJob {
    priority: u8,
    sequence: u64,
    id: u64,
    job: Job,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher priority first, then lower sequence (older) first.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

struct Sched {
    queue: BinaryHeap<QueuedJob>,
    /// Queued and running jobs by id.
    handles: HashMap<u64, JobHandle>,
    by_key: HashMap<String, u64>,
    /// Archives with a `Scan` or `PreExtract` currently executing.
    exclusive: HashSet<PathBuf>,
    sequence: u64,
}

struct EngineInner {
    sched: Mutex<Sched>,
    wake: Notify,
    shutdown: AtomicBool,
    next_id: AtomicU64,
    slots: Arc<Semaphore>,
    worker_count: usize,
    progress: ProgressSender,
}

#[derive(Clone)]
pub struct JobEngine {
    inner: Arc<EngineInner>,
}

impl JobEngine {
    pub fn new(worker_count: usize, progress: ProgressSender) -> Self {
        let worker_count = worker_count.max(1);
        let inner = Arc::new(EngineInner {
            sched: Mutex::new(Sched {
                queue: BinaryHeap::new(),
                handles: HashMap::new(),
                by_key: HashMap::new(),
                exclusive: HashSet::new(),
                sequence: 0,
            }),
            wake: Notify::new(),
            shutdown: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            slots: Arc::new(Semaphore::new(worker_count)),
            worker_count,
            progress,
        });

        tokio::spawn(dispatch(Arc::clone(&inner)));
        Self { inner }
    }

    /// Queue a job. If another live job shares its key, that one is cancelled
    /// first.
    pub fn enqueue(&self, job: Job) -> JobHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let ctrl = JobControl::new();
        // Scans restart from zero, so they are always safe to retry.
        ctrl.set_retryable(job.kind == JobKind::Scan);

        let handle = JobHandle {
            id,
            kind: job.kind,
            archive: job.archive.clone(),
            ctrl: ctrl.clone(),
        };

        {
            let mut s = self.inner.lock_sched();
            if let Some(&old_id) = s.by_key.get(&job.key) {
                if let Some(old) = s.handles.get(&old_id) {
                    debug!("Job key '{}' re-enqueued, cancelling job {}", job.key, old_id);
                    old.ctrl.request_cancel();
                }
            }
            s.by_key.insert(job.key.clone(), id);
            s.handles.insert(id, handle.clone());
            s.sequence += 1;
            let sequence = s.sequence;
            s.queue.push(QueuedJob {
                priority: job.priority,
                sequence,
                id,
                job,
            });
        }

        self.inner.wake.notify_waiters();
        handle
    }

    /// Request cancellation. Returns false if the job already finished.
    pub fn cancel_job(&self, id: u64) -> bool {
        let s = self.inner.lock_sched();
        match s.handles.get(&id) {
            Some(handle) => {
                handle.ctrl.request_cancel();
                drop(s);
                self.inner.wake.notify_waiters();
                true
            }
            None => false,
        }
    }

    /// Cancel every live job for an archive. With `keep_pre_extract`,
    /// pre-extraction is paused instead so its checkpoint survives a later
    /// resume.
    pub fn cancel_archive(&self, archive: &Path, keep_pre_extract: bool) {
        {
            let s = self.inner.lock_sched();
            for handle in s.handles.values() {
                if handle.archive != archive {
                    continue;
                }
                if keep_pre_extract && handle.kind == JobKind::PreExtract {
                    handle.ctrl.request_pause();
                } else {
                    handle.ctrl.request_cancel();
                }
            }
        }
        self.inner.wake.notify_waiters();
    }

    pub fn pause_pre_extract(&self, archive: &Path) -> bool {
        self.for_pre_extract(archive, |ctrl| ctrl.request_pause())
    }

    pub fn resume_pre_extract(&self, archive: &Path) -> bool {
        self.for_pre_extract(archive, |ctrl| ctrl.request_resume())
    }

    fn for_pre_extract(&self, archive: &Path, apply: impl Fn(&JobControl)) -> bool {
        let s = self.inner.lock_sched();
        let mut found = false;
        for handle in s.handles.values() {
            if handle.kind == JobKind::PreExtract && handle.archive == archive {
                apply(&handle.ctrl);
                found = true;
            }
        }
        drop(s);
        self.inner.wake.notify_waiters();
        found
    }

    /// Raise a queued job's priority (never lowers it). Running jobs are
    /// unaffected.
    pub fn bump_key(&self, key: &str, priority: u8) -> bool {
        let mut s = self.inner.lock_sched();
        let Some(&id) = s.by_key.get(key) else {
            return false;
        };
        let mut bumped = false;
        let mut items: Vec<QueuedJob> = s.queue.drain().collect();
        for item in &mut items {
            if item.id == id && item.priority < priority {
                item.priority = priority;
                bumped = true;
            }
        }
        s.queue.extend(items);
        drop(s);
        if bumped {
            self.inner.wake.notify_waiters();
        }
        bumped
    }

    pub fn handle_for_key(&self, key: &str) -> Option<JobHandle> {
        let s = self.inner.lock_sched();
        s.by_key.get(key).and_then(|id| s.handles.get(id)).cloned()
    }

    pub fn has_live_job(&self, key: &str) -> bool {
        let s = self.inner.lock_sched();
        match s.by_key.get(key).and_then(|id| s.handles.get(id)) {
            Some(handle) => !handle.ctrl.is_cancelled(),
            None => false,
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        let s = self.inner.lock_sched();
        let mut stats = SchedulerStats {
            queued: 0,
            running: 0,
            paused: 0,
            workers: self.inner.worker_count,
        };
        for handle in s.handles.values() {
            match handle.ctrl.state() {
                JobState::Queued => stats.queued += 1,
                JobState::Running => stats.running += 1,
                JobState::Paused => stats.paused += 1,
                _ => {}
            }
        }
        stats
    }

    /// Stop dispatching and cancel everything still live.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Relaxed);
        self.inner.slots.close();
        {
            let s = self.inner.lock_sched();
            for handle in s.handles.values() {
                handle.ctrl.request_cancel();
            }
        }
        self.inner.wake.notify_waiters();
    }
}

impl EngineInner {
    fn lock_sched(&self) -> MutexGuard<'_, Sched> {
        match self.sched.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Pop the best runnable job. Jobs blocked by archive exclusivity are
    /// stashed and reinserted; cancelled queued jobs are discarded here.
    fn try_dequeue(&self) -> Option<(u64, Job, JobControl)> {
        let mut dropped = Vec::new();
        let found = {
            let mut s = self.lock_sched();
            let mut stash = Vec::new();
            let mut found = None;

            while let Some(queued) = s.queue.pop() {
                let Some(handle) = s.handles.get(&queued.id) else {
                    continue;
                };
                let ctrl = handle.ctrl.clone();
                if ctrl.is_cancelled() {
                    ctrl.set_state(JobState::Cancelled);
                    s.handles.remove(&queued.id);
                    if s.by_key.get(&queued.job.key) == Some(&queued.id) {
                        s.by_key.remove(&queued.job.key);
                    }
                    dropped.push((queued.id, queued.job.archive));
                    continue;
                }

                let exclusive = matches!(queued.job.kind, JobKind::Scan | JobKind::PreExtract);
                if exclusive && s.exclusive.contains(&queued.job.archive) {
                    stash.push(queued);
                    continue;
                }
                if exclusive {
                    s.exclusive.insert(queued.job.archive.clone());
                }
                found = Some((queued.id, queued.job, ctrl));
                break;
            }

            s.queue.extend(stash);
            found
        };

        for (id, archive) in dropped {
            self.progress.emit(id, &archive, ProgressPayload::Cancelled);
        }
        found
    }
}

async fn dispatch(inner: Arc<EngineInner>) {
    loop {
        if inner.shutdown.load(Ordering::Relaxed) {
            break;
        }
        let permit = match Arc::clone(&inner.slots).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        // Hold the permit only while there is work to hand it to: paused
        // jobs reacquire their slots from this same semaphore, so an idle
        // dispatcher sitting on a permit would keep them parked.
        match inner.try_dequeue() {
            Some((id, job, ctrl)) => {
                ctrl.attach_slot(permit, Arc::clone(&inner.slots));
                let task_inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    run_job(&task_inner, id, job, ctrl).await;
                });
            }
            None => {
                drop(permit);
                // Bounded wait so a wake between the dequeue attempt and
                // this await cannot stall the dispatcher.
                let _ = tokio::time::timeout(
                    std::time::Duration::from_millis(50),
                    inner.wake.notified(),
                )
                .await;
            }
        }
    }
}

async fn run_job(inner: &Arc<EngineInner>, id: u64, job: Job, ctrl: JobControl) {
    let kind = job.kind;
    let archive = job.archive.clone();
    let key = job.key.clone();
    let exclusive = matches!(kind, JobKind::Scan | JobKind::PreExtract);

    ctrl.set_state(JobState::Running);
    debug!("Job {} ({:?}) started: {}", id, kind, key);
    inner
        .progress
        .emit(id, &archive, ProgressPayload::Started { job: kind });
    let started = Instant::now();

    let result = (job.exec)(JobContext {
        id,
        ctrl: ctrl.clone(),
    })
    .await;

    let final_state = match &result {
        Ok(()) if ctrl.is_cancelled() => JobState::Cancelled,
        Ok(()) => JobState::Completed,
        Err(EngineError::Cancelled) => JobState::Cancelled,
        Err(_) => JobState::Failed,
    };
    ctrl.set_state(final_state);
    ctrl.release_slot();

    {
        let mut s = inner.lock_sched();
        s.handles.remove(&id);
        if s.by_key.get(&key) == Some(&id) {
            s.by_key.remove(&key);
        }
        if exclusive {
            s.exclusive.remove(&archive);
        }
    }

    match (result, final_state) {
        (_, JobState::Cancelled) => {
            debug!("Job {} ({:?}) cancelled after {:?}", id, kind, started.elapsed());
            inner.progress.emit(id, &archive, ProgressPayload::Cancelled);
        }
        (Ok(()), _) => {
            inner.progress.emit(
                id,
                &archive,
                ProgressPayload::Completed {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    bytes: 0,
                },
            );
        }
        (Err(e), _) => {
            warn!("Job {} ({:?}) on {} failed: {}", id, kind, archive.display(), e);
            inner.progress.emit(
                id,
                &archive,
                ProgressPayload::Errored {
                    message: e.to_string(),
                    retryable: ctrl.is_retryable(),
                },
            );
        }
    }

    inner.wake.notify_waiters();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::priority;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn engine(workers: usize) -> JobEngine {
        let (tx, rx) = super::super::progress::channel();
        // Drain progress so the unbounded channel does not accumulate.
        tokio::spawn(async move {
            let mut rx = rx;
            while rx.recv().await.is_some() {}
        });
        JobEngine::new(workers, tx)
    }

    fn blocker(
        engine: &JobEngine,
        archive: &str,
        key: &str,
        release: Arc<Notify>,
    ) -> JobHandle {
        engine.enqueue(Job::new(
            JobKind::Scan,
            archive,
            priority::SCAN_ACTIVE,
            key,
            move |_cx| async move {
                release.notified().await;
                Ok(())
            },
        ))
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 2s");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_priority_over_fifo() {
        let engine = engine(1);
        let release = Arc::new(Notify::new());
        let hold = blocker(&engine, "/books/hold.cbz", "hold", Arc::clone(&release));
        wait_for(|| hold.state() == JobState::Running).await;

        let order = Arc::new(Mutex::new(Vec::new()));
        for (name, prio) in [("low", priority::INACTIVE), ("high", priority::PAGE)] {
            let order = Arc::clone(&order);
            engine.enqueue(Job::new(
                JobKind::PagePreload,
                format!("/books/{name}.cbz"),
                prio,
                name,
                move |_cx| async move {
                    order.lock().unwrap().push(name);
                    Ok(())
                },
            ));
        }

        release.notify_waiters();
        wait_for(|| order.lock().unwrap().len() == 2).await;
        assert_eq!(*order.lock().unwrap(), vec!["high", "low"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fifo_within_priority() {
        let engine = engine(1);
        let release = Arc::new(Notify::new());
        let hold = blocker(&engine, "/books/hold.cbz", "hold", Arc::clone(&release));
        wait_for(|| hold.state() == JobState::Running).await;

        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            engine.enqueue(Job::new(
                JobKind::PagePreload,
                format!("/books/{name}.cbz"),
                priority::INACTIVE,
                name,
                move |_cx| async move {
                    order.lock().unwrap().push(name);
                    Ok(())
                },
            ));
        }

        release.notify_waiters();
        wait_for(|| order.lock().unwrap().len() == 3).await;
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_duplicate_key_cancels_older() {
        let engine = engine(1);
        let release = Arc::new(Notify::new());
        let first = blocker(&engine, "/books/a.cbz", "scan:a", Arc::clone(&release));
        wait_for(|| first.state() == JobState::Running).await;

        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);
        engine.enqueue(Job::new(
            JobKind::Scan,
            "/books/a.cbz",
            priority::SCAN_ACTIVE,
            "scan:a",
            move |_cx| async move {
                ran_clone.store(true, Ordering::Relaxed);
                Ok(())
            },
        ));

        assert!(first.control().is_cancelled());
        release.notify_waiters();
        wait_for(|| ran.load(Ordering::Relaxed)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_archive_exclusivity() {
        let engine = engine(2);
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for key in ["scan:a", "pre:a"] {
            let concurrent = Arc::clone(&concurrent);
            let peak = Arc::clone(&peak);
            let kind = if key.starts_with("scan") {
                JobKind::Scan
            } else {
                JobKind::PreExtract
            };
            engine.enqueue(Job::new(
                kind,
                "/books/a.cbz",
                priority::SCAN_ACTIVE,
                key,
                move |_cx| async move {
                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                },
            ));
        }

        wait_for(|| {
            let stats = engine.stats();
            stats.running == 0 && stats.queued == 0
        })
        .await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pause_and_resume_pre_extract() {
        let engine = engine(1);
        let progressed = Arc::new(AtomicUsize::new(0));
        let progressed_clone = Arc::clone(&progressed);

        let handle = engine.enqueue(Job::new(
            JobKind::PreExtract,
            "/books/a.cbz",
            priority::PRE_EXTRACT_ACTIVE,
            "pre:a",
            move |cx| async move {
                for _ in 0..100 {
                    cx.ctrl.checkpoint().await?;
                    progressed_clone.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Ok(())
            },
        ));

        wait_for(|| progressed.load(Ordering::Relaxed) > 2).await;
        assert!(engine.pause_pre_extract(Path::new("/books/a.cbz")));
        wait_for(|| handle.state() == JobState::Paused).await;

        let at_pause = progressed.load(Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(100)).await;
        // One in-flight unit may land after the pause request.
        assert!(progressed.load(Ordering::Relaxed) <= at_pause + 1);

        assert!(engine.resume_pre_extract(Path::new("/books/a.cbz")));
        wait_for(|| progressed.load(Ordering::Relaxed) == 100).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_paused_jobs_resume_while_queue_is_idle() {
        // Every worker slot's job is paused and nothing else is queued; all
        // of them must still be able to take a slot back on resume.
        let engine = engine(2);
        let stop = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::new();
        for name in ["a", "b"] {
            let stop = Arc::clone(&stop);
            handles.push(engine.enqueue(Job::new(
                JobKind::PreExtract,
                format!("/books/{name}.cbz"),
                priority::PRE_EXTRACT_ACTIVE,
                format!("pre:{name}"),
                move |cx| async move {
                    loop {
                        cx.ctrl.checkpoint().await?;
                        if stop.load(Ordering::Relaxed) {
                            return Ok(());
                        }
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                },
            )));
        }
        wait_for(|| handles.iter().all(|h| h.state() == JobState::Running)).await;

        for h in &handles {
            h.control().request_pause();
        }
        wait_for(|| handles.iter().all(|h| h.state() == JobState::Paused)).await;

        for h in &handles {
            h.control().request_resume();
        }
        wait_for(|| handles.iter().all(|h| h.state() == JobState::Running)).await;

        stop.store(true, Ordering::Relaxed);
        wait_for(|| handles.iter().all(|h| h.state() == JobState::Completed)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_is_idempotent() {
        let engine = engine(1);
        let release = Arc::new(Notify::new());
        let handle = blocker(&engine, "/books/a.cbz", "scan:a", Arc::clone(&release));
        wait_for(|| handle.state() == JobState::Running).await;

        assert!(engine.cancel_job(handle.id()));
        assert!(engine.cancel_job(handle.id()));
        release.notify_waiters();
        wait_for(|| handle.state() == JobState::Cancelled).await;
        // Finished job: cancel is a no-op, not an error.
        assert!(!engine.cancel_job(handle.id()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_archive_keeps_pre_extract_paused() {
        let engine = engine(2);
        let release = Arc::new(Notify::new());
        let scan = blocker(&engine, "/books/a.cbz", "scan:a", Arc::clone(&release));

        let pre = engine.enqueue(Job::new(
            JobKind::PreExtract,
            "/books/a.cbz",
            priority::PRE_EXTRACT_ACTIVE,
            "pre:a",
            move |cx| async move {
                loop {
                    cx.ctrl.checkpoint().await?;
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            },
        ));

        wait_for(|| scan.state() == JobState::Running).await;
        engine.cancel_archive(Path::new("/books/a.cbz"), true);

        release.notify_waiters();
        wait_for(|| scan.state() == JobState::Cancelled).await;
        // Scan finished; pre-extract could then start and must end up paused.
        wait_for(|| pre.state() == JobState::Paused).await;
        assert!(!pre.control().is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stats_reflect_queue_depth() {
        let engine = engine(1);
        let release = Arc::new(Notify::new());
        let hold = blocker(&engine, "/books/hold.cbz", "hold", Arc::clone(&release));
        wait_for(|| hold.state() == JobState::Running).await;

        for i in 0..3 {
            engine.enqueue(Job::new(
                JobKind::PagePreload,
                "/books/b.cbz",
                priority::INACTIVE,
                format!("preload:{i}"),
                |_cx| async move { Ok(()) },
            ));
        }

        let stats = engine.stats();
        assert_eq!(stats.running, 1);
        assert_eq!(stats.queued, 3);
        assert_eq!(stats.workers, 1);

        release.notify_waiters();
        wait_for(|| {
            let stats = engine.stats();
            stats.running == 0 && stats.queued == 0
        })
        .await;
    }
}
