//! Job model: kinds, states, and the cooperative control block.
//!
//! Cancellation and pause are flags, not thread interruption: long-running
//! loops call [`JobControl::checkpoint`] between units of work (a scan batch,
//! an extracted entry), which is what bounds cancellation latency to one unit.
//!
//! State machine: `Queued -> Running -> {Completed, Failed, Cancelled}`, with
//! `Paused` reachable only from `Running` and returning only to `Running`.
//! A paused or otherwise suspended job gives its worker slot back; suspension
//! never blocks another job's worker.

pub mod engine;
pub mod progress;

use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum JobKind {
    Scan,
    PreExtract,
    PagePreload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobState {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

/// Scheduling priorities. Higher wins; FIFO within a priority.
pub mod priority {
    /// On-demand page work. Always chosen ahead of background jobs.
    pub const PAGE: u8 = 100;
    /// Scan of the currently open archive.
    pub const SCAN_ACTIVE: u8 = 60;
    /// Pre-extraction of the currently open archive.
    pub const PRE_EXTRACT_ACTIVE: u8 = 40;
    /// Anything belonging to a non-active archive.
    pub const INACTIVE: u8 = 10;
}

/// What a job body receives when it starts: its engine-assigned id (used to
/// tag progress events) and its control block.
#[derive(Clone)]
pub struct JobContext {
    pub id: u64,
    pub ctrl: JobControl,
}

pub(crate) type JobFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
pub(crate) type JobExec = Box<dyn FnOnce(JobContext) -> JobFuture + Send>;

/// A unit of schedulable work.
pub struct Job {
    pub kind: JobKind,
    pub archive: PathBuf,
    pub priority: u8,
    /// Dedupe/cancellation key. Enqueueing a second job with a live key
    /// cancels the first.
    pub key: String,
    pub(crate) exec: JobExec,
}

impl Job {
    pub fn new<F, Fut>(
        kind: JobKind,
        archive: impl Into<PathBuf>,
        priority: u8,
        key: impl Into<String>,
        exec: F,
    ) -> Self
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            kind,
            archive: archive.into(),
            priority,
            key: key.into(),
            exec: Box::new(move |cx| Box::pin(exec(cx))),
        }
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("kind", &self.kind)
            .field("archive", &self.archive)
            .field("priority", &self.priority)
            .field("key", &self.key)
            .finish()
    }
}

struct ControlInner {
    cancel: AtomicBool,
    pause: AtomicBool,
    resume: Notify,
    state: Mutex<JobState>,
    retryable: AtomicBool,
    /// Worker slot held while the job is actually executing. Taken out
    /// during suspension so other jobs can run.
    permit: Mutex<Option<OwnedSemaphorePermit>>,
    slots: Mutex<Option<Arc<Semaphore>>>,
}

/// Shared control block for one job. Cloned into the job body, the engine's
/// handle table, and anything that needs to pause/cancel it.
#[derive(Clone)]
pub struct JobControl {
    inner: Arc<ControlInner>,
}

impl JobControl {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ControlInner {
                cancel: AtomicBool::new(false),
                pause: AtomicBool::new(false),
                resume: Notify::new(),
                state: Mutex::new(JobState::Queued),
                retryable: AtomicBool::new(false),
                permit: Mutex::new(None),
                slots: Mutex::new(None),
            }),
        }
    }

    fn lock<'a, T>(m: &'a Mutex<T>) -> MutexGuard<'a, T> {
        match m.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.load(Ordering::Relaxed)
    }

    pub fn is_pause_requested(&self) -> bool {
        self.inner.pause.load(Ordering::Relaxed)
    }

    pub fn request_cancel(&self) {
        self.inner.cancel.store(true, Ordering::Relaxed);
        // A paused job must observe the cancel promptly.
        self.inner.resume.notify_waiters();
    }

    pub fn request_pause(&self) {
        self.inner.pause.store(true, Ordering::Relaxed);
    }

    pub fn request_resume(&self) {
        self.inner.pause.store(false, Ordering::Relaxed);
        self.inner.resume.notify_waiters();
    }

    pub fn state(&self) -> JobState {
        *Self::lock(&self.inner.state)
    }

    pub(crate) fn set_state(&self, state: JobState) {
        *Self::lock(&self.inner.state) = state;
    }

    /// Whether a failure of this job can be retried (always for scans; for
    /// pre-extraction only once a checkpoint exists).
    pub fn is_retryable(&self) -> bool {
        self.inner.retryable.load(Ordering::Relaxed)
    }

    pub fn set_retryable(&self, retryable: bool) {
        self.inner.retryable.store(retryable, Ordering::Relaxed);
    }

    pub(crate) fn attach_slot(&self, permit: OwnedSemaphorePermit, slots: Arc<Semaphore>) {
        *Self::lock(&self.inner.permit) = Some(permit);
        *Self::lock(&self.inner.slots) = Some(slots);
    }

    pub(crate) fn release_slot(&self) {
        Self::lock(&self.inner.permit).take();
    }

    /// Yield point between units of work. Returns `Cancelled` if cancellation
    /// was requested; parks the job (releasing its worker slot) while a pause
    /// is in effect.
    pub async fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if !self.is_pause_requested() {
            return Ok(());
        }
        self.park_until_resumed().await
    }

    async fn park_until_resumed(&self) -> Result<()> {
        let had_permit = Self::lock(&self.inner.permit).take().is_some();
        self.set_state(JobState::Paused);
        debug!("Job paused");

        loop {
            if self.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            if !self.is_pause_requested() {
                break;
            }
            // Bounded wait: a resume/cancel notification that lands before
            // this future is polled would otherwise be lost.
            let _ = tokio::time::timeout(
                Duration::from_millis(100),
                self.inner.resume.notified(),
            )
            .await;
        }

        self.reacquire_slot(had_permit).await?;
        self.set_state(JobState::Running);
        debug!("Job resumed");
        Ok(())
    }

    /// Run `wait` with the worker slot released and the job reported as
    /// `Paused` - the shape of memory-pool backpressure. Cancellation is
    /// polled so a cancel lands within ~100ms even mid-wait.
    pub async fn suspended<F>(&self, wait: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let had_permit = Self::lock(&self.inner.permit).take().is_some();
        self.set_state(JobState::Paused);

        tokio::pin!(wait);
        loop {
            if self.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            tokio::select! {
                _ = &mut wait => break,
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }

        self.reacquire_slot(had_permit).await?;
        self.set_state(JobState::Running);
        Ok(())
    }

    async fn reacquire_slot(&self, had_permit: bool) -> Result<()> {
        if !had_permit {
            return Ok(());
        }
        let slots = Self::lock(&self.inner.slots).clone();
        if let Some(slots) = slots {
            match slots.acquire_owned().await {
                Ok(permit) => {
                    *Self::lock(&self.inner.permit) = Some(permit);
                }
                // Semaphore closed: engine is shutting down.
                Err(_) => return Err(EngineError::Cancelled),
            }
        }
        Ok(())
    }
}

impl Default for JobControl {
    fn default() -> Self {
        Self::new()
    }
}
