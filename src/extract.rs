//! Checkpointed pre-extraction for solid archives.
//!
//! Solid compression makes random access cost the decompression of everything
//! before the target, so the only way to serve arbitrary pages quickly is to
//! walk the archive once, front to back, parking every entry in the memory
//! pool or the session temp dir. That walk is this module's job body.
//!
//! After each committed entry a JSON checkpoint is written next to the staged
//! files; a retry resumes at the checkpoint, re-adopting whatever staged files
//! survive on disk. This is the only resumable job kind - a scan just
//! restarts.
//!
//! Pool backpressure (`WouldBlock`) parks the job in `Paused` until capacity
//! frees up. Cancellation deletes the staged files and the checkpoint; pause
//! keeps both.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{retry_once, EngineError, Result};
use crate::jobs::progress::{ProgressPayload, ProgressSender};
use crate::jobs::JobContext;
use crate::pool::{MemoryPool, PageKey, Payload, Reservation, Urgency};
use crate::reader::{EntryMeta, ReaderFactory};

const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Persisted progress marker. Entries `0..=last_completed_index` are in the
/// pool or staged on disk at the moment this was written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job_id: u64,
    pub last_completed_index: usize,
}

impl Checkpoint {
    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(CHECKPOINT_FILE)
    }

    pub fn load(dir: &Path) -> Option<Self> {
        let data = std::fs::read(Self::path_in(dir)).ok()?;
        match serde_json::from_slice(&data) {
            Ok(cp) => Some(cp),
            Err(e) => {
                // A torn write from a crash; start over.
                warn!("Discarding unreadable checkpoint in {}: {}", dir.display(), e);
                None
            }
        }
    }

    pub fn write(&self, dir: &Path) -> Result<()> {
        let data = serde_json::to_vec(self).map_err(std::io::Error::other)?;
        retry_once(|| std::fs::write(Self::path_in(dir), &data))?;
        Ok(())
    }

    pub fn remove(dir: &Path) {
        let _ = std::fs::remove_file(Self::path_in(dir));
    }
}

/// Name of the staged temp file for one entry.
pub fn staged_file_name(index: usize) -> String {
    format!("{index:06}.page")
}

fn staged_index(name: &str) -> Option<usize> {
    name.strip_suffix(".page")?.parse().ok()
}

/// Everything a pre-extraction job body needs; assembled by the session.
pub struct PreExtract {
    pub archive: PathBuf,
    pub temp_dir: PathBuf,
    pub factory: Arc<dyn ReaderFactory>,
    /// The session's progressive entry table, filled by the scan.
    pub entries: Arc<RwLock<Vec<EntryMeta>>>,
    /// Flips to true once the full index is known.
    pub index_ready: watch::Receiver<bool>,
    pub pool: MemoryPool,
    /// Last extracted index, published after each commit. Shared with the
    /// session, which serves page requests at or below it.
    pub cursor: Arc<watch::Sender<Option<usize>>>,
    pub progress: ProgressSender,
}

impl PreExtract {
    pub async fn run(self, cx: JobContext) -> Result<()> {
        match self.run_inner(&cx).await {
            Err(EngineError::Cancelled) => {
                self.cleanup_partial();
                Err(EngineError::Cancelled)
            }
            other => other,
        }
    }

    async fn run_inner(&self, cx: &JobContext) -> Result<()> {
        self.await_index(cx).await?;

        let entries: Vec<EntryMeta> = match self.entries.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let total = entries.len();
        if total == 0 {
            return Ok(());
        }

        let start = self.resume_point(&entries);
        if start > 0 {
            info!(
                "Resuming pre-extraction of {} at entry {}/{}",
                self.archive.display(),
                start,
                total
            );
            cx.ctrl.set_retryable(true);
            let _ = self.cursor.send(Some(start - 1));
        }
        if start >= total {
            Checkpoint::remove(&self.temp_dir);
            return Ok(());
        }

        let mut reader = self
            .factory
            .open(&self.archive)
            .map_err(EngineError::reader)?;
        let mut bytes_done = 0u64;

        for (index, entry) in entries.iter().enumerate().skip(start) {
            cx.ctrl.checkpoint().await?;

            let key = PageKey::new(&self.archive, index);
            if !self.pool.contains(&key) {
                let ticket = match self
                    .pool
                    .reserve(key.clone(), entry.size, Urgency::Background)
                {
                    Reservation::Granted(ticket) => Some(ticket),
                    Reservation::AlreadyCached => None,
                    Reservation::WouldBlock => {
                        debug!(
                            "Pre-extraction of {} waiting for pool capacity at entry {}",
                            self.archive.display(),
                            index
                        );
                        // One continuous pause for the whole wait: re-reserve
                        // inside the suspension, with each capacity wait
                        // bounded so a notification firing between a failed
                        // reserve and the next await is never lost.
                        let mut outcome = None;
                        cx.ctrl
                            .suspended(async {
                                loop {
                                    let _ = tokio::time::timeout(
                                        Duration::from_millis(200),
                                        self.pool.wait_for_capacity(),
                                    )
                                    .await;
                                    match self.pool.reserve(
                                        key.clone(),
                                        entry.size,
                                        Urgency::Background,
                                    ) {
                                        Reservation::WouldBlock => {}
                                        granted => {
                                            outcome = Some(granted);
                                            break;
                                        }
                                    }
                                }
                            })
                            .await?;
                        match outcome {
                            Some(Reservation::Granted(ticket)) => Some(ticket),
                            _ => None,
                        }
                    }
                };

                if let Some(ticket) = ticket {
                    let (returned, data) = {
                        let mut r = reader;
                        tokio::task::spawn_blocking(move || {
                            let data = r.read_entry(index);
                            (r, data)
                        })
                        .await
                        .map_err(|e| EngineError::Io(std::io::Error::other(e)))?
                    };
                    reader = returned;
                    let data = data.map_err(EngineError::reader)?;
                    bytes_done += data.len() as u64;

                    if ticket.wants_file() {
                        let path = self.temp_dir.join(staged_file_name(index));
                        retry_once(|| std::fs::write(&path, &data))?;
                        self.pool.commit(ticket, Payload::File(path));
                    } else {
                        self.pool.commit(ticket, Payload::Bytes(data));
                    }
                }
            }

            Checkpoint {
                job_id: cx.id,
                last_completed_index: index,
            }
            .write(&self.temp_dir)?;
            // A checkpoint on disk is what makes a retry worthwhile.
            cx.ctrl.set_retryable(true);
            let _ = self.cursor.send(Some(index));
            self.progress.emit(
                cx.id,
                &self.archive,
                ProgressPayload::Extraction {
                    completed: index + 1,
                    total,
                    bytes: bytes_done,
                },
            );
        }

        Checkpoint::remove(&self.temp_dir);
        info!(
            "Pre-extracted {} ({} entries, {} bytes)",
            self.archive.display(),
            total,
            bytes_done
        );
        Ok(())
    }

    /// Wait until the index is complete. Polled with a short timeout so a
    /// cancel or pause lands promptly even if the scan stalls.
    async fn await_index(&self, cx: &JobContext) -> Result<()> {
        let mut ready = self.index_ready.clone();
        loop {
            if *ready.borrow() {
                return Ok(());
            }
            cx.ctrl.checkpoint().await?;
            let _ = tokio::time::timeout(Duration::from_millis(100), ready.changed()).await;
        }
    }

    /// First entry that still needs extracting: the checkpoint bounds the
    /// search, and every earlier entry must be either in the pool or staged
    /// on disk (staged files are re-adopted here, which is what carries a
    /// resume across a pool that was emptied in between).
    fn resume_point(&self, entries: &[EntryMeta]) -> usize {
        let Some(cp) = Checkpoint::load(&self.temp_dir) else {
            return 0;
        };
        let last = cp.last_completed_index.min(entries.len().saturating_sub(1));

        let staged: HashSet<usize> = WalkDir::new(&self.temp_dir)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| staged_index(&e.file_name().to_string_lossy()))
            .collect();

        let mut next = 0;
        for (index, entry) in entries.iter().enumerate().take(last + 1) {
            let key = PageKey::new(&self.archive, index);
            if self.pool.contains(&key) {
                next = index + 1;
            } else if staged.contains(&index) {
                self.pool
                    .adopt_file(key, self.temp_dir.join(staged_file_name(index)), entry.size);
                next = index + 1;
            } else {
                break;
            }
        }
        next
    }

    /// Cancellation cleanup: staged files and the checkpoint go; the session
    /// temp dir itself is owned by the session.
    fn cleanup_partial(&self) {
        let mut removed = 0usize;
        for entry in WalkDir::new(&self.temp_dir)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.file_type().is_file()
                && staged_index(&entry.file_name().to_string_lossy()).is_some()
                && std::fs::remove_file(entry.path()).is_ok()
            {
                removed += 1;
            }
        }
        Checkpoint::remove(&self.temp_dir);
        debug!(
            "Cancelled pre-extraction of {}, removed {} staged file(s)",
            self.archive.display(),
            removed
        );
    }
}
