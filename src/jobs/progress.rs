//! Progress reporting.
//!
//! Jobs push [`ProgressEvent`]s into an unbounded channel so a slow consumer
//! can never stall a worker. The aggregator task sits between that channel
//! and the broadcast subscribers: it enriches `Completed` events with the
//! elapsed time and byte totals it tracked, and when more than one background
//! job is active it interleaves a weighted [`ProgressPayload::Aggregate`]
//! summary so a single progress bar stays meaningful.

use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use super::JobKind;

#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub job_id: u64,
    pub archive: PathBuf,
    pub payload: ProgressPayload,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressPayload {
    Started {
        job: JobKind,
    },
    /// Scan progress; `estimated_total` is absent when the container format
    /// cannot report a count up front.
    Scanned {
        scanned: usize,
        estimated_total: Option<usize>,
    },
    /// Pre-extraction progress in entries and decompressed bytes.
    Extraction {
        completed: usize,
        total: usize,
        bytes: u64,
    },
    /// Weighted summary across all active background jobs.
    Aggregate {
        percent: f32,
        active_jobs: usize,
    },
    Completed {
        elapsed_ms: u64,
        bytes: u64,
    },
    Errored {
        message: String,
        retryable: bool,
    },
    Cancelled,
}

/// Cloneable sending half handed to every job.
#[derive(Clone)]
pub struct ProgressSender {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ProgressSender {
    pub fn send(&self, event: ProgressEvent) {
        // Receiver gone means the engine is shutting down; drop silently.
        let _ = self.tx.send(event);
    }

    pub fn emit(&self, job_id: u64, archive: &std::path::Path, payload: ProgressPayload) {
        self.send(ProgressEvent {
            job_id,
            archive: archive.to_path_buf(),
            payload,
        });
    }
}

pub fn channel() -> (ProgressSender, mpsc::UnboundedReceiver<ProgressEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ProgressSender { tx }, rx)
}

struct JobTrack {
    started: Instant,
    completed_units: usize,
    total_units: Option<usize>,
    bytes: u64,
    background: bool,
}

/// Spawn the aggregator task. Returns the broadcast handle subscribers
/// attach to; the task exits when all `ProgressSender` clones are dropped.
pub fn spawn_aggregator(
    mut rx: mpsc::UnboundedReceiver<ProgressEvent>,
    capacity: usize,
) -> broadcast::Sender<ProgressEvent> {
    let (out, _) = broadcast::channel(capacity);
    let publisher = out.clone();

    tokio::spawn(async move {
        let mut tracks: HashMap<u64, JobTrack> = HashMap::new();

        while let Some(event) = rx.recv().await {
            let forward = match &event.payload {
                ProgressPayload::Started { job } => {
                    tracks.insert(
                        event.job_id,
                        JobTrack {
                            started: Instant::now(),
                            completed_units: 0,
                            total_units: None,
                            bytes: 0,
                            background: !matches!(job, JobKind::PagePreload),
                        },
                    );
                    event
                }
                ProgressPayload::Scanned {
                    scanned,
                    estimated_total,
                } => {
                    if let Some(track) = tracks.get_mut(&event.job_id) {
                        track.completed_units = *scanned;
                        track.total_units = *estimated_total;
                    }
                    event
                }
                ProgressPayload::Extraction {
                    completed,
                    total,
                    bytes,
                } => {
                    if let Some(track) = tracks.get_mut(&event.job_id) {
                        track.completed_units = *completed;
                        track.total_units = Some(*total);
                        track.bytes = *bytes;
                    }
                    event
                }
                ProgressPayload::Completed { elapsed_ms, bytes } => {
                    // Workers report completion without totals; fill them in
                    // from what we tracked.
                    let (elapsed_ms, bytes) = match tracks.remove(&event.job_id) {
                        Some(track) => (
                            track.started.elapsed().as_millis() as u64,
                            track.bytes.max(*bytes),
                        ),
                        None => (*elapsed_ms, *bytes),
                    };
                    debug!(
                        "Job {} on {} completed in {}ms",
                        event.job_id,
                        event.archive.display(),
                        elapsed_ms
                    );
                    ProgressEvent {
                        payload: ProgressPayload::Completed { elapsed_ms, bytes },
                        ..event
                    }
                }
                ProgressPayload::Errored { .. } | ProgressPayload::Cancelled => {
                    tracks.remove(&event.job_id);
                    event
                }
                ProgressPayload::Aggregate { .. } => event,
            };

            let is_unit_progress = matches!(
                forward.payload,
                ProgressPayload::Scanned { .. } | ProgressPayload::Extraction { .. }
            );
            let _ = publisher.send(forward);

            if is_unit_progress {
                if let Some(summary) = aggregate(&tracks) {
                    let _ = publisher.send(summary);
                }
            }
        }
    });

    out
}

/// Weighted percentage across background jobs with known totals. Only emitted
/// when two or more are in flight; a single job's own events carry enough.
fn aggregate(tracks: &HashMap<u64, JobTrack>) -> Option<ProgressEvent> {
    let active: Vec<&JobTrack> = tracks
        .values()
        .filter(|t| t.background && t.total_units.is_some())
        .collect();
    if active.len() < 2 {
        return None;
    }

    let total: usize = active.iter().filter_map(|t| t.total_units).sum();
    if total == 0 {
        return None;
    }
    let completed: usize = active.iter().map(|t| t.completed_units).sum();

    Some(ProgressEvent {
        job_id: 0,
        archive: PathBuf::new(),
        payload: ProgressPayload::Aggregate {
            percent: (completed as f32 / total as f32) * 100.0,
            active_jobs: active.len(),
        },
    })
}
