//! Streaming index builder.
//!
//! Scans an archive's entry listing progressively, flushing a batch at least
//! every N entries or every T milliseconds (whichever comes first) so callers
//! can render a progress percentage without waiting for the full scan.
//!
//! Runs synchronously inside a blocking job slot; cancellation is checked at
//! batch boundaries. A failed or cancelled scan leaves nothing behind - only
//! pre-extraction is resumable, a scan retry always restarts from zero.

use std::time::Instant;
use tracing::{debug, info};

use super::{IndexRecord, ScanBatch};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::fingerprint::ArchiveFingerprint;
use crate::jobs::JobControl;
use crate::reader::ArchiveReader;

pub struct IndexBuilder {
    batch_size: usize,
    batch_interval: std::time::Duration,
}

impl IndexBuilder {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            batch_size: cfg.scan_batch_size.max(1),
            batch_interval: cfg.scan_batch_interval,
        }
    }

    /// Run the scan to completion, invoking `on_batch` for each flushed batch.
    ///
    /// Returns the completed record, or `Cancelled`/`Reader` without one.
    pub fn run(
        &self,
        reader: &mut dyn ArchiveReader,
        fingerprint: &ArchiveFingerprint,
        ctrl: &JobControl,
        mut on_batch: impl FnMut(ScanBatch),
    ) -> Result<IndexRecord> {
        let started = Instant::now();
        let estimated_total = reader.entry_count_hint();
        let solid = reader.is_solid();

        let mut all_entries = Vec::with_capacity(estimated_total.unwrap_or(0));
        let mut pending = Vec::with_capacity(self.batch_size);
        let mut last_flush = Instant::now();

        let mut iter = reader.list_entries().map_err(EngineError::reader)?;
        while let Some(item) = iter.next() {
            let entry = item.map_err(EngineError::reader)?;
            pending.push(entry);

            if pending.len() >= self.batch_size || last_flush.elapsed() >= self.batch_interval {
                if ctrl.is_cancelled() {
                    debug!(
                        "Scan of {} cancelled at {} entries",
                        fingerprint.path.display(),
                        all_entries.len() + pending.len()
                    );
                    return Err(EngineError::Cancelled);
                }

                let batch = std::mem::take(&mut pending);
                all_entries.extend_from_slice(&batch);
                on_batch(ScanBatch {
                    entries: batch,
                    scanned: all_entries.len(),
                    estimated_total,
                });
                last_flush = Instant::now();
            }
        }
        drop(iter);

        if ctrl.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        if !pending.is_empty() {
            let batch = std::mem::take(&mut pending);
            all_entries.extend_from_slice(&batch);
            on_batch(ScanBatch {
                entries: batch,
                scanned: all_entries.len(),
                estimated_total,
            });
        }

        info!(
            "Scanned {} ({} entries, solid={}) in {:?}",
            fingerprint.path.display(),
            all_entries.len(),
            solid,
            started.elapsed()
        );

        Ok(IndexRecord {
            fingerprint: fingerprint.clone(),
            entries: all_entries,
            solid,
            built_at: chrono::Utc::now(),
        })
    }
}
