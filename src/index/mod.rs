//! Archive index types.
//!
//! An [`IndexRecord`] is the persisted artifact of a completed scan, keyed by
//! the archive's fingerprint. It is immutable once written; a rescan produces
//! a new record that replaces the old one.

pub mod builder;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fingerprint::ArchiveFingerprint;
use crate::reader::EntryMeta;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexRecord {
    pub fingerprint: ArchiveFingerprint,
    /// Entries in archive order; position defines page order.
    pub entries: Vec<EntryMeta>,
    /// Whether the archive uses solid compression.
    pub solid: bool,
    pub built_at: DateTime<Utc>,
}

impl IndexRecord {
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }
}

/// A partial scan result, emitted while the scan is still running so the UI
/// can show progress before completion.
#[derive(Debug, Clone)]
pub struct ScanBatch {
    /// Entries discovered since the previous batch.
    pub entries: Vec<EntryMeta>,
    /// Total entries scanned so far.
    pub scanned: usize,
    /// Total expected, if the reader knows it up front.
    pub estimated_total: Option<usize>,
}
