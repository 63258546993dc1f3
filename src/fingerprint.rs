//! Archive identity.
//!
//! An archive is identified by its path, byte size, and modification time.
//! The fingerprint is recomputed on every open; any difference from a stored
//! fingerprint invalidates the cached index for that archive.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArchiveFingerprint {
    pub path: PathBuf,
    pub size: u64,
    /// Modification time as unix seconds.
    pub modified: i64,
}

impl ArchiveFingerprint {
    /// Compute the fingerprint from the archive's current on-disk state.
    pub fn compute(path: &Path) -> Result<Self> {
        let metadata = std::fs::metadata(path)?;
        let modified = metadata
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        Ok(Self {
            path: path.to_path_buf(),
            size: metadata.len(),
            modified,
        })
    }

    /// A short stable name for this fingerprint, used for session temp dirs.
    pub fn dir_name(&self) -> String {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().replace(['/', '\\', ' '], "_"))
            .unwrap_or_else(|| "archive".into());
        format!("{}-{:x}-{:x}", stem, self.size, self.modified)
    }
}
