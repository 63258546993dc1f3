//! Archive access layer.
//!
//! Everything above this module talks to archives through [`ArchiveReader`],
//! a per-handle, not-thread-safe seam: at most one scan-or-extract operation
//! uses a handle at a time, and page serving opens a second read-only handle.
//!
//! Two implementations ship here: a native ZIP reader (random access, never
//! solid) and a 7zz-binary-backed reader for 7z and RAR, which is where solid
//! compression shows up. Format detection goes by magic bytes, not extension,
//! to handle mislabeled archives (a `.cbz` that is actually RAR, etc).

pub mod sevenzip;
pub mod zip;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// One archive member. Ordering is insertion order from the reader and
/// defines page order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMeta {
    /// Position in the archive's file listing (directories excluded).
    pub index: usize,
    /// Path within the archive, forward slashes.
    pub inner_path: String,
    /// Uncompressed size in bytes.
    pub size: u64,
}

/// A handle on an open archive.
///
/// Handles are `Send` but not `Sync`; concurrent entry extraction on one
/// handle is not supported.
pub trait ArchiveReader: Send {
    /// Total entry count, if cheaply known before a full listing.
    fn entry_count_hint(&self) -> Option<usize>;

    /// Whether the archive uses solid (unified-stream) compression.
    ///
    /// Implementations must answer this from container header inspection
    /// alone, without decompressing the archive body.
    fn is_solid(&self) -> bool;

    /// Stream the entry listing in archive order.
    fn list_entries(&mut self) -> Result<Box<dyn Iterator<Item = Result<EntryMeta>> + '_>>;

    /// Extract one entry's bytes by listing index.
    ///
    /// For solid archives this costs decompression of everything before the
    /// entry; callers that need many entries should read in increasing order.
    fn read_entry(&mut self, index: usize) -> Result<Vec<u8>>;
}

/// Opens reader handles. The engine holds this as a seam so tests can swap in
/// an in-memory implementation.
pub trait ReaderFactory: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn ArchiveReader>>;
}

/// Archive type detected by magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveType {
    Zip,
    SevenZ,
    Rar,
    Unknown,
}

/// Detect archive type by reading magic bytes.
pub fn detect_archive_type(path: &Path) -> Result<ArchiveType> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open file: {}", path.display()))?;

    let mut magic = [0u8; 8];
    let bytes_read = file.read(&mut magic).unwrap_or(0);

    if bytes_read < 4 {
        return Ok(ArchiveType::Unknown);
    }

    // ZIP: PK\x03\x04 or PK\x05\x06 (empty) or PK\x07\x08 (spanned)
    if magic[0..2] == [0x50, 0x4B] {
        return Ok(ArchiveType::Zip);
    }

    // RAR: Rar!\x1A\x07\x00 (RAR4) or Rar!\x1A\x07\x01\x00 (RAR5)
    if magic[0..4] == [0x52, 0x61, 0x72, 0x21] {
        return Ok(ArchiveType::Rar);
    }

    // 7z: 7z\xBC\xAF\x27\x1C
    if bytes_read >= 6 && magic[0..6] == [0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C] {
        return Ok(ArchiveType::SevenZ);
    }

    Ok(ArchiveType::Unknown)
}

/// The default factory: ZIP via the `zip` crate, 7z/RAR via the 7zz binary.
pub struct SystemReaderFactory;

impl ReaderFactory for SystemReaderFactory {
    fn open(&self, path: &Path) -> Result<Box<dyn ArchiveReader>> {
        match detect_archive_type(path)? {
            ArchiveType::Zip => Ok(Box::new(zip::ZipReader::open(path)?)),
            ArchiveType::SevenZ | ArchiveType::Rar => {
                Ok(Box::new(sevenzip::SevenZipCliReader::open(path)?))
            }
            ArchiveType::Unknown => {
                bail!("unsupported archive format: {}", path.display())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_detect_zip_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.cbz");
        std::fs::write(&path, [0x50, 0x4B, 0x03, 0x04, 0, 0]).unwrap();
        assert_eq!(detect_archive_type(&path).unwrap(), ArchiveType::Zip);
    }

    #[test]
    fn test_detect_rar_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.zip"); // mislabeled on purpose
        std::fs::write(&path, b"Rar!\x1a\x07\x01\x00").unwrap();
        assert_eq!(detect_archive_type(&path).unwrap(), ArchiveType::Rar);
    }

    #[test]
    fn test_detect_sevenz_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.7z");
        std::fs::write(&path, [0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C, 0, 0]).unwrap();
        assert_eq!(detect_archive_type(&path).unwrap(), ArchiveType::SevenZ);
    }

    #[test]
    fn test_detect_short_file_is_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny");
        let mut f = File::create(&path).unwrap();
        f.write_all(b"PK").unwrap();
        drop(f);
        assert_eq!(detect_archive_type(&path).unwrap(), ArchiveType::Unknown);
    }
}
