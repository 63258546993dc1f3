//! Native ZIP/CBZ reader.
//!
//! ZIP has a central directory, so listing is cheap and entry access is
//! random. ZIP archives are never solid.

use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use zip::ZipArchive;

use super::{ArchiveReader, EntryMeta};

pub struct ZipReader {
    archive: ZipArchive<File>,
    /// Raw archive indexes of file (non-directory) entries, in archive order.
    file_indices: Vec<usize>,
}

impl ZipReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open archive: {}", path.display()))?;
        let mut archive = ZipArchive::new(file)
            .with_context(|| format!("Failed to read ZIP central directory: {}", path.display()))?;

        let mut file_indices = Vec::new();
        for raw in 0..archive.len() {
            let entry = archive
                .by_index(raw)
                .with_context(|| format!("Corrupt ZIP entry {raw}"))?;
            if !entry.is_dir() {
                file_indices.push(raw);
            }
        }

        Ok(Self {
            archive,
            file_indices,
        })
    }
}

impl ArchiveReader for ZipReader {
    fn entry_count_hint(&self) -> Option<usize> {
        Some(self.file_indices.len())
    }

    fn is_solid(&self) -> bool {
        false
    }

    fn list_entries(&mut self) -> Result<Box<dyn Iterator<Item = Result<EntryMeta>> + '_>> {
        let indices = self.file_indices.clone();
        let archive = &mut self.archive;
        let iter = indices.into_iter().enumerate().map(move |(index, raw)| {
            let entry = archive
                .by_index(raw)
                .with_context(|| format!("Corrupt ZIP entry {raw}"))?;
            Ok(EntryMeta {
                index,
                inner_path: entry.name().replace('\\', "/"),
                size: entry.size(),
            })
        });
        Ok(Box::new(iter))
    }

    fn read_entry(&mut self, index: usize) -> Result<Vec<u8>> {
        let Some(&raw) = self.file_indices.get(index) else {
            bail!(
                "entry index {index} out of range ({} entries)",
                self.file_indices.len()
            );
        };

        let mut entry = self
            .archive
            .by_index(raw)
            .with_context(|| format!("Corrupt ZIP entry {raw}"))?;
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut bytes)
            .with_context(|| format!("Failed to decompress entry {index}"))?;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn make_zip(dir: &Path, name: &str, entries: &[(&str, &[u8])]) -> std::path::PathBuf {
        let path = dir.join(name);
        let file = File::create(&path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (entry_name, data) in entries {
            zip.start_file(*entry_name, options).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
        path
    }

    #[test]
    fn test_list_preserves_archive_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = make_zip(
            dir.path(),
            "book.cbz",
            &[
                ("pages/002.png", b"second"),
                ("pages/001.png", b"first"),
                ("pages/003.png", b"third"),
            ],
        );

        let mut reader = ZipReader::open(&path).unwrap();
        assert_eq!(reader.entry_count_hint(), Some(3));
        assert!(!reader.is_solid());

        let entries: Vec<_> = reader
            .list_entries()
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        // Insertion order, not sorted order.
        assert_eq!(entries[0].inner_path, "pages/002.png");
        assert_eq!(entries[1].inner_path, "pages/001.png");
        assert_eq!(entries[2].inner_path, "pages/003.png");
        assert_eq!(entries[0].index, 0);
        assert_eq!(entries[2].index, 2);
        assert_eq!(entries[1].size, 5);
    }

    #[test]
    fn test_read_entry_by_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = make_zip(
            dir.path(),
            "book.cbz",
            &[("a.png", b"aaa" as &[u8]), ("b.png", b"bbbb")],
        );

        let mut reader = ZipReader::open(&path).unwrap();
        assert_eq!(reader.read_entry(0).unwrap(), b"aaa");
        assert_eq!(reader.read_entry(1).unwrap(), b"bbbb");
        assert!(reader.read_entry(2).is_err());
    }

    #[test]
    fn test_directories_excluded_from_listing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book.cbz");
        {
            let file = File::create(&path).unwrap();
            let mut zip = zip::ZipWriter::new(file);
            let options = zip::write::SimpleFileOptions::default();
            zip.add_directory("pages/", options).unwrap();
            zip.start_file("pages/001.png", options).unwrap();
            zip.write_all(b"data").unwrap();
            zip.finish().unwrap();
        }

        let mut reader = ZipReader::open(&path).unwrap();
        let entries: Vec<_> = reader
            .list_entries()
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].inner_path, "pages/001.png");
        assert_eq!(reader.read_entry(0).unwrap(), b"data");
    }
}
