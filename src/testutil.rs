//! In-memory archive fixtures for unit tests.

use anyhow::{anyhow, bail, Result};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::reader::{ArchiveReader, EntryMeta, ReaderFactory};

/// Synthetic archive with `count` pages of `page_size` bytes each. Page `i`
/// is filled with the byte `i % 251`, so content mismatches are detectable.
pub struct MemoryReader {
    count: usize,
    page_size: usize,
    solid: bool,
    fail_listing_at: Option<usize>,
    fail_read_at: Option<usize>,
    read_delay: Duration,
    read_log: Arc<Mutex<Vec<usize>>>,
}

impl MemoryReader {
    pub fn with_pages(count: usize, page_size: usize, solid: bool) -> Self {
        Self {
            count,
            page_size,
            solid,
            fail_listing_at: None,
            fail_read_at: None,
            read_delay: Duration::ZERO,
            read_log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The listing iterator yields an error at position `index`.
    pub fn failing_listing_at(mut self, index: usize) -> Self {
        self.fail_listing_at = Some(index);
        self
    }

    /// `read_entry` fails for entry `index`.
    pub fn failing_read_at(mut self, index: usize) -> Self {
        self.fail_read_at = Some(index);
        self
    }

    /// Add per-read latency, for tests that race reads against other work.
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    /// Every entry index passed to `read_entry`, in call order.
    pub fn read_log(&self) -> Arc<Mutex<Vec<usize>>> {
        Arc::clone(&self.read_log)
    }

    pub fn page_bytes(&self, index: usize) -> Vec<u8> {
        vec![(index % 251) as u8; self.page_size]
    }
}

impl ArchiveReader for MemoryReader {
    fn entry_count_hint(&self) -> Option<usize> {
        Some(self.count)
    }

    fn is_solid(&self) -> bool {
        self.solid
    }

    fn list_entries(&mut self) -> Result<Box<dyn Iterator<Item = Result<EntryMeta>> + '_>> {
        let count = self.count;
        let page_size = self.page_size as u64;
        let fail_at = self.fail_listing_at;
        Ok(Box::new((0..count).map(move |i| {
            if fail_at == Some(i) {
                return Err(anyhow!("listing failed at entry {i}"));
            }
            Ok(EntryMeta {
                index: i,
                inner_path: format!("pages/{i:04}.png"),
                size: page_size,
            })
        })))
    }

    fn read_entry(&mut self, index: usize) -> Result<Vec<u8>> {
        if !self.read_delay.is_zero() {
            std::thread::sleep(self.read_delay);
        }
        if index >= self.count {
            bail!("entry {} out of range ({} entries)", index, self.count);
        }
        if self.fail_read_at == Some(index) {
            bail!("read failed at entry {index}");
        }
        self.read_log.lock().unwrap().push(index);
        Ok(self.page_bytes(index))
    }
}

/// Factory producing [`MemoryReader`]s for any path. All readers share one
/// read log so tests can assert what got extracted across reopenings.
pub struct MemoryReaderFactory {
    count: usize,
    page_size: usize,
    solid: bool,
    fail_read_at: Option<usize>,
    read_delay: Duration,
    read_log: Arc<Mutex<Vec<usize>>>,
}

impl MemoryReaderFactory {
    pub fn new(count: usize, page_size: usize, solid: bool) -> Self {
        Self {
            count,
            page_size,
            solid,
            fail_read_at: None,
            read_delay: Duration::ZERO,
            read_log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    /// Readers opened by this factory fail when asked for entry `index`.
    pub fn failing_read_at(mut self, index: usize) -> Self {
        self.fail_read_at = Some(index);
        self
    }

    pub fn read_log(&self) -> Arc<Mutex<Vec<usize>>> {
        Arc::clone(&self.read_log)
    }
}

impl ReaderFactory for MemoryReaderFactory {
    fn open(&self, _path: &Path) -> Result<Box<dyn ArchiveReader>> {
        Ok(Box::new(MemoryReader {
            count: self.count,
            page_size: self.page_size,
            solid: self.solid,
            fail_listing_at: None,
            fail_read_at: self.fail_read_at,
            read_delay: self.read_delay,
            read_log: Arc::clone(&self.read_log),
        }))
    }
}
