//! 7zz binary integration for 7z and RAR archives.
//!
//! The 7zz binary gives consistent behavior across both formats and exposes
//! the solid flag straight from the container header (`7zz l -slt` prints
//! `Solid = +` without touching the compressed body), which is what lets the
//! engine decide on pre-extraction within the open latency budget.
//!
//! Commands used:
//! - List entries: `7zz l -slt -ba archive` (technical key=value listing)
//! - Solid probe:  `7zz l -slt archive` (archive properties block)
//! - Extract one:  `7zz e -so -spd archive "path/in/archive"`
//! - Stage all:    `7zz x -o{dir} archive` (solid archives only)
//!
//! For a solid archive, per-entry extraction would decompress from the start
//! of the stream on every call. The first `read_entry` instead stages the
//! whole archive into a temp directory in one sequential pass; later reads are
//! plain file reads from that staging dir.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;
use tracing::debug;

use super::{ArchiveReader, EntryMeta};

/// Locate the 7zz binary: next to the executable first, then system PATH.
pub fn find_7zz() -> Result<PathBuf> {
    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            for candidate in ["bin/7zz", "bin/7z.exe", "7zz"] {
                let path = exe_dir.join(candidate);
                if path.exists() {
                    return Ok(path);
                }
            }
        }
    }

    for name in ["7zz", "7z"] {
        if let Ok(output) = Command::new("which").arg(name).output() {
            if output.status.success() {
                let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !path.is_empty() {
                    return Ok(PathBuf::from(path));
                }
            }
        }
    }

    bail!("7z binary not found. Install p7zip or place 7zz next to the executable.")
}

/// Parse `7zz l -slt -ba` output into entries, archive order preserved.
fn parse_listing(output: &[u8]) -> Result<Vec<EntryMeta>> {
    let mut entries = Vec::new();
    let mut current: HashMap<String, String> = HashMap::new();

    let flush = |current: &mut HashMap<String, String>, entries: &mut Vec<EntryMeta>| {
        if let Some(path) = current.get("Path") {
            let is_dir = current.get("Folder").map(|v| v == "+").unwrap_or(false);
            let size = current
                .get("Size")
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0);
            if !is_dir && !path.is_empty() {
                entries.push(EntryMeta {
                    index: entries.len(),
                    inner_path: path.replace('\\', "/"),
                    size,
                });
            }
        }
        current.clear();
    };

    for line in BufReader::new(output).lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            flush(&mut current, &mut entries);
        } else if let Some((key, value)) = line.split_once(" = ") {
            current.insert(key.to_string(), value.to_string());
        }
    }
    flush(&mut current, &mut entries);

    Ok(entries)
}

/// Whether a technical listing reports solid compression.
fn listing_reports_solid(stdout: &str) -> bool {
    stdout.lines().any(|line| line.trim() == "Solid = +")
}

pub struct SevenZipCliReader {
    binary: PathBuf,
    archive_path: PathBuf,
    entries: Vec<EntryMeta>,
    solid: bool,
    /// Staging dir for solid archives, populated on first read.
    staging: Option<TempDir>,
}

impl SevenZipCliReader {
    pub fn open(path: &Path) -> Result<Self> {
        let binary = find_7zz()?;

        let output = Command::new(&binary)
            .arg("l")
            .arg("-slt")
            .arg("-ba")
            .arg("-scsUTF-8")
            .arg(path)
            .output()
            .with_context(|| format!("Failed to run 7z list on {}", path.display()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("7z list failed for {}: {}", path.display(), stderr);
        }
        let entries = parse_listing(&output.stdout)?;

        // Separate probe without -ba so the archive properties block (where
        // the Solid flag lives) is included. Header-only, no decompression.
        let probe = Command::new(&binary)
            .arg("l")
            .arg("-slt")
            .arg(path)
            .output()
            .with_context(|| format!("Failed to probe {} for solid flag", path.display()))?;
        let solid = probe.status.success()
            && listing_reports_solid(&String::from_utf8_lossy(&probe.stdout));

        debug!(
            "Opened {} via 7zz: {} entries, solid={}",
            path.display(),
            entries.len(),
            solid
        );

        Ok(Self {
            binary,
            archive_path: path.to_path_buf(),
            entries,
            solid,
            staging: None,
        })
    }

    /// Extract the whole archive into the staging dir (one sequential
    /// decompression pass). No-op if already staged.
    fn ensure_staged(&mut self) -> Result<&Path> {
        if self.staging.is_none() {
            let staging = tempfile::tempdir().context("Failed to create staging dir")?;
            debug!(
                "Staging solid archive {} -> {}",
                self.archive_path.display(),
                staging.path().display()
            );

            let output = Command::new(&self.binary)
                .arg("x")
                .arg("-y")
                .arg("-aoa")
                .arg("-scsUTF-8")
                .arg("-mmt=on")
                .arg(format!("-o{}", staging.path().display()))
                .arg(&self.archive_path)
                .output()
                .with_context(|| format!("Failed to extract {}", self.archive_path.display()))?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                bail!(
                    "7z extract failed for {}: {}",
                    self.archive_path.display(),
                    stderr
                );
            }

            self.staging = Some(staging);
        }
        match &self.staging {
            Some(dir) => Ok(dir.path()),
            None => bail!("staging dir unavailable"),
        }
    }

    fn read_direct(&self, inner_path: &str) -> Result<Vec<u8>> {
        let output = Command::new(&self.binary)
            .arg("e")
            .arg("-so")
            .arg("-bd")
            .arg("-y")
            .arg("-spd")
            .arg("-scsUTF-8")
            .arg(&self.archive_path)
            .arg(inner_path)
            .output()
            .with_context(|| {
                format!(
                    "Failed to extract '{}' from {}",
                    inner_path,
                    self.archive_path.display()
                )
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "7z extract failed for '{}' in {}: {}",
                inner_path,
                self.archive_path.display(),
                stderr
            );
        }
        if output.stdout.is_empty() {
            bail!(
                "7z returned no data for '{}' in {} - entry not found",
                inner_path,
                self.archive_path.display()
            );
        }
        Ok(output.stdout)
    }
}

impl ArchiveReader for SevenZipCliReader {
    fn entry_count_hint(&self) -> Option<usize> {
        Some(self.entries.len())
    }

    fn is_solid(&self) -> bool {
        self.solid
    }

    fn list_entries(&mut self) -> Result<Box<dyn Iterator<Item = Result<EntryMeta>> + '_>> {
        let entries = self.entries.clone();
        Ok(Box::new(entries.into_iter().map(Ok)))
    }

    fn read_entry(&mut self, index: usize) -> Result<Vec<u8>> {
        let Some(meta) = self.entries.get(index).cloned() else {
            bail!(
                "entry index {index} out of range ({} entries)",
                self.entries.len()
            );
        };

        if self.solid {
            let staged = self.ensure_staged()?.join(&meta.inner_path);
            std::fs::read(&staged)
                .with_context(|| format!("Staged entry missing: {}", staged.display()))
        } else {
            self.read_direct(&meta.inner_path)
        }
    }
}
