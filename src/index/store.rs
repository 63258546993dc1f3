//! SQLite-backed index store.
//!
//! Persists completed scans so a later reopen can skip rescanning - a lookup
//! hit is what lets the first page render within ~100ms on a warm archive.
//!
//! Invalidation is implicit: every lookup recomputes the archive's current
//! fingerprint from disk and treats a mismatch as a miss (the stale row is
//! dropped, not reported as an error). Total stored size is capped; inserts
//! beyond the ceiling evict least-recently-used records first.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

use super::IndexRecord;
use crate::error::Result;
use crate::fingerprint::ArchiveFingerprint;

pub struct IndexStore {
    conn: Mutex<Connection>,
    ceiling_bytes: u64,
}

impl IndexStore {
    /// Open or create the catalog database.
    pub fn open(db_path: &Path, ceiling_bytes: u64) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA temp_store = MEMORY;",
        )?;
        let store = Self {
            conn: Mutex::new(conn),
            ceiling_bytes,
        };
        store.create_tables()?;
        info!("Index store opened at {}", db_path.display());
        Ok(store)
    }

    /// In-memory catalog (for testing and the default no-path config).
    pub fn in_memory(ceiling_bytes: u64) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
            ceiling_bytes,
        };
        store.create_tables()?;
        Ok(store)
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.lock_conn();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS archive_indexes (
                path TEXT PRIMARY KEY,
                size INTEGER NOT NULL,
                modified INTEGER NOT NULL,
                byte_size INTEGER NOT NULL,
                built_at TEXT NOT NULL,
                last_used_at INTEGER NOT NULL,
                record BLOB NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_archive_indexes_lru
                ON archive_indexes(last_used_at);
            "#,
        )?;
        Ok(())
    }

    fn lock_conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Look up the cached index for an archive, validating it against the
    /// archive's current on-disk state. Mismatch or missing file is a miss.
    pub fn lookup(&self, path: &Path) -> Result<Option<IndexRecord>> {
        let Ok(current) = ArchiveFingerprint::compute(path) else {
            return Ok(None);
        };

        let key = path.to_string_lossy();
        let conn = self.lock_conn();

        // SQLite integers are i64; sizes are cast at the boundary.
        let row: Option<(i64, i64, Vec<u8>)> = conn
            .query_row(
                "SELECT size, modified, record FROM archive_indexes WHERE path = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((size, modified, blob)) = row else {
            return Ok(None);
        };

        if size as u64 != current.size || modified != current.modified {
            debug!(
                "Index for {} is stale (size {} -> {}, mtime {} -> {})",
                path.display(),
                size,
                current.size,
                modified,
                current.modified
            );
            conn.execute("DELETE FROM archive_indexes WHERE path = ?1", params![key])?;
            return Ok(None);
        }

        let record: IndexRecord = match serde_json::from_slice(&blob) {
            Ok(r) => r,
            Err(e) => {
                // Unreadable blob is treated the same as stale.
                debug!("Dropping unreadable index for {}: {}", path.display(), e);
                conn.execute("DELETE FROM archive_indexes WHERE path = ?1", params![key])?;
                return Ok(None);
            }
        };

        conn.execute(
            "UPDATE archive_indexes SET last_used_at = ?1 WHERE path = ?2",
            params![Utc::now().timestamp_millis(), key],
        )?;

        Ok(Some(record))
    }

    /// Store a completed scan, then evict least-recently-used records until
    /// total serialized size is back under the ceiling.
    pub fn put(&self, record: &IndexRecord) -> Result<()> {
        let blob = serde_json::to_vec(record).map_err(std::io::Error::other)?;
        let key = record.fingerprint.path.to_string_lossy().to_string();

        let conn = self.lock_conn();
        conn.execute(
            "INSERT OR REPLACE INTO archive_indexes
                 (path, size, modified, byte_size, built_at, last_used_at, record)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                key,
                record.fingerprint.size as i64,
                record.fingerprint.modified,
                blob.len() as i64,
                record.built_at.to_rfc3339(),
                Utc::now().timestamp_millis(),
                blob,
            ],
        )?;

        let mut evicted = 0usize;
        loop {
            let total: i64 = conn.query_row(
                "SELECT COALESCE(SUM(byte_size), 0) FROM archive_indexes",
                [],
                |row| row.get(0),
            )?;
            if total as u64 <= self.ceiling_bytes {
                break;
            }
            let removed = conn.execute(
                "DELETE FROM archive_indexes WHERE path IN
                     (SELECT path FROM archive_indexes ORDER BY last_used_at ASC LIMIT 1)",
                [],
            )?;
            if removed == 0 {
                break;
            }
            evicted += removed;
        }
        if evicted > 0 {
            debug!("Index store evicted {} record(s) over ceiling", evicted);
        }

        Ok(())
    }

    /// Drop the record for one archive, if present.
    pub fn remove(&self, path: &Path) -> Result<()> {
        let conn = self.lock_conn();
        conn.execute(
            "DELETE FROM archive_indexes WHERE path = ?1",
            params![path.to_string_lossy()],
        )?;
        Ok(())
    }

    /// Total serialized bytes currently stored.
    pub fn total_bytes(&self) -> Result<u64> {
        let conn = self.lock_conn();
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(byte_size), 0) FROM archive_indexes",
            [],
            |row| row.get(0),
        )?;
        Ok(total as u64)
    }

    pub fn record_count(&self) -> Result<usize> {
        let conn = self.lock_conn();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM archive_indexes", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Drop the catalog table so later writes fail; simulates a broken
    /// store database.
    #[cfg(test)]
    pub(crate) fn break_catalog(&self) {
        let conn = self.lock_conn();
        let _ = conn.execute("DROP TABLE archive_indexes", []);
    }
}
