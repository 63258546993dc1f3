//! Engine configuration.
//!
//! All values are read once at session start; mid-session changes take effect
//! on the next reservation/eviction decision rather than retroactively.

use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

/// How the memory budget is specified.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BudgetSpec {
    /// Fixed byte budget.
    Bytes(u64),
    /// Fraction of total system RAM (0.0 - 1.0).
    FractionOfRam(f64),
}

/// Configuration consumed by [`crate::session::Engine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Budget for memory-backed cache entries.
    pub memory_budget: BudgetSpec,
    /// Entries at or above this size always go to a temp file, never RAM.
    pub large_page_threshold: u64,
    /// How many pages past the requested one to preload.
    pub preload_window: usize,
    /// Ceiling on total serialized index data in the index store.
    pub index_cache_ceiling: u64,
    /// Worker slots in the job engine.
    pub worker_count: usize,
    /// Emit a scan batch at least every this many entries.
    pub scan_batch_size: usize,
    /// ...or at least this often, whichever comes first.
    pub scan_batch_interval: Duration,
    /// Available-RAM percentage below which the pool force-evicts.
    pub memory_pressure_floor: u8,
    /// Root for per-session temp directories. Defaults to the OS temp dir.
    pub temp_root: Option<PathBuf>,
    /// Index store database path. `None` keeps the catalog in memory.
    pub index_db_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memory_budget: BudgetSpec::FractionOfRam(0.25),
            large_page_threshold: 50 * 1024 * 1024,
            preload_window: 4,
            index_cache_ceiling: 100 * 1024 * 1024,
            worker_count: 2,
            scan_batch_size: 100,
            scan_batch_interval: Duration::from_millis(50),
            memory_pressure_floor: 10,
            temp_root: None,
            index_db_path: None,
        }
    }
}

impl EngineConfig {
    /// Resolve the configured budget to a concrete byte count.
    ///
    /// Fraction-of-RAM budgets are computed from total system memory, with a
    /// floor so tiny machines still get a workable cache.
    pub fn resolved_budget(&self) -> u64 {
        const MIN_BUDGET: u64 = 64 * 1024 * 1024;
        match self.memory_budget {
            BudgetSpec::Bytes(b) => b,
            BudgetSpec::FractionOfRam(f) => {
                let total = total_system_ram();
                ((total as f64 * f.clamp(0.0, 1.0)) as u64).max(MIN_BUDGET)
            }
        }
    }
}

/// Total system RAM in bytes, probed once per process.
pub fn total_system_ram() -> u64 {
    static TOTAL: OnceLock<u64> = OnceLock::new();

    *TOTAL.get_or_init(|| {
        let sys = sysinfo::System::new_with_specifics(
            sysinfo::RefreshKind::nothing().with_memory(sysinfo::MemoryRefreshKind::everything()),
        );
        sys.total_memory()
    })
}

/// Currently available system RAM as a percentage of total.
pub(crate) fn available_ram_percent() -> u64 {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();

    let total = sys.total_memory();
    if total == 0 {
        return 100;
    }
    sys.available_memory() * 100 / total
}
