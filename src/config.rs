use std::path::PathBuf;

/// Full pool size: 1 GiB.
pub const POOL_SIZE_FULL: u64 = 1024 * 1024 * 1024;

/// Small-pool mode size: 128 MiB, used for tests and constrained environments.
pub const POOL_SIZE_SMALL: u64 = 128 * 1024 * 1024;

/// Entries per NVM log block (spec: C = 63).
pub const NV_LOG_LENGTH: usize = 63;

/// Blocks in the NVM redo ring (spec: N = 1024).
pub const NV_LOG_BLOCK_NUM: usize = 1024;

/// Entries per volatile transaction log block (spec: V = 15).
pub const V_LOG_LENGTH: usize = 15;

/// Number of bucket chains in the combining table (spec: 2^20).
pub const COMBINING_TABLE_SIZE: usize = 1 << 20;

/// Default transaction-count threshold that triggers a group persist.
pub const DEFAULT_MAX_UNPERSIST_TX: usize = 64;

/// Runtime configuration for the persistence core.
///
/// A plain data-only struct with a `Default` impl, passed down by reference
/// rather than reached for through a global.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the backing pool file.
    pub pool_path: PathBuf,

    /// Pool size in bytes. Use [`POOL_SIZE_SMALL`] for test/CI environments.
    pub pool_size: u64,

    /// Number of absorbed transactions that forces a group persist.
    pub max_unpersist_tx: usize,

    /// Number of distinct addresses that forces a group persist
    /// (spec: `distinct_entries >= C - 2`).
    pub max_unpersist_entries: usize,

    /// Enable the measurement hooks. Pure observation; never
    /// changes control flow when toggled.
    pub metrics_enabled: bool,
}

impl Config {
    /// Configuration sized for tests: a small pool and a low flush threshold
    /// so group-commit and back-pressure paths exercise quickly.
    pub fn for_tests(pool_path: impl Into<PathBuf>) -> Self {
        Self {
            pool_path: pool_path.into(),
            pool_size: POOL_SIZE_SMALL,
            max_unpersist_tx: 4,
            max_unpersist_entries: NV_LOG_LENGTH - 2,
            metrics_enabled: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool_path: PathBuf::from("./data/nvcore.pool"),
            pool_size: POOL_SIZE_FULL,
            max_unpersist_tx: DEFAULT_MAX_UNPERSIST_TX,
            max_unpersist_entries: NV_LOG_LENGTH - 2,
            metrics_enabled: false,
        }
    }
}
