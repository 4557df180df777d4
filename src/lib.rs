//! nvcore — persistence and shadow-paging core for an NVM-backed software
//! transactional memory system.
//!
//! This crate owns the durability path of the STM, not the STM itself: the
//! read/write barrier engine, contention manager, benchmark harness, and
//! ABI adapters are external collaborators that call into the types
//! exported here. Four pieces compose the commit path:
//!
//! - [`pool`] — the memory-mapped NVM pool: root record, bump allocator,
//!   flush/drain, and an atomic multi-word `publish`.
//! - [`log`] — the per-transaction volatile log, the process-wide
//!   combining table that coalesces concurrent commits, and the circular
//!   on-NVM redo log those groups are framed into.
//! - [`commit`] — [`commit::GroupCommitController`], which drives
//!   absorb -> persist -> reproduce -> clean and owns recovery at open.
//! - [`paging`] — the lock-free shadow page table that serves transactional
//!   reads/writes out of DRAM frames ahead of commit.
//!
//! [`metrics`] and [`config`] are the ambient instrumentation and
//! configuration layers shared by all of the above.

pub mod commit;
pub mod config;
pub mod error;
pub mod log;
pub mod metrics;
pub mod paging;
pub mod pool;

pub use commit::GroupCommitController;
pub use config::Config;
pub use error::{NvError, Result};
pub use log::{CombiningTable, NvRing, VLog};
pub use metrics::{CommitTimer, Metrics, MetricsSnapshot};
pub use paging::ShadowPageTable;
pub use pool::{Pool, PublishAction};

/// Test-only helpers shared across this crate's unit and integration tests.
#[cfg(test)]
pub(crate) mod test_support {
    use once_cell::sync::Lazy;

    static TRACING: Lazy<()> = Lazy::new(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });

    /// Install a `tracing` subscriber for the current test binary, once.
    /// Safe to call from every test; only the first call does anything.
    pub fn init_tracing() {
        Lazy::force(&TRACING);
    }
}
