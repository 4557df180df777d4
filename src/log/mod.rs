//! Logging subsystem: the volatile per-transaction log, the log-combining
//! table that coalesces concurrent transactions before a group commit, and
//! the circular on-NVM redo log those commits are written into.
//!
//! | Module        | Role                                                          |
//! |---------------|----------------------------------------------------------------|
//! | [`vlog`]      | Per-transaction volatile (addr, value) log, chained in blocks  |
//! | [`combining`] | Hash-bucketed table that absorbs and coalesces multiple v-logs |
//! | [`ring`]      | The durable, crash-safe redo log the combined writes land in   |
//!
//! The flow through a commit is `vlog::VLog` (one per transaction) →
//! [`combining::CombiningTable::absorb`] → [`combining::CombiningTable::persist`]
//! → [`ring::NvRing::write_framed_record`]. [`commit`](crate::commit) drives
//! that sequence under the group-commit threshold.

pub mod combining;
pub mod ring;
pub mod vlog;

pub use combining::CombiningTable;
pub use ring::{EntryState, LogEntry, NvRing};
pub use vlog::VLog;
