//! Log-Combining Table.
//!
//! Concurrently committing transactions each call [`CombiningTable::absorb`]
//! with their volatile write set; the table keeps one coalesced, sorted
//! entry per address so a transaction that overwrote the same address
//! several times (or several transactions that touched the same address)
//! produce exactly one NVM write instead of one per transaction.
//!
//! Bucketing, absorption, and threshold checks are safe under concurrent
//! callers; [`CombiningTable::persist`] and [`CombiningTable::clean`] are
//! meant to run from inside the group-commit leader's critical section
//! ([`crate::commit`]) and are not themselves safe to call concurrently
//! with each other.

use crate::config::COMBINING_TABLE_SIZE;
use crate::error::Result;
use crate::log::ring::{LogEntry, NvRing};
use crate::log::vlog::VLog;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Clone, Copy)]
struct Entry {
    addr: u64,
    value: u64,
}

/// Maps a home address to its bucket using bits `[3, 3 + log2(table_size))`
/// — addresses are 8-byte aligned, so the low 3 bits never distinguish two
/// home addresses and are dropped before masking.
#[inline]
fn bucket_index(addr: u64) -> usize {
    ((addr >> 3) as usize) & (COMBINING_TABLE_SIZE - 1)
}

/// Coalescing hash table between a transaction's volatile write set and the
/// durable redo log.
pub struct CombiningTable {
    buckets: Vec<Mutex<Vec<Entry>>>,
    touched: Mutex<HashSet<usize>>,
    entry_count: AtomicUsize,
    absorbed_tx: AtomicUsize,
    max_timestamp: AtomicU64,
}

impl CombiningTable {
    pub fn new() -> Self {
        let mut buckets = Vec::with_capacity(COMBINING_TABLE_SIZE);
        for _ in 0..COMBINING_TABLE_SIZE {
            buckets.push(Mutex::new(Vec::new()));
        }
        Self {
            buckets,
            touched: Mutex::new(HashSet::new()),
            entry_count: AtomicUsize::new(0),
            absorbed_tx: AtomicUsize::new(0),
            max_timestamp: AtomicU64::new(0),
        }
    }

    /// Merge one transaction's write set into the table. `commit_timestamp`
    /// is that transaction's raw (pre-rebase) commit clock value; the table
    /// tracks the highest one seen since the last [`CombiningTable::clean`].
    pub fn absorb(&self, log: &VLog, commit_timestamp: u64) {
        for (addr, value) in log.iter() {
            let idx = bucket_index(addr);
            let mut bucket = self.buckets[idx].lock();
            match bucket.binary_search_by_key(&addr, |e| e.addr) {
                Ok(pos) => bucket[pos].value = value,
                Err(pos) => {
                    bucket.insert(pos, Entry { addr, value });
                    self.entry_count.fetch_add(1, Ordering::Relaxed);
                }
            }
            drop(bucket);
            self.touched.lock().insert(idx);
        }
        self.max_timestamp.fetch_max(commit_timestamp, Ordering::AcqRel);
        self.absorbed_tx.fetch_add(1, Ordering::AcqRel);
    }

    pub fn distinct_entries(&self) -> usize {
        self.entry_count.load(Ordering::Relaxed)
    }

    pub fn absorbed_transactions(&self) -> usize {
        self.absorbed_tx.load(Ordering::Relaxed)
    }

    pub fn max_timestamp(&self) -> u64 {
        self.max_timestamp.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.distinct_entries() == 0
    }

    /// True once either threshold configured for the pool has been crossed.
    pub fn should_persist(&self, max_unpersist_tx: usize, max_unpersist_entries: usize) -> bool {
        self.absorbed_transactions() >= max_unpersist_tx || self.distinct_entries() >= max_unpersist_entries
    }

    /// Write every currently-absorbed entry as one framed record, in
    /// bucket-ascending then address-ascending order (each bucket chain is
    /// already address-sorted by [`CombiningTable::absorb`]; only the
    /// touched-bucket traversal itself needs sorting).
    ///
    /// Does not clear the table: on `Err(NvError::RingFull)` the caller is
    /// expected to drive [`NvRing::reproduce_one`] and retry with the exact
    /// same call, so the table must still hold everything it had staged.
    /// Call [`CombiningTable::clean`] once this returns `Ok`.
    pub fn persist(&self, ring: &NvRing, commit_timestamp_absolute: u64) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }

        let touched = self.touched.lock();
        let mut sorted_buckets: Vec<usize> = touched.iter().copied().collect();
        sorted_buckets.sort_unstable();
        let mut entries = Vec::with_capacity(self.distinct_entries());
        for idx in sorted_buckets {
            let bucket = self.buckets[idx].lock();
            entries.extend(bucket.iter().map(|e| LogEntry::new(e.addr, e.value)));
        }
        drop(touched);

        ring.write_framed_record(&entries, commit_timestamp_absolute)
    }

    /// Drop every absorbed entry and reset the group counters, readying the
    /// table for the next group.
    pub fn clean(&self) {
        let mut touched = self.touched.lock();
        for idx in touched.drain() {
            self.buckets[idx].lock().clear();
        }
        self.entry_count.store(0, Ordering::Relaxed);
        self.absorbed_tx.store(0, Ordering::Relaxed);
        self.max_timestamp.store(0, Ordering::Relaxed);
    }
}

impl Default for CombiningTable {
    fn default() -> Self {
        Self::new()
    }
}
