//! Volatile Per-Transaction Log.
//!
//! Each in-flight transaction accumulates its writes in one of these before
//! they are absorbed into the [combining table](crate::log::combining).
//! Entries are chained in fixed-capacity blocks rather than a single
//! growable buffer so that a transaction with a long write set never needs
//! to reallocate and copy everything it has logged so far.

use crate::config::V_LOG_LENGTH;

const BLOCK_CAPACITY: usize = V_LOG_LENGTH;

#[derive(Clone, Copy)]
struct VLogEntry {
    addr: u64,
    value: u64,
}

struct VLogBlock {
    entries: [VLogEntry; BLOCK_CAPACITY],
    len: usize,
}

impl VLogBlock {
    fn empty() -> Self {
        Self {
            entries: [VLogEntry { addr: 0, value: 0 }; BLOCK_CAPACITY],
            len: 0,
        }
    }
}

/// A transaction's volatile write log.
///
/// Reusable across transactions via [`VLog::reset`]: previously allocated
/// blocks are kept and zeroed in place rather than freed, so a thread that
/// commits many short transactions amortizes its allocation to roughly one
/// block's worth of blocks total.
pub struct VLog {
    blocks: Vec<VLogBlock>,
    active_block: usize,
    total_entries: usize,
}

impl VLog {
    pub fn new() -> Self {
        let mut log = Self {
            blocks: Vec::new(),
            active_block: 0,
            total_entries: 0,
        };
        log.init();
        log
    }

    /// Start (or restart) logging for a fresh transaction.
    pub fn init(&mut self) {
        if self.blocks.is_empty() {
            self.blocks.push(VLogBlock::empty());
        }
        for block in &mut self.blocks {
            block.len = 0;
        }
        self.active_block = 0;
        self.total_entries = 0;
    }

    /// Equivalent to [`VLog::init`]; named separately so callers that are
    /// explicitly recycling a log after commit/abort read naturally.
    pub fn reset(&mut self) {
        self.init();
    }

    pub fn len(&self) -> usize {
        self.total_entries
    }

    pub fn is_empty(&self) -> bool {
        self.total_entries == 0
    }

    /// Append `(addr, value)`, expanding the block chain if the current
    /// block is full.
    pub fn append(&mut self, addr: u64, value: u64) {
        {
            let block = &mut self.blocks[self.active_block];
            if block.len < BLOCK_CAPACITY {
                block.entries[block.len] = VLogEntry { addr, value };
                block.len += 1;
                self.total_entries += 1;
                return;
            }
        }

        self.active_block += 1;
        if self.active_block == self.blocks.len() {
            self.blocks.push(VLogBlock::empty());
        }
        let block = &mut self.blocks[self.active_block];
        block.entries[0] = VLogEntry { addr, value };
        block.len = 1;
        self.total_entries += 1;
    }

    /// Patch the entry at `index` in place, where
    /// `index` counts entries in append order across the whole block chain.
    /// Used by a read/write barrier that maintains its own addr->index map
    /// and has already recorded a prior write to `addr` at this index; the
    /// caller guarantees `0 <= index < len()` (if
    /// the barrier does not track indices, it should just call `append` and
    /// let the combining table collapse duplicates instead).
    pub fn overwrite(&mut self, index: usize, addr: u64, value: u64) {
        debug_assert!(index < self.total_entries, "overwrite index {index} out of bounds");
        let block_idx = index / BLOCK_CAPACITY;
        let slot = index % BLOCK_CAPACITY;
        let block = &mut self.blocks[block_idx];
        debug_assert!(slot < block.len);
        block.entries[slot] = VLogEntry { addr, value };
    }

    /// Iterate all logged `(addr, value)` pairs in write order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.blocks[..=self.active_block]
            .iter()
            .flat_map(|b| b.entries[..b.len].iter().map(|e| (e.addr, e.value)))
    }
}

impl Default for VLog {
    fn default() -> Self {
        Self::new()
    }
}
