//! Circular NVM Redo Log.
//!
//! A ring of fixed-capacity blocks linked by next-pointers, with a producer
//! (write) cursor and a consumer (reproduce) cursor. Framed records are
//! delimited by BEGIN/END sentinels and may span multiple blocks.

use crate::config::{NV_LOG_BLOCK_NUM, NV_LOG_LENGTH};
use crate::error::{NvError, Result};
use crate::pool::layout::{
    PERSIST_BLOCK_OFFSET, PERSIST_OFFSET_OFFSET, PERSIST_TIMESTAMP_OFFSET, REPRODUCE_BLOCK_OFFSET,
    REPRODUCE_OFFSET_OFFSET, REPRODUCE_TIMESTAMP_OFFSET, RING_OFFSET, RING_SIZE,
};
use crate::pool::{Pool, PublishAction};
use parking_lot::Mutex;
use std::sync::Arc;

/// Sentinel marking the start of a framed record. Never a legal home
/// address: home addresses are bounded by pool size.
pub const BEGIN_SIG: u64 = 0xFFFF_FFFF_FFFF_FFFF;
/// Sentinel marking the end of a framed record.
pub const END_SIG: u64 = 0xFFFF_FFFF_FFFF_FFFE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Begin,
    Data,
    End,
}

#[derive(Debug, Clone, Copy)]
pub struct LogEntry {
    pub addr: u64,
    pub data: u64,
}

impl LogEntry {
    pub fn new(addr: u64, data: u64) -> Self {
        Self { addr, data }
    }
}

struct Cursors {
    write_block: u64,
    write_offset: u64,
    read_block: u64,
    read_offset: u64,
    timestamp_base: u64,
    record_start_block: u64,
    record_start_offset: u64,
}

enum FlushPlan {
    None,
    BlockTail { start: u64, len: u64 },
    RecordEnd { start: u64, len: u64 },
}

/// The circular on-NVM redo log.
///
/// Owns the volatile (DRAM-resident) write/read cursors; the durably
/// published copies of those cursors live in the pool root and are only
/// updated through [`Pool::publish`].
pub struct NvRing {
    pool: Arc<Pool>,
    cursors: Mutex<Cursors>,
}

impl NvRing {
    /// Attach to a pool's ring. On first creation the ring is allocated and
    /// linked once; on reopen the volatile cursors are restored from the
    /// durable root so the caller can drive recovery.
    pub fn attach(pool: Arc<Pool>, first_open: bool) -> Result<Self> {
        if first_open {
            Self::format_ring(&pool)?;
        }

        let cursors = Cursors {
            write_block: pool.persist_block(),
            write_offset: pool.persist_offset(),
            read_block: pool.reproduce_block(),
            read_offset: pool.reproduce_offset(),
            timestamp_base: pool.persist_timestamp(),
            record_start_block: pool.persist_block(),
            record_start_offset: pool.persist_offset(),
        };

        Ok(Self {
            pool,
            cursors: Mutex::new(cursors),
        })
    }

    fn format_ring(pool: &Pool) -> Result<()> {
        for i in 0..NV_LOG_BLOCK_NUM as u64 {
            let this_block = RING_OFFSET + i * block_size();
            let next_block = RING_OFFSET + ((i + 1) % NV_LOG_BLOCK_NUM as u64) * block_size();
            pool.write_u64(this_block, next_block);
            pool.write_u64(this_block + 8, 0);
        }
        pool.flush(RING_OFFSET, RING_SIZE);
        pool.drain();
        pool.init_ring_cursors(RING_OFFSET);
        Ok(())
    }

    #[inline]
    fn block_next(&self, block: u64) -> u64 {
        self.pool.read_u64(block)
    }

    #[inline]
    fn entry_offset(block: u64, slot: u64) -> u64 {
        block + 16 + slot * 16
    }

    pub fn timestamp_base(&self) -> u64 {
        self.cursors.lock().timestamp_base
    }

    pub fn persist_timestamp(&self) -> u64 {
        self.pool.persist_timestamp()
    }

    pub fn reproduce_timestamp(&self) -> u64 {
        self.pool.reproduce_timestamp()
    }

    /// Append one entry, advancing the write cursor.
    ///
    /// Returns `Err(NvError::RingFull)` when advancing would collide with
    /// the read cursor; in that case the entire in-flight record (back to
    /// the position saved at its `Begin` entry) is rewound, leaving no
    /// partial record visible ahead of the producer cursor.
    pub fn append_entry(&self, entry: LogEntry, state: EntryState) -> Result<()> {
        let plan;
        {
            let mut cur = self.cursors.lock();

            if state == EntryState::Begin {
                cur.record_start_block = cur.write_block;
                cur.record_start_offset = cur.write_offset;
            }

            let block = cur.write_block;
            let slot = cur.write_offset;
            let offset = Self::entry_offset(block, slot);
            self.pool.write_u64(offset, entry.addr);
            self.pool.write_u64(offset + 8, entry.data);

            cur.write_offset += 1;

            if cur.write_offset == NV_LOG_LENGTH as u64 {
                let next = self.block_next(block);
                if next == cur.read_block {
                    cur.write_block = cur.record_start_block;
                    cur.write_offset = cur.record_start_offset;
                    return Err(NvError::RingFull);
                }
                let flush_start = Self::entry_offset(block, 0);
                let flush_len = NV_LOG_LENGTH as u64 * 16;
                cur.write_block = next;
                cur.write_offset = 0;
                plan = FlushPlan::BlockTail { start: flush_start, len: flush_len };
            } else if state == EntryState::End {
                let record_start_in_block = if cur.record_start_block == block {
                    cur.record_start_offset
                } else {
                    0
                };
                let flush_start = Self::entry_offset(block, record_start_in_block);
                let flush_len = (cur.write_offset - record_start_in_block) * 16;
                plan = FlushPlan::RecordEnd { start: flush_start, len: flush_len };
            } else {
                plan = FlushPlan::None;
            }
        }

        match plan {
            FlushPlan::None => {}
            FlushPlan::BlockTail { start, len } => self.pool.flush(start, len),
            FlushPlan::RecordEnd { start, len } => {
                self.pool.flush(start, len);
                self.pool.drain();
            }
        }

        Ok(())
    }

    /// Consume one entry at the read cursor, advancing it.
    pub fn consume_entry(&self) -> LogEntry {
        let mut cur = self.cursors.lock();
        let block = cur.read_block;
        let slot = cur.read_offset;
        let offset = Self::entry_offset(block, slot);
        let addr = self.pool.read_u64(offset);
        let data = self.pool.read_u64(offset + 8);

        cur.read_offset += 1;
        if cur.read_offset == NV_LOG_LENGTH as u64 {
            cur.read_block = self.block_next(block);
            cur.read_offset = 0;
        }

        LogEntry { addr, data }
    }

    /// Write one BEGIN..DATA*..END framed record and durably publish the
    /// new producer cursor. `commit_timestamp_absolute` has already been
    /// rebased against [`NvRing::timestamp_base`] by the caller.
    pub fn write_framed_record(&self, entries: &[LogEntry], commit_timestamp_absolute: u64) -> Result<()> {
        let length = entries.len() as u64;

        self.append_entry(LogEntry::new(BEGIN_SIG, length), EntryState::Begin)?;
        for entry in entries {
            debug_assert!(
                entry.addr < self.pool.size(),
                "home address {:#x} collides with a ring sentinel",
                entry.addr
            );
            self.append_entry(*entry, EntryState::Data)?;
        }
        self.append_entry(LogEntry::new(END_SIG, commit_timestamp_absolute), EntryState::End)?;

        let (write_block, write_offset) = {
            let cur = self.cursors.lock();
            (cur.write_block, cur.write_offset)
        };

        self.pool.publish(&[
            PublishAction::new(PERSIST_BLOCK_OFFSET, write_block),
            PublishAction::new(PERSIST_OFFSET_OFFSET, write_offset),
            PublishAction::new(PERSIST_TIMESTAMP_OFFSET, commit_timestamp_absolute),
        ])
    }

    /// Consume one framed record from the ring and apply its effects to
    /// their NVM home addresses. Returns the record's commit timestamp, or
    /// `None` if the producer and consumer cursors already coincide.
    pub fn reproduce_one(&self) -> Result<Option<u64>> {
        if self.pool.persist_timestamp() == self.pool.reproduce_timestamp() {
            return Ok(None);
        }

        let begin = self.consume_entry();
        if begin.addr != BEGIN_SIG {
            tracing::error!(found = %format!("{:#x}", begin.addr), "redo ring corrupt: missing BEGIN sentinel");
            return Err(NvError::LogCorrupt(format!(
                "expected BEGIN sentinel, found {:#x}",
                begin.addr
            )));
        }
        let length = begin.data;

        for _ in 0..length {
            let entry = self.consume_entry();
            self.pool.write_u64(entry.addr, entry.data);
            self.pool.flush(entry.addr, 8);
        }
        self.pool.drain();

        let end = self.consume_entry();
        if end.addr != END_SIG {
            tracing::error!(found = %format!("{:#x}", end.addr), "redo ring corrupt: missing END sentinel");
            return Err(NvError::LogCorrupt(format!(
                "expected END sentinel, found {:#x}",
                end.addr
            )));
        }
        let commit_timestamp = end.data;

        let (read_block, read_offset) = {
            let cur = self.cursors.lock();
            (cur.read_block, cur.read_offset)
        };

        self.pool.publish(&[
            PublishAction::new(REPRODUCE_BLOCK_OFFSET, read_block),
            PublishAction::new(REPRODUCE_OFFSET_OFFSET, read_offset),
            PublishAction::new(REPRODUCE_TIMESTAMP_OFFSET, commit_timestamp),
        ])?;

        Ok(Some(commit_timestamp))
    }
}

#[inline]
fn block_size() -> u64 {
    crate::pool::layout::BLOCK_SIZE
}
