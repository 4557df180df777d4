//! NVM Pool Adapter.
//!
//! Opens or creates a single memory-mapped pool file, exposes the root
//! record, a bump allocator for typed blocks, cache-line flush/drain
//! primitives, and an atomic multi-word `publish`. No internal lock here —
//! the pool itself needs none; callers serialize access through the commit
//! critical section.

pub(crate) mod layout;

use crate::error::{NvError, Result};
use layout::*;
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// A single word store to be applied durably and atomically alongside
/// others in the same [`Pool::publish`] call.
#[derive(Debug, Clone, Copy)]
pub struct PublishAction {
    pub offset: u64,
    pub value: u64,
}

impl PublishAction {
    pub fn new(offset: u64, value: u64) -> Self {
        Self { offset, value }
    }
}

/// A memory-mapped NVM pool.
///
/// All reads/writes against pool memory go through byte offsets ("NVM
/// offsets"), never raw pointers — offsets are what gets persisted, and are
/// translated to host addresses by adding the mapping's base at use time.
pub struct Pool {
    mmap: MmapMut,
    path: PathBuf,
    size: u64,
}

// SAFETY: MmapMut itself is Send + Sync; Pool adds no additional interior
// mutability beyond what is accessed through atomic and raw-pointer helpers
// below, all of which are sound for concurrent shared access to mapped
// memory (the same pattern used for any shared-memory IPC ring buffer).
unsafe impl Sync for Pool {}

impl Pool {
    /// Open an existing pool file or create a fresh one.
    ///
    /// Returns the pool and `true` if this is a first-time creation (so the
    /// caller knows whether to allocate the ring versus recover from an
    /// existing one), matching the `persist_block == 0` branch in the
    /// original `pmem_init`.
    pub fn open_or_create<P: AsRef<Path>>(path: P, size: u64) -> Result<(Self, bool)> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let existed = path.exists();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| NvError::PoolOpenFailed(format!("{}: {}", path.display(), e)))?;

        let current_len = file.metadata()?.len();
        if current_len < size {
            file.set_len(size)?;
        }

        let mmap = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| NvError::PoolOpenFailed(format!("mmap failed: {}", e)))?;

        let mut pool = Self { mmap, path, size };

        if !existed {
            pool.format(size)?;
            pool.recover_publish()?;
            Ok((pool, true))
        } else {
            if let Err(err) = pool.validate_superblock(size) {
                tracing::error!(path = %pool.path.display(), %err, "refusing to open pool with bad superblock");
                return Err(err);
            }
            tracing::info!(path = %pool.path.display(), size, "reopened existing NVM pool");
            pool.recover_publish()?;
            Ok((pool, false))
        }
    }

    fn format(&mut self, size: u64) -> Result<()> {
        self.write_raw_u64(SUPERBLOCK_MAGIC_OFFSET, SUPERBLOCK_MAGIC);
        self.write_raw_bytes(SUPERBLOCK_LAYOUT_OFFSET, LAYOUT_NAME.as_bytes());
        self.write_raw_u64(SUPERBLOCK_SIZE_OFFSET, size);
        self.write_raw_u64(SUPERBLOCK_CHECKSUM_OFFSET, Self::superblock_checksum(size));
        self.flush(0, HEADER_SIZE as u64);
        self.drain();
        tracing::info!(path = %self.path.display(), size, "formatted fresh NVM pool");
        Ok(())
    }

    /// CRC32 over the superblock's identifying fields, so a truncated or
    /// foreign file is rejected at open time instead of silently misreading
    /// ring/root offsets.
    fn superblock_checksum(size: u64) -> u64 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&SUPERBLOCK_MAGIC.to_le_bytes());
        hasher.update(LAYOUT_NAME.as_bytes());
        hasher.update(&size.to_le_bytes());
        hasher.finalize() as u64
    }

    fn validate_superblock(&self, expected_size: u64) -> Result<()> {
        let magic = self.read_raw_u64(SUPERBLOCK_MAGIC_OFFSET);
        if magic != SUPERBLOCK_MAGIC {
            return Err(NvError::PoolOpenFailed(format!(
                "bad superblock magic in {}",
                self.path.display()
            )));
        }
        let stored_size = self.read_raw_u64(SUPERBLOCK_SIZE_OFFSET);
        if stored_size != expected_size {
            return Err(NvError::PoolOpenFailed(format!(
                "pool size mismatch: file was created with {} bytes, opened with {}",
                stored_size, expected_size
            )));
        }
        let stored_checksum = self.read_raw_u64(SUPERBLOCK_CHECKSUM_OFFSET);
        if stored_checksum != Self::superblock_checksum(stored_size) {
            return Err(NvError::PoolOpenFailed(format!(
                "superblock checksum mismatch in {}: pool header is corrupt",
                self.path.display()
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Raw byte/word access
    // ------------------------------------------------------------------

    #[inline]
    fn base_ptr(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
    }

    /// Borrow an 8-byte-aligned word in the mapping as an atomic cell.
    ///
    /// # Panics
    /// Panics if `offset + 8 > pool size` or `offset` is not 8-byte aligned.
    #[inline]
    fn atomic_at(&self, offset: u64) -> &AtomicU64 {
        assert!(offset % 8 == 0, "unaligned atomic access at {}", offset);
        assert!(offset + 8 <= self.size, "atomic access out of bounds at {}", offset);
        // SAFETY: offset is bounds-checked and 8-byte aligned above; AtomicU64
        // has the same size/alignment as u64 and the mapping outlives `self`.
        unsafe { &*(self.base_ptr().add(offset as usize) as *const AtomicU64) }
    }

    fn read_raw_u64(&self, offset: u64) -> u64 {
        self.atomic_at(offset).load(Ordering::Acquire)
    }

    fn write_raw_u64(&mut self, offset: u64, value: u64) {
        self.atomic_at(offset).store(value, Ordering::Release);
    }

    fn write_raw_bytes(&mut self, offset: u64, bytes: &[u8]) {
        assert!(offset as usize + bytes.len() <= self.size as usize);
        let dst = unsafe {
            std::slice::from_raw_parts_mut(self.base_ptr().add(offset as usize), bytes.len())
        };
        dst.copy_from_slice(bytes);
    }

    /// Read a word at an arbitrary NVM offset (used for home-address writes
    /// during reproduce and ring-entry access; not required to be 8-byte
    /// aligned to an atomic cell boundary beyond natural u64 alignment).
    pub fn read_u64(&self, offset: u64) -> u64 {
        self.read_raw_u64(offset)
    }

    pub fn write_u64(&self, offset: u64, value: u64) {
        self.atomic_at(offset).store(value, Ordering::Release);
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    // ------------------------------------------------------------------
    // Root record
    // ------------------------------------------------------------------

    pub fn object_root(&self, slot: usize) -> Result<u64> {
        self.check_slot(slot)?;
        Ok(self.read_raw_u64(OBJ_ROOT_OFFSET + (slot as u64) * 8))
    }

    pub fn set_object_root(&self, slot: usize, value: u64) -> Result<()> {
        self.check_slot(slot)?;
        self.atomic_at(OBJ_ROOT_OFFSET + (slot as u64) * 8).store(value, Ordering::Release);
        Ok(())
    }

    fn check_slot(&self, slot: usize) -> Result<()> {
        if slot >= ROOT_NUM_SLOTS {
            return Err(NvError::InvalidArgument(format!(
                "object root slot {} out of range (max {})",
                slot, ROOT_NUM_SLOTS
            )));
        }
        Ok(())
    }

    pub fn root_count(&self) -> u64 {
        self.read_raw_u64(ROOT_NUM_OFFSET)
    }

    pub fn set_root_count(&self, count: u64) {
        self.atomic_at(ROOT_NUM_OFFSET).store(count, Ordering::Release);
    }

    pub fn persist_block(&self) -> u64 {
        self.read_raw_u64(PERSIST_BLOCK_OFFSET)
    }

    pub fn reproduce_block(&self) -> u64 {
        self.read_raw_u64(REPRODUCE_BLOCK_OFFSET)
    }

    pub fn persist_offset(&self) -> u64 {
        self.read_raw_u64(PERSIST_OFFSET_OFFSET)
    }

    pub fn reproduce_offset(&self) -> u64 {
        self.read_raw_u64(REPRODUCE_OFFSET_OFFSET)
    }

    pub fn persist_timestamp(&self) -> u64 {
        self.read_raw_u64(PERSIST_TIMESTAMP_OFFSET)
    }

    pub fn reproduce_timestamp(&self) -> u64 {
        self.read_raw_u64(REPRODUCE_TIMESTAMP_OFFSET)
    }

    /// Direct, non-durable write of the ring allocation's initial cursors.
    /// Only used once, at first format, before any transaction is visible.
    pub(crate) fn init_ring_cursors(&self, first_block: u64) {
        self.atomic_at(PERSIST_BLOCK_OFFSET).store(first_block, Ordering::Release);
        self.atomic_at(REPRODUCE_BLOCK_OFFSET).store(first_block, Ordering::Release);
        self.atomic_at(PERSIST_OFFSET_OFFSET).store(0, Ordering::Release);
        self.atomic_at(REPRODUCE_OFFSET_OFFSET).store(0, Ordering::Release);
        self.atomic_at(PERSIST_TIMESTAMP_OFFSET).store(0, Ordering::Release);
        self.atomic_at(REPRODUCE_TIMESTAMP_OFFSET).store(0, Ordering::Release);
        self.flush(HEADER_OFFSET_PERSIST_BLOCK_REGION, 48);
        self.drain();
    }

    // ------------------------------------------------------------------
    // Bump allocator for typed blocks
    // ------------------------------------------------------------------

    /// Allocate `size` bytes from the pool's arena, past the ring, tagged
    /// with `type_tag` (the tag is not otherwise interpreted by this crate;
    /// it exists so a caller storing heterogeneous object roots can record
    /// what a given offset holds). Returns the NVM offset of the new block.
    pub fn alloc_typed(&self, size: u64, _type_tag: u32) -> Result<u64> {
        if size == 0 {
            return Err(NvError::InvalidArgument("alloc_typed: size must be > 0".into()));
        }
        let aligned = (size + 7) & !7;
        loop {
            let cursor = self.read_raw_u64(ALLOC_CURSOR_OFFSET);
            let base = if cursor == 0 { ALLOC_AREA_OFFSET } else { cursor };
            let next = base + aligned;
            if next > self.size {
                return Err(NvError::OutOfHeap(format!(
                    "pool arena exhausted: requested {} bytes, {} remaining",
                    aligned,
                    self.size.saturating_sub(base)
                )));
            }
            if self
                .atomic_at(ALLOC_CURSOR_OFFSET)
                .compare_exchange(cursor, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.flush(ALLOC_CURSOR_OFFSET, 8);
                return Ok(base);
            }
        }
    }

    // ------------------------------------------------------------------
    // Flush / drain
    // ------------------------------------------------------------------

    /// Cache-line writeback for `[offset, offset+len)`. Not ordered by
    /// itself; pair with [`Pool::drain`] before anything depends on
    /// durability.
    pub fn flush(&self, offset: u64, len: u64) {
        if len == 0 {
            return;
        }
        let _ = self.mmap.flush_async_range(offset as usize, len as usize);
    }

    /// Store-fence: guarantees prior [`Pool::flush`] calls have reached the
    /// persistence domain before this returns.
    pub fn drain(&self) {
        let _ = self.mmap.flush();
    }

    // ------------------------------------------------------------------
    // Atomic publish
    // ------------------------------------------------------------------

    /// Durably and atomically apply a batch of word-sized stores: either
    /// all of `actions` survive a crash, or none do.
    ///
    /// Implemented as a small fixed-capacity redo log in the pool header:
    /// the actions are staged and flushed, a single aligned word store
    /// marks the batch committed, the actions are then applied to their
    /// real offsets, and the commit word is cleared. A crash before the
    /// commit word is set loses the whole batch (as if `publish` was never
    /// called); a crash after replays the staged actions on reopen via
    /// [`Pool::recover_publish`], which is idempotent. This crate's
    /// `publish` always drains before returning, so callers never need an
    /// extra explicit drain before a cursor publish.
    pub fn publish(&self, actions: &[PublishAction]) -> Result<()> {
        if actions.len() > PUBLISH_MAX_ACTIONS {
            return Err(NvError::InvalidArgument(format!(
                "publish: {} actions exceeds max {}",
                actions.len(),
                PUBLISH_MAX_ACTIONS
            )));
        }

        for (i, action) in actions.iter().enumerate() {
            let slot = PUBLISH_LOG_OFFSET + (i as u64) * 16;
            self.atomic_at(slot).store(action.offset, Ordering::Release);
            self.atomic_at(slot + 8).store(action.value, Ordering::Release);
        }
        self.flush(PUBLISH_LOG_OFFSET, (actions.len() as u64) * 16);
        self.drain();

        self.atomic_at(PUBLISH_COUNT_OFFSET).store(actions.len() as u64, Ordering::Release);
        self.flush(PUBLISH_COUNT_OFFSET, 8);
        self.drain();

        self.apply_publish_log(actions.len());

        self.atomic_at(PUBLISH_COUNT_OFFSET).store(0, Ordering::Release);
        self.flush(PUBLISH_COUNT_OFFSET, 8);
        self.drain();

        Ok(())
    }

    fn apply_publish_log(&self, count: usize) {
        for i in 0..count {
            let slot = PUBLISH_LOG_OFFSET + (i as u64) * 16;
            let offset = self.read_raw_u64(slot);
            let value = self.read_raw_u64(slot + 8);
            self.write_u64(offset, value);
            self.flush(offset, 8);
        }
        self.drain();
    }

    /// Replay an interrupted publish found at open time. Idempotent: if the
    /// actions were already applied before the crash, re-applying them is a
    /// no-op on the home values.
    fn recover_publish(&mut self) -> Result<()> {
        let count = self.read_raw_u64(PUBLISH_COUNT_OFFSET) as usize;
        if count == 0 {
            return Ok(());
        }
        if count > PUBLISH_MAX_ACTIONS {
            return Err(NvError::LogCorrupt(format!(
                "publish log count {} exceeds capacity {}",
                count, PUBLISH_MAX_ACTIONS
            )));
        }
        tracing::warn!(count, "replaying interrupted publish batch found at open");
        self.apply_publish_log(count);
        self.atomic_at(PUBLISH_COUNT_OFFSET).store(0, Ordering::Release);
        self.flush(PUBLISH_COUNT_OFFSET, 8);
        self.drain();
        Ok(())
    }
}
