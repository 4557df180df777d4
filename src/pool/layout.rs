//! Pool file byte layout.
//!
//! ```text
//! [0, 64)            superblock (magic, layout tag, pool size, crc32 checksum)
//! [64, 1136)         root record: 127 object roots, root_num,
//!                    persist_block/offset, reproduce_block/offset,
//!                    persist_timestamp, reproduce_timestamp
//! [1136, 1144)       arena bump-allocator cursor
//! [1144, 1272)       publish redo log: count word + 8 (offset,value) slots
//! [1272, 4096)       reserved padding, header rounds up to one page
//! [4096, 4096+1MiB)  NV redo ring: 1024 blocks x 1024 bytes
//! [ring end, size)   bump-allocated arena for application object roots
//! ```

use crate::config::{NV_LOG_LENGTH, NV_LOG_BLOCK_NUM};

pub const SUPERBLOCK_MAGIC: u64 = 0x4E56_434F_5245_3031; // "NVCORE01" folded into a u64
pub const LAYOUT_NAME: &str = "nvcore";

pub const SUPERBLOCK_MAGIC_OFFSET: u64 = 0;
pub const SUPERBLOCK_LAYOUT_OFFSET: u64 = 8;
pub const SUPERBLOCK_SIZE_OFFSET: u64 = 24;
pub const SUPERBLOCK_CHECKSUM_OFFSET: u64 = 32;

pub const ROOT_OFFSET: u64 = 64;
pub const ROOT_NUM_SLOTS: usize = 127;

pub const OBJ_ROOT_OFFSET: u64 = ROOT_OFFSET;
pub const ROOT_NUM_OFFSET: u64 = OBJ_ROOT_OFFSET + (ROOT_NUM_SLOTS as u64) * 8;
pub const PERSIST_BLOCK_OFFSET: u64 = ROOT_NUM_OFFSET + 8;
pub const REPRODUCE_BLOCK_OFFSET: u64 = PERSIST_BLOCK_OFFSET + 8;
pub const PERSIST_OFFSET_OFFSET: u64 = REPRODUCE_BLOCK_OFFSET + 8;
pub const REPRODUCE_OFFSET_OFFSET: u64 = PERSIST_OFFSET_OFFSET + 8;
pub const PERSIST_TIMESTAMP_OFFSET: u64 = REPRODUCE_OFFSET_OFFSET + 8;
pub const REPRODUCE_TIMESTAMP_OFFSET: u64 = PERSIST_TIMESTAMP_OFFSET + 8;
pub const ROOT_END_OFFSET: u64 = REPRODUCE_TIMESTAMP_OFFSET + 8;

/// First of the six ring-cursor fields, used when flushing them together.
pub const HEADER_OFFSET_PERSIST_BLOCK_REGION: u64 = PERSIST_BLOCK_OFFSET;

pub const ALLOC_CURSOR_OFFSET: u64 = ROOT_END_OFFSET;

pub const PUBLISH_COUNT_OFFSET: u64 = ALLOC_CURSOR_OFFSET + 8;
pub const PUBLISH_MAX_ACTIONS: usize = 8;
pub const PUBLISH_LOG_OFFSET: u64 = PUBLISH_COUNT_OFFSET + 8;
pub const PUBLISH_LOG_END_OFFSET: u64 = PUBLISH_LOG_OFFSET + (PUBLISH_MAX_ACTIONS as u64) * 16;

pub const HEADER_SIZE: u64 = 4096;

pub const BLOCK_SIZE: u64 = 16 + (NV_LOG_LENGTH as u64) * 16;
pub const RING_OFFSET: u64 = HEADER_SIZE;
pub const RING_SIZE: u64 = (NV_LOG_BLOCK_NUM as u64) * BLOCK_SIZE;
pub const ALLOC_AREA_OFFSET: u64 = RING_OFFSET + RING_SIZE;

const _: () = assert!(PUBLISH_LOG_END_OFFSET <= HEADER_SIZE);
const _: () = assert!(BLOCK_SIZE == 1024);
