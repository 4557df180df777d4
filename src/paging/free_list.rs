//! The physical-page ring backing [`super::ShadowPageTable`].
//!
//! `PPN_NUM` descriptors are linked once, at startup, into a fixed circular
//! list (spec: a clock, not a classic allocate/free list — every physical
//! page stays in the ring forever and is continuously recycled by whichever
//! VPN next needs a frame). The only thing that changes after startup is
//! the atomic `head`, which a CAS race advances as threads contend for the
//! next reusable page.

use std::sync::atomic::{AtomicU64, Ordering};

/// Packs the shadow page table's 1-bit validity flag in the top bit of the
/// same word as the 63-bit per-thread "in use" bitmap, so both
/// can be read and updated with a single CAS.
pub const VALID_BIT: u64 = 1 << 63;
pub const USED_MASK: u64 = VALID_BIT - 1;

#[inline]
pub fn is_valid(info: u64) -> bool {
    info & VALID_BIT != 0
}

#[inline]
pub fn used_bitmap(info: u64) -> u64 {
    info & USED_MASK
}

#[inline]
pub fn pack(valid: bool, used: u64) -> u64 {
    (if valid { VALID_BIT } else { 0 }) | (used & USED_MASK)
}

/// One physical page frame. `next` is fixed at ring construction; `vpn` and
/// `info` change as the page is claimed, used, and released.
///
/// `touch_id` is deliberately *not* stored here: the data model
/// ties it to a VPN's page-table entry, not to whichever physical frame
/// currently backs it, so that the barrier survives the frame being
/// recycled for an unrelated VPN (see the VPN slot in `super`).
pub struct PhysicalPage {
    pub next: u64,
    pub vpn: AtomicU64,
    pub info: AtomicU64,
}

impl PhysicalPage {
    fn new(next: u64) -> Self {
        Self {
            next,
            vpn: AtomicU64::new(u64::MAX),
            info: AtomicU64::new(0),
        }
    }
}

/// The fixed-size ring of physical pages and the clock hand into it.
pub struct FreeList {
    pages: Vec<PhysicalPage>,
    head: AtomicU64,
}

impl FreeList {
    pub fn new(ppn_num: usize) -> Self {
        let pages = (0..ppn_num)
            .map(|i| PhysicalPage::new(((i + 1) % ppn_num) as u64))
            .collect();
        Self {
            pages,
            head: AtomicU64::new(0),
        }
    }

    pub fn page(&self, ppn: u64) -> &PhysicalPage {
        &self.pages[ppn as usize]
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Advance the clock hand past `from` without claiming anything —
    /// called when the page under the hand cannot be evicted yet.
    pub fn rotate_past(&self, from: u64) {
        let next = self.page(from).next;
        let _ = self.head.compare_exchange(from, next, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Attempt to claim the page currently under the clock hand, advancing
    /// the hand to its successor. Returns `None` if another thread claimed
    /// it first (the caller should re-read the hand and retry).
    pub fn try_claim(&self, from: u64) -> Option<u64> {
        let next = self.page(from).next;
        if self
            .head
            .compare_exchange(from, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Some(from)
        } else {
            None
        }
    }

    pub fn hand(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }
}
