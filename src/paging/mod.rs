//! Shadow Page Table.
//!
//! Maps virtual page numbers to physical frames without taking a lock on
//! the hot path: acquiring an already-resident page is a single CAS against
//! its packed valid-bit/used-bitmap word, and releasing one is the same CAS
//! in reverse plus a CAS-max on its `touch_id`. Installing a *new* mapping
//! (picking a frame off the clock and linking it to a VPN that was not
//! previously resident) takes a short per-VPN lock — only the fast path
//! and the eviction scan are lock-free.

pub mod free_list;

use crate::error::{NvError, Result};
use free_list::{is_valid, pack, used_bitmap, FreeList};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Up to 63 threads may hold a page pinned at once — one bit each in the
/// packed info word, alongside its top validity bit.
pub const MAX_THREADS: usize = 63;

const UNMAPPED: u64 = u64::MAX;

/// A VPN's page-table entry: a pointer to its current frame (if
/// any) plus `touch_id`, the highest commit timestamp of a transaction that
/// released this VPN. `touch_id` lives here rather than on the frame
/// descriptor so the barrier still applies to a VPN whose frame has already
/// been recycled for someone else.
struct VpnSlot {
    install_lock: Mutex<()>,
    ppn: AtomicU64,
    touch_id: AtomicU64,
}

impl VpnSlot {
    fn new() -> Self {
        Self {
            install_lock: Mutex::new(()),
            ppn: AtomicU64::new(UNMAPPED),
            touch_id: AtomicU64::new(0),
        }
    }
}

/// VPN -> PPN mapping over a fixed pool of physical frames.
pub struct ShadowPageTable {
    vpn_slots: Vec<VpnSlot>,
    frames: FreeList,
}

impl ShadowPageTable {
    pub fn new(vpn_num: usize, ppn_num: usize) -> Self {
        let vpn_slots = (0..vpn_num).map(|_| VpnSlot::new()).collect();
        Self {
            vpn_slots,
            frames: FreeList::new(ppn_num),
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Pin `vpn` for `thread_slot`, mapping it to a frame first if it is not
    /// already resident. `reproduce_timestamp` is the caller's current
    /// redo-log consumer cursor, used as the barrier against mapping `vpn`
    /// itself before its own last release has reached its NVM home — it is
    /// never applied to whichever frame the clock evicts to make room, since
    /// an evicted occupant's data still lives in the ring.
    ///
    /// Returns `Err(NvError::NeedsReproduce)` either because `vpn`'s own
    /// `touch_id` is still ahead of `reproduce_timestamp`, or because every
    /// frame is currently pinned by some other thread; the caller is
    /// expected to drive the redo log's reproduce step and retry.
    pub fn use_page(&self, vpn: u64, thread_slot: usize, reproduce_timestamp: u64) -> Result<u64> {
        debug_assert!(thread_slot < MAX_THREADS, "thread slot {thread_slot} out of range");

        if let Some(ppn) = self.try_fast_path(vpn, thread_slot) {
            return Ok(ppn);
        }
        self.map_slow(vpn, thread_slot, reproduce_timestamp)
    }

    /// Release `vpn`'s pin for `thread_slot`. `touch_id_candidate` is
    /// typically the releasing write's commit timestamp; it only ever
    /// advances the VPN's recorded `touch_id`, never moves it backward.
    pub fn release_page(&self, vpn: u64, thread_slot: usize, touch_id_candidate: u64) {
        let slot = &self.vpn_slots[vpn as usize];
        let ppn = slot.ppn.load(Ordering::Acquire);
        if ppn != UNMAPPED {
            let page = self.frames.page(ppn);
            loop {
                let info = page.info.load(Ordering::Acquire);
                let cleared = info & !(1u64 << thread_slot);
                if page
                    .info
                    .compare_exchange(info, cleared, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break;
                }
            }
        }

        loop {
            let current = slot.touch_id.load(Ordering::Acquire);
            if touch_id_candidate <= current {
                break;
            }
            if slot
                .touch_id
                .compare_exchange(current, touch_id_candidate, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
    }

    fn try_fast_path(&self, vpn: u64, thread_slot: usize) -> Option<u64> {
        let ppn = self.vpn_slots[vpn as usize].ppn.load(Ordering::Acquire);
        if ppn == UNMAPPED {
            return None;
        }
        let page = self.frames.page(ppn);
        loop {
            let info = page.info.load(Ordering::Acquire);
            if !is_valid(info) {
                return None; // evicted concurrently; fall back to the slow path
            }
            let claimed = pack(true, used_bitmap(info) | (1 << thread_slot));
            if page
                .info
                .compare_exchange(info, claimed, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(ppn);
            }
        }
    }

    fn map_slow(&self, vpn: u64, thread_slot: usize, reproduce_timestamp: u64) -> Result<u64> {
        let slot = &self.vpn_slots[vpn as usize];
        let _guard = slot.install_lock.lock();

        // Step 1: re-check under the lock — another thread may
        // have mapped this VPN while we waited.
        let existing = slot.ppn.load(Ordering::Acquire);
        if existing != UNMAPPED {
            let page = self.frames.page(existing);
            loop {
                let info = page.info.load(Ordering::Acquire);
                if !is_valid(info) {
                    break; // lost the race with an eviction; claim a fresh frame below
                }
                let claimed = pack(true, used_bitmap(info) | (1 << thread_slot));
                if page
                    .info
                    .compare_exchange(info, claimed, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Ok(existing);
                }
            }
        }

        // Step 2: this VPN's own last release may not have reached NVM yet.
        // Mapping it fresh now (copying stale NVM into the new shadow frame)
        // would lose that write, so refuse until reproduce has caught up.
        if slot.touch_id.load(Ordering::Acquire) > reproduce_timestamp {
            return Err(NvError::NeedsReproduce);
        }

        let frame_count = self.frames.len();
        let mut scanned = 0usize;
        loop {
            let candidate = self.frames.hand();
            let page = self.frames.page(candidate);
            let info = page.info.load(Ordering::Acquire);

            // A valid-but-unpinned frame is always evictable, regardless of
            // its occupant's touch_id: the occupant's data still lives in the
            // ring, and re-mapping that VPN later is gated by step 2 above,
            // not by anything checked here.
            if is_valid(info) && used_bitmap(info) != 0 {
                self.frames.rotate_past(candidate);
                scanned += 1;
                if scanned >= frame_count {
                    return Err(NvError::NeedsReproduce);
                }
                continue;
            }

            let Some(ppn) = self.frames.try_claim(candidate) else {
                continue; // lost the CAS race for this frame; re-read the hand
            };

            let old_vpn = page.vpn.swap(vpn, Ordering::AcqRel);
            if old_vpn != UNMAPPED && old_vpn != vpn {
                let _ = self.vpn_slots[old_vpn as usize].ppn.compare_exchange(
                    ppn,
                    UNMAPPED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
            page.info.store(pack(true, 1 << thread_slot), Ordering::Release);
            slot.ppn.store(ppn, Ordering::Release);
            return Ok(ppn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_use_maps_and_pins_a_frame() {
        let table = ShadowPageTable::new(16, 4);
        let ppn = table.use_page(0, 0, 0).unwrap();
        assert!(ppn < 4);

        let ppn_again = table.use_page(0, 1, 0).unwrap();
        assert_eq!(ppn, ppn_again, "a second thread pinning the same vpn reuses its frame");
    }

    #[test]
    fn unpinned_valid_frame_is_evicted_regardless_of_its_own_touch_id() {
        let table = ShadowPageTable::new(16, 1); // exactly one frame forces reuse
        let ppn0 = table.use_page(0, 0, 0).unwrap();
        table.release_page(0, 0, 5); // touch_id(vpn 0) becomes 5

        // vpn 0's frame is valid and unpinned: evicting it for vpn 1 must
        // succeed immediately, even though reproduce_timestamp (0) has not
        // reached 5 — the touch_id barrier only ever gates re-mapping vpn 0
        // itself, never the victim side of an eviction.
        let ppn1 = table.use_page(1, 0, 0).unwrap();
        assert_eq!(ppn1, ppn0);
    }

    #[test]
    fn remapping_a_vpn_with_unreproduced_touch_id_is_refused() {
        let table = ShadowPageTable::new(16, 1); // single frame forces reuse
        let ppn0 = table.use_page(0, 0, 0).unwrap();
        table.release_page(0, 0, 10); // touch_id(vpn 0) = 10, frame still valid & unpinned

        // Evict vpn 0's frame for vpn 1 right away; reproduce_timestamp = 0
        // is irrelevant to the eviction itself.
        let ppn1 = table.use_page(1, 0, 0).unwrap();
        assert_eq!(ppn1, ppn0);
        table.release_page(1, 0, 11); // free the only frame again, touch_id(vpn 1) = 11

        // vpn 0 no longer holds a resident frame, but its own touch_id (10)
        // is still ahead of reproduce_timestamp — re-mapping it must fail
        // even though a frame is available and unpinned.
        let err = table.use_page(0, 1, 9).unwrap_err();
        assert!(matches!(err, NvError::NeedsReproduce));

        // Once reproduce_timestamp reaches vpn 0's own touch_id, the re-map
        // succeeds — the current occupant's (vpn 1, touch_id 11) touch_id
        // plays no part in gating it.
        let ppn_again = table.use_page(0, 1, 10).unwrap();
        assert_eq!(ppn_again, ppn0);
    }

    #[test]
    fn still_pinned_frame_is_never_evicted() {
        let table = ShadowPageTable::new(16, 1);
        table.use_page(0, 0, 0).unwrap(); // never released, still pinned

        let err = table.use_page(1, 0, u64::MAX).unwrap_err();
        assert!(matches!(err, NvError::NeedsReproduce));
    }

    #[test]
    fn scan_rotates_past_a_pinned_frame_to_an_evictable_one() {
        let table = ShadowPageTable::new(16, 2);
        let ppn0 = table.use_page(0, 0, 0).unwrap(); // pinned, never released
        let ppn1 = table.use_page(1, 0, 0).unwrap();
        table.release_page(1, 0, 1); // vpn 1's frame is valid but unpinned

        // Whichever frame the clock hand lands on first, the scan must keep
        // going past the still-pinned one and claim the evictable one
        // instead of bailing out with NeedsReproduce.
        let ppn2 = table.use_page(2, 0, 0).unwrap();
        assert_eq!(ppn2, ppn1);
        assert_ne!(ppn2, ppn0);
    }
}
