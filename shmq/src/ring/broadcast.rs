//! Multi-producer / multi-consumer broadcast ring.
//!
//! Every connected reader consumes every committed message. A slot is
//! writable again once its reader bitmap has drained; a producer that finds
//! a stalled reader in its way may evict it with [`force_push`](Ring::force_push).
//!
//! The protocol never blocks: producers and consumers either succeed, report
//! full/empty, or retry through the backoff ladder.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};

use crossbeam_utils::CachePadded;
use log::warn;

use super::{inc_mask, inc_rc, index_of, ConnHead, Ring, EP_INCR, EP_MASK, RC_MASK};
use crate::backoff::backoff;

/// One ring element: payload plus the two per-slot words the protocol
/// operates on.
#[repr(C)]
pub struct Slot<T> {
    data: UnsafeCell<MaybeUninit<T>>,
    /// Reader bitmap | write counter | epoch, co-updated in a single CAS.
    rc: AtomicU64,
    /// Commit flag: `!c` right after commit `c` is published, `c + N` once
    /// every reader released the slot, 0 before first use.
    f_ct: AtomicU64,
}

/// The broadcast ring living at offset 0 of a channel's segment.
///
/// `N` is the slot count, a power of two no larger than 2^16.
#[repr(C)]
pub struct Broadcast<T, const N: usize> {
    head: ConnHead,
    /// Commit index; the low `log2 N` bits select the slot.
    ct: CachePadded<AtomicU16>,
    /// Eviction epoch, bumped in its top byte by every force-push.
    epoch: CachePadded<AtomicU64>,
    slots: CachePadded<[Slot<T>; N]>,
}

// Payloads are plain `Copy` data and all cross-thread state is atomic.
unsafe impl<T: Copy + Send, const N: usize> Send for Broadcast<T, N> {}
unsafe impl<T: Copy + Send, const N: usize> Sync for Broadcast<T, N> {}

impl<T: Copy, const N: usize> Broadcast<T, N> {
    #[inline]
    fn slot(&self, c: u16) -> &Slot<T> {
        &self.slots[index_of::<N>(c)]
    }

    #[cfg(test)]
    pub(crate) fn slot_state(&self, c: u16) -> (u64, u64) {
        let el = self.slot(c);
        (el.rc.load(Ordering::Acquire), el.f_ct.load(Ordering::Acquire))
    }

    #[cfg(test)]
    pub(crate) fn epoch_word(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn connections(&self) -> u32 {
        self.head.connections(Ordering::Acquire)
    }
}

impl<T: Copy, const N: usize> Ring<T> for Broadcast<T, N> {
    fn init(&self) {
        const {
            assert!(N.is_power_of_two());
            assert!(N <= 1 << 16);
        }
        self.head.init();
    }

    fn cursor(&self) -> u16 {
        self.ct.load(Ordering::Acquire)
    }

    fn connect_receiver(&self) -> u32 {
        self.head.connect_receiver()
    }

    fn disconnect_receiver(&self, id: u32) -> u32 {
        self.head.disconnect_receiver(id)
    }

    fn is_connected(&self, id: u32) -> bool {
        self.head.connections(Ordering::Acquire) & id != 0
    }

    fn conn_count(&self) -> usize {
        self.head.count()
    }

    fn connect_sender(&self) -> bool {
        self.head.connect_sender()
    }

    fn disconnect_sender(&self) {
        self.head.disconnect_sender()
    }

    fn push(&self, prep: &mut dyn FnMut(*mut T)) -> bool {
        let mut epoch = self.epoch.load(Ordering::Acquire);
        let mut k = 0u32;
        let (cur_ct, el) = loop {
            let cc = self.head.connections(Ordering::Relaxed);
            if cc == 0 {
                return false; // no reader
            }
            let cur_ct = self.ct.load(Ordering::Relaxed);
            let el = self.slot(cur_ct);
            let cur_rc = el.rc.load(Ordering::Relaxed);
            let rem = (cur_rc & RC_MASK) as u32;
            if cc & rem != 0 && cur_rc & !EP_MASK == epoch {
                // a live reader still owes a read of the previous lap
                return false;
            } else if rem == 0 {
                let cur_fl = el.f_ct.load(Ordering::Acquire);
                if cur_fl != 0 && cur_fl != u64::from(cur_ct) {
                    return false; // last reader has not recycled the slot yet
                }
            }
            let next = inc_mask(epoch | (cur_rc & EP_MASK)) | u64::from(cc);
            if el
                .rc
                .compare_exchange_weak(cur_rc, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                // confirm no eviction slipped in under us
                match self
                    .epoch
                    .compare_exchange(epoch, epoch, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => break (cur_ct, el),
                    Err(now) => epoch = now,
                }
            }
            backoff(&mut k);
        };
        // single winner past this point: the rc and epoch exchanges above
        // admit exactly one producer per commit index
        self.ct.store(cur_ct.wrapping_add(1), Ordering::Release);
        prep(el.data.get().cast::<T>());
        el.f_ct.store(!u64::from(cur_ct), Ordering::Release);
        true
    }

    fn force_push(&self, prep: &mut dyn FnMut(*mut T)) -> bool {
        let mut epoch = self
            .epoch
            .fetch_add(EP_INCR, Ordering::Release)
            .wrapping_add(EP_INCR);
        let mut k = 0u32;
        let (cur_ct, el) = loop {
            let mut cc = self.head.connections(Ordering::Relaxed);
            if cc == 0 {
                return false; // no reader
            }
            let cur_ct = self.ct.load(Ordering::Relaxed);
            let el = self.slot(cur_ct);
            let cur_rc = el.rc.load(Ordering::Acquire);
            let rem = (cur_rc & RC_MASK) as u32;
            if cc & rem != 0 {
                warn!("force_push: evicting stalled readers {:#010x} (k = {})", rem, k);
                cc = self.head.disconnect_receiver(rem);
                if cc == 0 {
                    return false;
                }
            }
            let next = inc_mask(epoch | (cur_rc & EP_MASK)) | u64::from(cc);
            if el
                .rc
                .compare_exchange_weak(cur_rc, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                if epoch == self.epoch.load(Ordering::Acquire) {
                    break (cur_ct, el);
                } else if self.push(&mut *prep) {
                    // a competing evictor moved the epoch on; the plain path
                    // succeeded under the newer one
                    return true;
                }
                epoch = self
                    .epoch
                    .fetch_add(EP_INCR, Ordering::Release)
                    .wrapping_add(EP_INCR);
            }
            backoff(&mut k);
        };
        self.ct.store(cur_ct.wrapping_add(1), Ordering::Release);
        prep(el.data.get().cast::<T>());
        el.f_ct.store(!u64::from(cur_ct), Ordering::Release);
        true
    }

    fn pop(&self, cursor: &mut u16, id: u32, read: &mut dyn FnMut(*const T)) -> Option<bool> {
        let el = self.slot(*cursor);
        let cur_fl = el.f_ct.load(Ordering::Acquire);
        if cur_fl != !u64::from(*cursor) {
            return None; // nothing committed at this cursor yet
        }
        *cursor = cursor.wrapping_add(1);
        // copy out before releasing: the slot may be rewritten the moment
        // the bitmap drains
        read(el.data.get().cast_const().cast::<T>());
        let mut k = 0u32;
        loop {
            let cur_rc = el.rc.load(Ordering::Acquire);
            if cur_rc & RC_MASK == 0 {
                el.f_ct
                    .store(u64::from(cursor.wrapping_add((N - 1) as u16)), Ordering::Release);
                return Some(true);
            }
            let nxt_rc = inc_rc(cur_rc) & !u64::from(id);
            let last_one = nxt_rc & RC_MASK == 0;
            if last_one {
                el.f_ct
                    .store(u64::from(cursor.wrapping_add((N - 1) as u16)), Ordering::Release);
            }
            if el
                .rc
                .compare_exchange_weak(cur_rc, nxt_rc, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return Some(last_one);
            }
            backoff(&mut k);
        }
    }
}
