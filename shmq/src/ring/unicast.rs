//! Multi-producer / multi-consumer unicast ring.
//!
//! Each committed message is consumed by exactly one reader, whichever wins
//! the read-index race. There is no per-reader bookkeeping beyond the
//! connection count; a reader id is only evidence of being connected.
//!
//! Producers claim a commit index, fill the slot, and mark it with the
//! commit flag; the write index trails behind and is relayed forward over
//! consecutively committed slots so readers only ever see finished payloads.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

use super::{index_of, ConnCounter, Ring};
use crate::backoff::backoff;

#[repr(C)]
pub struct UniSlot<T> {
    data: UnsafeCell<MaybeUninit<T>>,
    /// `!c` while commit `c` waits to be folded into the write index.
    f_ct: AtomicU64,
}

/// The unicast ring living at offset 0 of a channel's segment.
///
/// Holds at most `N - 1` unconsumed messages; `N` is a power of two no
/// larger than 2^16.
#[repr(C)]
pub struct Unicast<T, const N: usize> {
    head: ConnCounter,
    /// Read index: the next slot to consume.
    rd: CachePadded<AtomicU16>,
    /// Write index: everything below it is fully committed.
    wt: CachePadded<AtomicU16>,
    /// Commit index: producers claim slots here.
    ct: CachePadded<AtomicU16>,
    slots: CachePadded<[UniSlot<T>; N]>,
}

unsafe impl<T: Copy + Send, const N: usize> Send for Unicast<T, N> {}
unsafe impl<T: Copy + Send, const N: usize> Sync for Unicast<T, N> {}

impl<T: Copy, const N: usize> Unicast<T, N> {
    #[inline]
    fn slot(&self, c: u16) -> &UniSlot<T> {
        &self.slots[index_of::<N>(c)]
    }
}

impl<T: Copy, const N: usize> Ring<T> for Unicast<T, N> {
    fn init(&self) {
        const {
            assert!(N.is_power_of_two());
            assert!(N <= 1 << 16);
        }
        self.head.init();
    }

    /// Unicast readers share the global read index; there is no per-reader
    /// cursor to seed.
    fn cursor(&self) -> u16 {
        0
    }

    fn connect_receiver(&self) -> u32 {
        self.head.connect_receiver()
    }

    fn disconnect_receiver(&self, id: u32) -> u32 {
        self.head.disconnect_receiver(id)
    }

    fn is_connected(&self, id: u32) -> bool {
        id != 0
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
        let mut k = 0u32;
        let mut cur_ct = loop {
            let cur_ct = self.ct.load(Ordering::Relaxed);
            let nxt_ct = cur_ct.wrapping_add(1);
            if index_of::<N>(nxt_ct) == index_of::<N>(self.rd.load(Ordering::Acquire)) {
                return false; // full
            }
            if self
                .ct
                .compare_exchange_weak(cur_ct, nxt_ct, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break cur_ct;
            }
            backoff(&mut k);
        };
        let el = self.slot(cur_ct);
        prep(el.data.get().cast::<T>());
        el.f_ct.store(!u64::from(cur_ct), Ordering::Release);
        // relay: fold every consecutively committed slot into the write
        // index, no matter which producer committed it
        loop {
            let el = self.slot(cur_ct);
            let cac_ct = el.f_ct.load(Ordering::Acquire);
            if self.wt.load(Ordering::Relaxed) != cur_ct {
                return true;
            }
            if !cac_ct != u64::from(cur_ct) {
                return true;
            }
            if el
                .f_ct
                .compare_exchange(cac_ct, 0, Ordering::Relaxed, Ordering::Relaxed)
                .is_err()
            {
                return true;
            }
            cur_ct = cur_ct.wrapping_add(1);
            self.wt.store(cur_ct, Ordering::Release);
        }
    }

    /// Unicast slots carry no reader bitmap to evict from; a full ring means
    /// a consumer has gone away, so one connection is written off instead.
    fn force_push(&self, _prep: &mut dyn FnMut(*mut T)) -> bool {
        self.head.disconnect_receiver(1);
        false
    }

    fn pop(&self, _cursor: &mut u16, _id: u32, read: &mut dyn FnMut(*const T)) -> Option<bool> {
        let mut k = 0u32;
        loop {
            let cur_rd = self.rd.load(Ordering::Relaxed);
            let cur_wt = self.wt.load(Ordering::Acquire);
            if index_of::<N>(cur_rd) == index_of::<N>(cur_wt) {
                let el = self.slot(cur_wt);
                let cac_ct = el.f_ct.load(Ordering::Acquire);
                if !cac_ct != u64::from(cur_wt) {
                    return None; // empty
                }
                // committed but not yet relayed; fold it in ourselves
                if el
                    .f_ct
                    .compare_exchange_weak(cac_ct, 0, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    self.wt.store(cur_wt.wrapping_add(1), Ordering::Release);
                }
                k = 0;
            } else {
                // copy out before racing for the read index; a loser's copy
                // is simply discarded
                let buf: MaybeUninit<T> = unsafe { self.slot(cur_rd).data.get().read() };
                if self
                    .rd
                    .compare_exchange_weak(
                        cur_rd,
                        cur_rd.wrapping_add(1),
                        Ordering::Release,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    read(buf.as_ptr());
                    return Some(true);
                }
                backoff(&mut k);
            }
        }
    }
}
