//! Circular-array building blocks shared by the protocol variants.
//!
//! A channel's shared segment starts with connection bookkeeping, followed by
//! the protocol indices and the slot array. Everything here is `#[repr(C)]`
//! and valid when zero-filled, since segments are mapped by several processes
//! and initialized exactly once.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::backoff::{backoff, SpinLock};

pub mod broadcast;
pub mod unicast;

/// Broadcast channels address readers by single bits of a 32-bit bitmap.
pub const MAX_RECEIVERS: usize = 32;

// Each broadcast slot carries one 64-bit state word packing three fields
// that must move under a single CAS:
//   low 32 bits  - reader bitmap (who still owes a read)
//   next 24 bits - per-slot write counter
//   high 8 bits  - eviction epoch
pub(crate) const RC_MASK: u64 = 0x0000_0000_ffff_ffff;
pub(crate) const EP_MASK: u64 = 0x00ff_ffff_ffff_ffff;
pub(crate) const EP_INCR: u64 = 0x0100_0000_0000_0000;
pub(crate) const IC_MASK: u64 = 0xff00_0000_ffff_ffff;
pub(crate) const IC_INCR: u64 = 0x0000_0001_0000_0000;

/// Bumps the write counter, leaving bitmap and epoch untouched.
#[inline]
pub(crate) const fn inc_rc(rc: u64) -> u64 {
    (rc & IC_MASK) | (rc.wrapping_add(IC_INCR) & !IC_MASK)
}

/// Bumps the write counter and clears the reader bitmap.
#[inline]
pub(crate) const fn inc_mask(rc: u64) -> u64 {
    inc_rc(rc) & !RC_MASK
}

/// Maps a commit index onto the slot array. `N` is a power of two.
#[inline]
pub(crate) const fn index_of<const N: usize>(c: u16) -> usize {
    c as usize & (N - 1)
}

/// Operations the queue facade needs from a protocol variant.
///
/// Each variant is an independent `#[repr(C)]` type laid out directly in the
/// shared segment and selected by the caller at the type level.
pub trait Ring<T>: Sized {
    /// Idempotent one-time initialization of the mapped segment.
    fn init(&self);

    /// Commit index a newly connected reader should start consuming from.
    fn cursor(&self) -> u16;

    /// Registers a reader; returns its id, or 0 when no slot is left.
    fn connect_receiver(&self) -> u32;

    /// Releases a reader id (or a mask of evicted ids); returns what is
    /// still connected.
    fn disconnect_receiver(&self, id: u32) -> u32;

    /// Whether `id` still holds a live connection.
    fn is_connected(&self, id: u32) -> bool;

    fn conn_count(&self) -> usize;

    fn connect_sender(&self) -> bool;

    fn disconnect_sender(&self);

    /// Publishes one message, constructed in place by `prep`. False when the
    /// ring is full for some live reader, or no reader is connected.
    fn push(&self, prep: &mut dyn FnMut(*mut T)) -> bool;

    /// Like [`push`](Ring::push), but evicts readers that still block the
    /// target slot instead of refusing.
    fn force_push(&self, prep: &mut dyn FnMut(*mut T)) -> bool;

    /// Consumes the message at `cursor`, advancing it. `None` when nothing
    /// is committed there yet; otherwise whether this reader was the last
    /// one to release the slot.
    fn pop(&self, cursor: &mut u16, id: u32, read: &mut dyn FnMut(*const T)) -> Option<bool>;
}

/// Connection bookkeeping for broadcast rings: one bit per reader, plus a
/// producer count behind `ready_sending`.
#[repr(C)]
pub struct ConnHead {
    cc: AtomicU32,
    sc: AtomicU32,
    lc: SpinLock,
    constructed: AtomicBool,
}

impl ConnHead {
    /// Double-checked one-time zeroing. Fresh segments are already zeroed;
    /// this guards re-opens racing a crashed initializer.
    pub fn init(&self) {
        if !self.constructed.load(Ordering::Acquire) {
            let _guard = self.lc.lock();
            if !self.constructed.load(Ordering::Relaxed) {
                self.cc.store(0, Ordering::Relaxed);
                self.sc.store(0, Ordering::Relaxed);
                self.constructed.store(true, Ordering::Release);
            }
        }
    }

    /// Claims the lowest clear bit. Returns the single-bit reader id, or 0
    /// when all 32 connection slots are taken.
    pub fn connect_receiver(&self) -> u32 {
        let mut k = 0u32;
        loop {
            let curr = self.cc.load(Ordering::Acquire);
            // e.g. 0b0011 -> 0b0111: first zero bit set
            let next = curr | curr.wrapping_add(1);
            if next == curr {
                return 0;
            }
            if self
                .cc
                .compare_exchange_weak(curr, next, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return next ^ curr;
            }
            backoff(&mut k);
        }
    }

    pub fn disconnect_receiver(&self, id: u32) -> u32 {
        self.cc.fetch_and(!id, Ordering::AcqRel) & !id
    }

    #[inline]
    pub fn connections(&self, order: Ordering) -> u32 {
        self.cc.load(order)
    }

    pub fn count(&self) -> usize {
        self.cc.load(Ordering::Acquire).count_ones() as usize
    }

    pub fn connect_sender(&self) -> bool {
        self.sc.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn disconnect_sender(&self) {
        self.sc.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Connection bookkeeping for unicast rings: readers are anonymous, only
/// their number matters.
#[repr(C)]
pub struct ConnCounter {
    cc: AtomicU32,
    sc: AtomicU32,
    lc: SpinLock,
    constructed: AtomicBool,
}

impl ConnCounter {
    pub fn init(&self) {
        if !self.constructed.load(Ordering::Acquire) {
            let _guard = self.lc.lock();
            if !self.constructed.load(Ordering::Relaxed) {
                self.cc.store(0, Ordering::Relaxed);
                self.sc.store(0, Ordering::Relaxed);
                self.constructed.store(true, Ordering::Release);
            }
        }
    }

    pub fn connect_receiver(&self) -> u32 {
        self.cc.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn disconnect_receiver(&self, id: u32) -> u32 {
        if id == u32::MAX {
            self.cc.store(0, Ordering::Relaxed);
            0
        } else {
            self.cc.fetch_sub(1, Ordering::Relaxed) - 1
        }
    }

    #[inline]
    pub fn connections(&self, order: Ordering) -> u32 {
        self.cc.load(order)
    }

    pub fn count(&self) -> usize {
        self.connections(Ordering::Acquire) as usize
    }

    pub fn connect_sender(&self) -> bool {
        self.sc.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn disconnect_sender(&self) {
        self.sc.fetch_sub(1, Ordering::Relaxed);
    }
}
