//! Escalating backoff for spin loops.
//!
//! Lock-free retry loops fail mostly because another thread is mid-update;
//! retrying immediately tends to fail again. Every spin loop in this crate
//! waits through [`backoff`] instead of busy-waiting raw.

use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

/// One step of the ladder, selected by the attempt count `k`:
/// under 4 nothing, under 16 a CPU spin hint (`pause` on x86, `yield` on
/// ARM), under 32 an OS thread yield, from 32 on a 1 ms sleep.
///
/// `k` stops incrementing at the sleep stage, so the wait per attempt is
/// bounded.
#[inline]
pub fn backoff(k: &mut u32) {
    if *k < 4 {
        // burn the attempt
    } else if *k < 16 {
        core::hint::spin_loop();
    } else if *k < 32 {
        thread::yield_now();
    } else {
        thread::sleep(Duration::from_millis(1));
        return;
    }
    *k += 1;
}

/// Minimal spin lock that may live inside a shared-memory segment.
///
/// Zeroed memory is a valid unlocked state, which is what segment
/// initialization relies on.
#[repr(transparent)]
pub(crate) struct SpinLock(AtomicU32);

impl SpinLock {
    #[cfg(test)]
    pub(crate) const fn new() -> Self {
        SpinLock(AtomicU32::new(0))
    }

    pub(crate) fn lock(&self) -> SpinGuard<'_> {
        let mut k = 0u32;
        while self.0.swap(1, Ordering::Acquire) != 0 {
            backoff(&mut k);
        }
        SpinGuard(self)
    }
}

pub(crate) struct SpinGuard<'a>(&'a SpinLock);

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        (self.0).0.store(0, Ordering::Release);
    }
}
