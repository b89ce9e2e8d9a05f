//! Named cross-process synchronization: mutex, semaphore, condition, waiter.
//!
//! Everything here suspends in the kernel; the ring itself never does. The
//! queue pairs with a [`Waiter`](waiter::Waiter) when callers want to sleep
//! on an empty channel instead of spinning.

use std::io;

use crate::errors::ShmqError;

pub mod condition;
pub mod mutex;
pub mod semaphore;
pub mod waiter;

/// Timeout sentinel: wait without limit.
pub const TIMEOUT_INFINITE: u64 = u64::MAX;

/// Maps a pthread-style return code onto `ShmqError`.
pub(crate) fn sys(code: libc::c_int) -> Result<(), ShmqError> {
    if code == 0 {
        Ok(())
    } else {
        Err(ShmqError::Sys(io::Error::from_raw_os_error(code)))
    }
}

/// Absolute CLOCK_REALTIME deadline `timeout_ms` from now, for the timed
/// pthread and semaphore waits.
pub(crate) fn abs_timespec(timeout_ms: u64) -> Result<libc::timespec, ShmqError> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) } != 0 {
        return Err(ShmqError::Sys(io::Error::last_os_error()));
    }
    ts.tv_sec += (timeout_ms / 1_000) as libc::time_t;
    ts.tv_nsec += ((timeout_ms % 1_000) * 1_000_000) as libc::c_long;
    if ts.tv_nsec >= 1_000_000_000 {
        ts.tv_sec += 1;
        ts.tv_nsec -= 1_000_000_000;
    }
    Ok(ts)
}
