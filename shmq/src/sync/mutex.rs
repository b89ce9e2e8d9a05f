//! Named mutex shared across processes.
//!
//! A robust, process-shared pthread mutex living in its own named segment.
//! When the previous holder died while holding it, acquisition marks the
//! state consistent, releases, and retries — the caller simply observes a
//! successful lock.

use std::cell::UnsafeCell;
use std::io;
use std::mem;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{error, warn};

use super::{abs_timespec, sys, TIMEOUT_INFINITE};
use crate::backoff::SpinLock;
use crate::errors::ShmqError;
use crate::shm::{OpenMode, ShmHandle};

#[repr(C)]
struct MutexInner {
    lc: SpinLock,
    constructed: AtomicBool,
    mutex: UnsafeCell<libc::pthread_mutex_t>,
}

/// A named mutex. Open the same name in any process to share it.
pub struct Mutex {
    handle: ShmHandle,
    name: String,
}

// The pthread mutex is process-shared; the handle itself carries no
// thread-affine state.
unsafe impl Send for Mutex {}
unsafe impl Sync for Mutex {}

impl Mutex {
    pub fn open(name: &str) -> Result<Mutex, ShmqError> {
        let handle = ShmHandle::acquire(name, mem::size_of::<MutexInner>(), OpenMode::CreateOrOpen)?;
        let mutex = Mutex {
            handle,
            name: name.to_string(),
        };
        mutex.init()?;
        Ok(mutex)
    }

    #[inline]
    fn inner(&self) -> &MutexInner {
        unsafe { &*(self.handle.as_ptr() as *const MutexInner) }
    }

    fn init(&self) -> Result<(), ShmqError> {
        let inner = self.inner();
        if inner.constructed.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = inner.lc.lock();
        if inner.constructed.load(Ordering::Relaxed) {
            return Ok(());
        }
        unsafe {
            let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
            sys(libc::pthread_mutexattr_init(attr.as_mut_ptr()))?;
            libc::pthread_mutexattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED);
            libc::pthread_mutexattr_setrobust(attr.as_mut_ptr(), libc::PTHREAD_MUTEX_ROBUST);
            let rc = libc::pthread_mutex_init(inner.mutex.get(), attr.as_ptr());
            libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
            sys(rc)?;
        }
        inner.constructed.store(true, Ordering::Release);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquires the mutex, waiting up to `timeout_ms`
    /// ([`TIMEOUT_INFINITE`] for no limit). `Ok(false)` on timeout.
    pub fn lock(&self, timeout_ms: u64) -> Result<bool, ShmqError> {
        let m = self.inner().mutex.get();
        loop {
            let rc = if timeout_ms == TIMEOUT_INFINITE {
                unsafe { libc::pthread_mutex_lock(m) }
            } else {
                let ts = abs_timespec(timeout_ms)?;
                unsafe { libc::pthread_mutex_timedlock(m, &ts) }
            };
            match rc {
                0 => return Ok(true),
                libc::ETIMEDOUT => return Ok(false),
                libc::EOWNERDEAD => {
                    warn!("mutex {}: owner died while holding it, recovering", self.name);
                    unsafe {
                        libc::pthread_mutex_consistent(m);
                        libc::pthread_mutex_unlock(m);
                    }
                    // take it again now that the state is consistent
                }
                e => {
                    error!("mutex {}: lock failed with {}", self.name, e);
                    return Err(ShmqError::Sys(io::Error::from_raw_os_error(e)));
                }
            }
        }
    }

    /// Non-blocking acquire: `Ok(false)` when held elsewhere. An abandoned
    /// owner is recovered but surfaced as an error to the caller.
    pub fn try_lock(&self) -> Result<bool, ShmqError> {
        let m = self.inner().mutex.get();
        match unsafe { libc::pthread_mutex_trylock(m) } {
            0 => Ok(true),
            libc::EBUSY => Ok(false),
            libc::EOWNERDEAD => {
                unsafe {
                    libc::pthread_mutex_consistent(m);
                    libc::pthread_mutex_unlock(m);
                }
                error!("mutex {}: try_lock found a dead owner", self.name);
                Err(ShmqError::Sys(io::Error::from_raw_os_error(libc::EOWNERDEAD)))
            }
            e => {
                error!("mutex {}: try_lock failed with {}", self.name, e);
                Err(ShmqError::Sys(io::Error::from_raw_os_error(e)))
            }
        }
    }

    pub fn unlock(&self) -> Result<(), ShmqError> {
        sys(unsafe { libc::pthread_mutex_unlock(self.inner().mutex.get()) })
    }

    /// Unlinks the mutex's backing name.
    pub fn clear_storage(name: &str) -> bool {
        ShmHandle::clear_storage(name)
    }
}
