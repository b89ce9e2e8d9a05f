//! Predicate waiting with cooperative shutdown.
//!
//! A `Waiter` pairs a cross-process [`Condition`] with its mutex
//! (`<name>_WAITER_COND_` / `<name>_WAITER_LOCK_`) and a process-local quit
//! flag, so a blocked thread can be released either by progress (the
//! predicate turning false) or by shutdown.

use std::sync::atomic::{AtomicBool, Ordering};

use super::condition::Condition;
use super::mutex::Mutex;
use super::TIMEOUT_INFINITE;
use crate::errors::ShmqError;
use crate::guard::ScopeGuard;

pub struct Waiter {
    cond: Condition,
    lock: Mutex,
    quit: AtomicBool,
}

impl Waiter {
    pub fn open(name: &str) -> Result<Waiter, ShmqError> {
        let cond = Condition::open(&format!("{}_WAITER_COND_", name))?;
        let lock = Mutex::open(&format!("{}_WAITER_LOCK_", name))?;
        Ok(Waiter {
            cond,
            lock,
            quit: AtomicBool::new(false),
        })
    }

    /// Blocks while `pred` holds and nobody called
    /// [`quit_waiting`](Waiter::quit_waiting). `Ok(false)` when an inner
    /// wait timed out; `Ok(true)` when the loop exited on its own terms.
    pub fn wait_if(
        &self,
        mut pred: impl FnMut() -> bool,
        timeout_ms: u64,
    ) -> Result<bool, ShmqError> {
        self.lock.lock(TIMEOUT_INFINITE)?;
        let _unlock = ScopeGuard::new(|| {
            let _ = self.lock.unlock();
        });
        while !self.quit.load(Ordering::Relaxed) && pred() {
            if !self.cond.wait(&self.lock, timeout_ms)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Wakes one waiter. The empty lock/unlock pair orders this wake after
    /// whatever state change the caller just published.
    pub fn notify(&self) -> Result<bool, ShmqError> {
        self.lock.lock(TIMEOUT_INFINITE)?;
        self.lock.unlock()?;
        self.cond.notify()
    }

    /// Wakes every waiter.
    pub fn broadcast(&self) -> Result<bool, ShmqError> {
        self.lock.lock(TIMEOUT_INFINITE)?;
        self.lock.unlock()?;
        self.cond.broadcast()
    }

    /// Releases all current waiters and makes every future `wait_if` return
    /// immediately.
    pub fn quit_waiting(&self) -> Result<bool, ShmqError> {
        self.quit.store(true, Ordering::Release);
        self.broadcast()
    }

    /// Unlinks both backing names.
    pub fn clear_storage(name: &str) {
        Condition::clear_storage(&format!("{}_WAITER_COND_", name));
        Mutex::clear_storage(&format!("{}_WAITER_LOCK_", name));
    }
}
