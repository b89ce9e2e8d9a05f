//! Cross-process condition variable.
//!
//! Composed from three named objects derived from one base name: a counting
//! semaphore (`<name>_COND_SEM_`) that parks waiters, a mutex
//! (`<name>_COND_LOCK_`) guarding the bookkeeping, and a 4-byte segment
//! (`<name>_COND_SHM_`) holding the number of parked waiters.
//!
//! The counter is what keeps the semaphore honest: posting unconditionally
//! would leak permits and turn some later `wait` into a spurious return.

use std::mem;
use std::sync::atomic::{AtomicI32, Ordering};

use super::mutex::Mutex;
use super::semaphore::Semaphore;
use super::TIMEOUT_INFINITE;
use crate::errors::ShmqError;
use crate::guard::ScopeGuard;
use crate::shm::{OpenMode, ShmHandle};

pub struct Condition {
    sem: Semaphore,
    lock: Mutex,
    count: ShmHandle,
}

impl Condition {
    pub fn open(name: &str) -> Result<Condition, ShmqError> {
        // partially opened members close themselves on the early returns
        let sem = Semaphore::open(&format!("{}_COND_SEM_", name), 0)?;
        let lock = Mutex::open(&format!("{}_COND_LOCK_", name))?;
        let count = ShmHandle::acquire(
            &format!("{}_COND_SHM_", name),
            mem::size_of::<AtomicI32>(),
            OpenMode::CreateOrOpen,
        )?;
        Ok(Condition { sem, lock, count })
    }

    #[inline]
    fn counter(&self) -> &AtomicI32 {
        unsafe { &*(self.count.as_ptr() as *const AtomicI32) }
    }

    /// Parks the caller until a notify or the timeout, releasing `mutex` for
    /// the duration. The caller holds `mutex` again on return either way;
    /// `Ok(false)` means the wait timed out.
    pub fn wait(&self, mutex: &Mutex, timeout_ms: u64) -> Result<bool, ShmqError> {
        {
            self.lock.lock(TIMEOUT_INFINITE)?;
            let _unlock = ScopeGuard::new(|| {
                let _ = self.lock.unlock();
            });
            let cnt = self.counter();
            let c = cnt.load(Ordering::Relaxed);
            debug_assert!(c >= 0, "condition counter went negative: {}", c);
            // a negative count can only be a remnant of a torn shutdown;
            // forgive it rather than undercount
            cnt.store(if c < 0 { 1 } else { c + 1 }, Ordering::Relaxed);
        }
        // The permit was counted before the user mutex is released, so a
        // notify landing in the gap below leaves its post in the semaphore
        // instead of getting lost.
        mutex.unlock()?;
        let signalled = self.sem.wait(timeout_ms)?;
        let relocked = mutex.lock(TIMEOUT_INFINITE)?;
        if !signalled {
            self.lock.lock(TIMEOUT_INFINITE)?;
            self.counter().fetch_sub(1, Ordering::Relaxed);
            self.lock.unlock()?;
        }
        Ok(signalled && relocked)
    }

    /// Wakes one parked waiter, if any. Returns whether a permit was posted.
    /// The caller does not need to hold the user mutex.
    pub fn notify(&self) -> Result<bool, ShmqError> {
        self.lock.lock(TIMEOUT_INFINITE)?;
        let _unlock = ScopeGuard::new(|| {
            let _ = self.lock.unlock();
        });
        let cnt = self.counter();
        if cnt.load(Ordering::Relaxed) > 0 {
            self.sem.post(1)?;
            cnt.fetch_sub(1, Ordering::Relaxed);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Wakes every parked waiter. Returns whether any permit was posted.
    pub fn broadcast(&self) -> Result<bool, ShmqError> {
        self.lock.lock(TIMEOUT_INFINITE)?;
        let _unlock = ScopeGuard::new(|| {
            let _ = self.lock.unlock();
        });
        let cnt = self.counter();
        let c = cnt.load(Ordering::Relaxed);
        if c > 0 {
            self.sem.post(c as u32)?;
            cnt.store(0, Ordering::Relaxed);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Unlinks all three backing names.
    pub fn clear_storage(name: &str) {
        ShmHandle::clear_storage(&format!("{}_COND_SHM_", name));
        Mutex::clear_storage(&format!("{}_COND_LOCK_", name));
        Semaphore::clear_storage(&format!("{}_COND_SEM_", name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::unique_name;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn teardown(name: &str) {
        Condition::clear_storage(name);
        Mutex::clear_storage(&format!("{}_user", name));
    }

    #[test]
    fn notify_without_waiters_posts_nothing() {
        let name = unique_name("cond-idle");
        let cond = Condition::open(&name).unwrap();
        assert!(!cond.notify().unwrap());
        assert!(!cond.broadcast().unwrap());

        // and no permit leaked: a later wait must time out, not return early
        let user = Mutex::open(&format!("{}_user", name)).unwrap();
        user.lock(TIMEOUT_INFINITE).unwrap();
        assert!(!cond.wait(&user, 50).unwrap());
        user.unlock().unwrap();
        teardown(&name);
    }

    #[test]
    fn notify_wakes_exactly_one_waiter() {
        let name = unique_name("cond-one");
        let cond = Arc::new(Condition::open(&name).unwrap());
        let user = Arc::new(Mutex::open(&format!("{}_user", name)).unwrap());

        let mut waiters = Vec::new();
        for _ in 0..3 {
            let cond = Arc::clone(&cond);
            let user = Arc::clone(&user);
            waiters.push(thread::spawn(move || {
                user.lock(TIMEOUT_INFINITE).unwrap();
                let woken = cond.wait(&user, 2_000).unwrap();
                user.unlock().unwrap();
                woken
            }));
        }
        thread::sleep(Duration::from_millis(100));
        assert!(cond.notify().unwrap());

        let results: Vec<bool> = waiters.into_iter().map(|w| w.join().unwrap()).collect();
        assert_eq!(
            results.iter().filter(|woken| **woken).count(),
            1,
            "one notify, one wake"
        );
        teardown(&name);
    }

    #[test]
    fn broadcast_wakes_every_waiter() {
        let name = unique_name("cond-all");
        let cond = Arc::new(Condition::open(&name).unwrap());
        let user = Arc::new(Mutex::open(&format!("{}_user", name)).unwrap());

        let mut waiters = Vec::new();
        for _ in 0..3 {
            let cond = Arc::clone(&cond);
            let user = Arc::clone(&user);
            waiters.push(thread::spawn(move || {
                user.lock(TIMEOUT_INFINITE).unwrap();
                let woken = cond.wait(&user, 5_000).unwrap();
                user.unlock().unwrap();
                woken
            }));
        }
        thread::sleep(Duration::from_millis(100));
        assert!(cond.broadcast().unwrap());
        for w in waiters {
            assert!(w.join().unwrap(), "broadcast must reach every waiter");
        }
        teardown(&name);
    }

    #[test]
    fn timed_out_waiter_corrects_the_count() {
        let name = unique_name("cond-balance");
        let cond = Condition::open(&name).unwrap();
        let user = Mutex::open(&format!("{}_user", name)).unwrap();

        user.lock(TIMEOUT_INFINITE).unwrap();
        assert!(!cond.wait(&user, 50).unwrap());
        user.unlock().unwrap();

        // the timed-out wait decremented; notify must see nobody parked
        assert!(!cond.notify().unwrap());
        teardown(&name);
    }
}
