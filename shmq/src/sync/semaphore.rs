//! Named counting semaphore (POSIX `sem_open` family).

use std::ffi::CString;
use std::io;

use log::error;

use super::{abs_timespec, TIMEOUT_INFINITE};
use crate::errors::ShmqError;
use crate::shm::is_valid_name;

/// A named semaphore. Open the same name in any process to share it.
pub struct Semaphore {
    sem: *mut libc::sem_t,
    name: String,
}

// sem_t operations are process- and thread-safe by contract.
unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

fn sem_os_name(name: &str) -> Result<CString, ShmqError> {
    if !is_valid_name(name) {
        return Err(ShmqError::Config(format!("invalid semaphore name {:?}", name)));
    }
    let mut os = String::with_capacity(name.len() + 1);
    os.push('/');
    for c in name.chars() {
        os.push(if c == '/' { '_' } else { c });
    }
    CString::new(os).map_err(|_| ShmqError::Config(format!("invalid semaphore name {:?}", name)))
}

impl Semaphore {
    /// Opens the semaphore, creating it with `initial` permits if this is
    /// the first opener.
    pub fn open(name: &str, initial: u32) -> Result<Semaphore, ShmqError> {
        let os_name = sem_os_name(name)?;
        let sem = unsafe {
            libc::sem_open(
                os_name.as_ptr(),
                libc::O_CREAT,
                0o600 as libc::c_uint,
                initial as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            let err = io::Error::last_os_error();
            error!("semaphore {}: open failed: {}", name, err);
            return Err(ShmqError::Sys(err));
        }
        Ok(Semaphore {
            sem,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Takes one permit, waiting up to `timeout_ms`
    /// ([`TIMEOUT_INFINITE`] for no limit). `Ok(false)` on timeout;
    /// interrupted waits restart against the original deadline.
    pub fn wait(&self, timeout_ms: u64) -> Result<bool, ShmqError> {
        let deadline = if timeout_ms == TIMEOUT_INFINITE {
            None
        } else {
            Some(abs_timespec(timeout_ms)?)
        };
        loop {
            let rc = match &deadline {
                None => unsafe { libc::sem_wait(self.sem) },
                Some(ts) => unsafe { libc::sem_timedwait(self.sem, ts) },
            };
            if rc == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::ETIMEDOUT) => return Ok(false),
                Some(libc::EINTR) => continue,
                _ => {
                    error!("semaphore {}: wait failed: {}", self.name, err);
                    return Err(ShmqError::Sys(err));
                }
            }
        }
    }

    /// Releases `count` permits.
    pub fn post(&self, count: u32) -> Result<(), ShmqError> {
        for _ in 0..count {
            if unsafe { libc::sem_post(self.sem) } != 0 {
                let err = io::Error::last_os_error();
                error!("semaphore {}: post failed: {}", self.name, err);
                return Err(ShmqError::Sys(err));
            }
        }
        Ok(())
    }

    /// Unlinks the semaphore's name.
    pub fn clear_storage(name: &str) -> bool {
        match sem_os_name(name) {
            Ok(os_name) => unsafe { libc::sem_unlink(os_name.as_ptr()) == 0 },
            Err(_) => false,
        }
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.sem);
        }
    }
}
