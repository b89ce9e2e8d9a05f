//! Named shared-memory segments.
//!
//! Thin binding layer over the `shared_memory` crate: every channel object
//! (ring, mutex, condition counter) lives in a POSIX segment keyed by a
//! printable name. Mappings are released on drop; the name itself persists
//! until [`ShmHandle::clear_storage`] unlinks it.

use shared_memory::{Shmem, ShmemConf, ShmemError};

use crate::errors::ShmqError;

/// How to bind a named segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Create the segment; fail if the name already exists.
    Create,
    /// Open an existing segment; fail if the name is unknown.
    Open,
    /// Open the segment, creating it first if nobody has yet.
    CreateOrOpen,
}

/// A mapped named segment.
pub struct ShmHandle {
    shmem: Shmem,
}

// The mapping is plain memory; concurrent access is governed by the atomics
// placed inside it, not by this handle.
unsafe impl Send for ShmHandle {}
unsafe impl Sync for ShmHandle {}

/// Channel names must be printable and non-empty; they key kernel objects.
pub(crate) fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_graphic())
}

fn os_id(name: &str) -> String {
    let mut id = String::with_capacity(name.len() + 1);
    id.push('/');
    for c in name.chars() {
        id.push(if c == '/' { '_' } else { c });
    }
    id
}

impl ShmHandle {
    /// Binds `name` to a mapping of at least `size` bytes. The actual mapped
    /// length can exceed the request because of page rounding.
    ///
    /// Freshly created segments are zero-filled by the OS; all one-time init
    /// schemes in this crate build on that.
    pub fn acquire(name: &str, size: usize, mode: OpenMode) -> Result<ShmHandle, ShmqError> {
        if !is_valid_name(name) {
            return Err(ShmqError::Config(format!("invalid segment name {:?}", name)));
        }
        let id = os_id(name);
        let mut shmem = match mode {
            OpenMode::Create => ShmemConf::new().size(size).os_id(&id).create()?,
            OpenMode::Open => ShmemConf::new().os_id(&id).open()?,
            OpenMode::CreateOrOpen => match ShmemConf::new().size(size).os_id(&id).create() {
                Ok(m) => m,
                Err(ShmemError::LinkExists) | Err(ShmemError::MappingIdExists) => {
                    ShmemConf::new().os_id(&id).open()?
                }
                Err(e) => return Err(ShmqError::SharedMemory(e)),
            },
        };
        // the name outlives this process; reclamation is explicit via
        // clear_storage
        shmem.set_owner(false);
        if shmem.len() < size {
            return Err(ShmqError::Config(format!(
                "segment {:?} maps {} bytes, {} required",
                name,
                shmem.len(),
                size
            )));
        }
        Ok(ShmHandle { shmem })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.shmem.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.shmem.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shmem.len() == 0
    }

    /// Unlinks the backing name. Live mappings stay valid until their
    /// handles drop. Returns false when the name does not exist.
    pub fn clear_storage(name: &str) -> bool {
        match ShmemConf::new().os_id(&os_id(name)).open() {
            Ok(mut m) => {
                m.set_owner(true);
                true
            }
            Err(_) => false,
        }
    }
}
