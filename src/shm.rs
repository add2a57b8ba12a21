//! Low-level POSIX shared memory operations

use crate::error::{LockstepError, Result, Violation};
use rustix::fs::{fstat, ftruncate};
use rustix::io::Errno;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::shm::{shm_open, shm_unlink, Mode, ShmOFlags};
use std::ptr::NonNull;
use tracing::{debug, warn};

/// How this process obtains a shared region.
///
/// The process that creates a region owns the OS object and is the only one
/// allowed to unlink it. The peer maps the already-created region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Create the OS object exclusively; unlink it at teardown
    Creator,
    /// Map an object the peer already created; never unlink
    Opener,
}

impl Capability {
    /// Capability of the control process on this platform.
    ///
    /// On POSIX hosts the control side creates every region before the engine
    /// maps it.
    pub fn for_platform() -> Self {
        Capability::Creator
    }

    /// Capability of the engine process on this platform
    pub fn peer_for_platform() -> Self {
        match Self::for_platform() {
            Capability::Creator => Capability::Opener,
            Capability::Opener => Capability::Creator,
        }
    }
}

/// Handle to a mapped shared memory region
pub struct SharedRegion {
    addr: NonNull<u8>,
    size: usize,
    os_name: String,
    capability: Capability,
    unlinked: bool,
}

// SAFETY: the mapping stays valid for the life of the handle; concurrent
// access to its contents is serialized by the handshake protocol
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Create or open `os_name` according to `capability`.
    ///
    /// A creator fails if the name is still live (for example left behind by
    /// a session that crashed). An opener fails if the existing object is not
    /// exactly `size` bytes.
    pub fn open(os_name: &str, size: usize, capability: Capability) -> Result<Self> {
        match capability {
            Capability::Creator => Self::create_exclusive(os_name, size),
            Capability::Opener => Self::open_existing(os_name, size),
        }
    }

    fn create_exclusive(os_name: &str, size: usize) -> Result<Self> {
        let fd = shm_open(
            os_name,
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|e| alloc_err(os_name, e))?;

        if let Err(e) = ftruncate(&fd, size as u64) {
            let _ = shm_unlink(os_name);
            return Err(alloc_err(os_name, e));
        }

        let addr = match map(&fd, size) {
            Ok(addr) => addr,
            Err(e) => {
                let _ = shm_unlink(os_name);
                return Err(alloc_err(os_name, e));
            }
        };

        // Zero initialize
        unsafe {
            std::ptr::write_bytes(addr.as_ptr(), 0, size);
        }

        debug!(name = os_name, bytes = size, "created shared region");
        Ok(Self {
            addr,
            size,
            os_name: os_name.to_string(),
            capability: Capability::Creator,
            unlinked: false,
        })
    }

    fn open_existing(os_name: &str, size: usize) -> Result<Self> {
        let fd = shm_open(os_name, ShmOFlags::RDWR, Mode::empty())
            .map_err(|e| alloc_err(os_name, e))?;

        let stat = fstat(&fd).map_err(|e| alloc_err(os_name, e))?;
        let got = stat.st_size as usize;
        if got != size {
            return Err(LockstepError::ShapeMismatch {
                name: os_name.to_string(),
                expected: size,
                got,
            });
        }

        let addr = map(&fd, size).map_err(|e| alloc_err(os_name, e))?;

        debug!(name = os_name, bytes = size, "opened shared region");
        Ok(Self {
            addr,
            size,
            os_name: os_name.to_string(),
            capability: Capability::Opener,
            unlinked: false,
        })
    }

    /// Remove the OS name of the region.
    ///
    /// Returns `Ok(false)` with a logged warning if it was already unlinked.
    /// The mapping itself stays valid until the handle is dropped, but the
    /// buffer layer refuses all access once this has run.
    pub fn unlink(&mut self) -> Result<bool> {
        if self.capability == Capability::Opener {
            return Err(Violation::UnlinkByOpener.into());
        }
        if self.unlinked {
            warn!(name = %self.os_name, "shared region already unlinked");
            return Ok(false);
        }
        match shm_unlink(self.os_name.as_str()) {
            Ok(()) => {}
            Err(Errno::NOENT) => {
                warn!(name = %self.os_name, "shared region was removed by someone else");
            }
            Err(e) => return Err(alloc_err(&self.os_name, e)),
        }
        self.unlinked = true;
        debug!(name = %self.os_name, "unlinked shared region");
        Ok(true)
    }

    /// Remove a region left behind by an unclean shutdown.
    ///
    /// Returns whether anything was removed.
    pub fn remove_stale(os_name: &str) -> Result<bool> {
        match shm_unlink(os_name) {
            Ok(()) => {
                warn!(name = os_name, "removed stale shared region");
                Ok(true)
            }
            Err(Errno::NOENT) => Ok(false),
            Err(e) => Err(alloc_err(os_name, e)),
        }
    }

    /// Get raw pointer to shared memory
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    /// Get size of shared memory region
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Full OS name of the region
    #[inline(always)]
    pub fn os_name(&self) -> &str {
        &self.os_name
    }

    #[inline(always)]
    pub fn capability(&self) -> Capability {
        self.capability
    }

    #[inline(always)]
    pub fn is_unlinked(&self) -> bool {
        self.unlinked
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.addr.as_ptr().cast(), self.size);
        }

        if self.capability == Capability::Creator && !self.unlinked {
            debug!(name = %self.os_name, "unlinking shared region on drop");
            let _ = shm_unlink(self.os_name.as_str());
        }
    }
}

fn map(fd: &rustix::fd::OwnedFd, size: usize) -> std::result::Result<NonNull<u8>, Errno> {
    let addr = unsafe {
        mmap(
            std::ptr::null_mut(),
            size,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )?
    };
    NonNull::new(addr.cast::<u8>()).ok_or(Errno::NOMEM)
}

fn alloc_err(name: &str, e: Errno) -> LockstepError {
    LockstepError::Allocation {
        name: name.to_string(),
        source: e.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique(tag: &str) -> String {
        format!("/lockstep_test_shm_{}_{}", std::process::id(), tag)
    }

    #[test]
    fn test_create_and_open() {
        let name = unique("create_open");
        let size = 4096;

        let shm1 = SharedRegion::open(&name, size, Capability::Creator).unwrap();
        assert_eq!(shm1.capability(), Capability::Creator);
        assert_eq!(shm1.size(), size);

        unsafe {
            std::ptr::write(shm1.as_ptr(), 42u8);
        }

        // Open from another "process"
        let shm2 = SharedRegion::open(&name, size, Capability::Opener).unwrap();
        assert_eq!(shm2.capability(), Capability::Opener);

        let val = unsafe { std::ptr::read(shm2.as_ptr()) };
        assert_eq!(val, 42u8);

        // Drop shm2 first, then shm1 will unlink
        drop(shm2);
        drop(shm1);
        assert!(SharedRegion::open(&name, size, Capability::Opener).is_err());
    }

    #[test]
    fn test_creator_rejects_live_name() {
        let name = unique("collision");
        let _shm = SharedRegion::open(&name, 64, Capability::Creator).unwrap();
        let err = SharedRegion::open(&name, 64, Capability::Creator)
            .err()
            .unwrap();
        assert!(matches!(err, LockstepError::Allocation { .. }));
    }

    #[test]
    fn test_opener_checks_size() {
        let name = unique("size");
        let _shm = SharedRegion::open(&name, 64, Capability::Creator).unwrap();
        let err = SharedRegion::open(&name, 128, Capability::Opener)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            LockstepError::ShapeMismatch {
                expected: 128,
                got: 64,
                ..
            }
        ));
    }

    #[test]
    fn test_unlink_twice_is_noop() {
        let name = unique("unlink");
        let mut shm = SharedRegion::open(&name, 64, Capability::Creator).unwrap();
        assert!(shm.unlink().unwrap());
        assert!(!shm.unlink().unwrap());
        assert!(shm.is_unlinked());
    }

    #[test]
    fn test_opener_cannot_unlink() {
        let name = unique("opener_unlink");
        let _owner = SharedRegion::open(&name, 64, Capability::Creator).unwrap();
        let mut peer = SharedRegion::open(&name, 64, Capability::Opener).unwrap();
        let err = peer.unlink().unwrap_err();
        assert_eq!(err.violation(), Some(Violation::UnlinkByOpener));
    }

    #[test]
    fn test_remove_stale() {
        let name = unique("stale");
        let shm = SharedRegion::open(&name, 64, Capability::Creator).unwrap();
        std::mem::forget(shm);
        assert!(SharedRegion::remove_stale(&name).unwrap());
        assert!(!SharedRegion::remove_stale(&name).unwrap());
    }
}
