//! Named POSIX semaphores
//!
//! rustix does not wrap `sem_open` (it lives in libc, not the kernel ABI), so
//! this module goes through `libc` directly.

use crate::error::{LockstepError, Result, Violation};
use crate::shm::Capability;
use std::ffi::CString;
use std::io;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Handle to a named semaphore
pub struct NamedSemaphore {
    sem: *mut libc::sem_t,
    name: String,
    c_name: CString,
    capability: Capability,
    unlinked: bool,
}

// SAFETY: sem_post/sem_wait are thread-safe on a valid sem_t
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    /// Create (exclusively, value 0) or open `name` according to `capability`
    pub fn open(name: &str, capability: Capability) -> Result<Self> {
        let c_name = CString::new(name).map_err(|e| LockstepError::Allocation {
            name: name.to_string(),
            source: io::Error::new(io::ErrorKind::InvalidInput, e),
        })?;

        let sem = unsafe {
            match capability {
                Capability::Creator => libc::sem_open(
                    c_name.as_ptr(),
                    libc::O_CREAT | libc::O_EXCL,
                    0o600 as libc::c_uint,
                    0 as libc::c_uint,
                ),
                Capability::Opener => libc::sem_open(c_name.as_ptr(), 0),
            }
        };
        if sem == libc::SEM_FAILED {
            return Err(LockstepError::Allocation {
                name: name.to_string(),
                source: io::Error::last_os_error(),
            });
        }

        debug!(name = %name, ?capability, "opened semaphore");
        Ok(Self {
            sem,
            name: name.to_string(),
            c_name,
            capability,
            unlinked: false,
        })
    }

    /// Increment the semaphore. Never blocks.
    pub fn post(&self) -> Result<()> {
        if unsafe { libc::sem_post(self.sem) } != 0 {
            return Err(self.os_err());
        }
        Ok(())
    }

    /// Decrement without blocking. Returns whether a post was consumed.
    pub fn try_wait(&self) -> Result<bool> {
        loop {
            if unsafe { libc::sem_trywait(self.sem) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => return Ok(false),
                Some(libc::EINTR) => continue,
                _ => return Err(self.wrap(err)),
            }
        }
    }

    /// Decrement, blocking for at most `timeout`.
    ///
    /// Returns `Ok(false)` on timeout. The timeout is measured on the
    /// monotonic clock. sem_timedwait itself takes a CLOCK_REALTIME deadline,
    /// so when the wall clock jumps forward and the wait ends early, the
    /// deadline is rebuilt from the time actually left. A backward jump
    /// during a wait cannot be detected and lengthens it by the size of the
    /// jump.
    #[cfg(target_os = "linux")]
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        let start = Instant::now();
        loop {
            let left = timeout.saturating_sub(start.elapsed());
            let deadline = realtime_deadline(left).map_err(|e| self.wrap(e))?;
            if unsafe { libc::sem_timedwait(self.sem, &deadline) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::ETIMEDOUT) => {
                    if start.elapsed() >= timeout {
                        return Ok(false);
                    }
                    debug!(name = %self.name, "realtime deadline passed early, waiting again");
                }
                Some(libc::EINTR) => continue,
                _ => return Err(self.wrap(err)),
            }
        }
    }

    /// Decrement, blocking for at most `timeout`.
    ///
    /// Platforms without `sem_timedwait` poll with a short sleep.
    #[cfg(not(target_os = "linux"))]
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        let start = Instant::now();
        loop {
            if self.try_wait()? {
                return Ok(true);
            }
            if start.elapsed() >= timeout {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_micros(200));
        }
    }

    /// Remove the semaphore's name. Only the creator may do this; a second
    /// call is a logged no-op.
    pub fn unlink(&mut self) -> Result<bool> {
        if self.capability == Capability::Opener {
            return Err(Violation::UnlinkByOpener.into());
        }
        if self.unlinked {
            warn!(name = %self.name, "semaphore already unlinked");
            return Ok(false);
        }
        if unsafe { libc::sem_unlink(self.c_name.as_ptr()) } != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(LockstepError::Allocation {
                    name: self.name.clone(),
                    source: err,
                });
            }
            warn!(name = %self.name, "semaphore was removed by someone else");
        }
        self.unlinked = true;
        Ok(true)
    }

    /// Remove a semaphore left behind by an unclean shutdown
    pub fn remove_stale(name: &str) -> Result<bool> {
        let c_name = CString::new(name).map_err(|e| LockstepError::Allocation {
            name: name.to_string(),
            source: io::Error::new(io::ErrorKind::InvalidInput, e),
        })?;
        if unsafe { libc::sem_unlink(c_name.as_ptr()) } == 0 {
            warn!(name = %name, "removed stale semaphore");
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ENOENT) => Ok(false),
            _ => Err(LockstepError::Allocation {
                name: name.to_string(),
                source: err,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    fn os_err(&self) -> LockstepError {
        self.wrap(io::Error::last_os_error())
    }

    fn wrap(&self, source: io::Error) -> LockstepError {
        LockstepError::Semaphore {
            name: self.name.clone(),
            source,
        }
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.sem);
        }
        if self.capability == Capability::Creator && !self.unlinked {
            debug!(name = %self.name, "unlinking semaphore on drop");
            unsafe {
                libc::sem_unlink(self.c_name.as_ptr());
            }
        }
    }
}

/// Absolute CLOCK_REALTIME deadline `timeout` from now, as sem_timedwait wants
#[cfg(target_os = "linux")]
fn realtime_deadline(timeout: Duration) -> io::Result<libc::timespec> {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(deadline_after(now, timeout))
}

#[cfg(target_os = "linux")]
fn deadline_after(now: libc::timespec, timeout: Duration) -> libc::timespec {
    let mut sec = now.tv_sec as i64 + timeout.as_secs().min(i64::MAX as u64 / 2) as i64;
    let mut nsec = now.tv_nsec as i64 + timeout.subsec_nanos() as i64;
    if nsec >= 1_000_000_000 {
        sec += 1;
        nsec -= 1_000_000_000;
    }
    libc::timespec {
        tv_sec: sec as libc::time_t,
        tv_nsec: nsec as _,
    }
}

/// Wait on `sem` until `timeout`, reporting the elapsed time
pub(crate) fn timed_wait(sem: &NamedSemaphore, timeout: Duration) -> Result<(bool, Duration)> {
    let start = Instant::now();
    let signalled = sem.wait_timeout(timeout)?;
    Ok((signalled, start.elapsed()))
}
