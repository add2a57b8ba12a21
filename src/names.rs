//! OS object naming
//!
//! Every shared memory region and semaphore name is derived here from the
//! session identifier, so the control process and the engine can never
//! disagree on a path. Including the session id in every name keeps
//! concurrent sessions on one host apart, and keeps stale objects left by a
//! crashed session from being picked up by a new one.
//!
//! A region name is `SHM_PREFIX`, the session id, `_`, then the buffer name.
//! Session ids may not contain `_`, so the first `_` after the prefix always
//! ends the session id and distinct (session, buffer) pairs never share a
//! name. Buffer names may contain `_`.

use crate::error::{LockstepError, Result};
use std::io;

/// Prefix of every shared memory region
pub const SHM_PREFIX: &str = "/LOCKSTEP_MEM";

/// Semaphore posted by the control process when input is ready
pub const CONTROL_READY_SEM: &str = "/LOCKSTEP_SEM_CONTROL";

/// Semaphore posted by the engine when a tick is complete
pub const REMOTE_DONE_SEM: &str = "/LOCKSTEP_SEM_REMOTE";

/// One-shot semaphore posted by the engine once it has loaded
pub const LOADING_SEM: &str = "/LOCKSTEP_LOADING_SEM";

/// Single-bool buffer asking the engine to reinitialize the simulation
pub const RESET_BUFFER: &str = "RESET";

/// Byte buffer carrying the serialized command queue
pub const COMMAND_BUFFER: &str = "COMMAND_BUFFER";

/// Single-bool buffer telling the engine whether this tick carries commands
pub const COMMAND_READY: &str = "COMMAND_READY";

/// POSIX limit on shm object names (NAME_MAX)
pub const MAX_SHM_NAME_LEN: usize = 255;

/// glibc prepends "sem." to semaphore names under /dev/shm
pub const MAX_SEM_NAME_LEN: usize = 251;

/// Full OS name of a shared memory region
pub fn shm_name(session_id: &str, name: &str) -> Result<String> {
    check_session_id(session_id)?;
    check_component(name)?;
    let full = format!("{}{}_{}", SHM_PREFIX, session_id, name);
    check_len(&full, MAX_SHM_NAME_LEN)?;
    Ok(full)
}

/// Full OS name of a session-scoped semaphore
pub fn sem_name(base: &str, session_id: &str) -> Result<String> {
    check_session_id(session_id)?;
    let full = format!("{}{}", base, session_id);
    check_len(&full, MAX_SEM_NAME_LEN)?;
    Ok(full)
}

fn check_len(full: &str, max: usize) -> Result<()> {
    if full.len() > max {
        return Err(LockstepError::NameTooLong {
            max,
            got: full.len(),
        });
    }
    Ok(())
}

/// Session ids follow the buffer-name rules and additionally exclude the
/// `_` delimiter
pub fn check_session_id(session_id: &str) -> Result<()> {
    check_component(session_id)?;
    if session_id.contains('_') {
        return Err(LockstepError::Allocation {
            name: session_id.to_string(),
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                "session ids may not contain '_'",
            ),
        });
    }
    Ok(())
}

fn check_component(part: &str) -> Result<()> {
    if part.contains('/') || part.contains('\0') {
        return Err(LockstepError::Allocation {
            name: part.to_string(),
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                "names may not contain '/' or NUL",
            ),
        });
    }
    Ok(())
}
