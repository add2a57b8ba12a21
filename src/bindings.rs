//! C bindings for the engine side
//!
//! Lets an engine written in another language join a session: open the
//! session's shared objects, publish frames, wait for input and map buffers
//! by name. The command buffer is mapped like any other buffer
//! (`COMMAND_BUFFER`, bytes; `COMMAND_READY`, one bool) and decoded by the
//! engine.

use crate::buffer::{BufferSpec, ElementType};
use crate::error::LockstepError;
use crate::remote::EngineLink;
use std::ffi::CStr;
use std::os::raw::c_char;
use std::ptr;
use std::slice;
use std::time::Duration;
use tracing::warn;

pub const LOCKSTEP_OK: i32 = 0;
pub const LOCKSTEP_ERR: i32 = -1;
pub const LOCKSTEP_STALL: i32 = -2;
pub const LOCKSTEP_CRASH: i32 = -3;
pub const LOCKSTEP_PROTOCOL: i32 = -4;

// Opaque handle
pub struct LockstepEngineHandle(EngineLink);

fn status(err: &LockstepError) -> i32 {
    match err {
        LockstepError::EngineStall { .. } => LOCKSTEP_STALL,
        LockstepError::EngineCrash => LOCKSTEP_CRASH,
        LockstepError::ProtocolViolation(_) => LOCKSTEP_PROTOCOL,
        _ => LOCKSTEP_ERR,
    }
}

fn element_type(raw: u32) -> Option<ElementType> {
    match raw {
        0 => Some(ElementType::Float32),
        1 => Some(ElementType::Uint8),
        2 => Some(ElementType::Byte),
        3 => Some(ElementType::Bool),
        _ => None,
    }
}

unsafe fn str_arg<'a>(s: *const c_char) -> Option<&'a str> {
    if s.is_null() {
        return None;
    }
    CStr::from_ptr(s).to_str().ok()
}

/// Open the engine side of a session
///
/// # Safety
/// `session_id` must be a valid null-terminated string
#[no_mangle]
pub unsafe extern "C" fn lockstep_engine_open(
    session_id: *const c_char,
    command_capacity: usize,
) -> *mut LockstepEngineHandle {
    let Some(sid) = str_arg(session_id) else {
        return ptr::null_mut();
    };
    match EngineLink::open(sid, command_capacity) {
        Ok(link) => Box::into_raw(Box::new(LockstepEngineHandle(link))),
        Err(e) => {
            warn!(error = %e, "engine open failed");
            ptr::null_mut()
        }
    }
}

/// Close an engine handle. Pointers from `lockstep_engine_map_buffer` become
/// invalid.
///
/// # Safety
/// `handle` must come from `lockstep_engine_open` and not be used afterwards
#[no_mangle]
pub unsafe extern "C" fn lockstep_engine_close(handle: *mut LockstepEngineHandle) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// Signal that the frame is done and state buffers are written
///
/// # Safety
/// `handle` must be a live handle from `lockstep_engine_open`
#[no_mangle]
pub unsafe extern "C" fn lockstep_engine_publish(handle: *mut LockstepEngineHandle) -> i32 {
    if handle.is_null() {
        return LOCKSTEP_ERR;
    }
    match (*handle).0.publish_frame() {
        Ok(()) => LOCKSTEP_OK,
        Err(e) => status(&e),
    }
}

/// Wait for the control side's next input, at most `timeout_ms`
///
/// # Safety
/// `handle` must be a live handle from `lockstep_engine_open`
#[no_mangle]
pub unsafe extern "C" fn lockstep_engine_wait(
    handle: *mut LockstepEngineHandle,
    timeout_ms: u64,
) -> i32 {
    if handle.is_null() {
        return LOCKSTEP_ERR;
    }
    match (*handle).0.wait_for_input(Duration::from_millis(timeout_ms)) {
        Ok(()) => LOCKSTEP_OK,
        Err(e) => status(&e),
    }
}

/// 1 if a reset was requested this tick, 0 if not, negative on error
///
/// # Safety
/// `handle` must be a live handle from `lockstep_engine_open`
#[no_mangle]
pub unsafe extern "C" fn lockstep_engine_reset_requested(
    handle: *mut LockstepEngineHandle,
) -> i32 {
    if handle.is_null() {
        return LOCKSTEP_ERR;
    }
    match (*handle).0.reset_requested() {
        Ok(flag) => flag as i32,
        Err(e) => status(&e),
    }
}

/// Map a buffer the control side created and return its address.
///
/// `element_type_raw`: 0 = f32, 1 = u8, 2 = i8, 3 = bool (one byte).
/// `writable` maps a state buffer the engine fills; otherwise the buffer is
/// control input and must only be read. The byte length is stored in
/// `out_len`. Returns null on failure.
///
/// # Safety
/// `name` must be a valid null-terminated string, `shape` must point to
/// `ndim` values and `out_len` must be null or valid for writes
#[no_mangle]
pub unsafe extern "C" fn lockstep_engine_map_buffer(
    handle: *mut LockstepEngineHandle,
    name: *const c_char,
    element_type_raw: u32,
    shape: *const usize,
    ndim: usize,
    writable: bool,
    out_len: *mut usize,
) -> *mut u8 {
    if handle.is_null() || shape.is_null() {
        return ptr::null_mut();
    }
    let (Some(name), Some(dtype)) = (str_arg(name), element_type(element_type_raw)) else {
        return ptr::null_mut();
    };
    let shape = slice::from_raw_parts(shape, ndim);
    let spec = if writable {
        BufferSpec::state(name, shape, dtype)
    } else {
        BufferSpec::input(name, shape, dtype)
    };

    let link = &mut (*handle).0;
    let mapped = if link.registry().contains(name) {
        link.state_mut(name)
    } else {
        link.map(spec)
    };
    match mapped {
        Ok(buffer) => {
            if !out_len.is_null() {
                *out_len = buffer.byte_len();
            }
            buffer.as_ptr()
        }
        Err(e) => {
            warn!(name = %name, error = %e, "map buffer failed");
            ptr::null_mut()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Session, SessionConfig};
    use std::ffi::CString;

    #[test]
    fn test_engine_over_c_abi() {
        let sid = format!("ffi{}", std::process::id());
        let mut session = Session::create(
            SessionConfig::default()
                .with_session_id(&sid)
                .with_command_capacity(1024)
                .with_tick_timeout(Duration::from_secs(5)),
        )
        .unwrap();
        session.allocate_state("OBS", &[4], ElementType::Uint8).unwrap();

        let c_sid = CString::new(sid).unwrap();
        let c_name = CString::new("OBS").unwrap();
        let shape = [4usize];
        unsafe {
            let h = lockstep_engine_open(c_sid.as_ptr(), 1024);
            assert!(!h.is_null());

            let mut len = 0usize;
            let obs = lockstep_engine_map_buffer(
                h,
                c_name.as_ptr(),
                1,
                shape.as_ptr(),
                1,
                true,
                &mut len,
            );
            assert!(!obs.is_null());
            assert_eq!(len, 4);
            ptr::copy_nonoverlapping([1u8, 2, 3, 4].as_ptr(), obs, 4);

            // acquire without a prior release
            assert_eq!(lockstep_engine_wait(h, 10), LOCKSTEP_PROTOCOL);
            assert_eq!(lockstep_engine_publish(h), LOCKSTEP_OK);
            session.start(None).unwrap();
            assert_eq!(session.state("OBS").unwrap().to_vec::<u8>().unwrap(), vec![1, 2, 3, 4]);

            assert!(lockstep_engine_open(ptr::null(), 1024).is_null());
            assert_eq!(lockstep_engine_publish(ptr::null_mut()), LOCKSTEP_ERR);
            lockstep_engine_close(h);
        }
    }
}
