//! Typed shared buffers
//!
//! A [`TypedSharedBuffer`] is one named, fixed-shape, fixed-dtype region that
//! both processes interpret with the same contract. Nothing is negotiated at
//! runtime: both peers must already agree on name, shape and element type.
//!
//! # Ownership by phase
//!
//! Every buffer records which [`Side`] may touch it right now (its
//! [`Phase`]). The handshake hands the phase to the engine on `release` and
//! back to the control process on a successful `acquire`. Debug builds refuse
//! any access out of phase; all builds refuse writes from the side that is
//! not the buffer's writer.

use crate::error::{LockstepError, Result, Violation};
use crate::names;
use crate::shm::{Capability, SharedRegion};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Element types understood by both peers.
///
/// This is a closed set; adding a variant is a wire format change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    Float32,
    Uint8,
    Byte,
    Bool,
}

impl ElementType {
    /// Size of one element in bytes
    pub const fn size(self) -> usize {
        match self {
            ElementType::Float32 => 4,
            ElementType::Uint8 | ElementType::Byte | ElementType::Bool => 1,
        }
    }
}

/// One-byte boolean as stored in shared memory.
///
/// Any nonzero byte reads as `true`, so a peer writing a value other than 1
/// can never produce an invalid Rust `bool`.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bool8(pub u8);

impl Bool8 {
    pub const FALSE: Bool8 = Bool8(0);
    pub const TRUE: Bool8 = Bool8(1);

    #[inline]
    pub fn get(self) -> bool {
        self.0 != 0
    }
}

impl From<bool> for Bool8 {
    fn from(v: bool) -> Self {
        Bool8(v as u8)
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for f32 {}
    impl Sealed for u8 {}
    impl Sealed for i8 {}
    impl Sealed for super::Bool8 {}
}

/// Rust type a buffer can be viewed as.
///
/// Implemented only for types where every bit pattern is valid.
pub trait Element: Copy + sealed::Sealed + 'static {
    const TYPE: ElementType;
}

impl Element for f32 {
    const TYPE: ElementType = ElementType::Float32;
}

impl Element for u8 {
    const TYPE: ElementType = ElementType::Uint8;
}

impl Element for i8 {
    const TYPE: ElementType = ElementType::Byte;
}

impl Element for Bool8 {
    const TYPE: ElementType = ElementType::Bool;
}

/// One of the two processes taking part in a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Control,
    Remote,
}

impl Side {
    pub fn peer(self) -> Side {
        match self {
            Side::Control => Side::Remote,
            Side::Remote => Side::Control,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Side::Control => 0,
            Side::Remote => 1,
        }
    }

    fn from_u8(v: u8) -> Side {
        if v == 0 {
            Side::Control
        } else {
            Side::Remote
        }
    }
}

/// Which side currently holds the session's buffers.
///
/// Cloned into every buffer of a session and flipped by the handshake.
#[derive(Debug, Clone)]
pub struct Phase(Arc<AtomicU8>);

impl Phase {
    pub fn new(holder: Side) -> Self {
        Phase(Arc::new(AtomicU8::new(holder.to_u8())))
    }

    /// The side the buffers are currently writable by
    #[inline]
    pub fn holder(&self) -> Side {
        Side::from_u8(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn hand_to(&self, side: Side) {
        self.0.store(side.to_u8(), Ordering::Release);
    }
}

/// Who writes a buffer during a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Written by the engine, read-only to the control process
    State,
    /// Written by the control process, read by the engine
    Input,
}

impl BufferKind {
    pub fn writer(self) -> Side {
        match self {
            BufferKind::State => Side::Remote,
            BufferKind::Input => Side::Control,
        }
    }
}

/// Name, shape and dtype of a buffer, agreed between both peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub element_type: ElementType,
    pub kind: BufferKind,
}

impl BufferSpec {
    /// An engine-written state buffer
    pub fn state(name: &str, shape: &[usize], element_type: ElementType) -> Self {
        Self {
            name: name.to_string(),
            shape: shape.to_vec(),
            element_type,
            kind: BufferKind::State,
        }
    }

    /// A control-written input buffer
    pub fn input(name: &str, shape: &[usize], element_type: ElementType) -> Self {
        Self {
            name: name.to_string(),
            shape: shape.to_vec(),
            element_type,
            kind: BufferKind::Input,
        }
    }

    /// Number of elements
    pub fn len(&self) -> Result<usize> {
        if self.shape.is_empty() || self.shape.contains(&0) {
            return Err(LockstepError::InvalidShape(self.shape.clone()));
        }
        self.shape
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| LockstepError::InvalidShape(self.shape.clone()))
    }

    /// Size of the backing region in bytes
    pub fn byte_len(&self) -> Result<usize> {
        self.len()?
            .checked_mul(self.element_type.size())
            .ok_or_else(|| LockstepError::InvalidShape(self.shape.clone()))
    }
}

/// A named, fixed-shape, fixed-dtype shared memory region
pub struct TypedSharedBuffer {
    spec: BufferSpec,
    len: usize,
    side: Side,
    phase: Phase,
    region: SharedRegion,
}

impl TypedSharedBuffer {
    /// Create (or map, for an opener) the buffer `spec` in `session_id`.
    ///
    /// The handle belongs to `side` and starts with a private phase held by
    /// that side; use [`with_phase`](Self::with_phase) to join a session.
    pub fn create_or_open(
        session_id: &str,
        spec: BufferSpec,
        capability: Capability,
        side: Side,
    ) -> Result<Self> {
        let len = spec.len()?;
        let byte_len = spec.byte_len()?;
        let os_name = names::shm_name(session_id, &spec.name)?;
        let region = SharedRegion::open(&os_name, byte_len, capability)?;
        Ok(Self {
            spec,
            len,
            side,
            phase: Phase::new(side),
            region,
        })
    }

    /// Attach this buffer to a session's phase
    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.spec.shape
    }

    pub fn element_type(&self) -> ElementType {
        self.spec.element_type
    }

    pub fn kind(&self) -> BufferKind {
        self.spec.kind
    }

    pub fn spec(&self) -> &BufferSpec {
        &self.spec
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn byte_len(&self) -> usize {
        self.region.size()
    }

    pub fn os_name(&self) -> &str {
        self.region.os_name()
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn is_unlinked(&self) -> bool {
        self.region.is_unlinked()
    }

    /// Raw base pointer, for C callers that manage phases themselves
    pub fn as_ptr(&self) -> *mut u8 {
        self.region.as_ptr()
    }

    /// Read-only view as `T`, laid out in row-major order over `shape`
    pub fn view<T: Element>(&self) -> Result<&[T]> {
        self.check_type::<T>()?;
        self.check_access()?;
        Ok(unsafe { std::slice::from_raw_parts(self.region.as_ptr() as *const T, self.len) })
    }

    /// Mutable view as `T`. Only the buffer's writer may take one.
    pub fn view_mut<T: Element>(&mut self) -> Result<&mut [T]> {
        self.check_type::<T>()?;
        self.check_write()?;
        Ok(unsafe { std::slice::from_raw_parts_mut(self.region.as_ptr() as *mut T, self.len) })
    }

    /// The region as raw bytes, whatever its dtype
    pub fn bytes(&self) -> Result<&[u8]> {
        self.check_access()?;
        Ok(unsafe { std::slice::from_raw_parts(self.region.as_ptr(), self.region.size()) })
    }

    pub fn bytes_mut(&mut self) -> Result<&mut [u8]> {
        self.check_write()?;
        Ok(unsafe { std::slice::from_raw_parts_mut(self.region.as_ptr(), self.region.size()) })
    }

    /// Copy `data` into the buffer. `data` must cover the whole shape.
    pub fn write<T: Element>(&mut self, data: &[T]) -> Result<()> {
        if data.len() != self.len {
            return Err(LockstepError::ShapeMismatch {
                name: self.spec.name.clone(),
                expected: self.len * T::TYPE.size(),
                got: std::mem::size_of_val(data),
            });
        }
        self.view_mut::<T>()?.copy_from_slice(data);
        Ok(())
    }

    /// Copy the buffer out
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        Ok(self.view::<T>()?.to_vec())
    }

    /// First element of a bool buffer
    pub fn flag(&self) -> Result<bool> {
        Ok(self.view::<Bool8>()?[0].get())
    }

    /// Set the first element of a bool buffer
    pub fn set_flag(&mut self, value: bool) -> Result<()> {
        self.view_mut::<Bool8>()?[0] = Bool8::from(value);
        Ok(())
    }

    /// Unlink the backing OS object.
    ///
    /// A second call is a no-op that logs a warning and returns `Ok(false)`.
    /// Every access after the first call fails with `UseAfterUnlink`.
    pub fn unlink(&mut self) -> Result<bool> {
        self.region.unlink()
    }

    fn check_type<T: Element>(&self) -> Result<()> {
        if T::TYPE != self.spec.element_type {
            return Err(Violation::WrongElementType.into());
        }
        Ok(())
    }

    fn check_access(&self) -> Result<()> {
        if self.region.is_unlinked() {
            return Err(Violation::UseAfterUnlink.into());
        }
        if cfg!(debug_assertions) && self.phase.holder() != self.side {
            return Err(Violation::OutOfPhase.into());
        }
        Ok(())
    }

    fn check_write(&self) -> Result<()> {
        self.check_access()?;
        if self.spec.kind.writer() != self.side {
            return Err(Violation::WrongWriter.into());
        }
        Ok(())
    }
}

impl std::fmt::Debug for TypedSharedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedSharedBuffer")
            .field("name", &self.spec.name)
            .field("shape", &self.spec.shape)
            .field("element_type", &self.spec.element_type)
            .field("kind", &self.spec.kind)
            .field("side", &self.side)
            .finish()
    }
}
