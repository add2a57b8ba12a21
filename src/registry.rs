//! Session-scoped buffer registry

use crate::buffer::{BufferKind, BufferSpec, Element, ElementType, Phase, Side, TypedSharedBuffer};
use crate::error::{LockstepError, Result};
use crate::shm::Capability;
use std::collections::HashMap;
use std::io;
use tracing::{debug, warn};

/// Read-only view of an engine-written state buffer
#[derive(Debug, Clone, Copy)]
pub struct StateView<'a>(&'a TypedSharedBuffer);

impl<'a> StateView<'a> {
    pub fn name(&self) -> &'a str {
        self.0.name()
    }

    pub fn shape(&self) -> &'a [usize] {
        self.0.shape()
    }

    pub fn element_type(&self) -> ElementType {
        self.0.element_type()
    }

    pub fn view<T: Element>(&self) -> Result<&'a [T]> {
        self.0.view()
    }

    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        self.0.to_vec()
    }
}

/// Allocates and looks up buffers by name within one session.
///
/// Names are namespaced by the session id, so two sessions on one host never
/// share a region. Nothing is pooled across sessions.
pub struct BufferRegistry {
    session_id: String,
    side: Side,
    capability: Capability,
    phase: Phase,
    buffers: HashMap<String, TypedSharedBuffer>,
}

impl BufferRegistry {
    pub fn new(session_id: &str, side: Side, capability: Capability, phase: Phase) -> Self {
        Self {
            session_id: session_id.to_string(),
            side,
            capability,
            phase,
            buffers: HashMap::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Create (or map) a buffer and register it under its name
    pub fn allocate(&mut self, spec: BufferSpec) -> Result<&mut TypedSharedBuffer> {
        if self.buffers.contains_key(&spec.name) {
            return Err(LockstepError::Allocation {
                name: spec.name.clone(),
                source: io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "buffer already allocated in this session",
                ),
            });
        }
        let name = spec.name.clone();
        let buffer = TypedSharedBuffer::create_or_open(&self.session_id, spec, self.capability, self.side)?
            .with_phase(self.phase.clone());
        debug!(session = %self.session_id, name = %name, bytes = buffer.byte_len(), "allocated buffer");
        Ok(self.buffers.entry(name).or_insert(buffer))
    }

    /// Allocate an engine-written buffer and return its read-only view
    pub fn allocate_state(
        &mut self,
        name: &str,
        shape: &[usize],
        element_type: ElementType,
    ) -> Result<StateView<'_>> {
        let buffer = self.allocate(BufferSpec::state(name, shape, element_type))?;
        Ok(StateView(buffer))
    }

    /// Allocate a control-written buffer
    pub fn allocate_input(
        &mut self,
        name: &str,
        shape: &[usize],
        element_type: ElementType,
    ) -> Result<&mut TypedSharedBuffer> {
        self.allocate(BufferSpec::input(name, shape, element_type))
    }

    pub fn get(&self, name: &str) -> Result<&TypedSharedBuffer> {
        self.buffers
            .get(name)
            .ok_or_else(|| LockstepError::NotFound(name.to_string()))
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut TypedSharedBuffer> {
        self.buffers
            .get_mut(name)
            .ok_or_else(|| LockstepError::NotFound(name.to_string()))
    }

    /// Read-only view of a state buffer
    pub fn state(&self, name: &str) -> Result<StateView<'_>> {
        let buffer = self.get(name)?;
        if buffer.kind() != BufferKind::State {
            return Err(LockstepError::NotFound(name.to_string()));
        }
        Ok(StateView(buffer))
    }

    /// Every state buffer, keyed by name
    pub fn states(&self) -> impl Iterator<Item = (&str, StateView<'_>)> {
        self.buffers
            .iter()
            .filter(|(_, b)| b.kind() == BufferKind::State)
            .map(|(name, b)| (name.as_str(), StateView(b)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.buffers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Unregister a buffer, unlinking it if this side created it
    pub fn release(&mut self, name: &str) -> Result<()> {
        let mut buffer = self
            .buffers
            .remove(name)
            .ok_or_else(|| LockstepError::NotFound(name.to_string()))?;
        if self.capability == Capability::Creator {
            buffer.unlink()?;
        }
        Ok(())
    }

    /// Unlink every buffer this side created.
    ///
    /// Keeps going past failures and returns the first one.
    pub fn unlink_all(&mut self) -> Result<usize> {
        if self.capability != Capability::Creator {
            return Ok(0);
        }
        let mut unlinked = 0;
        let mut first_err = None;
        for (name, buffer) in self.buffers.iter_mut() {
            match buffer.unlink() {
                Ok(true) => unlinked += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(name = %name, error = %e, "failed to unlink buffer");
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(unlinked),
        }
    }
}
