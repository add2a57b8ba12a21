//! Command queue
//!
//! Commands accumulate between ticks and are serialized into the shared
//! command buffer exactly once per handshake cycle, just before `release`.
//! The engine applies them in the order they were enqueued.

use crate::buffer::{BufferSpec, ElementType, Phase, Side, TypedSharedBuffer};
use crate::command::{self, Command, RawCommand, HEADER_LEN};
use crate::error::{LockstepError, Result};
use crate::names;
use crate::shm::Capability;
use tracing::{debug, warn};

fn buffer_specs(capacity: usize) -> (BufferSpec, BufferSpec) {
    (
        BufferSpec::input(names::COMMAND_BUFFER, &[capacity], ElementType::Byte),
        BufferSpec::input(names::COMMAND_READY, &[1], ElementType::Bool),
    )
}

/// FIFO of commands for the next tick, backed by a fixed-capacity shared buffer
pub struct CommandQueue {
    pending: Vec<RawCommand>,
    pending_bytes: usize,
    buffer: TypedSharedBuffer,
    ready: TypedSharedBuffer,
}

impl CommandQueue {
    /// Create the command buffer (`capacity` bytes) and its ready flag
    pub fn create(session_id: &str, capacity: usize, capability: Capability, phase: Phase) -> Result<Self> {
        let (buf_spec, ready_spec) = buffer_specs(capacity);
        let buffer = TypedSharedBuffer::create_or_open(session_id, buf_spec, capability, Side::Control)?
            .with_phase(phase.clone());
        let ready = TypedSharedBuffer::create_or_open(session_id, ready_spec, capability, Side::Control)?
            .with_phase(phase);
        Ok(Self {
            pending: Vec::new(),
            pending_bytes: 0,
            buffer,
            ready,
        })
    }

    /// Capacity of the shared buffer in bytes, header included
    pub fn capacity(&self) -> usize {
        self.buffer.byte_len()
    }

    /// Number of pending commands
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Bytes the next flush would write
    pub fn pending_bytes(&self) -> usize {
        if self.pending.is_empty() {
            0
        } else {
            HEADER_LEN + self.pending_bytes
        }
    }

    /// Append a command.
    ///
    /// Fails with `CommandOverflow`, leaving the queue as it was, if the
    /// serialized queue would no longer fit in the buffer.
    pub fn enqueue(&mut self, command: impl Into<RawCommand>) -> Result<()> {
        let raw = command.into();
        let len = raw.encoded_len();
        let required = HEADER_LEN + self.pending_bytes + len;
        if required > self.capacity() {
            return Err(LockstepError::CommandOverflow {
                capacity: self.capacity(),
                required,
            });
        }
        self.pending_bytes += len;
        self.pending.push(raw);
        Ok(())
    }

    /// Serialize every pending command into the shared buffer and empty the
    /// queue.
    ///
    /// Returns the number of bytes written; an empty queue writes nothing and
    /// lowers the ready flag. The queue is empty afterwards even on failure:
    /// callers re-enqueue and retry the whole cycle rather than single
    /// commands.
    pub fn flush(&mut self) -> Result<usize> {
        let pending = std::mem::take(&mut self.pending);
        self.pending_bytes = 0;

        if pending.is_empty() {
            self.ready.set_flag(false)?;
            return Ok(0);
        }

        let written = match command::encode_into(&pending, self.buffer.bytes_mut()?) {
            Ok(n) => n,
            Err(e) => {
                self.ready.set_flag(false)?;
                return Err(e);
            }
        };
        self.ready.set_flag(true)?;
        debug!(commands = pending.len(), bytes = written, "flushed command queue");
        Ok(written)
    }

    /// Discard pending commands without sending them.
    ///
    /// Returns how many were dropped; a non-empty queue is logged as a
    /// warning.
    pub fn clear(&mut self) -> usize {
        let discarded = self.pending.len();
        if discarded > 0 {
            warn!(discarded, "discarding commands that were never sent");
        }
        self.pending.clear();
        self.pending_bytes = 0;
        discarded
    }

    /// Unlink the command buffer and its flag
    pub fn unlink(&mut self) -> Result<()> {
        self.buffer.unlink()?;
        self.ready.unlink()?;
        Ok(())
    }
}

/// Engine-side reader of the command buffer
pub struct CommandReader {
    buffer: TypedSharedBuffer,
    ready: TypedSharedBuffer,
}

impl CommandReader {
    /// Map the command buffer the control process created
    pub fn open(session_id: &str, capacity: usize, capability: Capability, phase: Phase) -> Result<Self> {
        let (buf_spec, ready_spec) = buffer_specs(capacity);
        let buffer = TypedSharedBuffer::create_or_open(session_id, buf_spec, capability, Side::Remote)?
            .with_phase(phase.clone());
        let ready = TypedSharedBuffer::create_or_open(session_id, ready_spec, capability, Side::Remote)?
            .with_phase(phase);
        Ok(Self { buffer, ready })
    }

    /// Raw commands sent for this tick, in order
    pub fn read_raw(&self) -> Result<Vec<RawCommand>> {
        if !self.ready.flag()? {
            return Ok(Vec::new());
        }
        command::decode(self.buffer.bytes()?)
    }

    /// Typed commands sent for this tick; an unknown tag is an error
    pub fn read(&self) -> Result<Vec<Command>> {
        self.read_raw()?.into_iter().map(Command::try_from).collect()
    }
}
