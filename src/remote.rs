//! Engine side of a session
//!
//! The engine maps what the control process created and runs the mirror of
//! its loop: publish a frame, wait for input, apply the reset flag and the
//! commands, write the state buffers, publish again. The first publish
//! announces the initial frame and needs no input.

use crate::buffer::{BufferSpec, ElementType, Phase, Side, TypedSharedBuffer};
use crate::command::{Command, RawCommand};
use crate::error::Result;
use crate::handshake::{ChannelState, HandshakeChannel, LivenessProbe};
use crate::names;
use crate::queue::CommandReader;
use crate::registry::BufferRegistry;
use crate::shm::Capability;
use std::time::Duration;
use tracing::debug;

/// Engine-side handle on a session's shared objects
pub struct EngineLink {
    channel: HandshakeChannel,
    commands: CommandReader,
    registry: BufferRegistry,
}

impl EngineLink {
    /// Map the session's semaphores, command buffer and reset flag.
    ///
    /// `command_capacity` must match the control side's configuration.
    pub fn open(session_id: &str, command_capacity: usize) -> Result<Self> {
        let capability = Capability::peer_for_platform();
        let phase = Phase::new(Side::Remote);

        let channel =
            HandshakeChannel::open(session_id, Side::Remote, capability)?.with_phase(phase.clone());
        let commands = CommandReader::open(session_id, command_capacity, capability, phase.clone())?;
        let mut registry = BufferRegistry::new(session_id, Side::Remote, capability, phase);
        registry.allocate(BufferSpec::input(names::RESET_BUFFER, &[1], ElementType::Bool))?;

        debug!(session = session_id, "engine link open");
        Ok(Self {
            channel,
            commands,
            registry,
        })
    }

    /// Probe for the control process, consulted when input does not arrive
    pub fn with_probe(mut self, probe: impl LivenessProbe + 'static) -> Self {
        self.channel.set_probe(Box::new(probe));
        self
    }

    /// Hand the finished frame to the control process
    pub fn publish_frame(&mut self) -> Result<()> {
        self.channel.release()
    }

    /// Block until the control process sends the next tick's input
    pub fn wait_for_input(&mut self, timeout: Duration) -> Result<()> {
        self.channel.acquire(timeout)
    }

    /// Whether the control process asked for a level reset this tick
    pub fn reset_requested(&self) -> Result<bool> {
        self.registry.get(names::RESET_BUFFER)?.flag()
    }

    /// Commands sent this tick, in order
    pub fn commands(&self) -> Result<Vec<Command>> {
        self.commands.read()
    }

    /// Commands sent this tick without tag validation
    pub fn raw_commands(&self) -> Result<Vec<RawCommand>> {
        self.commands.read_raw()
    }

    /// Map a buffer the control process allocated
    pub fn map(&mut self, spec: BufferSpec) -> Result<&mut TypedSharedBuffer> {
        self.registry.allocate(spec)
    }

    /// Map a state buffer the control process allocated
    pub fn map_state(
        &mut self,
        name: &str,
        shape: &[usize],
        element_type: ElementType,
    ) -> Result<&mut TypedSharedBuffer> {
        self.map(BufferSpec::state(name, shape, element_type))
    }

    pub fn state_mut(&mut self, name: &str) -> Result<&mut TypedSharedBuffer> {
        self.registry.get_mut(name)
    }

    pub fn registry(&self) -> &BufferRegistry {
        &self.registry
    }

    pub fn channel_state(&self) -> ChannelState {
        self.channel.state()
    }
}
