//! Lockstep IPC - drive an external simulation engine frame by frame
//!
//! A control process and an engine process exchange typed buffers through
//! POSIX shared memory and take turns through a pair of named semaphores.
//! Every handshake advances the engine by exactly one frame.
//!
//! # Architecture
//!
//! - **Buffers**: named, fixed-shape regions; state buffers are written by the
//!   engine, input buffers by the control process
//! - **Handshake**: `release` hands the turn to the peer, `acquire` waits for
//!   it to come back, bounded by a timeout that tells a stall from a crash
//! - **Commands**: queued between ticks and serialized into one shared
//!   buffer just before `release`
//!
//! # Per tick
//!
//! ```text
//!   control: flush ─▶ release ─┐                    ┌─▶ acquire ─▶ read state
//!                              ▼                    │
//!   engine:              acquire ─▶ apply ─▶ write ─▶ release
//! ```

pub mod error;
pub mod names;
pub mod shm;
pub mod buffer;
pub mod registry;
pub mod semaphore;
pub mod handshake;
pub mod command;
pub mod queue;
pub mod teardown;
pub mod launch;
pub mod session;
pub mod remote;
pub mod bindings;

pub use buffer::{Bool8, BufferKind, BufferSpec, Element, ElementType, Side, TypedSharedBuffer};
pub use command::{Command, CommandTag, RawCommand};
pub use error::{LockstepError, Result, Violation};
pub use handshake::{ChannelState, HandshakeChannel, LivenessProbe, PidProbe};
pub use launch::{EngineProcess, LoadingSignal};
pub use queue::{CommandQueue, CommandReader};
pub use registry::{BufferRegistry, StateView};
pub use remote::EngineLink;
pub use session::{Session, SessionConfig};
pub use shm::Capability;
