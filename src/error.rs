//! Error types for lockstep IPC

use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for lockstep IPC operations
pub type Result<T> = std::result::Result<T, LockstepError>;

/// Local misuse of the protocol. Always a programming error on the caller's side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    /// `release()` called again before the matching `acquire()`
    DoubleRelease,
    /// `acquire()` called with no release outstanding
    AcquireWithoutRelease,
    /// The channel already failed (stall or crash) and cannot be reused
    ChannelFailed,
    /// A buffer was accessed after it was unlinked
    UseAfterUnlink,
    /// This side is not the writer of the buffer
    WrongWriter,
    /// The buffer was viewed as a different element type than it was created with
    WrongElementType,
    /// The buffer was touched while the other process owns it
    OutOfPhase,
    /// `tick()` called before the first `reset()`
    TickBeforeReset,
    /// Only the creating side may unlink a region
    UnlinkByOpener,
    /// The session was already torn down
    TornDown,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Violation::DoubleRelease => "release called twice without an intervening acquire",
            Violation::AcquireWithoutRelease => "acquire called with no outstanding release",
            Violation::ChannelFailed => "handshake channel has failed and must not be reused",
            Violation::UseAfterUnlink => "buffer used after unlink",
            Violation::WrongWriter => "buffer is not writable from this side",
            Violation::WrongElementType => "buffer viewed with the wrong element type",
            Violation::OutOfPhase => "buffer accessed while the peer owns it",
            Violation::TickBeforeReset => "reset must be called before tick",
            Violation::UnlinkByOpener => "only the creating side may unlink a region",
            Violation::TornDown => "session already torn down",
        };
        f.write_str(msg)
    }
}

/// Errors that can occur in lockstep IPC operations
#[derive(Debug, Error)]
pub enum LockstepError {
    /// Shared memory or semaphore could not be created, opened, sized or mapped
    #[error("Failed to allocate '{name}': {source}")]
    Allocation {
        name: String,
        #[source]
        source: io::Error,
    },

    /// An opened region does not have the size its shape/dtype implies
    #[error("Shared region '{name}' has {got} bytes, expected {expected}")]
    ShapeMismatch {
        name: String,
        expected: usize,
        got: usize,
    },

    /// Shape is empty, has a zero dimension, or overflows
    #[error("Invalid shape {0:?}")]
    InvalidShape(Vec<usize>),

    /// OS object name exceeds the platform limit
    #[error("Name too long: max {max} chars, got {got}")]
    NameTooLong { max: usize, got: usize },

    /// Local misuse of the protocol
    #[error("Protocol violation: {0}")]
    ProtocolViolation(Violation),

    /// Remote process is alive but did not complete the tick in time
    #[error("Engine process is still running but did not respond within {timeout:?}; is it frozen?")]
    EngineStall { timeout: Duration },

    /// Remote process exited before completing the tick
    #[error("Engine process exited while waiting for the tick to complete")]
    EngineCrash,

    /// Serialized commands do not fit in the command buffer
    #[error("Command buffer overflow: capacity {capacity} bytes, required {required} bytes")]
    CommandOverflow { capacity: usize, required: usize },

    /// No buffer registered under that name
    #[error("No buffer named '{0}'")]
    NotFound(String),

    /// Command buffer carries a tag this build does not know
    #[error("Unknown command tag {0}")]
    UnknownCommandTag(u32),

    /// Command buffer could not be parsed
    #[error("Malformed command buffer: {0}")]
    MalformedCommandBuffer(&'static str),

    /// The configured tick cap was reached
    #[error("The designated tick limit has been reached: {ticks} tick(s)")]
    TickLimitReached { ticks: u64 },

    /// The engine never posted its loading signal
    #[error("Timed out after {timeout:?} waiting for the engine to load")]
    LoadTimeout { timeout: Duration },

    /// The engine binary could not be spawned
    #[error("Failed to spawn engine process: {0}")]
    Spawn(#[source] io::Error),

    /// Posting or waiting on a semaphore failed at the OS level
    #[error("Semaphore '{name}' failed: {source}")]
    Semaphore {
        name: String,
        #[source]
        source: io::Error,
    },
}

impl LockstepError {
    /// Whether the session this error came from must be abandoned
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LockstepError::EngineStall { .. }
                | LockstepError::EngineCrash
                | LockstepError::ProtocolViolation(Violation::ChannelFailed)
        )
    }

    /// The protocol violation carried by this error, if any
    pub fn violation(&self) -> Option<Violation> {
        match self {
            LockstepError::ProtocolViolation(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<Violation> for LockstepError {
    fn from(v: Violation) -> Self {
        LockstepError::ProtocolViolation(v)
    }
}
