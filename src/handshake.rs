//! Acquire/release tick protocol
//!
//! Two named semaphores per session: one posted by the control process when
//! its input for the next tick is in shared memory, one posted by the engine
//! when the tick is done and the state buffers are written.
//!
//! The channel is a strict ping-pong. At most one release is outstanding at a
//! time, because the engine overwrites state buffers in place: a second
//! release before the matching acquire would let it start writing a buffer
//! the control process is still reading.
//!
//! ```text
//!   Idle ──release──▶ AwaitingRemote ──acquire ok──▶ Ready ──release──▶ AwaitingRemote ...
//!                           │
//!                           └──timeout──▶ Failed (terminal)
//! ```

use crate::buffer::{Phase, Side};
use crate::error::{LockstepError, Result, Violation};
use crate::names;
use crate::semaphore::{self, NamedSemaphore};
use crate::shm::Capability;
use rustix::io::Errno;
use rustix::process::{test_kill_process, Pid};
use std::time::Duration;
use tracing::{debug, error, trace};

/// Tells a stalled engine apart from a dead one
pub trait LivenessProbe: Send {
    fn is_alive(&self) -> bool;
}

impl<F> LivenessProbe for F
where
    F: Fn() -> bool + Send,
{
    fn is_alive(&self) -> bool {
        self()
    }
}

/// Liveness of an arbitrary process id, via `kill(pid, 0)`.
///
/// A zombie still counts as alive here; when the engine is our own child,
/// prefer [`EngineProcess`](crate::launch::EngineProcess), which reaps it.
#[derive(Debug, Clone, Copy)]
pub struct PidProbe {
    pid: Pid,
}

impl PidProbe {
    pub fn new(raw: i32) -> Option<Self> {
        if raw <= 0 {
            return None;
        }
        Pid::from_raw(raw).map(|pid| Self { pid })
    }
}

impl LivenessProbe for PidProbe {
    fn is_alive(&self) -> bool {
        match test_kill_process(self.pid) {
            Ok(()) => true,
            // exists, but belongs to someone else
            Err(Errno::PERM) => true,
            Err(_) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No release outstanding; this side may write its input
    Idle,
    /// Released; waiting for the peer to finish the tick
    AwaitingRemote,
    /// Peer finished; state buffers are safe to read until the next release
    Ready,
    /// Timed out; the session must be torn down
    Failed,
}

/// Semaphore pair driving one tick per release/acquire cycle
pub struct HandshakeChannel {
    side: Side,
    outgoing: NamedSemaphore,
    incoming: NamedSemaphore,
    state: ChannelState,
    phase: Phase,
    probe: Option<Box<dyn LivenessProbe>>,
}

impl HandshakeChannel {
    /// Open the session's semaphore pair from `side`.
    pub fn open(session_id: &str, side: Side, capability: Capability) -> Result<Self> {
        let control_ready = names::sem_name(names::CONTROL_READY_SEM, session_id)?;
        let remote_done = names::sem_name(names::REMOTE_DONE_SEM, session_id)?;

        let (out_name, in_name) = match side {
            Side::Control => (control_ready, remote_done),
            Side::Remote => (remote_done, control_ready),
        };
        let outgoing = NamedSemaphore::open(&out_name, capability)?;
        let incoming = NamedSemaphore::open(&in_name, capability)?;

        debug!(session = session_id, ?side, "handshake channel open");
        Ok(Self {
            side,
            outgoing,
            incoming,
            state: ChannelState::Idle,
            phase: Phase::new(side),
            probe: None,
        })
    }

    /// Probe consulted when an acquire times out
    pub fn with_probe(mut self, probe: impl LivenessProbe + 'static) -> Self {
        self.probe = Some(Box::new(probe));
        self
    }

    pub fn set_probe(&mut self, probe: Box<dyn LivenessProbe>) {
        self.probe = Some(probe);
    }

    /// Share `phase` with the buffers this channel guards
    pub fn with_phase(mut self, phase: Phase) -> Self {
        phase.hand_to(self.phase.holder());
        self.phase = phase;
        self
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// The peer owes a signal without a release from this side.
    ///
    /// Used once at startup, when the engine announces its first frame on its
    /// own.
    pub fn expect_peer_signal(&mut self) -> Result<()> {
        match self.state {
            ChannelState::Failed => Err(Violation::ChannelFailed.into()),
            ChannelState::AwaitingRemote => Err(Violation::DoubleRelease.into()),
            ChannelState::Idle | ChannelState::Ready => {
                self.phase.hand_to(self.side.peer());
                self.state = ChannelState::AwaitingRemote;
                Ok(())
            }
        }
    }

    /// Signal the peer that this side's input is in shared memory.
    ///
    /// Never blocks. Must follow the command flush, and must not be called
    /// again before a successful [`acquire`](Self::acquire).
    pub fn release(&mut self) -> Result<()> {
        match self.state {
            ChannelState::Failed => return Err(Violation::ChannelFailed.into()),
            ChannelState::AwaitingRemote => return Err(Violation::DoubleRelease.into()),
            ChannelState::Idle | ChannelState::Ready => {}
        }

        self.phase.hand_to(self.side.peer());
        if let Err(e) = self.outgoing.post() {
            self.state = ChannelState::Failed;
            return Err(e);
        }
        self.state = ChannelState::AwaitingRemote;
        trace!(side = ?self.side, "released");
        Ok(())
    }

    /// Block until the peer finishes the tick, or `timeout` elapses.
    ///
    /// On timeout the channel moves to `Failed` and the error says whether
    /// the peer is still running (`EngineStall`) or gone (`EngineCrash`).
    /// Without a probe the peer is assumed dead.
    pub fn acquire(&mut self, timeout: Duration) -> Result<()> {
        match self.state {
            ChannelState::Failed => return Err(Violation::ChannelFailed.into()),
            ChannelState::Idle | ChannelState::Ready => {
                return Err(Violation::AcquireWithoutRelease.into())
            }
            ChannelState::AwaitingRemote => {}
        }

        let (signalled, elapsed) = match semaphore::timed_wait(&self.incoming, timeout) {
            Ok(r) => r,
            Err(e) => {
                self.state = ChannelState::Failed;
                return Err(e);
            }
        };

        if signalled {
            self.phase.hand_to(self.side);
            self.state = ChannelState::Ready;
            trace!(side = ?self.side, elapsed_us = elapsed.as_micros() as u64, "acquired");
            return Ok(());
        }

        self.state = ChannelState::Failed;
        let alive = self.probe.as_ref().map(|p| p.is_alive()).unwrap_or(false);
        if alive {
            error!(
                timeout_ms = timeout.as_millis() as u64,
                "peer is running but did not complete the tick"
            );
            Err(LockstepError::EngineStall { timeout })
        } else {
            error!(
                timeout_ms = timeout.as_millis() as u64,
                "peer exited before completing the tick"
            );
            Err(LockstepError::EngineCrash)
        }
    }

    /// Unlink both semaphores. Creator only.
    pub fn unlink(&mut self) -> Result<()> {
        self.outgoing.unlink()?;
        self.incoming.unlink()?;
        Ok(())
    }
}
