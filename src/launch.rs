//! Engine launch boundary
//!
//! Starting the engine binary is outside the tick protocol; this module only
//! provides what the protocol needs from it: the one-shot loading signal the
//! engine posts once it is ready, and a liveness probe for the spawned
//! process.

use crate::error::{LockstepError, Result};
use crate::handshake::LivenessProbe;
use crate::names;
use crate::semaphore::NamedSemaphore;
use crate::shm::Capability;
use std::process::{Child, Command};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Argument prefix the engine reads its session id from
pub const SESSION_ARG: &str = "--session-id=";

/// One-shot "engine loaded" semaphore
pub struct LoadingSignal {
    sem: NamedSemaphore,
}

impl LoadingSignal {
    /// Create the signal (value 0) before spawning the engine
    pub fn create(session_id: &str) -> Result<Self> {
        let name = names::sem_name(names::LOADING_SEM, session_id)?;
        Ok(Self {
            sem: NamedSemaphore::open(&name, Capability::Creator)?,
        })
    }

    /// Engine side: open the signal the control process created
    pub fn open(session_id: &str) -> Result<Self> {
        let name = names::sem_name(names::LOADING_SEM, session_id)?;
        Ok(Self {
            sem: NamedSemaphore::open(&name, Capability::Opener)?,
        })
    }

    /// Engine side: announce that loading finished
    pub fn post(&self) -> Result<()> {
        self.sem.post()
    }

    /// Wait for the engine to post, then unlink the signal
    pub fn wait(mut self, timeout: Duration) -> Result<()> {
        let loaded = self.sem.wait_timeout(timeout)?;
        if let Err(e) = self.sem.unlink() {
            warn!(error = %e, "failed to unlink loading signal");
        }
        if !loaded {
            return Err(LockstepError::LoadTimeout { timeout });
        }
        debug!("engine loaded");
        Ok(())
    }
}

/// A spawned engine process
pub struct EngineProcess {
    child: Mutex<Child>,
    pid: u32,
}

impl EngineProcess {
    /// Spawn `command` with the session id appended as `--session-id=<id>`
    pub fn spawn(mut command: Command, session_id: &str) -> Result<Arc<Self>> {
        command.arg(format!("{}{}", SESSION_ARG, session_id));
        let child = command.spawn().map_err(LockstepError::Spawn)?;
        let pid = child.id();
        info!(pid, session = session_id, "spawned engine process");
        Ok(Arc::new(Self {
            child: Mutex::new(child),
            pid,
        }))
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether the process is still running. Reaps it if it exited.
    pub fn is_running(&self) -> bool {
        let mut child = match self.child.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        matches!(child.try_wait(), Ok(None))
    }

    /// Kill and reap the process. A process that already exited is fine.
    pub fn kill(&self) -> Result<()> {
        let mut child = match self.child.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Ok(Some(status)) = child.try_wait() {
            debug!(pid = self.pid, %status, "engine already exited");
            return Ok(());
        }
        child.kill().map_err(LockstepError::Spawn)?;
        let status = child.wait().map_err(LockstepError::Spawn)?;
        info!(pid = self.pid, %status, "engine process stopped");
        Ok(())
    }

    /// Liveness probe sharing this process handle
    pub fn probe(self: &Arc<Self>) -> ProcessProbe {
        ProcessProbe(Arc::clone(self))
    }
}

/// Liveness of a spawned engine; zombies count as dead
pub struct ProcessProbe(Arc<EngineProcess>);

impl LivenessProbe for ProcessProbe {
    fn is_alive(&self) -> bool {
        self.0.is_running()
    }
}

/// Session id argument from an engine's command line, if present
pub fn session_id_from_args<I, S>(args: I) -> Option<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    args.into_iter()
        .find_map(|a| a.as_ref().strip_prefix(SESSION_ARG).map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn session(tag: &str) -> String {
        format!("ld{}{}", std::process::id(), tag)
    }

    #[test]
    fn test_loading_signal_posted_by_engine() {
        let sid = session("ok");
        let signal = LoadingSignal::create(&sid).unwrap();
        let engine_sid = sid.clone();
        let engine = thread::spawn(move || {
            let s = LoadingSignal::open(&engine_sid).unwrap();
            s.post().unwrap();
        });
        signal.wait(Duration::from_secs(5)).unwrap();
        engine.join().unwrap();
        // unlinked after use
        assert!(LoadingSignal::open(&sid).is_err());
    }

    #[test]
    fn test_loading_signal_times_out() {
        let sid = session("slow");
        let signal = LoadingSignal::create(&sid).unwrap();
        assert!(matches!(
            signal.wait(Duration::from_millis(30)),
            Err(LockstepError::LoadTimeout { .. })
        ));
    }

    #[test]
    fn test_session_arg_round_trip() {
        let args = ["engine", "world", "--session-id=abc123"];
        assert_eq!(session_id_from_args(args), Some("abc123".to_string()));
        assert_eq!(session_id_from_args(["engine"]), None);
    }

    #[test]
    fn test_engine_process_liveness() {
        // sh takes the appended session arg as $1 and ignores it
        let mut sh = Command::new("sh");
        sh.arg("-c").arg("sleep 30").arg("engine");

        let proc = EngineProcess::spawn(sh, "x").unwrap();
        let probe = proc.probe();
        assert!(probe.is_alive());
        proc.kill().unwrap();
        assert!(!probe.is_alive());
        proc.kill().unwrap();
    }
}
