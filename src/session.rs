//! Control-side session
//!
//! Drives the engine through reset and tick cycles using the handshake
//! channel, the command queue and the buffer registry. One tick is:
//! flush the queue into shared memory, release, then acquire with a bounded
//! wait.

use crate::buffer::{BufferKind, Element, ElementType, Phase, Side, TypedSharedBuffer};
use crate::command::Command;
use crate::error::{LockstepError, Result, Violation};
use crate::handshake::{ChannelState, HandshakeChannel, LivenessProbe};
use crate::launch::{EngineProcess, LoadingSignal};
use crate::names;
use crate::queue::CommandQueue;
use crate::registry::{BufferRegistry, StateView};
use crate::shm::Capability;
use crate::teardown::Teardown;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default command buffer capacity (1MB)
const DEFAULT_COMMAND_CAPACITY: usize = 1024 * 1024;

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Discriminator in every OS object name; empty for a single session.
    /// May not contain `_`, `/` or NUL.
    pub session_id: String,
    /// Size of the command buffer in bytes
    pub command_capacity: usize,
    /// Bound on each acquire
    pub tick_timeout: Duration,
    /// Bound on waiting for the engine's loading signal
    pub load_timeout: Duration,
    /// Uncounted ticks run after raising the reset flag, before agents are
    /// respawned. The engine needs a few frames to finish tearing the level
    /// down; validate this against the engine's reset handling.
    pub reset_settle_ticks: u32,
    /// Extra uncounted ticks after respawning, so the level can settle
    pub pre_start_steps: u32,
    /// Stop with `TickLimitReached` after this many user ticks
    pub max_ticks: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_id: String::new(),
            command_capacity: DEFAULT_COMMAND_CAPACITY,
            tick_timeout: Duration::from_secs(60),
            load_timeout: Duration::from_secs(10),
            reset_settle_ticks: 3,
            pre_start_steps: 2,
            max_ticks: None,
        }
    }
}

impl SessionConfig {
    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = id.into();
        self
    }

    pub fn with_tick_timeout(mut self, timeout: Duration) -> Self {
        self.tick_timeout = timeout;
        self
    }

    pub fn with_max_ticks(mut self, max: u64) -> Self {
        self.max_ticks = Some(max);
        self
    }

    pub fn with_command_capacity(mut self, bytes: usize) -> Self {
        self.command_capacity = bytes;
        self
    }
}

/// Control side of one engine session
pub struct Session {
    config: SessionConfig,
    registry: BufferRegistry,
    channel: HandshakeChannel,
    queue: CommandQueue,
    initial_commands: Vec<Command>,
    user_ticks: u64,
    has_reset: bool,
    teardown: Teardown,
}

impl Session {
    /// Create every shared object of the session: semaphores, command
    /// buffers and the reset flag.
    ///
    /// The engine must not be started before this returns, since it maps
    /// what is created here.
    pub fn create(config: SessionConfig) -> Result<Self> {
        let sid = config.session_id.clone();
        let capability = Capability::for_platform();
        let phase = Phase::new(Side::Control);

        let channel =
            HandshakeChannel::open(&sid, Side::Control, capability)?.with_phase(phase.clone());
        let queue = CommandQueue::create(&sid, config.command_capacity, capability, phase.clone())?;

        let mut registry = BufferRegistry::new(&sid, Side::Control, capability, phase);
        registry
            .allocate_input(names::RESET_BUFFER, &[1], ElementType::Bool)?
            .set_flag(false)?;

        info!(session = %sid, "session created");
        Ok(Self {
            config,
            registry,
            channel,
            queue,
            initial_commands: Vec::new(),
            user_ticks: 0,
            has_reset: false,
            teardown: Teardown::new(),
        })
    }

    /// Create the session, spawn the engine, wait for it to load and for its
    /// first frame.
    ///
    /// The engine is killed when the session is torn down.
    pub fn launch(config: SessionConfig, command: std::process::Command) -> Result<Self> {
        let mut session = Self::create(config)?;
        let loading = LoadingSignal::create(&session.config.session_id)?;
        let engine = EngineProcess::spawn(command, &session.config.session_id)?;
        session.attach_engine(engine);
        session.start(Some(loading))?;
        Ok(session)
    }

    /// Use `engine` for stall/crash detection and kill it on teardown
    pub fn attach_engine(&mut self, engine: Arc<EngineProcess>) {
        self.channel.set_probe(Box::new(engine.probe()));
        self.teardown.register("kill engine", move || {
            engine.kill().map_err(|e| e.to_string())
        });
    }

    /// Probe consulted when a tick times out
    pub fn set_probe(&mut self, probe: impl LivenessProbe + 'static) {
        self.channel.set_probe(Box::new(probe));
    }

    /// Wait for the loading signal (if any), then for the engine's first
    /// frame. The engine signals that frame on its own, without a release.
    pub fn start(&mut self, loading: Option<LoadingSignal>) -> Result<()> {
        self.ensure_open()?;
        if let Some(loading) = loading {
            loading.wait(self.config.load_timeout)?;
        }
        self.channel.expect_peer_signal()?;
        self.channel.acquire(self.config.tick_timeout)?;
        debug!(session = %self.config.session_id, "engine delivered first frame");
        Ok(())
    }

    /// Command sent on every reset, e.g. agent spawns
    pub fn add_initial_command(&mut self, command: Command) {
        self.initial_commands.push(command);
    }

    /// Reinitialize the simulation.
    ///
    /// Discards unsent commands, raises the reset flag, runs the settle
    /// ticks, resends the initial commands and runs the pre-start ticks.
    /// None of these ticks count toward `max_ticks`.
    pub fn reset(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.has_reset = true;

        // warns if anything was still queued
        self.queue.clear();

        self.registry.get_mut(names::RESET_BUFFER)?.set_flag(true)?;
        for i in 0..self.config.reset_settle_ticks.max(1) {
            self.cycle()?;
            if i == 0 {
                // the engine consumed the flag during that tick
                self.registry.get_mut(names::RESET_BUFFER)?.set_flag(false)?;
            }
        }

        for command in &self.initial_commands {
            self.queue.enqueue(command)?;
        }
        for _ in 0..=self.config.pre_start_steps {
            self.cycle()?;
        }

        self.user_ticks = 0;
        info!(session = %self.config.session_id, "reset complete");
        Ok(())
    }

    /// Advance the engine by one frame
    pub fn tick(&mut self) -> Result<()> {
        self.ensure_open()?;
        if !self.has_reset {
            return Err(Violation::TickBeforeReset.into());
        }
        self.cycle()?;
        self.user_ticks += 1;
        if let Some(max) = self.config.max_ticks {
            if self.user_ticks >= max {
                return Err(LockstepError::TickLimitReached {
                    ticks: self.user_ticks,
                });
            }
        }
        Ok(())
    }

    /// Advance the engine by `n` frames
    pub fn tick_n(&mut self, n: u32) -> Result<()> {
        for _ in 0..n {
            self.tick()?;
        }
        Ok(())
    }

    fn cycle(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.queue.flush()?;
        self.channel.release()?;
        self.channel.acquire(self.config.tick_timeout)
    }

    /// Queue a command for the next tick
    pub fn enqueue(&mut self, command: Command) -> Result<()> {
        self.ensure_open()?;
        self.queue.enqueue(command)
    }

    /// Spawn a non-main agent now. Agents that must survive a reset belong
    /// in [`add_initial_command`](Self::add_initial_command).
    pub fn spawn_agent(
        &mut self,
        agent_type: &str,
        name: &str,
        location: [f32; 3],
        rotation: [f32; 3],
    ) -> Result<()> {
        self.enqueue(Command::spawn_agent(agent_type, name, location, rotation))
    }

    /// Spawn a prop; see [`Command::spawn_prop`]
    #[allow(clippy::too_many_arguments)]
    pub fn spawn_prop(
        &mut self,
        prop_type: &str,
        location: [f32; 3],
        rotation: [f32; 3],
        scale: f32,
        sim_physics: bool,
        material: &str,
        tag: &str,
    ) -> Result<()> {
        self.enqueue(Command::spawn_prop(
            prop_type,
            location,
            rotation,
            scale,
            sim_physics,
            material,
            tag,
        ))
    }

    pub fn move_viewport(&mut self, location: [f32; 3], rotation: [f32; 3]) -> Result<()> {
        self.enqueue(Command::TeleportCamera { location, rotation })
    }

    pub fn set_render_viewport(&mut self, enabled: bool) -> Result<()> {
        self.enqueue(Command::RenderViewport { enabled })
    }

    /// 0 = low .. 3 = epic; higher values are clamped
    pub fn set_render_quality(&mut self, level: u8) -> Result<()> {
        self.enqueue(Command::RenderQuality { level: level.min(3) })
    }

    /// Send a world command. Worlds that do not know `name` will exit.
    pub fn send_world_command(
        &mut self,
        name: &str,
        num_params: Vec<f32>,
        string_params: Vec<String>,
    ) -> Result<()> {
        self.enqueue(Command::world(name, num_params, string_params))
    }

    /// Allocate an engine-written buffer
    pub fn allocate_state(
        &mut self,
        name: &str,
        shape: &[usize],
        element_type: ElementType,
    ) -> Result<StateView<'_>> {
        self.ensure_open()?;
        self.registry.allocate_state(name, shape, element_type)
    }

    pub fn state(&self, name: &str) -> Result<StateView<'_>> {
        self.registry.state(name)
    }

    /// Allocate a control-written buffer, e.g. an action vector the engine
    /// reads on its next frame
    pub fn allocate_input(
        &mut self,
        name: &str,
        shape: &[usize],
        element_type: ElementType,
    ) -> Result<&mut TypedSharedBuffer> {
        self.ensure_open()?;
        if name == names::RESET_BUFFER {
            return Err(reserved(name));
        }
        self.registry.allocate_input(name, shape, element_type)
    }

    /// Writable handle to an input buffer.
    ///
    /// Writes through it go through the usual phase and writer checks, so
    /// they fail while the engine holds the turn. State buffers and the
    /// reset flag are not reachable here.
    pub fn input_mut(&mut self, name: &str) -> Result<&mut TypedSharedBuffer> {
        self.ensure_open()?;
        if name == names::RESET_BUFFER {
            return Err(reserved(name));
        }
        let buffer = self.registry.get_mut(name)?;
        if buffer.kind() != BufferKind::Input {
            return Err(Violation::WrongWriter.into());
        }
        Ok(buffer)
    }

    /// Copy `data` into an input buffer for the next tick
    pub fn write_input<T: Element>(&mut self, name: &str, data: &[T]) -> Result<()> {
        self.input_mut(name)?.write(data)
    }

    /// Tick once and return `(reward, terminal)` from the task buffer
    pub fn step(&mut self, task: &str) -> Result<(f32, bool)> {
        self.tick()?;
        self.task_state(task)
    }

    /// `(reward, terminal)` from a task buffer of at least two floats
    pub fn task_state(&self, name: &str) -> Result<(f32, bool)> {
        let task = self.registry.state(name)?.view::<f32>()?;
        if task.len() < 2 {
            return Err(LockstepError::ShapeMismatch {
                name: name.to_string(),
                expected: 8,
                got: task.len() * 4,
            });
        }
        Ok((task[0], task[1] != 0.0))
    }

    pub fn registry(&self) -> &BufferRegistry {
        &self.registry
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Ticks since the last reset
    pub fn user_ticks(&self) -> u64 {
        self.user_ticks
    }

    pub fn channel_state(&self) -> ChannelState {
        self.channel.state()
    }

    /// Extra shutdown work, run once at teardown before the session's own
    /// hooks registered earlier
    pub fn on_teardown<F>(&mut self, label: &'static str, hook: F)
    where
        F: FnOnce() -> std::result::Result<(), String> + Send + 'static,
    {
        self.teardown.register(label, hook);
    }

    pub fn is_closed(&self) -> bool {
        self.teardown.is_torn_down()
    }

    /// Unlink every buffer and semaphore, then run the teardown hooks.
    ///
    /// Runs once; later calls are no-ops. Every step runs even if an earlier
    /// one failed, and the first failure is returned.
    pub fn close(&mut self) -> Result<()> {
        if self.teardown.is_torn_down() {
            return Ok(());
        }

        let mut first_err = None;
        if let Err(e) = self.queue.unlink() {
            first_err.get_or_insert(e);
        }
        if let Err(e) = self.registry.unlink_all() {
            first_err.get_or_insert(e);
        }
        if let Err(e) = self.channel.unlink() {
            first_err.get_or_insert(e);
        }
        self.teardown.run();

        info!(session = %self.config.session_id, "session closed");
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Refuse work on a closed session or a failed channel, before any
    /// buffer is touched. After a failed acquire the phase stays with the
    /// engine, so buffer access would report the wrong error.
    fn ensure_open(&self) -> Result<()> {
        if self.teardown.is_torn_down() {
            return Err(Violation::TornDown.into());
        }
        if self.channel.state() == ChannelState::Failed {
            return Err(Violation::ChannelFailed.into());
        }
        Ok(())
    }
}

fn reserved(name: &str) -> LockstepError {
    LockstepError::Allocation {
        name: name.to_string(),
        source: std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "reserved for the reset flag",
        ),
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "session teardown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferSpec;
    use crate::remote::EngineLink;
    use std::thread::{self, JoinHandle};

    const TASK: &str = "TASK";

    fn session(tag: &str) -> String {
        format!("ss{}{}", std::process::id(), tag)
    }

    fn config(sid: &str) -> SessionConfig {
        SessionConfig::default()
            .with_session_id(sid)
            .with_command_capacity(4096)
            .with_tick_timeout(Duration::from_secs(5))
    }

    struct EngineLog {
        resets: usize,
        commands: Vec<Command>,
    }

    /// Serves `frames` ticks after its initial frame. The task buffer holds
    /// the frames since the last reset and whether that reached `frames`.
    fn fake_engine(sid: String, frames: usize) -> JoinHandle<EngineLog> {
        thread::spawn(move || {
            let mut link = EngineLink::open(&sid, 4096).unwrap();
            link.map_state(TASK, &[2], ElementType::Float32).unwrap();
            link.publish_frame().unwrap();

            let mut log = EngineLog {
                resets: 0,
                commands: Vec::new(),
            };
            let mut since_reset = 0usize;
            for _ in 0..frames {
                link.wait_for_input(Duration::from_secs(5)).unwrap();
                if link.reset_requested().unwrap() {
                    log.resets += 1;
                    since_reset = 0;
                }
                log.commands.extend(link.commands().unwrap());
                since_reset += 1;
                let terminal = if since_reset >= frames { 1.0 } else { 0.0 };
                link.state_mut(TASK)
                    .unwrap()
                    .write(&[since_reset as f32, terminal])
                    .unwrap();
                link.publish_frame().unwrap();
            }
            log
        })
    }

    #[test]
    fn test_reset_then_ticks() {
        let sid = session("run");
        let mut s = Session::create(config(&sid)).unwrap();
        s.allocate_state(TASK, &[2], ElementType::Float32).unwrap();
        let spawn = Command::spawn_agent("Agent", "bot", [0.0; 3], [0.0; 3]);
        s.add_initial_command(spawn.clone());

        // 3 settle + 3 pre-start + 2 user ticks
        let engine = fake_engine(sid.clone(), 8);
        s.start(None).unwrap();

        s.set_render_quality(9).unwrap();
        s.reset().unwrap();
        assert_eq!(s.user_ticks(), 0);

        s.move_viewport([1.0, 2.0, 3.0], [0.0; 3]).unwrap();
        s.tick_n(2).unwrap();
        assert_eq!(s.user_ticks(), 2);
        assert_eq!(s.task_state(TASK).unwrap(), (8.0, true));

        let log = engine.join().unwrap();
        assert_eq!(log.resets, 1);
        // the quality command was queued before reset and discarded
        assert_eq!(
            log.commands,
            vec![
                spawn,
                Command::TeleportCamera {
                    location: [1.0, 2.0, 3.0],
                    rotation: [0.0; 3],
                },
            ]
        );
        s.close().unwrap();
    }

    /// Rewards each frame with the sum of the action the control side wrote
    fn action_engine(sid: String, frames: usize) -> JoinHandle<Vec<Vec<f32>>> {
        thread::spawn(move || {
            let mut link = EngineLink::open(&sid, 4096).unwrap();
            link.map_state(TASK, &[2], ElementType::Float32).unwrap();
            link.map(BufferSpec::input("ACTION", &[2], ElementType::Float32))
                .unwrap();
            link.publish_frame().unwrap();

            let mut seen = Vec::new();
            for frame in 1..=frames {
                link.wait_for_input(Duration::from_secs(5)).unwrap();
                let action = link.registry().get("ACTION").unwrap().to_vec::<f32>().unwrap();
                let terminal = if frame == frames { 1.0 } else { 0.0 };
                link.state_mut(TASK)
                    .unwrap()
                    .write(&[action.iter().sum::<f32>(), terminal])
                    .unwrap();
                seen.push(action);
                link.publish_frame().unwrap();
            }
            seen
        })
    }

    #[test]
    fn test_step_with_actions() {
        let sid = session("act");
        let mut cfg = config(&sid);
        cfg.reset_settle_ticks = 1;
        cfg.pre_start_steps = 0;
        let mut s = Session::create(cfg).unwrap();
        s.allocate_state(TASK, &[2], ElementType::Float32).unwrap();
        s.allocate_input("ACTION", &[2], ElementType::Float32).unwrap();

        // 2 reset ticks + 2 steps
        let engine = action_engine(sid.clone(), 4);
        s.start(None).unwrap();
        s.reset().unwrap();

        s.write_input("ACTION", &[1.0f32, 2.0]).unwrap();
        assert_eq!(s.step(TASK).unwrap(), (3.0, false));

        s.input_mut("ACTION").unwrap().view_mut::<f32>().unwrap()[0] = 0.5;
        assert_eq!(s.step(TASK).unwrap(), (2.5, true));
        assert_eq!(s.user_ticks(), 2);

        let seen = engine.join().unwrap();
        assert_eq!(&seen[2..], &[vec![1.0, 2.0], vec![0.5, 2.0]]);
        s.close().unwrap();
    }

    #[test]
    fn test_input_access_is_limited_to_inputs() {
        let mut s = Session::create(config(&session("inacc"))).unwrap();
        s.allocate_state(TASK, &[2], ElementType::Float32).unwrap();
        s.allocate_input("ACTION", &[3], ElementType::Uint8).unwrap();

        assert_eq!(
            s.input_mut(TASK).unwrap_err().violation(),
            Some(Violation::WrongWriter)
        );
        assert!(s.input_mut(names::RESET_BUFFER).is_err());
        assert!(s.allocate_input(names::RESET_BUFFER, &[1], ElementType::Bool).is_err());
        assert!(matches!(
            s.input_mut("MISSING"),
            Err(LockstepError::NotFound(_))
        ));
        assert!(matches!(
            s.write_input("ACTION", &[1u8, 2]),
            Err(LockstepError::ShapeMismatch { .. })
        ));
        assert_eq!(
            s.write_input("ACTION", &[1.0f32, 2.0, 3.0]).unwrap_err().violation(),
            Some(Violation::WrongElementType)
        );
        s.write_input("ACTION", &[1u8, 2, 3]).unwrap();
        assert_eq!(
            s.registry().get("ACTION").unwrap().to_vec::<u8>().unwrap(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn test_tick_before_reset() {
        let mut s = Session::create(config(&session("early"))).unwrap();
        assert_eq!(
            s.tick().unwrap_err().violation(),
            Some(Violation::TickBeforeReset)
        );
    }

    #[test]
    fn test_max_ticks() {
        let sid = session("max");
        let mut cfg = config(&sid).with_max_ticks(2);
        cfg.reset_settle_ticks = 1;
        cfg.pre_start_steps = 0;
        let mut s = Session::create(cfg).unwrap();
        s.allocate_state(TASK, &[2], ElementType::Float32).unwrap();

        let engine = fake_engine(sid.clone(), 4);
        s.start(None).unwrap();
        s.reset().unwrap();
        s.tick().unwrap();
        assert!(matches!(
            s.tick(),
            Err(LockstepError::TickLimitReached { ticks: 2 })
        ));
        engine.join().unwrap();
    }

    #[test]
    fn test_dead_engine_fails_tick() {
        let sid = session("dead");
        let mut s =
            Session::create(config(&sid).with_tick_timeout(Duration::from_millis(100))).unwrap();
        s.allocate_state(TASK, &[2], ElementType::Float32).unwrap();

        // publishes the initial frame, then exits
        fake_engine(sid.clone(), 0).join().unwrap();
        s.start(None).unwrap();

        assert!(matches!(s.reset(), Err(LockstepError::EngineCrash)));
        assert_eq!(s.channel_state(), ChannelState::Failed);
        assert_eq!(s.tick().unwrap_err().violation(), Some(Violation::ChannelFailed));

        // every later entry point reports the terminal failure, in any build
        let err = s.reset().unwrap_err();
        assert_eq!(err.violation(), Some(Violation::ChannelFailed));
        assert!(err.is_terminal());
        assert!(s.tick().unwrap_err().is_terminal());
        assert!(s.step(TASK).unwrap_err().is_terminal());
        assert!(s.input_mut("ACTION").unwrap_err().is_terminal());
        s.close().unwrap();
    }

    #[test]
    fn test_stalled_engine_fails_tick() {
        let sid = session("stall");
        let mut s =
            Session::create(config(&sid).with_tick_timeout(Duration::from_millis(100))).unwrap();
        s.allocate_state(TASK, &[2], ElementType::Float32).unwrap();
        s.set_probe(|| true);

        fake_engine(sid.clone(), 0).join().unwrap();
        s.start(None).unwrap();
        assert!(matches!(s.reset(), Err(LockstepError::EngineStall { .. })));
    }

    #[test]
    fn test_close_once() {
        let sid = session("close");
        let mut s = Session::create(config(&sid)).unwrap();
        let hooks = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let h = hooks.clone();
        s.on_teardown("count", move || {
            h.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        });

        s.close().unwrap();
        s.close().unwrap();
        assert!(s.is_closed());
        assert_eq!(
            s.enqueue(Command::RenderViewport { enabled: false })
                .unwrap_err()
                .violation(),
            Some(Violation::TornDown)
        );
        assert_eq!(hooks.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(EngineLink::open(&sid, 4096).is_err());

        // the names are free again
        let again = Session::create(config(&sid));
        assert!(again.is_ok());
    }
}
