//! Fake engine
//!
//! Speaks the engine side of the protocol: announces it loaded, publishes a
//! first frame, then applies commands and writes a task buffer and a small
//! camera image every tick. Started by the `control` demo with
//! `--session-id=<id>`.

use lockstep_ipc::launch::{session_id_from_args, LoadingSignal};
use lockstep_ipc::{Command, ElementType, EngineLink};
use std::time::Duration;
use tracing::{info, warn};

const COMMAND_CAPACITY: usize = 1024 * 1024;
const EPISODE_FRAMES: u32 = 200;
const CAMERA: [usize; 3] = [16, 16, 3];

fn main() -> lockstep_ipc::Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    let session_id = session_id_from_args(std::env::args()).unwrap_or_default();
    info!(session = %session_id, "engine starting");

    let mut link = EngineLink::open(&session_id, COMMAND_CAPACITY)?;
    link.map_state("TASK", &[2], ElementType::Float32)?;
    link.map_state("CAMERA", &CAMERA, ElementType::Uint8)?;

    match LoadingSignal::open(&session_id) {
        Ok(loading) => loading.post()?,
        Err(e) => warn!(error = %e, "no loading signal, control side started us by hand"),
    }
    link.publish_frame()?;

    let mut frame = 0u32;
    let mut agents = 0usize;
    let mut camera = [0.0f32; 3];
    loop {
        if let Err(e) = link.wait_for_input(Duration::from_secs(60)) {
            info!(error = %e, "control side gone, exiting");
            return Ok(());
        }

        if link.reset_requested()? {
            info!(frames = frame, "level reset");
            frame = 0;
            agents = 0;
        }

        for command in link.commands()? {
            match command {
                Command::SpawnAgent { name, agent_type, .. } => {
                    agents += 1;
                    info!(%name, %agent_type, "spawned agent");
                }
                Command::TeleportCamera { location, .. } => camera = location,
                Command::RenderViewport { enabled } => info!(enabled, "viewport"),
                Command::RenderQuality { level } => info!(level, "render quality"),
                Command::Custom { name, num_params, .. } => {
                    info!(%name, params = num_params.len(), "world command")
                }
            }
        }

        frame += 1;
        let reward = if agents > 0 { 1.0 / EPISODE_FRAMES as f32 } else { 0.0 };
        let terminal = if frame >= EPISODE_FRAMES { 1.0 } else { 0.0 };
        link.state_mut("TASK")?.write(&[reward, terminal])?;

        let shade = (frame as f32 + camera[0]).rem_euclid(256.0) as u8;
        link.state_mut("CAMERA")?.view_mut::<u8>()?.fill(shade);

        link.publish_frame()?;
    }
}
