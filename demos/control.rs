//! Control loop demo
//!
//! Spawns the `engine` demo, runs a few episodes and reports tick latency.
//!
//! Usage: control [path/to/engine] [episodes]

use lockstep_ipc::{
    Command, ElementType, EngineProcess, LoadingSignal, Session, SessionConfig,
};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{error, info};

fn engine_path() -> PathBuf {
    if let Some(path) = std::env::args().nth(1) {
        return PathBuf::from(path);
    }
    // cargo puts both demos in the same directory
    let mut path = std::env::current_exe().unwrap_or_default();
    path.set_file_name("engine");
    path
}

fn main() -> lockstep_ipc::Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    let episodes: u32 = std::env::args()
        .nth(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(3);
    let config = SessionConfig::default()
        .with_session_id(format!("demo{}", std::process::id()))
        .with_tick_timeout(Duration::from_secs(5));

    println!("╔══════════════════════════════════════════════════╗");
    println!("║          Lockstep IPC Control Demo               ║");
    println!("╚══════════════════════════════════════════════════╝");
    println!();

    let mut session = Session::create(config)?;
    session.allocate_state("TASK", &[2], ElementType::Float32)?;
    session.allocate_state("CAMERA", &[16, 16, 3], ElementType::Uint8)?;
    session.add_initial_command(Command::SpawnAgent {
        agent_type: "Agent".to_string(),
        name: "main".to_string(),
        location: [0.0, 0.0, 100.0],
        rotation: [0.0; 3],
        max_height: f32::MAX,
        is_main_agent: true,
    });

    let loading = LoadingSignal::create(&session.config().session_id)?;
    let engine = EngineProcess::spawn(
        std::process::Command::new(engine_path()),
        &session.config().session_id,
    )?;
    println!("[Control] Engine PID: {}", engine.pid());
    session.attach_engine(engine);
    session.start(Some(loading))?;

    for episode in 0..episodes {
        session.reset()?;
        session.set_render_quality(1)?;

        let mut total = 0.0f32;
        let mut latencies = Vec::new();
        loop {
            let t0 = Instant::now();
            if let Err(e) = session.tick() {
                if e.is_terminal() {
                    error!(error = %e, "engine lost");
                }
                return Err(e);
            }
            latencies.push(t0.elapsed());

            let (reward, terminal) = session.task_state("TASK")?;
            total += reward;
            if session.user_ticks() % 50 == 0 {
                let pixel = session.state("CAMERA")?.view::<u8>()?[0];
                session.move_viewport([pixel as f32, 0.0, 200.0], [0.0; 3])?;
            }
            if terminal {
                break;
            }
        }

        latencies.sort();
        let mean = latencies.iter().sum::<Duration>() / latencies.len().max(1) as u32;
        let p99 = latencies[(latencies.len() * 99 / 100).min(latencies.len() - 1)];
        info!(episode, ticks = session.user_ticks(), reward = total, "episode done");
        println!(
            "[Control] Episode {}: {} ticks, reward {:.2}, mean {:?}, p99 {:?}",
            episode,
            session.user_ticks(),
            total,
            mean,
            p99
        );
    }

    session.close()?;
    println!("[Control] Done");
    Ok(())
}
