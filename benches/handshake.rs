use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lockstep_ipc::buffer::{Phase, Side};
use lockstep_ipc::{Capability, Command, CommandQueue, EngineLink, Session, SessionConfig};
use std::thread;
use std::time::Duration;

fn flush_bench(c: &mut Criterion) {
    let sid = format!("bflush{}", std::process::id());
    let mut queue =
        CommandQueue::create(&sid, 64 * 1024, Capability::Creator, Phase::new(Side::Control))
            .unwrap();
    let spawn = Command::spawn_agent("Agent", "bench", [1.0, 2.0, 3.0], [0.0; 3]);

    c.bench_function("flush-32-commands", |b| {
        b.iter(|| {
            for _ in 0..32 {
                queue.enqueue(&spawn).unwrap();
            }
            black_box(queue.flush().unwrap())
        })
    });
    queue.unlink().unwrap();
}

fn tick_bench(c: &mut Criterion) {
    let config = SessionConfig::default()
        .with_session_id(format!("btick{}", std::process::id()))
        .with_command_capacity(4096)
        .with_tick_timeout(Duration::from_secs(5));
    let sid = config.session_id.clone();
    let mut session = Session::create(config).unwrap();

    // serves frames until the session goes away
    let engine = thread::spawn(move || {
        let mut link = EngineLink::open(&sid, 4096).unwrap();
        link.publish_frame().unwrap();
        while link.wait_for_input(Duration::from_secs(1)).is_ok() {
            black_box(link.commands().unwrap());
            link.publish_frame().unwrap();
        }
    });
    session.start(None).unwrap();
    session.reset().unwrap();

    c.bench_function("tick-round-trip", |b| b.iter(|| session.tick().unwrap()));
    c.bench_function("tick-with-command", |b| {
        b.iter(|| {
            session.move_viewport([0.0; 3], [0.0; 3]).unwrap();
            session.tick().unwrap()
        })
    });

    drop(session);
    engine.join().unwrap();
}

criterion_group!(benches, flush_bench, tick_bench);
criterion_main!(benches);
