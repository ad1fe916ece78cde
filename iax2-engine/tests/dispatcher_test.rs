//! Worker-pool behavior: datagrams processed off-thread, same-call ordering
//! preserved, clean shutdown.

mod common;

use std::time::{Duration, Instant};

use common::{raw_full, test_engine};
use iax2_engine::dispatcher::Dispatcher;
use iax2_engine::{Config, UserConfig};
use iax2_proto::constants::{FrameType, IaxCommand};
use iax2_proto::Ie;

fn wait_until(deadline_ms: u64, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_millis(deadline_ms);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn test_poke_processed_on_worker() {
    let t = test_engine("198.51.100.2:4569", Config::default(), 101);
    let dispatcher = Dispatcher::start(t.engine.clone());

    let poke = raw_full(
        0x42,
        0,
        0,
        0,
        FrameType::Iax as u8,
        IaxCommand::Poke as u8,
        &[],
    );
    dispatcher.dispatch(poke, "203.0.113.5:4569".parse().unwrap());

    assert!(wait_until(2_000, || t.net.pending() > 0));
    let frames = t.net.take_full_frames();
    assert_eq!(frames[0].csub, IaxCommand::Pong as u8);
    assert_eq!(frames[0].dcallno, 0x42);

    dispatcher.shutdown();
}

#[test]
fn test_many_calls_land_on_workers() {
    let t = test_engine("198.51.100.2:4569", Config::default(), 102);
    t.engine.registry().add_user(UserConfig::new("guest"));
    let dispatcher = Dispatcher::start(t.engine.clone());

    for i in 0..20u16 {
        let new = raw_full(
            100 + i,
            0,
            0,
            0,
            FrameType::Iax as u8,
            IaxCommand::New as u8,
            &[
                Ie::Version(2),
                Ie::CalledNumber("100".into()),
                Ie::Capability(0x6),
                Ie::Format(0x4),
            ],
        );
        let from: std::net::SocketAddr = format!("203.0.113.{}:4569", 10 + i).parse().unwrap();
        dispatcher.dispatch(new, from);
    }

    assert!(wait_until(2_000, || t.engine.live_calls().len() == 20));
    dispatcher.shutdown();
}

#[test]
fn test_shutdown_joins_quietly() {
    let t = test_engine("198.51.100.2:4569", Config::default(), 103);
    let dispatcher = Dispatcher::start(t.engine.clone());
    dispatcher.shutdown();
    // A dispatch after shutdown is a no-op, not a panic.
    dispatcher.dispatch(vec![0x80, 0, 0, 0], "203.0.113.5:4569".parse().unwrap());
}
