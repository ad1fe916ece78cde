//! Reliable-delivery behavior at the engine level: retransmission with the
//! retrans bit, VNAK-driven resends, and max-retry teardown.

mod common;

use std::time::Duration;

use common::{raw_full, test_engine, TestEngine};
use iax2_engine::call::CallState;
use iax2_engine::{Config, DialRequest};
use iax2_proto::constants::{cause, FrameType, IaxCommand};
use iax2_proto::Ie;

const REMOTE_SCALLNO: u16 = 0x200;

fn remote() -> std::net::SocketAddr {
    "203.0.113.50:4569".parse().unwrap()
}

fn dial_out(t: &TestEngine) -> u16 {
    let callno = t
        .engine
        .dial(DialRequest {
            addr: Some(remote()),
            called_number: "300".into(),
            ..Default::default()
        })
        .unwrap();
    callno
}

/// Pushes the call to Up by faking the remote's ACCEPT.
fn fake_accept(t: &TestEngine, callno: u16) {
    let accept = raw_full(
        REMOTE_SCALLNO,
        callno,
        0,
        1,
        FrameType::Iax as u8,
        IaxCommand::Accept as u8,
        &[Ie::Format(0x4)],
    );
    t.engine.handle_datagram(&accept, remote());
}

#[test]
fn test_unanswered_new_retransmits_with_bit_set() {
    let t = test_engine("198.51.100.1:4569", Config::default(), 61);
    let _callno = dial_out(&t);

    let first = t.net.take_full_frames();
    assert_eq!(first.len(), 1);
    assert!(!first[0].retrans);
    assert_eq!(first[0].csub, IaxCommand::New as u8);

    // Default ping time gives a 100 ms first retry.
    t.clock.advance(Duration::from_millis(150));
    t.engine.poll_timers();

    let second = t.net.take_full_frames();
    assert_eq!(second.len(), 1);
    assert!(second[0].retrans);
    assert_eq!(second[0].oseqno, first[0].oseqno);
}

#[test]
fn test_ack_stops_retransmission() {
    let t = test_engine("198.51.100.1:4569", Config::default(), 62);
    let callno = dial_out(&t);
    t.net.take_all();

    // One lost ack's worth of retransmission, then the ACCEPT lands.
    t.clock.advance(Duration::from_millis(150));
    t.engine.poll_timers();
    assert_eq!(t.net.take_full_frames().len(), 1);

    fake_accept(&t, callno);
    t.net.take_all();

    // The back-off timer fires into an empty queue: silence.
    t.clock.advance(Duration::from_secs(30));
    t.engine.poll_timers();
    let frames: Vec<_> = t
        .net
        .take_full_frames()
        .into_iter()
        .filter(|f| f.csub == IaxCommand::New as u8)
        .collect();
    assert!(frames.is_empty());
}

#[test]
fn test_vnak_resends_requested_window() {
    let t = test_engine("198.51.100.1:4569", Config::default(), 63);
    let callno = dial_out(&t);
    fake_accept(&t, callno);
    assert_eq!(t.engine.call_state(callno), Some(CallState::Up));

    // Three reliable frames: oseqnos 1, 2, 3 (NEW was 0).
    for text in ["one", "two", "three"] {
        t.engine.send_text(callno, text).unwrap();
    }
    t.net.take_all();

    // The peer claims everything from 2 on went missing.
    let vnak = raw_full(
        REMOTE_SCALLNO,
        callno,
        1,
        2,
        FrameType::Iax as u8,
        IaxCommand::Vnak as u8,
        &[],
    );
    t.engine.handle_datagram(&vnak, remote());

    let resent = t.net.take_full_frames();
    assert_eq!(resent.len(), 2);
    assert!(resent.iter().all(|f| f.retrans));
    assert_eq!(resent[0].oseqno, 2);
    assert_eq!(resent[1].oseqno, 3);
}

#[test]
fn test_retries_exhausted_destroys_call() {
    let config = Config {
        // Keep the setup deadline out of the way of the retry ladder.
        max_time: Duration::from_secs(600),
        ..Default::default()
    };
    let t = test_engine("198.51.100.1:4569", config, 64);
    let callno = dial_out(&t);

    for _ in 0..8 {
        t.clock.advance(Duration::from_secs(11));
        t.engine.poll_timers();
    }

    assert!(t.engine.call_state(callno).is_none());
    let hangups = t.events.hangups.lock();
    assert_eq!(hangups.len(), 1);
    assert_eq!(hangups[0].2, Some(cause::DESTINATION_OUT_OF_ORDER));
}

#[test]
fn test_maxtime_congests_unanswered_call() {
    let t = test_engine("198.51.100.1:4569", Config::default(), 65);
    let callno = dial_out(&t);
    t.net.take_all();

    // Default maxtime is 30 s; jump past it without any remote response.
    t.clock.advance(Duration::from_secs(31));
    t.engine.poll_timers();

    let hangups = t.events.hangups.lock();
    assert_eq!(hangups.len(), 1);
    assert_eq!(hangups[0].2, Some(cause::NORMAL_CIRCUIT_CONGESTION));
    assert_eq!(t.engine.call_state(callno), Some(CallState::Terminating));
}
