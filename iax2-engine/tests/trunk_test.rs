//! Trunk aggregation at the engine level: many calls to one host share a
//! single meta frame per tick.

mod common;

use std::time::Duration;

use common::{raw_full, test_engine, TestEngine};
use iax2_engine::{Config, DialRequest};
use iax2_proto::constants::{FrameType, IaxCommand};
use iax2_proto::frame::Frame;
use iax2_proto::Ie;

fn remote() -> std::net::SocketAddr {
    "203.0.113.80:4569".parse().unwrap()
}

/// Dials and fakes an ACCEPT so the call is up, then moves it to a trunk
/// number.
fn up_trunk_call(t: &TestEngine, remote_scallno: u16) -> u16 {
    let callno = t
        .engine
        .dial(DialRequest {
            addr: Some(remote()),
            called_number: "700".into(),
            ..Default::default()
        })
        .unwrap();
    let accept = raw_full(
        remote_scallno,
        callno,
        0,
        1,
        FrameType::Iax as u8,
        IaxCommand::Accept as u8,
        &[Ie::Format(0x4)],
    );
    t.engine.handle_datagram(&accept, remote());
    t.engine.make_trunk(callno).unwrap()
}

#[test]
fn test_five_calls_one_meta_frame_per_tick() {
    let config = Config {
        // Classic supermini entries: (callno, len, payload).
        trunk_timestamps: false,
        ..Default::default()
    };
    let t = test_engine("198.51.100.1:4569", config, 91);

    let calls: Vec<u16> = (0..5)
        .map(|i| up_trunk_call(&t, 0x300 + i))
        .collect();
    assert!(calls.iter().all(|&c| c >= 16_384));

    // First voice frame per call re-anchors timestamps as a full frame.
    for &c in &calls {
        t.engine.send_voice(c, &[7u8; 20], 20).unwrap();
    }
    t.net.take_all();

    // Second round rides the trunk.
    t.clock.advance(Duration::from_millis(20));
    for &c in &calls {
        t.engine.send_voice(c, &[9u8; 20], 20).unwrap();
    }
    assert_eq!(t.net.pending(), 0, "trunked media must wait for the tick");

    t.engine.poll_timers();
    let sent = t.net.take_all();
    assert_eq!(sent.len(), 1);
    let (data, dest) = &sent[0];
    assert_eq!(*dest, remote());
    // 8-byte meta header plus five (2 + 2 + 20)-byte entries.
    assert_eq!(data.len(), 8 + 5 * 24);

    let Frame::Trunk(trunk) = Frame::decode(data).unwrap() else {
        panic!("expected a trunk meta frame");
    };
    assert!(!trunk.timestamps);
    assert_eq!(trunk.entries.len(), 5);
    for entry in &trunk.entries {
        assert_eq!(entry.payload, vec![9u8; 20]);
        assert!(calls.contains(&entry.callno));
    }

    // The next tick starts from an empty buffer.
    t.clock.advance(Duration::from_millis(20));
    t.engine.poll_timers();
    assert!(t
        .net
        .take_all()
        .iter()
        .all(|(data, _)| Frame::decode(data).map(|f| !matches!(f, Frame::Trunk(_))).unwrap_or(true)));
}

#[test]
fn test_timestamped_trunk_entries_carry_ts() {
    let t = test_engine("198.51.100.1:4569", Config::default(), 92);
    let callno = up_trunk_call(&t, 0x400);

    t.engine.send_voice(callno, &[1u8; 20], 20).unwrap();
    t.net.take_all();
    t.clock.advance(Duration::from_millis(20));
    t.engine.send_voice(callno, &[2u8; 20], 20).unwrap();
    t.engine.poll_timers();

    let sent = t.net.take_all();
    let trunked: Vec<_> = sent
        .iter()
        .filter_map(|(data, _)| match Frame::decode(data) {
            Ok(Frame::Trunk(tf)) => Some(tf),
            _ => None,
        })
        .collect();
    assert_eq!(trunked.len(), 1);
    assert!(trunked[0].timestamps);
    assert_eq!(trunked[0].entries.len(), 1);
    assert!(trunked[0].entries[0].ts.is_some());
}
