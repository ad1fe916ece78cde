//! Native transfer: a server bridging two calls hands the media path off so
//! the endpoints talk directly.

mod common;

use common::{test_engine, TestEngine};
use iax2_engine::call::CallState;
use iax2_engine::{Config, DialRequest, UserConfig};

/// Delivers queued datagrams between three engines until quiet.
fn tri_pump(engines: &[&TestEngine]) {
    for _ in 0..96 {
        let mut moved = false;
        for src in engines {
            for (data, dest) in src.net.take_all() {
                for dst in engines {
                    if dest == dst.addr {
                        dst.engine.handle_datagram(&data, src.addr);
                        moved = true;
                    }
                }
            }
        }
        if !moved {
            return;
        }
    }
    panic!("wire never went quiet");
}

#[test]
fn test_full_transfer_moves_call_off_the_server() {
    let server = test_engine("198.51.100.2:4569", Config::default(), 111);
    let alice = test_engine("198.51.100.3:4569", Config::default(), 112);
    let bob = test_engine("198.51.100.4:4569", Config::default(), 113);
    server.engine.registry().add_user(UserConfig::new("guest"));

    let a_call = alice
        .engine
        .dial(DialRequest {
            addr: Some(server.addr),
            called_number: "100".into(),
            ..Default::default()
        })
        .unwrap();
    let b_call = bob
        .engine
        .dial(DialRequest {
            addr: Some(server.addr),
            called_number: "200".into(),
            ..Default::default()
        })
        .unwrap();
    tri_pump(&[&server, &alice, &bob]);

    let legs = server.engine.live_calls();
    assert_eq!(legs.len(), 2);
    assert_eq!(alice.engine.call_state(a_call), Some(CallState::Up));
    assert_eq!(bob.engine.call_state(b_call), Some(CallState::Up));

    server.engine.begin_transfer(legs[0], legs[1]).unwrap();
    tri_pump(&[&server, &alice, &bob]);

    // Both server legs released and reaped; the endpoints survived.
    assert!(server.engine.live_calls().is_empty());
    assert_eq!(alice.engine.call_state(a_call), Some(CallState::Up));
    assert_eq!(bob.engine.call_state(b_call), Some(CallState::Up));

    // The endpoints now speak directly: text crosses without the server.
    alice.engine.send_text(a_call, "direct path").unwrap();
    tri_pump(&[&alice, &bob]);
    let texts = bob.events.texts.lock();
    assert_eq!(texts.len(), 1);
    assert_eq!(texts[0].1, "direct path");
}
