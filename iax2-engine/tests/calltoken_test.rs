//! The call-token handshake in front of call-number allocation.

mod common;

use std::time::Duration;

use common::{raw_full, test_engine, TestEngine};
use iax2_engine::{CallTokenPolicy, Config};
use iax2_proto::constants::{FrameType, IaxCommand};
use iax2_proto::{Ie, IeSet};
use iax2_engine::UserConfig;

fn server() -> TestEngine {
    let config = Config {
        calltoken_policy: CallTokenPolicy::Required,
        ..Default::default()
    };
    let t = test_engine("198.51.100.2:4569", config, 41);
    t.engine.registry().add_user(UserConfig::new("guest"));
    t
}

fn client_addr() -> std::net::SocketAddr {
    "198.51.100.7:4569".parse().unwrap()
}

fn new_ies(token: Option<Vec<u8>>) -> Vec<Ie> {
    let mut ies = vec![
        Ie::Version(2),
        Ie::CalledNumber("100".into()),
        Ie::Capability(0x6),
        Ie::Format(0x4),
    ];
    if let Some(token) = token {
        ies.push(Ie::CallToken(token));
    }
    ies
}

/// Pulls the token out of the server's CALLTOKEN reply.
fn extract_token(server: &TestEngine) -> Vec<u8> {
    let frames = server.net.take_full_frames();
    assert_eq!(frames.len(), 1);
    let reply = &frames[0];
    assert_eq!(reply.csub, IaxCommand::CallToken as u8);
    let set = IeSet::parse(&reply.payload).unwrap();
    set.calltoken.expect("token data present")
}

#[test]
fn test_token_round_trip_allocates_validated_slot() {
    let srv = server();

    // First packet: NEW with an empty CALLTOKEN IE.
    let new1 = raw_full(
        0x123,
        0,
        0,
        0,
        FrameType::Iax as u8,
        IaxCommand::New as u8,
        &new_ies(Some(vec![])),
    );
    srv.engine.handle_datagram(&new1, client_addr());

    // Token offered, no state allocated.
    let token = extract_token(&srv);
    assert!(srv.engine.live_calls().is_empty());
    assert_eq!(srv.engine.nonvalidated_in_use(), 0);

    // Echo the exact token within the window.
    srv.clock.advance(Duration::from_secs(9));
    let new2 = raw_full(
        0x123,
        0,
        0,
        0,
        FrameType::Iax as u8,
        IaxCommand::New as u8,
        &new_ies(Some(token)),
    );
    srv.engine.handle_datagram(&new2, client_addr());

    let calls = srv.engine.live_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(srv.engine.call_validated(calls[0]), Some(true));
    assert_eq!(srv.engine.nonvalidated_in_use(), 0);
    // The call proceeded straight to ACCEPT for the unauthenticated user.
    let replies = srv.net.take_full_frames();
    assert!(replies
        .iter()
        .any(|f| f.csub == IaxCommand::Accept as u8));
}

#[test]
fn test_outbound_call_replays_new_with_token() {
    // A full engine on each end: the client's first NEW is answered with a
    // token demand, the replay carries it, and the call completes.
    let srv = server();
    let client = test_engine("198.51.100.7:4569", Config::default(), 42);

    let callno = client
        .engine
        .dial(iax2_engine::DialRequest {
            addr: Some(srv.addr),
            called_number: "100".into(),
            ..Default::default()
        })
        .unwrap();
    common::pump(&client, &srv);

    assert_eq!(
        client.engine.call_state(callno),
        Some(iax2_engine::call::CallState::Up)
    );
    let server_calls = srv.engine.live_calls();
    assert_eq!(server_calls.len(), 1);
    assert_eq!(srv.engine.call_validated(server_calls[0]), Some(true));
    assert_eq!(srv.engine.nonvalidated_in_use(), 0);
}

#[test]
fn test_missing_token_gets_offer_not_slot() {
    let srv = server();
    let new1 = raw_full(
        0x50,
        0,
        0,
        0,
        FrameType::Iax as u8,
        IaxCommand::New as u8,
        &new_ies(None),
    );
    srv.engine.handle_datagram(&new1, client_addr());
    let frames = srv.net.take_full_frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].csub, IaxCommand::CallToken as u8);
    assert!(srv.engine.live_calls().is_empty());
}

#[test]
fn test_expired_token_rejected() {
    let srv = server();
    let new1 = raw_full(
        0x60,
        0,
        0,
        0,
        FrameType::Iax as u8,
        IaxCommand::New as u8,
        &new_ies(Some(vec![])),
    );
    srv.engine.handle_datagram(&new1, client_addr());
    let token = extract_token(&srv);

    // Too slow: the default window is ten seconds.
    srv.clock.advance(Duration::from_secs(11));
    let new2 = raw_full(
        0x60,
        0,
        0,
        0,
        FrameType::Iax as u8,
        IaxCommand::New as u8,
        &new_ies(Some(token)),
    );
    srv.engine.handle_datagram(&new2, client_addr());

    assert!(srv.engine.live_calls().is_empty());
    let frames = srv.net.take_full_frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].csub, IaxCommand::Reject as u8);
}

#[test]
fn test_tampered_token_rejected() {
    let srv = server();
    let new1 = raw_full(
        0x70,
        0,
        0,
        0,
        FrameType::Iax as u8,
        IaxCommand::New as u8,
        &new_ies(Some(vec![])),
    );
    srv.engine.handle_datagram(&new1, client_addr());
    let mut token = extract_token(&srv);
    let last = token.len() - 1;
    token[last] ^= 0x01;

    let new2 = raw_full(
        0x70,
        0,
        0,
        0,
        FrameType::Iax as u8,
        IaxCommand::New as u8,
        &new_ies(Some(token)),
    );
    srv.engine.handle_datagram(&new2, client_addr());
    assert!(srv.engine.live_calls().is_empty());
    assert_eq!(srv.engine.nonvalidated_in_use(), 0);
}
