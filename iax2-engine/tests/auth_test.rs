//! MD5 challenge authentication between two engines.

mod common;

use std::time::Duration;

use common::{advance, pump, test_engine};
use iax2_engine::call::CallState;
use iax2_engine::config::Credentials;
use iax2_engine::{Config, DialRequest, UserConfig};

fn secured_user(name: &str, secret: &str) -> UserConfig {
    let mut user = UserConfig::new(name);
    user.credentials = Credentials {
        secret: Some(secret.into()),
        ..Default::default()
    };
    user
}

#[test]
fn test_md5_challenge_round_trip() {
    let client = test_engine("198.51.100.1:4569", Config::default(), 31);
    let server = test_engine("198.51.100.2:4569", Config::default(), 32);
    server
        .engine
        .registry()
        .add_user(secured_user("alice", "s3cret"));

    let callno = client
        .engine
        .dial(DialRequest {
            addr: Some(server.addr),
            called_number: "200".into(),
            username: Some("alice".into()),
            secret: Some("s3cret".into()),
            ..Default::default()
        })
        .unwrap();
    pump(&client, &server);

    assert_eq!(client.engine.call_state(callno), Some(CallState::Up));
    assert_eq!(server.events.offers.lock().len(), 1);
    assert_eq!(
        server.events.offers.lock()[0].username.as_deref(),
        Some("alice")
    );
}

#[test]
fn test_wrong_secret_rejected() {
    let client = test_engine("198.51.100.1:4569", Config::default(), 33);
    let server = test_engine("198.51.100.2:4569", Config::default(), 34);
    server
        .engine
        .registry()
        .add_user(secured_user("alice", "s3cret"));

    let callno = client
        .engine
        .dial(DialRequest {
            addr: Some(server.addr),
            called_number: "200".into(),
            username: Some("alice".into()),
            secret: Some("letmein".into()),
            ..Default::default()
        })
        .unwrap();
    pump(&client, &server);

    assert!(client.engine.call_state(callno).is_none());
    assert!(server.events.offers.lock().is_empty());
    let hangups = client.events.hangups.lock();
    assert_eq!(hangups.len(), 1);
    assert_eq!(hangups[0].1.as_deref(), Some("Password incorrect"));
}

#[test]
fn test_delayed_reject_waits_a_second() {
    let client = test_engine("198.51.100.1:4569", Config::default(), 35);
    let server_config = Config {
        delay_reject: true,
        ..Default::default()
    };
    let server = test_engine("198.51.100.2:4569", server_config, 36);
    server
        .engine
        .registry()
        .add_user(secured_user("alice", "s3cret"));

    let callno = client
        .engine
        .dial(DialRequest {
            addr: Some(server.addr),
            called_number: "200".into(),
            username: Some("alice".into()),
            secret: Some("wrong".into()),
            ..Default::default()
        })
        .unwrap();
    pump(&client, &server);

    // The REJECT is deferred; the caller has heard nothing yet.
    assert!(client.events.hangups.lock().is_empty());
    assert_eq!(client.engine.call_state(callno), Some(CallState::WaitAccept));

    advance(&client, &server, Duration::from_millis(1_100));
    assert_eq!(client.events.hangups.lock().len(), 1);
    assert!(client.engine.call_state(callno).is_none());
}

#[test]
fn test_outstanding_authreq_cap() {
    let config = Config {
        max_auth_req: 1,
        ..Default::default()
    };
    let server = test_engine("198.51.100.2:4569", config, 39);
    server
        .engine
        .registry()
        .add_user(secured_user("alice", "s3cret"));

    use iax2_proto::constants::{FrameType, IaxCommand};
    use iax2_proto::Ie;
    let new = |scallno: u16| {
        common::raw_full(
            scallno,
            0,
            0,
            0,
            FrameType::Iax as u8,
            IaxCommand::New as u8,
            &[
                Ie::Version(2),
                Ie::Username("alice".into()),
                Ie::CalledNumber("100".into()),
                Ie::Capability(0x6),
                Ie::Format(0x4),
            ],
        )
    };
    let addr: std::net::SocketAddr = "203.0.113.40:4569".parse().unwrap();

    server.engine.handle_datagram(&new(10), addr);
    let first = server.net.take_full_frames();
    assert!(first.iter().any(|f| f.csub == IaxCommand::AuthReq as u8));

    // A second unanswered challenge for the same user is over the cap.
    server.engine.handle_datagram(&new(11), addr);
    let second = server.net.take_full_frames();
    assert!(second.iter().any(|f| f.csub == IaxCommand::Reject as u8));
    assert!(!second.iter().any(|f| f.csub == IaxCommand::AuthReq as u8));
}

#[test]
fn test_unknown_user_rejected() {
    let client = test_engine("198.51.100.1:4569", Config::default(), 37);
    let server = test_engine("198.51.100.2:4569", Config::default(), 38);

    let callno = client
        .engine
        .dial(DialRequest {
            addr: Some(server.addr),
            called_number: "200".into(),
            username: Some("mallory".into()),
            ..Default::default()
        })
        .unwrap();
    pump(&client, &server);

    assert!(client.engine.call_state(callno).is_none());
    let hangups = client.events.hangups.lock();
    assert_eq!(hangups.len(), 1);
    assert_eq!(hangups[0].1.as_deref(), Some("No authority found"));
}
