//! Dynamic registration: inbound registrar flow, outbound registrant state
//! machine, expiry and qualify pokes.

mod common;

use std::time::Duration;

use common::{advance, pump, test_engine, TestEngine};
use iax2_engine::config::{Credentials, RegistrationConfig};
use iax2_engine::registry::RegState;
use iax2_engine::{Config, PeerConfig, PeerStatusEvent, RegEvent};

fn dynamic_peer(name: &str, secret: &str) -> PeerConfig {
    let mut peer = PeerConfig::new(name);
    peer.credentials = Credentials {
        secret: Some(secret.into()),
        ..Default::default()
    };
    peer
}

fn registered_pair() -> (TestEngine, TestEngine) {
    let client = test_engine("198.51.100.1:4569", Config::default(), 81);
    let server = test_engine("198.51.100.2:4569", Config::default(), 82);
    server
        .engine
        .registry()
        .add_peer(dynamic_peer("polly", "cracker"));

    client.engine.add_registration(RegistrationConfig {
        username: "polly".into(),
        secret: Some("cracker".into()),
        addr: server.addr,
        refresh: 60,
    });
    client.engine.poll_timers();
    pump(&client, &server);
    (client, server)
}

#[test]
fn test_challenge_then_regack() {
    let (client, server) = registered_pair();

    let state = client
        .engine
        .registry()
        .with_registration(0, |reg| reg.state)
        .unwrap();
    assert_eq!(state, RegState::Registered);

    let regs = server.events.registrations.lock();
    assert!(regs
        .iter()
        .any(|(name, ev)| name == "polly" && *ev == RegEvent::Bound(client.addr)));

    // The registrar reports the address it sees us at.
    let apparent = client
        .engine
        .registry()
        .with_registration(0, |reg| reg.apparent_addr)
        .unwrap();
    assert_eq!(apparent, Some(client.addr));

    // The exchange slots were torn down on both sides.
    assert!(client.engine.live_calls().is_empty());
    assert!(server.engine.live_calls().is_empty());
}

#[test]
fn test_binding_persisted_in_registry_namespace() {
    use iax2_engine::registry::{MemoryStore, RegistryStore};
    use std::sync::Arc;

    let client = test_engine("198.51.100.1:4569", Config::default(), 87);
    let store = Arc::new(MemoryStore::default());
    let net = Arc::new(common::RecordingNet::default());
    let clock = Arc::new(iax2_transport::ManualTimeProvider::new(
        std::time::Instant::now(),
        1_700_000_000_000,
    ));
    let server_engine = iax2_engine::Engine::builder(net.clone())
        .store(store.clone())
        .time(clock)
        .rng_seed(88)
        .build();
    server_engine
        .registry()
        .add_peer(dynamic_peer("polly", "cracker"));
    let server = common::TestEngine {
        engine: server_engine,
        net,
        events: Arc::new(common::RecordingEvents::default()),
        clock: Arc::new(iax2_transport::ManualTimeProvider::new(
            std::time::Instant::now(),
            1_700_000_000_000,
        )),
        addr: "198.51.100.2:4569".parse().unwrap(),
    };

    client.engine.add_registration(RegistrationConfig {
        username: "polly".into(),
        secret: Some("cracker".into()),
        addr: server.addr,
        refresh: 60,
    });
    client.engine.poll_timers();
    pump(&client, &server);

    assert_eq!(
        store.get("IAX/Registry/polly").as_deref(),
        Some("198.51.100.1:4569:60")
    );
}

#[test]
fn test_wrong_secret_gets_regrej() {
    let client = test_engine("198.51.100.1:4569", Config::default(), 83);
    let server = test_engine("198.51.100.2:4569", Config::default(), 84);
    server
        .engine
        .registry()
        .add_peer(dynamic_peer("polly", "cracker"));

    client.engine.add_registration(RegistrationConfig {
        username: "polly".into(),
        secret: Some("stale".into()),
        addr: server.addr,
        refresh: 60,
    });
    client.engine.poll_timers();
    pump(&client, &server);

    let state = client
        .engine
        .registry()
        .with_registration(0, |reg| reg.state)
        .unwrap();
    assert_eq!(state, RegState::Rejected);
    assert!(server
        .events
        .registrations
        .lock()
        .iter()
        .all(|(_, ev)| !matches!(ev, RegEvent::Bound(_))));
}

#[test]
fn test_refresh_keeps_binding_alive() {
    let (client, server) = registered_pair();
    server.events.registrations.lock().clear();

    // Refresh runs at five sixths of the interval, well inside expiry.
    for _ in 0..4 {
        advance(&client, &server, Duration::from_secs(50));
    }

    let state = client
        .engine
        .registry()
        .with_registration(0, |reg| reg.state)
        .unwrap();
    assert_eq!(state, RegState::Registered);
    // The address never changed, so rebinding stays quiet.
    assert!(server
        .events
        .registrations
        .lock()
        .iter()
        .all(|(_, ev)| !matches!(ev, RegEvent::Unbound)));
}

#[test]
fn test_binding_expires_without_refresh() {
    let (client, server) = registered_pair();
    // Stop the client from refreshing by dropping its timers on the floor:
    // only the server's clock moves.
    server.clock.advance(Duration::from_secs(61));
    server.engine.poll_timers();

    let regs = server.events.registrations.lock();
    assert!(regs
        .iter()
        .any(|(name, ev)| name == "polly" && *ev == RegEvent::Unbound));
    let _ = client;
}

#[test]
fn test_qualify_poke_reachable_and_timeout() {
    let client = test_engine("198.51.100.1:4569", Config::default(), 85);
    let server = test_engine("198.51.100.2:4569", Config::default(), 86);

    let mut peer = PeerConfig::new("edge");
    peer.host = Some(client.addr);
    peer.maxms = 2000;
    server.engine.registry().add_peer(peer);

    server.engine.start_qualify("edge");
    server.engine.poll_timers();
    pump(&client, &server);

    assert!(server
        .events
        .peer_status
        .lock()
        .iter()
        .any(|(name, ev)| name == "edge" && matches!(ev, PeerStatusEvent::Reachable { .. })));
    assert!(server.engine.live_calls().is_empty());

    // Next cycle: the peer vanishes; the poke times out at maxms.
    server.events.peer_status.lock().clear();
    server.clock.advance(Duration::from_secs(60));
    server.engine.poll_timers();
    // Poke sent but never answered.
    server.net.take_all();
    server.clock.advance(Duration::from_secs(3));
    server.engine.poll_timers();

    assert!(server
        .events
        .peer_status
        .lock()
        .iter()
        .any(|(name, ev)| name == "edge" && matches!(ev, PeerStatusEvent::Unreachable)));
    assert!(server.engine.live_calls().is_empty());
}
