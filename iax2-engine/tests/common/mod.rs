//! Shared harness: recording transports, recording event sinks, manual
//! clocks, and a two-engine "wire" that delivers datagrams without threads.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use iax2_engine::events::{CallDisposition, CallOffer, ChannelEvents, RegEvent, Transport};
use iax2_engine::{Config, Engine};
use iax2_proto::frame::{Frame, FullFrame};
use iax2_proto::{build_ies, Ie};
use iax2_transport::ManualTimeProvider;

/// Transport that records every datagram instead of sending it.
#[derive(Default)]
pub struct RecordingNet {
    pub sent: Mutex<VecDeque<(Vec<u8>, SocketAddr)>>,
}

impl Transport for RecordingNet {
    fn send_to(&self, data: &[u8], addr: SocketAddr) -> std::io::Result<usize> {
        self.sent.lock().push_back((data.to_vec(), addr));
        Ok(data.len())
    }
}

impl RecordingNet {
    pub fn take_all(&self) -> Vec<(Vec<u8>, SocketAddr)> {
        self.sent.lock().drain(..).collect()
    }

    /// Decodes everything sent so far as frames, dropping the queue.
    pub fn take_frames(&self) -> Vec<Frame> {
        self.take_all()
            .into_iter()
            .filter_map(|(data, _)| Frame::decode(&data).ok())
            .collect()
    }

    pub fn take_full_frames(&self) -> Vec<FullFrame> {
        self.take_frames()
            .into_iter()
            .filter_map(|f| match f {
                Frame::Full(full) => Some(full),
                _ => None,
            })
            .collect()
    }

    pub fn pending(&self) -> usize {
        self.sent.lock().len()
    }
}

/// Event sink that records callbacks and answers offers with a configured
/// disposition.
pub struct RecordingEvents {
    pub disposition: Mutex<CallDisposition>,
    pub offers: Mutex<Vec<CallOffer>>,
    pub accepted: Mutex<Vec<(u16, u64)>>,
    pub answered: Mutex<Vec<u16>>,
    pub hangups: Mutex<Vec<(u16, Option<String>, Option<u8>)>>,
    pub media: Mutex<Vec<(u16, u32, Vec<u8>)>>,
    pub texts: Mutex<Vec<(u16, String)>>,
    pub registrations: Mutex<Vec<(String, RegEvent)>>,
    pub peer_status: Mutex<Vec<(String, iax2_engine::PeerStatusEvent)>>,
}

impl Default for RecordingEvents {
    fn default() -> Self {
        Self {
            disposition: Mutex::new(CallDisposition::Accept),
            offers: Mutex::new(Vec::new()),
            accepted: Mutex::new(Vec::new()),
            answered: Mutex::new(Vec::new()),
            hangups: Mutex::new(Vec::new()),
            media: Mutex::new(Vec::new()),
            texts: Mutex::new(Vec::new()),
            registrations: Mutex::new(Vec::new()),
            peer_status: Mutex::new(Vec::new()),
        }
    }
}

impl ChannelEvents for RecordingEvents {
    fn on_call_offered(&self, offer: &CallOffer) -> CallDisposition {
        self.offers.lock().push(offer.clone());
        self.disposition.lock().clone()
    }

    fn on_accepted(&self, callno: u16, format: u64) {
        self.accepted.lock().push((callno, format));
    }

    fn on_answered(&self, callno: u16) {
        self.answered.lock().push(callno);
    }

    fn on_media(
        &self,
        callno: u16,
        _dir: iax2_engine::MediaDirection,
        ts: u32,
        payload: &[u8],
    ) {
        self.media.lock().push((callno, ts, payload.to_vec()));
    }

    fn on_text(&self, callno: u16, text: &str) {
        self.texts.lock().push((callno, text.to_string()));
    }

    fn on_hangup(&self, callno: u16, cause: Option<&str>, code: Option<u8>) {
        self.hangups
            .lock()
            .push((callno, cause.map(str::to_string), code));
    }

    fn on_registration(&self, peer: &str, event: RegEvent) {
        self.registrations.lock().push((peer.to_string(), event));
    }

    fn on_peer_status(&self, peer: &str, event: iax2_engine::PeerStatusEvent) {
        self.peer_status.lock().push((peer.to_string(), event));
    }
}

pub struct TestEngine {
    pub engine: Arc<Engine>,
    pub net: Arc<RecordingNet>,
    pub events: Arc<RecordingEvents>,
    pub clock: Arc<ManualTimeProvider>,
    pub addr: SocketAddr,
}

/// Builds an engine on a manual clock with a recording transport.
pub fn test_engine(addr: &str, config: Config, seed: u64) -> TestEngine {
    let net = Arc::new(RecordingNet::default());
    let events = Arc::new(RecordingEvents::default());
    let clock = Arc::new(ManualTimeProvider::new(Instant::now(), 1_700_000_000_000));
    let engine = Engine::builder(net.clone())
        .config(config)
        .events(events.clone())
        .time(clock.clone())
        .rng_seed(seed)
        .build();
    TestEngine {
        engine,
        net,
        events,
        clock,
        addr: addr.parse().unwrap(),
    }
}

/// Delivers everything each engine has "sent" to the other until the wire
/// goes quiet. Loops are bounded so a ping-pong bug fails fast.
pub fn pump(a: &TestEngine, b: &TestEngine) {
    for _ in 0..64 {
        let from_a = a.net.take_all();
        let from_b = b.net.take_all();
        if from_a.is_empty() && from_b.is_empty() {
            return;
        }
        for (data, dest) in from_a {
            if dest == b.addr {
                b.engine.handle_datagram(&data, a.addr);
            }
        }
        for (data, dest) in from_b {
            if dest == a.addr {
                a.engine.handle_datagram(&data, b.addr);
            }
        }
    }
    panic!("wire never went quiet");
}

/// Advances both clocks, runs due timers, and pumps the wire.
pub fn advance(a: &TestEngine, b: &TestEngine, by: Duration) {
    a.clock.advance(by);
    b.clock.advance(by);
    a.engine.poll_timers();
    b.engine.poll_timers();
    pump(a, b);
}

/// Handy raw full-frame builder for single-engine tests that fake a remote.
pub fn raw_full(
    scallno: u16,
    dcallno: u16,
    oseqno: u8,
    iseqno: u8,
    frametype: u8,
    csub: u8,
    ies: &[Ie],
) -> Vec<u8> {
    FullFrame {
        scallno,
        dcallno,
        retrans: false,
        ts: 0,
        oseqno,
        iseqno,
        frametype,
        csub,
        payload: build_ies(ies),
    }
    .encode()
}
