//! Trunk aggregation.
//!
//! Calls marked trunk do not send their audio as individual mini frames;
//! each remote host gets a scratch buffer that collects `(callno, [ts,] len,
//! payload)` entries, and a fixed-rate tick drains one meta frame per host.
//! A buffer that would overflow the MTU flushes early; hosts idle for five
//! seconds are reaped.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use iax2_proto::constants::{META_HDR_LEN, META_TRUNK, META_TRUNK_MINI};
use iax2_proto::frame::{append_trunk_entry, trunk_entry_len, TrunkEntry};

/// Initial scratch allocation; growth happens in these increments.
pub const DEFAULT_TRUNKDATA: usize = 640 * 10;

/// Trunk peers idle this long are dropped.
pub const TRUNK_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct TrunkConfig {
    /// Emit early once a datagram would pass this size.
    pub mtu: usize,
    /// Hard cap on a host's scratch buffer.
    pub max_size: usize,
    /// Whether entries carry per-frame timestamps.
    pub timestamps: bool,
}

impl Default for TrunkConfig {
    fn default() -> Self {
        Self {
            mtu: 1240,
            max_size: 128_000,
            timestamps: true,
        }
    }
}

#[derive(Debug)]
struct TrunkPeer {
    /// Accumulated wire-format entries for the next meta frame.
    buf: Vec<u8>,
    capacity_limit: usize,
    calls_this_tick: u32,
    last_tx: Instant,
}

impl TrunkPeer {
    fn new(now: Instant) -> Self {
        Self {
            buf: Vec::with_capacity(DEFAULT_TRUNKDATA),
            capacity_limit: DEFAULT_TRUNKDATA,
            calls_this_tick: 0,
            last_tx: now,
        }
    }
}

/// A datagram ready for the socket.
#[derive(Debug, PartialEq, Eq)]
pub struct TrunkDatagram {
    pub addr: SocketAddr,
    pub data: Vec<u8>,
}

pub struct TrunkManager {
    config: TrunkConfig,
    /// Timestamp base for emitted meta frames.
    epoch: Instant,
    peers: Mutex<HashMap<SocketAddr, TrunkPeer>>,
}

impl TrunkManager {
    pub fn new(config: TrunkConfig, epoch: Instant) -> Self {
        Self {
            config,
            epoch,
            peers: Mutex::new(HashMap::new()),
        }
    }

    fn trunk_ts(&self, now: Instant) -> u32 {
        now.duration_since(self.epoch).as_millis() as u32
    }

    fn meta_frame(&self, now: Instant, entries: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(META_HDR_LEN + entries.len());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.push(META_TRUNK);
        out.push(if self.config.timestamps {
            META_TRUNK_MINI
        } else {
            0
        });
        out.extend_from_slice(&self.trunk_ts(now).to_be_bytes());
        out.extend_from_slice(entries);
        out
    }

    /// Queues one call's media for the next tick. Returns an early-flush
    /// datagram when adding the entry would pass the MTU.
    pub fn queue(
        &self,
        addr: SocketAddr,
        callno: u16,
        ts: u16,
        payload: &[u8],
        now: Instant,
    ) -> Option<TrunkDatagram> {
        let mut peers = self.peers.lock();
        let peer = peers.entry(addr).or_insert_with(|| {
            debug!(%addr, "trunk peer created");
            TrunkPeer::new(now)
        });

        let entry_len = trunk_entry_len(self.config.timestamps, payload.len());

        let mut flushed = None;
        if META_HDR_LEN + peer.buf.len() + entry_len > self.config.mtu && !peer.buf.is_empty() {
            flushed = Some(TrunkDatagram {
                addr,
                data: self.meta_frame(now, &peer.buf),
            });
            peer.buf.clear();
            peer.calls_this_tick = 0;
            peer.last_tx = now;
        }

        if peer.buf.len() + entry_len > peer.capacity_limit {
            let needed = peer.buf.len() + entry_len;
            let grown = needed.div_ceil(DEFAULT_TRUNKDATA) * DEFAULT_TRUNKDATA;
            if grown > self.config.max_size {
                warn!(%addr, needed, "trunk buffer over maximum size, dropping frame");
                return flushed;
            }
            peer.capacity_limit = grown;
            peer.buf.reserve(grown - peer.buf.len());
        }

        append_trunk_entry(
            &mut peer.buf,
            self.config.timestamps,
            &TrunkEntry {
                callno,
                ts: self.config.timestamps.then_some(ts),
                payload: payload.to_vec(),
            },
        );
        peer.calls_this_tick += 1;
        flushed
    }

    /// The tick: one meta frame per host holding anything.
    pub fn drain(&self, now: Instant) -> Vec<TrunkDatagram> {
        let mut out = Vec::new();
        let mut peers = self.peers.lock();
        for (addr, peer) in peers.iter_mut() {
            if peer.buf.is_empty() {
                continue;
            }
            debug!(%addr, calls = peer.calls_this_tick, bytes = peer.buf.len(), "trunk tick");
            out.push(TrunkDatagram {
                addr: *addr,
                data: self.meta_frame(now, &peer.buf),
            });
            peer.buf.clear();
            peer.calls_this_tick = 0;
            peer.last_tx = now;
        }
        out
    }

    /// Drops hosts that have sent nothing for the idle timeout.
    pub fn reap(&self, now: Instant) {
        self.peers.lock().retain(|addr, peer| {
            let keep =
                !peer.buf.is_empty() || now.duration_since(peer.last_tx) < TRUNK_IDLE_TIMEOUT;
            if !keep {
                debug!(%addr, "trunk peer idle, reaping");
            }
            keep
        });
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "203.0.113.20:4569".parse().unwrap()
    }

    fn manager(timestamps: bool) -> TrunkManager {
        TrunkManager::new(
            TrunkConfig {
                timestamps,
                ..Default::default()
            },
            Instant::now(),
        )
    }

    #[test]
    fn five_calls_one_datagram() {
        let now = Instant::now();
        let mgr = manager(true);
        for callno in 1..=5u16 {
            assert!(mgr
                .queue(addr(), callno, callno * 20, &[0u8; 20], now)
                .is_none());
        }
        let out = mgr.drain(now + Duration::from_millis(20));
        assert_eq!(out.len(), 1);
        // 8-byte meta header + 5 * (callno + ts + len + 20 bytes of audio)
        assert_eq!(out[0].data.len(), META_HDR_LEN + 5 * (2 + 2 + 2 + 20));

        // Next tick starts fresh.
        assert!(mgr.drain(now + Duration::from_millis(40)).is_empty());
    }

    #[test]
    fn supermini_entries_omit_timestamp() {
        let now = Instant::now();
        let mgr = manager(false);
        for callno in 1..=5u16 {
            mgr.queue(addr(), callno, 0, &[0u8; 20], now);
        }
        let out = mgr.drain(now);
        assert_eq!(out[0].data.len(), META_HDR_LEN + 5 * (2 + 2 + 20));
    }

    #[test]
    fn mtu_overflow_flushes_early() {
        let now = Instant::now();
        let mgr = manager(true);
        let payload = [0u8; 160];
        let mut flushes = 0;
        for callno in 0..20u16 {
            if mgr.queue(addr(), callno + 2, 0, &payload, now).is_some() {
                flushes += 1;
            }
        }
        assert!(flushes > 0);
        for d in mgr.drain(now) {
            assert!(d.data.len() <= 1240);
        }
    }

    #[test]
    fn idle_peers_reaped_after_five_seconds() {
        let now = Instant::now();
        let mgr = manager(true);
        mgr.queue(addr(), 2, 0, &[0u8; 20], now);
        mgr.drain(now);
        assert_eq!(mgr.peer_count(), 1);
        mgr.reap(now + Duration::from_secs(4));
        assert_eq!(mgr.peer_count(), 1);
        mgr.reap(now + Duration::from_secs(6));
        assert_eq!(mgr.peer_count(), 0);
    }
}
