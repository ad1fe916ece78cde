//! Call-number allocation: the shuffled pools, the reuse quarantine
//! bookkeeping and the per-remote quotas.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::RngCore;
use tracing::warn;

use iax2_proto::constants::MAX_CALLS;

use crate::error::{EngineError, EngineResult};

/// A freed call number stays out of circulation this long so retransmissions
/// aimed at the old call cannot land on a new one.
pub const MIN_REUSE_TIME: Duration = Duration::from_secs(60);

/// First trunk call number; non-trunk numbers live below.
pub const TRUNK_BOUNDARY: u16 = (MAX_CALLS / 2) as u16;

/// Call numbers 0 and 1 are reserved (0 is "no call", 1 answers stateless
/// pokes).
const FIRST_USABLE: u16 = 2;

/// One half of the split pool, a Fisher–Yates–Durstenfeld arrangement: the
/// first `available` entries are free; allocation swaps a uniformly random
/// free entry to the boundary and shrinks it.
#[derive(Debug)]
struct ShufflePool {
    numbers: Vec<u16>,
    available: usize,
}

impl ShufflePool {
    fn new(range: std::ops::Range<u16>) -> Self {
        let numbers: Vec<u16> = range.collect();
        let available = numbers.len();
        Self { numbers, available }
    }

    fn allocate(&mut self, rng: &mut dyn RngCore) -> Option<u16> {
        if self.available == 0 {
            return None;
        }
        let idx = (rng.next_u64() % self.available as u64) as usize;
        self.numbers.swap(idx, self.available - 1);
        self.available -= 1;
        Some(self.numbers[self.available])
    }

    fn free(&mut self, callno: u16) {
        debug_assert!(self.available < self.numbers.len());
        self.numbers[self.available] = callno;
        self.available += 1;
    }

    fn available(&self) -> usize {
        self.available
    }
}

/// The process-wide pools, split between trunked and plain calls.
#[derive(Debug)]
pub struct CallNumberPool {
    nontrunk: Mutex<ShufflePool>,
    trunk: Mutex<ShufflePool>,
}

impl Default for CallNumberPool {
    fn default() -> Self {
        Self::new()
    }
}

impl CallNumberPool {
    pub fn new() -> Self {
        Self {
            nontrunk: Mutex::new(ShufflePool::new(FIRST_USABLE..TRUNK_BOUNDARY)),
            trunk: Mutex::new(ShufflePool::new(TRUNK_BOUNDARY..MAX_CALLS as u16)),
        }
    }

    pub fn allocate(&self, trunk: bool, rng: &mut dyn RngCore) -> EngineResult<u16> {
        let pool = if trunk { &self.trunk } else { &self.nontrunk };
        pool.lock()
            .allocate(rng)
            .ok_or(EngineError::PoolExhausted)
    }

    /// Returns a quarantined number to circulation. Callers schedule this
    /// [`MIN_REUSE_TIME`] after the slot died; nothing here re-checks.
    pub fn release(&self, callno: u16) {
        if callno >= TRUNK_BOUNDARY {
            self.trunk.lock().free(callno);
        } else {
            self.nontrunk.lock().free(callno);
        }
    }

    pub fn available(&self, trunk: bool) -> usize {
        if trunk {
            self.trunk.lock().available()
        } else {
            self.nontrunk.lock().available()
        }
    }

    pub fn is_trunk_callno(callno: u16) -> bool {
        callno >= TRUNK_BOUNDARY
    }
}

#[derive(Debug, Default)]
struct PeerCount {
    current: u32,
    limit: u32,
    /// Limit was installed by a registration rather than config.
    registered: bool,
}

/// Concurrent call-number accounting per remote IP, plus the global cap on
/// numbers held for senders that never proved their address.
#[derive(Debug)]
pub struct PeerCounts {
    map: Mutex<HashMap<IpAddr, PeerCount>>,
    nonvalidated: AtomicU32,
    nonvalidated_limit: u32,
}

impl PeerCounts {
    pub fn new(nonvalidated_limit: u32) -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
            nonvalidated: AtomicU32::new(0),
            nonvalidated_limit,
        }
    }

    /// Claims one call number for `ip`. `limit` is resolved by the caller
    /// (config ranges, then peer cap, then the global default).
    pub fn acquire(&self, ip: IpAddr, limit: u32, validated: bool) -> EngineResult<()> {
        if !validated {
            let prev = self.nonvalidated.fetch_add(1, Ordering::SeqCst);
            if prev >= self.nonvalidated_limit {
                self.nonvalidated.fetch_sub(1, Ordering::SeqCst);
                warn!(%ip, "non-validated call number quota exceeded");
                return Err(EngineError::NonvalidatedQuotaExceeded);
            }
        }

        let mut map = self.map.lock();
        let entry = map.entry(ip).or_insert_with(|| PeerCount {
            current: 0,
            limit,
            registered: false,
        });
        if !entry.registered {
            entry.limit = limit;
        }
        if entry.current >= entry.limit {
            drop(map);
            if !validated {
                self.nonvalidated.fetch_sub(1, Ordering::SeqCst);
            }
            warn!(%ip, limit, "per-peer call number limit reached");
            return Err(EngineError::PeerLimitExceeded(std::net::SocketAddr::new(
                ip, 0,
            )));
        }
        entry.current += 1;
        Ok(())
    }

    /// Releases one call number. Runs on the same quarantine schedule as the
    /// pool return.
    pub fn release(&self, ip: IpAddr, validated: bool) {
        if !validated {
            self.nonvalidated.fetch_sub(1, Ordering::SeqCst);
        }
        let mut map = self.map.lock();
        if let Some(entry) = map.get_mut(&ip) {
            entry.current = entry.current.saturating_sub(1);
            if entry.current == 0 && !entry.registered {
                map.remove(&ip);
            }
        }
    }

    /// Installs a cap learned from a peer's registration.
    pub fn set_registered_limit(&self, ip: IpAddr, limit: u32) {
        let mut map = self.map.lock();
        let entry = map.entry(ip).or_default();
        entry.limit = limit;
        entry.registered = true;
    }

    pub fn current(&self, ip: IpAddr) -> u32 {
        self.map.lock().get(&ip).map(|e| e.current).unwrap_or(0)
    }

    pub fn nonvalidated_in_use(&self) -> u32 {
        self.nonvalidated.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn pools_stay_in_their_ranges() {
        let pool = CallNumberPool::new();
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..100 {
            let n = pool.allocate(false, &mut rng).unwrap();
            assert!((FIRST_USABLE..TRUNK_BOUNDARY).contains(&n));
            let t = pool.allocate(true, &mut rng).unwrap();
            assert!(t >= TRUNK_BOUNDARY);
        }
    }

    #[test]
    fn allocation_is_unique_until_freed() {
        let pool = CallNumberPool::new();
        let mut rng = StdRng::seed_from_u64(2);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(pool.allocate(false, &mut rng).unwrap()));
        }
    }

    #[test]
    fn freed_number_can_come_back() {
        let pool = CallNumberPool::new();
        let mut rng = StdRng::seed_from_u64(3);
        let n = pool.allocate(false, &mut rng).unwrap();
        let before = pool.available(false);
        pool.release(n);
        assert_eq!(pool.available(false), before + 1);
    }

    #[test]
    fn peer_quota_enforced_at_limit() {
        let counts = PeerCounts::new(100);
        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        for _ in 0..3 {
            counts.acquire(ip, 3, true).unwrap();
        }
        assert!(matches!(
            counts.acquire(ip, 3, true),
            Err(EngineError::PeerLimitExceeded(_))
        ));
        assert_eq!(counts.current(ip), 3);
        counts.release(ip, true);
        counts.acquire(ip, 3, true).unwrap();
    }

    #[test]
    fn nonvalidated_quota_is_global() {
        let counts = PeerCounts::new(2);
        let a: IpAddr = "203.0.113.1".parse().unwrap();
        let b: IpAddr = "203.0.113.2".parse().unwrap();
        counts.acquire(a, 100, false).unwrap();
        counts.acquire(b, 100, false).unwrap();
        assert!(matches!(
            counts.acquire(b, 100, false),
            Err(EngineError::NonvalidatedQuotaExceeded)
        ));
        // Validated calls are exempt.
        counts.acquire(b, 100, true).unwrap();
        counts.release(a, false);
        counts.acquire(a, 100, false).unwrap();
    }
}
