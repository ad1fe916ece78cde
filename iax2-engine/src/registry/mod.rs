//! Peers, users and the bindings learned from registrations.

mod registration;

pub use registration::{RegState, Registration};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::config::{PeerConfig, RegistrationConfig, UserConfig};

/// Reachability as seen by the qualify machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerStatus {
    #[default]
    Unknown,
    /// Round trip in milliseconds.
    Reachable(u32),
    Unreachable,
    /// Qualify disabled for this peer.
    Unmonitored,
}

/// Runtime state layered over a peer's configuration.
#[derive(Debug)]
pub struct Peer {
    pub config: PeerConfig,
    /// Where the peer is right now: the static host or the registered
    /// binding.
    pub addr: Option<SocketAddr>,
    /// When the current dynamic binding lapses.
    pub expiry_at: Option<Instant>,
    pub status: PeerStatus,
    /// Smoothed qualify round-trip (ms).
    pub historic_ms: u32,
    /// Call number of a POKE in flight, if any.
    pub poke_callno: Option<u16>,
    /// Challenge outstanding from a REGAUTH we sent.
    pub challenge: Option<String>,
    pub auth_fails: u32,
    pub expire_timer: Option<crate::sched::TimerId>,
    pub qualify_timer: Option<crate::sched::TimerId>,
}

impl Peer {
    pub fn new(config: PeerConfig) -> Self {
        let addr = config.host;
        let status = if config.maxms == 0 {
            PeerStatus::Unmonitored
        } else {
            PeerStatus::Unknown
        };
        Self {
            config,
            addr,
            expiry_at: None,
            status,
            historic_ms: 0,
            poke_callno: None,
            challenge: None,
            auth_fails: 0,
            expire_timer: None,
            qualify_timer: None,
        }
    }

    /// Folds a fresh qualify sample into the historic value. With smoothing
    /// on, old and new each weigh half.
    pub fn record_qualify_ms(&mut self, ms: u32) {
        self.historic_ms = if self.config.qualify_smoothing && self.historic_ms != 0 {
            (self.historic_ms + ms) / 2
        } else {
            ms
        };
        self.status = PeerStatus::Reachable(self.historic_ms);
    }
}

/// Persistence seam for `IAX/Registry/<name>` bindings. The realtime
/// database lives on the far side of this trait.
pub trait RegistryStore: Send + Sync {
    fn put(&self, peer: &str, value: &str);
    fn get(&self, peer: &str) -> Option<String>;
    fn delete(&self, peer: &str);
}

/// In-process store used by default and under test.
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: Mutex<HashMap<String, String>>,
}

impl RegistryStore for MemoryStore {
    fn put(&self, peer: &str, value: &str) {
        self.map.lock().insert(peer.to_string(), value.to_string());
    }

    fn get(&self, peer: &str) -> Option<String> {
        self.map.lock().get(peer).cloned()
    }

    fn delete(&self, peer: &str) {
        self.map.lock().remove(peer);
    }
}

/// Formats the persisted binding value: `<addr>:<port>:<expirySeconds>`.
pub fn format_binding(addr: SocketAddr, expiry_secs: u16) -> String {
    format!("{}:{}:{}", addr.ip(), addr.port(), expiry_secs)
}

#[derive(Default)]
pub struct Registry {
    peers: RwLock<HashMap<String, Arc<Mutex<Peer>>>>,
    users: RwLock<HashMap<String, Arc<UserConfig>>>,
    registrations: Mutex<Vec<Registration>>,
    /// Outstanding AUTHREQ challenges per user, bounded by `maxauthreq`.
    authreq_counts: Mutex<HashMap<String, u32>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_peer(&self, config: PeerConfig) {
        let name = config.name.clone();
        debug!(peer = %name, dynamic = config.dynamic(), "peer loaded");
        self.peers
            .write()
            .insert(name, Arc::new(Mutex::new(Peer::new(config))));
    }

    pub fn remove_peer(&self, name: &str) -> bool {
        self.peers.write().remove(name).is_some()
    }

    pub fn add_user(&self, config: UserConfig) {
        debug!(user = %config.name, "user loaded");
        self.users
            .write()
            .insert(config.name.clone(), Arc::new(config));
    }

    pub fn peer(&self, name: &str) -> Option<Arc<Mutex<Peer>>> {
        self.peers.read().get(name).cloned()
    }

    pub fn user(&self, name: &str) -> Option<Arc<UserConfig>> {
        self.users.read().get(name).cloned()
    }

    pub fn peer_names(&self) -> Vec<String> {
        self.peers.read().keys().cloned().collect()
    }

    /// Finds the peer currently bound to an address.
    pub fn peer_by_addr(&self, addr: SocketAddr) -> Option<Arc<Mutex<Peer>>> {
        self.peers
            .read()
            .values()
            .find(|p| {
                let p = p.lock();
                p.addr.map(|a| a.ip()) == Some(addr.ip())
            })
            .cloned()
    }

    /// Scores users against an inbound call and returns the best match:
    /// exact username first, then an ACL hit, then a mere secret.
    pub fn best_user(
        &self,
        username: Option<&str>,
        addr: SocketAddr,
    ) -> Option<Arc<UserConfig>> {
        let users = self.users.read();
        let mut best: Option<(u32, &Arc<UserConfig>)> = None;
        for user in users.values() {
            if let Some(name) = username {
                if user.name != name {
                    continue;
                }
            }
            if !user.acl.permits(addr.ip()) {
                continue;
            }
            let mut score = 0;
            if username == Some(user.name.as_str()) {
                score += 4;
            }
            if !user.acl.is_empty() {
                score += 2;
            }
            if user.credentials.secret.is_some() {
                score += 1;
            }
            if best.as_ref().map(|(s, _)| score > *s).unwrap_or(true) {
                best = Some((score, user));
            }
        }
        best.map(|(_, u)| u.clone())
    }

    /// Claims one outstanding AUTHREQ for a user; false when the cap is
    /// already reached.
    pub fn try_begin_authreq(&self, user: &str, cap: u32) -> bool {
        let mut counts = self.authreq_counts.lock();
        let count = counts.entry(user.to_string()).or_insert(0);
        if *count >= cap {
            return false;
        }
        *count += 1;
        true
    }

    /// Releases an outstanding AUTHREQ after the reply (or the slot) died.
    pub fn end_authreq(&self, user: &str) {
        let mut counts = self.authreq_counts.lock();
        if let Some(count) = counts.get_mut(user) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(user);
            }
        }
    }

    pub fn add_registration(&self, config: RegistrationConfig) -> usize {
        let mut regs = self.registrations.lock();
        regs.push(Registration::new(config));
        info!(index = regs.len() - 1, "outbound registration added");
        regs.len() - 1
    }

    pub fn with_registration<R>(
        &self,
        index: usize,
        f: impl FnOnce(&mut Registration) -> R,
    ) -> Option<R> {
        self.registrations.lock().get_mut(index).map(f)
    }

    pub fn registration_count(&self) -> usize {
        self.registrations.lock().len()
    }

    /// Finds the registration owning a call number.
    pub fn registration_by_callno(&self, callno: u16) -> Option<usize> {
        self.registrations
            .lock()
            .iter()
            .position(|r| r.callno == Some(callno))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;

    fn addr() -> SocketAddr {
        "203.0.113.5:4569".parse().unwrap()
    }

    #[test]
    fn exact_name_beats_acl_only() {
        let reg = Registry::new();

        let mut named = UserConfig::new("alice");
        named.credentials = Credentials {
            secret: Some("x".into()),
            ..Default::default()
        };
        reg.add_user(named);

        let mut acl_user = UserConfig::new("lan");
        acl_user.acl.permit("203.0.113.0".parse().unwrap(), 24);
        reg.add_user(acl_user);

        let best = reg.best_user(Some("alice"), addr()).unwrap();
        assert_eq!(best.name, "alice");

        // Without a username the ACL user wins over nothing.
        let best = reg.best_user(None, addr()).unwrap();
        assert_eq!(best.name, "lan");
    }

    #[test]
    fn acl_blocks_named_user() {
        let reg = Registry::new();
        let mut user = UserConfig::new("bob");
        user.acl.deny("203.0.113.0".parse().unwrap(), 24);
        reg.add_user(user);
        assert!(reg.best_user(Some("bob"), addr()).is_none());
    }

    #[test]
    fn qualify_smoothing_halves() {
        let mut cfg = PeerConfig::new("p");
        cfg.qualify_smoothing = true;
        cfg.maxms = 2000;
        let mut peer = Peer::new(cfg);
        peer.record_qualify_ms(100);
        assert_eq!(peer.historic_ms, 100);
        peer.record_qualify_ms(50);
        assert_eq!(peer.historic_ms, 75);
    }
}
