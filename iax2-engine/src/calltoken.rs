//! The call-token anti-spoof guard.
//!
//! A sender that wants a call number must first echo a server-signed token
//! proving it receives traffic at the address it claims. The token is
//! `<unix_time>?<sha1-hex(addr || port || time || secret)>`; the server keeps
//! no state between the two messages.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use parking_lot::RwLock;
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::config::CallTokenPolicy;
use crate::error::{EngineError, EngineResult};

#[derive(Debug)]
pub struct CallTokenGuard {
    secret: [u8; 16],
    max_delay: Duration,
    /// Addresses that have completed a validated exchange, for the AUTO
    /// policy upgrade.
    validated_sources: RwLock<HashSet<SocketAddr>>,
}

impl CallTokenGuard {
    pub fn new(secret: [u8; 16], max_delay: Duration) -> Self {
        Self {
            secret,
            max_delay,
            validated_sources: RwLock::new(HashSet::new()),
        }
    }

    fn digest(&self, addr: SocketAddr, unix_secs: i64) -> String {
        let mut hasher = Sha1::new();
        hasher.update(addr.ip().to_string().as_bytes());
        hasher.update(addr.port().to_be_bytes());
        hasher.update(unix_secs.to_string().as_bytes());
        hasher.update(self.secret);
        hex::encode(hasher.finalize())
    }

    /// Builds the token for a requesting sender.
    pub fn create(&self, addr: SocketAddr, now_unix_ms: i64) -> Vec<u8> {
        let secs = now_unix_ms / 1000;
        format!("{secs}?{}", self.digest(addr, secs)).into_bytes()
    }

    /// Checks a token echoed back by the sender.
    pub fn validate(
        &self,
        addr: SocketAddr,
        token: &[u8],
        now_unix_ms: i64,
    ) -> EngineResult<()> {
        let text = std::str::from_utf8(token).map_err(|_| EngineError::CallTokenInvalid)?;
        let (secs_text, mac) = text.split_once('?').ok_or(EngineError::CallTokenInvalid)?;
        let secs: i64 = secs_text.parse().map_err(|_| EngineError::CallTokenInvalid)?;

        let now_secs = now_unix_ms / 1000;
        if secs > now_secs {
            debug!(%addr, "call token from the future");
            return Err(EngineError::CallTokenInvalid);
        }
        if now_secs - secs > self.max_delay.as_secs() as i64 {
            debug!(%addr, age = now_secs - secs, "call token expired");
            return Err(EngineError::CallTokenInvalid);
        }

        let expected = self.digest(addr, secs);
        if expected.as_bytes().ct_eq(mac.as_bytes()).unwrap_u8() != 1 {
            debug!(%addr, "call token hash mismatch");
            return Err(EngineError::CallTokenInvalid);
        }

        self.validated_sources.write().insert(addr);
        Ok(())
    }

    /// Whether this address has ever completed validation (drives the AUTO
    /// policy upgrade).
    pub fn has_validated(&self, addr: SocketAddr) -> bool {
        self.validated_sources.read().contains(&addr)
    }

    /// Resolves the effective requirement for one sender.
    pub fn required_for(
        &self,
        policy: CallTokenPolicy,
        addr: SocketAddr,
        ignores: &crate::acl::Acl,
    ) -> bool {
        match policy {
            CallTokenPolicy::Required => true,
            CallTokenPolicy::No => false,
            CallTokenPolicy::Auto => self.has_validated(addr),
            CallTokenPolicy::Optional => !ignores.is_empty() && !ignores.permits(addr.ip()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> CallTokenGuard {
        CallTokenGuard::new([7; 16], Duration::from_secs(10))
    }

    fn addr() -> SocketAddr {
        "198.51.100.7:4569".parse().unwrap()
    }

    #[test]
    fn round_trip_validates() {
        let g = guard();
        let token = g.create(addr(), 1_700_000_000_000);
        assert!(g.validate(addr(), &token, 1_700_000_009_000).is_ok());
        assert!(g.has_validated(addr()));
    }

    #[test]
    fn expired_token_rejected() {
        let g = guard();
        let token = g.create(addr(), 1_700_000_000_000);
        assert!(g.validate(addr(), &token, 1_700_000_011_000).is_err());
    }

    #[test]
    fn future_token_rejected() {
        let g = guard();
        let token = g.create(addr(), 1_700_000_005_000);
        assert!(g.validate(addr(), &token, 1_700_000_004_000).is_err());
    }

    #[test]
    fn wrong_address_rejected() {
        let g = guard();
        let token = g.create(addr(), 1_700_000_000_000);
        let other: SocketAddr = "198.51.100.8:4569".parse().unwrap();
        assert!(g.validate(other, &token, 1_700_000_001_000).is_err());
    }

    #[test]
    fn tampered_token_rejected() {
        let g = guard();
        let mut token = g.create(addr(), 1_700_000_000_000);
        let last = token.len() - 1;
        token[last] ^= 1;
        assert!(g.validate(addr(), &token, 1_700_000_001_000).is_err());
    }

    #[test]
    fn auto_policy_upgrades() {
        let g = guard();
        let ignores = crate::acl::Acl::new();
        assert!(!g.required_for(CallTokenPolicy::Auto, addr(), &ignores));
        let token = g.create(addr(), 1_700_000_000_000);
        g.validate(addr(), &token, 1_700_000_001_000).unwrap();
        assert!(g.required_for(CallTokenPolicy::Auto, addr(), &ignores));
    }
}
