//! Outbound registration state.
//!
//! One instance per `register =>` target. The engine drives it from timer
//! events and inbound REGAUTH/REGACK/REGREJ frames; the struct itself only
//! tracks where in the exchange we are.

use std::net::SocketAddr;
use std::time::Duration;

use crate::config::RegistrationConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegState {
    #[default]
    Unregistered,
    /// REGREQ sent, no reply yet.
    RegSent,
    /// Challenge received, REGREQ with proof sent.
    AuthSent,
    Registered,
    Rejected,
    Timeout,
    /// Registrar demanded credentials we do not have.
    NoAuth,
}

#[derive(Debug)]
pub struct Registration {
    pub config: RegistrationConfig,
    pub state: RegState,
    /// Slot carrying the in-flight exchange, if any.
    pub callno: Option<u16>,
    /// Interval granted by the registrar; starts from config.
    pub refresh: u16,
    /// How the registrar sees us, from REGACK's APPARENT_ADDR.
    pub apparent_addr: Option<SocketAddr>,
    pub attempts: u32,
}

impl Registration {
    pub fn new(config: RegistrationConfig) -> Self {
        let refresh = config.refresh;
        Self {
            config,
            state: RegState::Unregistered,
            callno: None,
            refresh,
            apparent_addr: None,
            attempts: 0,
        }
    }

    /// When the next refresh should go out: five sixths of the granted
    /// interval, so the binding never lapses in transit.
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.refresh) * 5 / 6)
    }

    pub fn begin_attempt(&mut self, callno: u16) {
        self.callno = Some(callno);
        self.state = RegState::RegSent;
        self.attempts += 1;
    }

    pub fn on_authenticated(&mut self) {
        self.state = RegState::AuthSent;
    }

    pub fn on_ack(&mut self, refresh: u16, apparent: Option<SocketAddr>) {
        self.state = RegState::Registered;
        if refresh > 0 {
            self.refresh = refresh;
        }
        if apparent.is_some() {
            self.apparent_addr = apparent;
        }
        self.callno = None;
        self.attempts = 0;
    }

    pub fn on_rej(&mut self) {
        self.state = RegState::Rejected;
        self.callno = None;
    }

    pub fn on_timeout(&mut self) {
        self.state = RegState::Timeout;
        self.callno = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg() -> Registration {
        Registration::new(RegistrationConfig {
            username: "kermit".into(),
            secret: Some("frog".into()),
            addr: "203.0.113.1:4569".parse().unwrap(),
            refresh: 60,
        })
    }

    #[test]
    fn refresh_interval_is_five_sixths() {
        let mut r = reg();
        assert_eq!(r.refresh_interval(), Duration::from_secs(50));
        r.on_ack(120, None);
        assert_eq!(r.refresh_interval(), Duration::from_secs(100));
    }

    #[test]
    fn ack_records_apparent_addr() {
        let mut r = reg();
        r.begin_attempt(42);
        assert_eq!(r.state, RegState::RegSent);
        let apparent = "192.0.2.9:4569".parse().unwrap();
        r.on_ack(0, Some(apparent));
        assert_eq!(r.state, RegState::Registered);
        assert_eq!(r.apparent_addr, Some(apparent));
        assert_eq!(r.refresh, 60);
        assert_eq!(r.callno, None);
    }
}
