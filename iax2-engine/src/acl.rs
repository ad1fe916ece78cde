//! Ordered permit/deny address lists.

use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rule {
    Permit,
    Deny,
}

/// An ordered access control list. Rules are evaluated in order; the last
/// matching rule wins, mirroring how the configuration file stacks
/// `permit`/`deny` lines. An empty list permits everything.
#[derive(Debug, Clone, Default)]
pub struct Acl {
    rules: Vec<(Rule, IpAddr, u8)>,
}

impl Acl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn permit(&mut self, net: IpAddr, prefix: u8) -> &mut Self {
        self.rules.push((Rule::Permit, net, prefix));
        self
    }

    pub fn deny(&mut self, net: IpAddr, prefix: u8) -> &mut Self {
        self.rules.push((Rule::Deny, net, prefix));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn permits(&self, addr: IpAddr) -> bool {
        let mut verdict = true;
        for (rule, net, prefix) in &self.rules {
            if addr_in_net(addr, *net, *prefix) {
                verdict = *rule == Rule::Permit;
            }
        }
        verdict
    }
}

/// Whether `addr` falls inside `net/prefix`. Families must match.
pub fn addr_in_net(addr: IpAddr, net: IpAddr, prefix: u8) -> bool {
    match (addr, net) {
        (IpAddr::V4(a), IpAddr::V4(n)) => {
            let prefix = prefix.min(32);
            if prefix == 0 {
                return true;
            }
            let mask = u32::MAX << (32 - u32::from(prefix));
            (u32::from(a) & mask) == (u32::from(n) & mask)
        }
        (IpAddr::V6(a), IpAddr::V6(n)) => {
            let prefix = prefix.min(128);
            if prefix == 0 {
                return true;
            }
            let mask = u128::MAX << (128 - u32::from(prefix));
            (u128::from(a) & mask) == (u128::from(n) & mask)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn empty_acl_permits() {
        assert!(Acl::new().permits(ip("203.0.113.9")));
    }

    #[test]
    fn last_match_wins() {
        let mut acl = Acl::new();
        acl.deny(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
            .permit(ip("192.168.0.0"), 16);
        assert!(acl.permits(ip("192.168.4.4")));
        assert!(!acl.permits(ip("203.0.113.9")));

        let mut acl = Acl::new();
        acl.permit(ip("192.168.0.0"), 16).deny(ip("192.168.4.0"), 24);
        assert!(!acl.permits(ip("192.168.4.4")));
        assert!(acl.permits(ip("192.168.5.4")));
    }

    #[test]
    fn families_do_not_mix() {
        let mut acl = Acl::new();
        acl.deny(ip("::"), 0);
        assert!(acl.permits(ip("203.0.113.9")));
        assert!(!acl.permits(ip("2001:db8::1")));
    }
}
