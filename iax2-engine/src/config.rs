//! Runtime configuration.
//!
//! Parsing the INI surface stays with the host; these structs carry the
//! values the engine consumes, with the documented defaults baked into the
//! `Default` impls so a bare `Config::default()` behaves like an untouched
//! install.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use iax2_proto::constants::{AUTH_MD5, AUTH_PLAINTEXT, AUTH_RSA, IAX_DEFAULT_PORT};
use iax2_transport::jitter::JitterConfig;

use crate::acl::Acl;

/// Per-peer call-token enforcement policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallTokenPolicy {
    /// Token always demanded.
    Required,
    /// Token demanded unless the address is on the ignore list.
    #[default]
    Optional,
    /// Starts optional; upgrades to required after the first validated
    /// exchange from that peer.
    Auto,
    /// Never demanded.
    No,
}

/// Which side's preference list drives codec selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecPriority {
    Caller,
    #[default]
    Host,
    /// Preference lists disabled; pick the highest capability bit.
    Disabled,
    /// Accept only the caller's exact requested format.
    ReqOnly,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bindaddr: SocketAddr,
    /// Fixed worker pool size.
    pub thread_count: usize,
    /// Cap on pool plus dynamic workers.
    pub max_thread_count: usize,
    pub jitterbuffer: bool,
    pub jitter: JitterConfig,
    pub ping_time: Duration,
    pub lagrq_time: Duration,
    /// Trunk drain cadence.
    pub trunk_freq: Duration,
    pub trunk_mtu: usize,
    pub trunk_max_size: usize,
    pub trunk_timestamps: bool,
    pub max_reg_expire: u16,
    pub min_reg_expire: u16,
    pub auth_debug: bool,
    /// Encryption methods offered by default (ENCRYPT_* bits).
    pub encryption: u16,
    pub force_encryption: bool,
    pub delay_reject: bool,
    /// Whether `delay_reject` also applies to call-token stage rejects.
    pub delay_reject_calltoken: bool,
    pub max_auth_req: u32,
    /// Default audio capability mask.
    pub capability: u64,
    pub calltoken_policy: CallTokenPolicy,
    /// Addresses exempt from optional call-token checks.
    pub calltoken_ignores: Acl,
    pub max_calltoken_delay: Duration,
    /// Default per-remote concurrent call-number cap.
    pub max_call_numbers: u32,
    /// System-wide cap for unvalidated senders.
    pub max_call_numbers_nonvalidated: u32,
    pub shrink_callerid: bool,
    /// Outgoing call setup deadline before auto-congestion.
    pub max_time: Duration,
    pub codec_priority: CodecPriority,
    /// Auth methods offered to peers with no per-user setting.
    pub auth_methods: u16,
    /// Secret mixed into call-token hashes. Regenerated at startup when the
    /// host does not pin one.
    pub calltoken_secret: [u8; 16],
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bindaddr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), IAX_DEFAULT_PORT),
            thread_count: 10,
            max_thread_count: 100,
            jitterbuffer: true,
            jitter: JitterConfig::default(),
            ping_time: Duration::from_secs(21),
            lagrq_time: Duration::from_secs(10),
            trunk_freq: Duration::from_millis(20),
            trunk_mtu: 1240,
            trunk_max_size: 128_000,
            trunk_timestamps: true,
            max_reg_expire: 3600,
            min_reg_expire: 60,
            auth_debug: true,
            encryption: 0,
            force_encryption: false,
            delay_reject: false,
            delay_reject_calltoken: false,
            max_auth_req: 3,
            capability: iax2_proto::format::ULAW
                | iax2_proto::format::ALAW
                | iax2_proto::format::GSM,
            calltoken_policy: CallTokenPolicy::Optional,
            calltoken_ignores: Acl::default(),
            max_calltoken_delay: Duration::from_secs(10),
            max_call_numbers: 2048,
            max_call_numbers_nonvalidated: 8192,
            shrink_callerid: true,
            max_time: Duration::from_secs(30),
            codec_priority: CodecPriority::default(),
            auth_methods: AUTH_MD5 | AUTH_PLAINTEXT,
            calltoken_secret: [0; 16],
        }
    }
}

/// How a peer or user proves itself.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub secret: Option<String>,
    /// Names of trusted public keys for inbound RSA auth.
    pub inkeys: Vec<String>,
    /// Name of the private key used for outbound RSA auth.
    pub outkey: Option<String>,
    /// AUTH_* bits this identity accepts; 0 falls back to the global set.
    pub auth_methods: u16,
}

impl Credentials {
    pub fn methods_or(&self, fallback: u16) -> u16 {
        if self.auth_methods != 0 {
            self.auth_methods
        } else if self.secret.is_some() || !self.inkeys.is_empty() {
            let mut m = fallback;
            if !self.inkeys.is_empty() {
                m |= AUTH_RSA;
            }
            m
        } else {
            fallback
        }
    }

    pub fn requires_auth(&self) -> bool {
        self.secret.is_some() || !self.inkeys.is_empty()
    }
}

/// Static or registered remote the engine may call or qualify.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub name: String,
    pub credentials: Credentials,
    /// `None` makes the peer dynamic (address learned from REGREQ).
    pub host: Option<SocketAddr>,
    pub default_refresh: u16,
    pub encryption: u16,
    pub force_encryption: bool,
    pub transfer_allowed: bool,
    pub trunk: bool,
    pub acl: Acl,
    pub context: String,
    pub callerid_num: Option<String>,
    pub callerid_name: Option<String>,
    pub mailbox: Option<String>,
    /// Qualify threshold in ms; 0 disables pokes.
    pub maxms: u32,
    pub qualify_freq_ok: Duration,
    pub qualify_freq_notok: Duration,
    /// Smooth historic poke times instead of keeping the last sample.
    pub qualify_smoothing: bool,
    pub codec_priority: Option<CodecPriority>,
    pub calltoken_policy: Option<CallTokenPolicy>,
    /// Per-peer concurrent call-number cap; `None` uses the global default.
    pub max_call_numbers: Option<u32>,
}

impl PeerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            credentials: Credentials::default(),
            host: None,
            default_refresh: 60,
            encryption: 0,
            force_encryption: false,
            transfer_allowed: true,
            trunk: false,
            acl: Acl::default(),
            context: "default".into(),
            callerid_num: None,
            callerid_name: None,
            mailbox: None,
            maxms: 0,
            qualify_freq_ok: Duration::from_secs(60),
            qualify_freq_notok: Duration::from_secs(10),
            qualify_smoothing: false,
            codec_priority: None,
            calltoken_policy: None,
            max_call_numbers: None,
        }
    }

    pub fn dynamic(&self) -> bool {
        self.host.is_none()
    }
}

/// Identity allowed to place calls into the engine.
#[derive(Debug, Clone)]
pub struct UserConfig {
    pub name: String,
    pub credentials: Credentials,
    pub context: String,
    pub acl: Acl,
    pub capability: u64,
    pub prefs: iax2_proto::codec_pref::CodecPref,
    pub encryption: u16,
    pub force_encryption: bool,
    pub codec_priority: Option<CodecPriority>,
    pub calltoken_policy: Option<CallTokenPolicy>,
}

impl UserConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            credentials: Credentials::default(),
            context: "default".into(),
            acl: Acl::default(),
            capability: 0,
            prefs: iax2_proto::codec_pref::CodecPref::new(),
            encryption: 0,
            force_encryption: false,
            codec_priority: None,
            calltoken_policy: None,
        }
    }
}

/// One `register =>` line: keep a registration alive with a remote server.
#[derive(Debug, Clone)]
pub struct RegistrationConfig {
    pub username: String,
    pub secret: Option<String>,
    pub addr: SocketAddr,
    pub refresh: u16,
}

/// Address-range overrides for the per-remote call-number cap.
#[derive(Debug, Clone, Default)]
pub struct CallNumberLimits {
    entries: Vec<(IpAddr, u8, u32)>,
}

impl CallNumberLimits {
    pub fn add(&mut self, net: IpAddr, prefix: u8, limit: u32) {
        self.entries.push((net, prefix, limit));
    }

    /// The configured limit for an address, if any range matches. The most
    /// specific (longest-prefix) match wins.
    pub fn limit_for(&self, addr: IpAddr) -> Option<u32> {
        self.entries
            .iter()
            .filter(|(net, prefix, _)| crate::acl::addr_in_net(addr, *net, *prefix))
            .max_by_key(|(_, prefix, _)| *prefix)
            .map(|(_, _, limit)| *limit)
    }
}
