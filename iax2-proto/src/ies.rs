//! Information element TLV codec.
//!
//! Each IE is a 1-byte id, a 1-byte length, and `length` bytes of value.
//! Decoding produces a tagged variant per known id with an `Unknown`
//! catch-all so unrecognized ids survive a round trip; numeric values are
//! network byte order.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::{WireError, WireResult};

pub mod id {
    pub const CALLED_NUMBER: u8 = 1;
    pub const CALLING_NUMBER: u8 = 2;
    pub const CALLING_ANI: u8 = 3;
    pub const CALLING_NAME: u8 = 4;
    pub const CALLED_CONTEXT: u8 = 5;
    pub const USERNAME: u8 = 6;
    pub const PASSWORD: u8 = 7;
    pub const CAPABILITY: u8 = 8;
    pub const FORMAT: u8 = 9;
    pub const LANGUAGE: u8 = 10;
    pub const VERSION: u8 = 11;
    pub const ADSICPE: u8 = 12;
    pub const DNID: u8 = 13;
    pub const AUTHMETHODS: u8 = 14;
    pub const CHALLENGE: u8 = 15;
    pub const MD5_RESULT: u8 = 16;
    pub const RSA_RESULT: u8 = 17;
    pub const APPARENT_ADDR: u8 = 18;
    pub const REFRESH: u8 = 19;
    pub const DPSTATUS: u8 = 20;
    pub const CALLNO: u8 = 21;
    pub const CAUSE: u8 = 22;
    pub const IAX_UNKNOWN: u8 = 23;
    pub const MSGCOUNT: u8 = 24;
    pub const AUTOANSWER: u8 = 25;
    pub const MUSICONHOLD: u8 = 26;
    pub const TRANSFERID: u8 = 27;
    pub const RDNIS: u8 = 28;
    pub const DATETIME: u8 = 31;
    pub const DEVICETYPE: u8 = 32;
    pub const SERVICEIDENT: u8 = 33;
    pub const FIRMWAREVER: u8 = 34;
    pub const FWBLOCKDESC: u8 = 35;
    pub const FWBLOCKDATA: u8 = 36;
    pub const CALLINGPRES: u8 = 38;
    pub const CALLINGTON: u8 = 39;
    pub const CALLINGTNS: u8 = 40;
    pub const SAMPLINGRATE: u8 = 41;
    pub const CAUSECODE: u8 = 42;
    pub const ENCRYPTION: u8 = 43;
    pub const ENCKEY: u8 = 44;
    pub const CODEC_PREFS: u8 = 45;
    pub const RR_JITTER: u8 = 46;
    pub const RR_LOSS: u8 = 47;
    pub const RR_PKTS: u8 = 48;
    pub const RR_DELAY: u8 = 49;
    pub const RR_DROPPED: u8 = 50;
    pub const RR_OOO: u8 = 51;
    pub const VARIABLE: u8 = 52;
    pub const OSPTOKEN: u8 = 53;
    pub const CALLTOKEN: u8 = 54;
    pub const CAPABILITY2: u8 = 55;
    pub const FORMAT2: u8 = 56;
    pub const CALLINGANI2: u8 = 57;
}

/// One decoded information element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ie {
    CalledNumber(String),
    CallingNumber(String),
    CallingAni(String),
    CallingName(String),
    CalledContext(String),
    Username(String),
    Password(String),
    /// Legacy 32-bit capability mask.
    Capability(u32),
    /// Legacy 32-bit desired format.
    Format(u32),
    Language(String),
    Version(u16),
    AdsiCpe(u16),
    Dnid(String),
    AuthMethods(u16),
    Challenge(String),
    Md5Result(String),
    RsaResult(Vec<u8>),
    ApparentAddr(SocketAddr),
    Refresh(u16),
    DpStatus(u16),
    CallNo(u16),
    Cause(String),
    /// Subclass of a command we did not understand, echoed in UNSUPPORT.
    UnknownCmd(u8),
    MsgCount(u16),
    AutoAnswer,
    MusicOnHold,
    TransferId(u32),
    Rdnis(String),
    DateTime(u32),
    DeviceType(String),
    ServiceIdent(String),
    FirmwareVer(u16),
    FwBlockDesc(u32),
    FwBlockData(Vec<u8>),
    CallingPres(u8),
    CallingTon(u8),
    CallingTns(u16),
    SamplingRate(u16),
    CauseCode(u8),
    Encryption(u16),
    EncKey(Vec<u8>),
    CodecPrefs(String),
    RrJitter(u32),
    RrLoss(u32),
    RrPkts(u32),
    RrDelay(u16),
    RrDropped(u32),
    RrOoo(u32),
    Variable(String),
    OspToken { block: u8, data: Vec<u8> },
    /// Empty data is a token request; otherwise the token itself.
    CallToken(Vec<u8>),
    /// Versioned 64-bit capability (version byte 0 on the wire).
    Capability2(u64),
    /// Versioned 64-bit desired format.
    Format2(u64),
    CallingAni2(u32),
    Unknown { ie: u8, data: Vec<u8> },
}

impl Ie {
    pub fn id(&self) -> u8 {
        match self {
            Ie::CalledNumber(_) => id::CALLED_NUMBER,
            Ie::CallingNumber(_) => id::CALLING_NUMBER,
            Ie::CallingAni(_) => id::CALLING_ANI,
            Ie::CallingName(_) => id::CALLING_NAME,
            Ie::CalledContext(_) => id::CALLED_CONTEXT,
            Ie::Username(_) => id::USERNAME,
            Ie::Password(_) => id::PASSWORD,
            Ie::Capability(_) => id::CAPABILITY,
            Ie::Format(_) => id::FORMAT,
            Ie::Language(_) => id::LANGUAGE,
            Ie::Version(_) => id::VERSION,
            Ie::AdsiCpe(_) => id::ADSICPE,
            Ie::Dnid(_) => id::DNID,
            Ie::AuthMethods(_) => id::AUTHMETHODS,
            Ie::Challenge(_) => id::CHALLENGE,
            Ie::Md5Result(_) => id::MD5_RESULT,
            Ie::RsaResult(_) => id::RSA_RESULT,
            Ie::ApparentAddr(_) => id::APPARENT_ADDR,
            Ie::Refresh(_) => id::REFRESH,
            Ie::DpStatus(_) => id::DPSTATUS,
            Ie::CallNo(_) => id::CALLNO,
            Ie::Cause(_) => id::CAUSE,
            Ie::UnknownCmd(_) => id::IAX_UNKNOWN,
            Ie::MsgCount(_) => id::MSGCOUNT,
            Ie::AutoAnswer => id::AUTOANSWER,
            Ie::MusicOnHold => id::MUSICONHOLD,
            Ie::TransferId(_) => id::TRANSFERID,
            Ie::Rdnis(_) => id::RDNIS,
            Ie::DateTime(_) => id::DATETIME,
            Ie::DeviceType(_) => id::DEVICETYPE,
            Ie::ServiceIdent(_) => id::SERVICEIDENT,
            Ie::FirmwareVer(_) => id::FIRMWAREVER,
            Ie::FwBlockDesc(_) => id::FWBLOCKDESC,
            Ie::FwBlockData(_) => id::FWBLOCKDATA,
            Ie::CallingPres(_) => id::CALLINGPRES,
            Ie::CallingTon(_) => id::CALLINGTON,
            Ie::CallingTns(_) => id::CALLINGTNS,
            Ie::SamplingRate(_) => id::SAMPLINGRATE,
            Ie::CauseCode(_) => id::CAUSECODE,
            Ie::Encryption(_) => id::ENCRYPTION,
            Ie::EncKey(_) => id::ENCKEY,
            Ie::CodecPrefs(_) => id::CODEC_PREFS,
            Ie::RrJitter(_) => id::RR_JITTER,
            Ie::RrLoss(_) => id::RR_LOSS,
            Ie::RrPkts(_) => id::RR_PKTS,
            Ie::RrDelay(_) => id::RR_DELAY,
            Ie::RrDropped(_) => id::RR_DROPPED,
            Ie::RrOoo(_) => id::RR_OOO,
            Ie::Variable(_) => id::VARIABLE,
            Ie::OspToken { .. } => id::OSPTOKEN,
            Ie::CallToken(_) => id::CALLTOKEN,
            Ie::Capability2(_) => id::CAPABILITY2,
            Ie::Format2(_) => id::FORMAT2,
            Ie::CallingAni2(_) => id::CALLINGANI2,
            Ie::Unknown { ie, .. } => *ie,
        }
    }

    /// Appends this IE's TLV bytes.
    pub fn append_to(&self, out: &mut Vec<u8>) {
        match self {
            Ie::CalledNumber(s)
            | Ie::CallingNumber(s)
            | Ie::CallingAni(s)
            | Ie::CallingName(s)
            | Ie::CalledContext(s)
            | Ie::Username(s)
            | Ie::Password(s)
            | Ie::Language(s)
            | Ie::Dnid(s)
            | Ie::Challenge(s)
            | Ie::Md5Result(s)
            | Ie::Cause(s)
            | Ie::Rdnis(s)
            | Ie::DeviceType(s)
            | Ie::ServiceIdent(s)
            | Ie::CodecPrefs(s)
            | Ie::Variable(s) => append_raw(out, self.id(), s.as_bytes()),
            Ie::Capability(v)
            | Ie::Format(v)
            | Ie::TransferId(v)
            | Ie::DateTime(v)
            | Ie::FwBlockDesc(v)
            | Ie::RrJitter(v)
            | Ie::RrLoss(v)
            | Ie::RrPkts(v)
            | Ie::RrDropped(v)
            | Ie::RrOoo(v)
            | Ie::CallingAni2(v) => append_raw(out, self.id(), &v.to_be_bytes()),
            Ie::Version(v)
            | Ie::AdsiCpe(v)
            | Ie::AuthMethods(v)
            | Ie::Refresh(v)
            | Ie::DpStatus(v)
            | Ie::CallNo(v)
            | Ie::MsgCount(v)
            | Ie::FirmwareVer(v)
            | Ie::CallingTns(v)
            | Ie::SamplingRate(v)
            | Ie::Encryption(v)
            | Ie::RrDelay(v) => append_raw(out, self.id(), &v.to_be_bytes()),
            Ie::UnknownCmd(v) | Ie::CallingPres(v) | Ie::CallingTon(v) | Ie::CauseCode(v) => {
                append_raw(out, self.id(), &[*v])
            }
            Ie::RsaResult(d) | Ie::FwBlockData(d) | Ie::EncKey(d) | Ie::CallToken(d) => {
                append_raw(out, self.id(), d)
            }
            Ie::AutoAnswer | Ie::MusicOnHold => append_raw(out, self.id(), &[]),
            Ie::ApparentAddr(addr) => {
                let bytes = encode_sockaddr(addr);
                append_raw(out, self.id(), &bytes);
            }
            Ie::OspToken { block, data } => {
                let mut v = Vec::with_capacity(data.len() + 1);
                v.push(*block);
                v.extend_from_slice(data);
                append_raw(out, self.id(), &v);
            }
            Ie::Capability2(v) | Ie::Format2(v) => {
                let mut bytes = [0u8; 9];
                bytes[1..].copy_from_slice(&v.to_be_bytes());
                append_raw(out, self.id(), &bytes);
            }
            Ie::Unknown { data, .. } => append_raw(out, self.id(), data),
        }
    }
}

fn append_raw(out: &mut Vec<u8>, ie: u8, data: &[u8]) {
    debug_assert!(data.len() <= u8::MAX as usize);
    out.push(ie);
    out.push(data.len() as u8);
    out.extend_from_slice(data);
}

/// Serializes a list of IEs into a full-frame payload.
pub fn build_ies(ies: &[Ie]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ies.len() * 8);
    for ie in ies {
        ie.append_to(&mut out);
    }
    out
}

/// Parses a full-frame IE payload into a list of elements.
///
/// Unknown ids are preserved as [`Ie::Unknown`]. A declared length that spans
/// past the payload is a hard error; the frame is not trustworthy past that
/// point.
pub fn parse_ies(mut data: &[u8]) -> WireResult<Vec<Ie>> {
    let mut out = Vec::new();
    while data.len() >= 2 {
        let ie = data[0];
        let len = data[1] as usize;
        if len > data.len() - 2 {
            return Err(WireError::BadIeLen { ie, len });
        }
        let value = &data[2..2 + len];
        out.push(decode_one(ie, value));
        data = &data[2 + len..];
    }
    if !data.is_empty() {
        return Err(WireError::BadIeLen {
            ie: data[0],
            len: data.len(),
        });
    }
    Ok(out)
}

fn decode_one(ie: u8, v: &[u8]) -> Ie {
    // Mis-sized numeric IEs degrade to Unknown rather than killing the frame;
    // the sender's other elements may still be usable.
    match ie {
        id::CALLED_NUMBER => Ie::CalledNumber(text(v)),
        id::CALLING_NUMBER => Ie::CallingNumber(text(v)),
        id::CALLING_ANI => Ie::CallingAni(text(v)),
        id::CALLING_NAME => Ie::CallingName(text(v)),
        id::CALLED_CONTEXT => Ie::CalledContext(text(v)),
        id::USERNAME => Ie::Username(text(v)),
        id::PASSWORD => Ie::Password(text(v)),
        id::CAPABILITY => match be_u32(v) {
            Some(x) => Ie::Capability(x),
            None => unknown(ie, v),
        },
        id::FORMAT => match be_u32(v) {
            Some(x) => Ie::Format(x),
            None => unknown(ie, v),
        },
        id::LANGUAGE => Ie::Language(text(v)),
        id::VERSION => match be_u16(v) {
            Some(x) => Ie::Version(x),
            None => unknown(ie, v),
        },
        id::ADSICPE => match be_u16(v) {
            Some(x) => Ie::AdsiCpe(x),
            None => unknown(ie, v),
        },
        id::DNID => Ie::Dnid(text(v)),
        id::AUTHMETHODS => match be_u16(v) {
            Some(x) => Ie::AuthMethods(x),
            None => unknown(ie, v),
        },
        id::CHALLENGE => Ie::Challenge(text(v)),
        id::MD5_RESULT => Ie::Md5Result(text(v)),
        id::RSA_RESULT => Ie::RsaResult(v.to_vec()),
        id::APPARENT_ADDR => match decode_sockaddr(v) {
            Some(a) => Ie::ApparentAddr(a),
            None => unknown(ie, v),
        },
        id::REFRESH => match be_u16(v) {
            Some(x) => Ie::Refresh(x),
            None => unknown(ie, v),
        },
        id::DPSTATUS => match be_u16(v) {
            Some(x) => Ie::DpStatus(x),
            None => unknown(ie, v),
        },
        id::CALLNO => match be_u16(v) {
            Some(x) => Ie::CallNo(x),
            None => unknown(ie, v),
        },
        id::CAUSE => Ie::Cause(text(v)),
        id::IAX_UNKNOWN => match v {
            [b] => Ie::UnknownCmd(*b),
            _ => unknown(ie, v),
        },
        id::MSGCOUNT => match be_u16(v) {
            Some(x) => Ie::MsgCount(x),
            None => unknown(ie, v),
        },
        id::AUTOANSWER => Ie::AutoAnswer,
        id::MUSICONHOLD => Ie::MusicOnHold,
        id::TRANSFERID => match be_u32(v) {
            Some(x) => Ie::TransferId(x),
            None => unknown(ie, v),
        },
        id::RDNIS => Ie::Rdnis(text(v)),
        id::DATETIME => match be_u32(v) {
            Some(x) => Ie::DateTime(x),
            None => unknown(ie, v),
        },
        id::DEVICETYPE => Ie::DeviceType(text(v)),
        id::SERVICEIDENT => Ie::ServiceIdent(text(v)),
        id::FIRMWAREVER => match be_u16(v) {
            Some(x) => Ie::FirmwareVer(x),
            None => unknown(ie, v),
        },
        id::FWBLOCKDESC => match be_u32(v) {
            Some(x) => Ie::FwBlockDesc(x),
            None => unknown(ie, v),
        },
        id::FWBLOCKDATA => Ie::FwBlockData(v.to_vec()),
        id::CALLINGPRES => match v {
            [b] => Ie::CallingPres(*b),
            _ => unknown(ie, v),
        },
        id::CALLINGTON => match v {
            [b] => Ie::CallingTon(*b),
            _ => unknown(ie, v),
        },
        id::CALLINGTNS => match be_u16(v) {
            Some(x) => Ie::CallingTns(x),
            None => unknown(ie, v),
        },
        id::SAMPLINGRATE => match be_u16(v) {
            Some(x) => Ie::SamplingRate(x),
            None => unknown(ie, v),
        },
        id::CAUSECODE => match v {
            [b] => Ie::CauseCode(*b),
            _ => unknown(ie, v),
        },
        id::ENCRYPTION => match be_u16(v) {
            Some(x) => Ie::Encryption(x),
            None => unknown(ie, v),
        },
        id::ENCKEY => Ie::EncKey(v.to_vec()),
        id::CODEC_PREFS => Ie::CodecPrefs(text(v)),
        id::RR_JITTER => match be_u32(v) {
            Some(x) => Ie::RrJitter(x),
            None => unknown(ie, v),
        },
        id::RR_LOSS => match be_u32(v) {
            Some(x) => Ie::RrLoss(x),
            None => unknown(ie, v),
        },
        id::RR_PKTS => match be_u32(v) {
            Some(x) => Ie::RrPkts(x),
            None => unknown(ie, v),
        },
        id::RR_DELAY => match be_u16(v) {
            Some(x) => Ie::RrDelay(x),
            None => unknown(ie, v),
        },
        id::RR_DROPPED => match be_u32(v) {
            Some(x) => Ie::RrDropped(x),
            None => unknown(ie, v),
        },
        id::RR_OOO => match be_u32(v) {
            Some(x) => Ie::RrOoo(x),
            None => unknown(ie, v),
        },
        id::VARIABLE => Ie::Variable(text(v)),
        id::OSPTOKEN => match v.split_first() {
            Some((block, rest)) => Ie::OspToken {
                block: *block,
                data: rest.to_vec(),
            },
            None => unknown(ie, v),
        },
        id::CALLTOKEN => Ie::CallToken(v.to_vec()),
        id::CAPABILITY2 => match versioned_u64(v) {
            Some(x) => Ie::Capability2(x),
            None => unknown(ie, v),
        },
        id::FORMAT2 => match versioned_u64(v) {
            Some(x) => Ie::Format2(x),
            None => unknown(ie, v),
        },
        id::CALLINGANI2 => match be_u32(v) {
            Some(x) => Ie::CallingAni2(x),
            None => unknown(ie, v),
        },
        _ => unknown(ie, v),
    }
}

fn unknown(ie: u8, v: &[u8]) -> Ie {
    Ie::Unknown {
        ie,
        data: v.to_vec(),
    }
}

fn text(v: &[u8]) -> String {
    String::from_utf8_lossy(v).into_owned()
}

fn be_u16(v: &[u8]) -> Option<u16> {
    Some(u16::from_be_bytes(v.try_into().ok()?))
}

fn be_u32(v: &[u8]) -> Option<u32> {
    Some(u32::from_be_bytes(v.try_into().ok()?))
}

fn versioned_u64(v: &[u8]) -> Option<u64> {
    match v {
        [0, rest @ ..] if rest.len() == 8 => Some(u64::from_be_bytes(rest.try_into().ok()?)),
        // Unknown versions are not an error; the caller keeps the raw bytes.
        _ => None,
    }
}

/// Length of an encoded IPv4 sockaddr: family + port + addr + 8 bytes zero.
const SOCKADDR_IN_LEN: usize = 16;
/// Length of an encoded IPv6 sockaddr: family + port + flowinfo + addr + scope.
const SOCKADDR_IN6_LEN: usize = 28;

const AF_INET: u16 = 2;
const AF_INET6: u16 = 10;

/// Encodes a socket address the way the wire has always carried it: the raw
/// layout of `sockaddr_in`/`sockaddr_in6`, family little-endian, port
/// big-endian. The decoder distinguishes the two by length.
pub fn encode_sockaddr(addr: &SocketAddr) -> Vec<u8> {
    match addr {
        SocketAddr::V4(a) => {
            let mut out = vec![0u8; SOCKADDR_IN_LEN];
            out[0..2].copy_from_slice(&AF_INET.to_le_bytes());
            out[2..4].copy_from_slice(&a.port().to_be_bytes());
            out[4..8].copy_from_slice(&a.ip().octets());
            out
        }
        SocketAddr::V6(a) => {
            let mut out = vec![0u8; SOCKADDR_IN6_LEN];
            out[0..2].copy_from_slice(&AF_INET6.to_le_bytes());
            out[2..4].copy_from_slice(&a.port().to_be_bytes());
            out[8..24].copy_from_slice(&a.ip().octets());
            out
        }
    }
}

pub fn decode_sockaddr(v: &[u8]) -> Option<SocketAddr> {
    match v.len() {
        SOCKADDR_IN_LEN => {
            let port = u16::from_be_bytes([v[2], v[3]]);
            let ip = Ipv4Addr::new(v[4], v[5], v[6], v[7]);
            Some(SocketAddr::new(IpAddr::V4(ip), port))
        }
        SOCKADDR_IN6_LEN => {
            let port = u16::from_be_bytes([v[2], v[3]]);
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&v[8..24]);
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

/// A decoded IE payload flattened into named fields, the shape the call state
/// machine actually consumes. Later duplicates win, except that the 32-bit
/// capability/format never overwrite a 64-bit form already seen.
#[derive(Debug, Default, Clone)]
pub struct IeSet {
    pub called_number: Option<String>,
    pub calling_number: Option<String>,
    pub calling_ani: Option<String>,
    pub calling_name: Option<String>,
    pub called_context: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub capability: Option<u64>,
    pub format: Option<u64>,
    pub language: Option<String>,
    pub version: Option<u16>,
    pub adsicpe: Option<u16>,
    pub dnid: Option<String>,
    pub rdnis: Option<String>,
    pub authmethods: Option<u16>,
    pub challenge: Option<String>,
    pub md5_result: Option<String>,
    pub rsa_result: Option<Vec<u8>>,
    pub apparent_addr: Option<SocketAddr>,
    pub refresh: Option<u16>,
    pub dpstatus: Option<u16>,
    pub callno: Option<u16>,
    pub cause: Option<String>,
    pub causecode: Option<u8>,
    pub iax_unknown: Option<u8>,
    pub msgcount: Option<u16>,
    pub autoanswer: bool,
    pub musiconhold: bool,
    pub transferid: Option<u32>,
    pub datetime: Option<u32>,
    pub devicetype: Option<String>,
    pub serviceident: Option<String>,
    pub firmwarever: Option<u16>,
    pub calling_pres: Option<u8>,
    pub calling_ton: Option<u8>,
    pub calling_tns: Option<u16>,
    pub calling_ani2: Option<u32>,
    pub samprate: u16,
    pub encmethods: Option<u16>,
    pub enckey: Option<Vec<u8>>,
    pub codec_prefs: Option<String>,
    pub rr_jitter: Option<u32>,
    pub rr_loss: Option<u32>,
    pub rr_pkts: Option<u32>,
    pub rr_delay: Option<u16>,
    pub rr_dropped: Option<u32>,
    pub rr_ooo: Option<u32>,
    pub variables: Vec<String>,
    pub calltoken: Option<Vec<u8>>,
    /// Set when a CALLTOKEN IE was present at all, even empty.
    pub calltoken_seen: bool,
    /// Set when the 64-bit capability/format IEs were seen.
    capability2_seen: bool,
    format2_seen: bool,
}

impl IeSet {
    pub fn parse(data: &[u8]) -> WireResult<Self> {
        Ok(Self::from_list(&parse_ies(data)?))
    }

    pub fn from_list(ies: &[Ie]) -> Self {
        let mut set = IeSet {
            samprate: crate::constants::RATE_8KHZ,
            ..Default::default()
        };
        for ie in ies {
            set.absorb(ie);
        }
        set
    }

    fn absorb(&mut self, ie: &Ie) {
        match ie {
            Ie::CalledNumber(s) => self.called_number = Some(s.clone()),
            Ie::CallingNumber(s) => self.calling_number = Some(s.clone()),
            Ie::CallingAni(s) => self.calling_ani = Some(s.clone()),
            Ie::CallingName(s) => self.calling_name = Some(s.clone()),
            Ie::CalledContext(s) => self.called_context = Some(s.clone()),
            Ie::Username(s) => self.username = Some(s.clone()),
            Ie::Password(s) => self.password = Some(s.clone()),
            Ie::Capability(v) => {
                if !self.capability2_seen {
                    self.capability = Some(u64::from(*v));
                }
            }
            Ie::Capability2(v) => {
                self.capability = Some(*v);
                self.capability2_seen = true;
            }
            Ie::Format(v) => {
                if !self.format2_seen {
                    self.format = Some(u64::from(*v));
                }
            }
            Ie::Format2(v) => {
                self.format = Some(*v);
                self.format2_seen = true;
            }
            Ie::Language(s) => self.language = Some(s.clone()),
            Ie::Version(v) => self.version = Some(*v),
            Ie::AdsiCpe(v) => self.adsicpe = Some(*v),
            Ie::Dnid(s) => self.dnid = Some(s.clone()),
            Ie::Rdnis(s) => self.rdnis = Some(s.clone()),
            Ie::AuthMethods(v) => self.authmethods = Some(*v),
            Ie::Challenge(s) => self.challenge = Some(s.clone()),
            Ie::Md5Result(s) => self.md5_result = Some(s.clone()),
            Ie::RsaResult(d) => self.rsa_result = Some(d.clone()),
            Ie::ApparentAddr(a) => self.apparent_addr = Some(*a),
            Ie::Refresh(v) => self.refresh = Some(*v),
            Ie::DpStatus(v) => self.dpstatus = Some(*v),
            Ie::CallNo(v) => self.callno = Some(*v),
            Ie::Cause(s) => self.cause = Some(s.clone()),
            Ie::CauseCode(v) => self.causecode = Some(*v),
            Ie::UnknownCmd(v) => self.iax_unknown = Some(*v),
            Ie::MsgCount(v) => self.msgcount = Some(*v),
            Ie::AutoAnswer => self.autoanswer = true,
            Ie::MusicOnHold => self.musiconhold = true,
            Ie::TransferId(v) => self.transferid = Some(*v),
            Ie::DateTime(v) => self.datetime = Some(*v),
            Ie::DeviceType(s) => self.devicetype = Some(s.clone()),
            Ie::ServiceIdent(s) => self.serviceident = Some(s.clone()),
            Ie::FirmwareVer(v) => self.firmwarever = Some(*v),
            Ie::CallingPres(v) => self.calling_pres = Some(*v),
            Ie::CallingTon(v) => self.calling_ton = Some(*v),
            Ie::CallingTns(v) => self.calling_tns = Some(*v),
            Ie::CallingAni2(v) => self.calling_ani2 = Some(*v),
            Ie::SamplingRate(v) => self.samprate = *v,
            Ie::Encryption(v) => self.encmethods = Some(*v),
            Ie::EncKey(d) => self.enckey = Some(d.clone()),
            Ie::CodecPrefs(s) => self.codec_prefs = Some(s.clone()),
            Ie::RrJitter(v) => self.rr_jitter = Some(*v),
            Ie::RrLoss(v) => self.rr_loss = Some(*v),
            Ie::RrPkts(v) => self.rr_pkts = Some(*v),
            Ie::RrDelay(v) => self.rr_delay = Some(*v),
            Ie::RrDropped(v) => self.rr_dropped = Some(*v),
            Ie::RrOoo(v) => self.rr_ooo = Some(*v),
            Ie::Variable(s) => self.variables.push(s.clone()),
            Ie::CallToken(d) => {
                self.calltoken_seen = true;
                if !d.is_empty() {
                    self.calltoken = Some(d.clone());
                }
            }
            Ie::FwBlockDesc(_) | Ie::FwBlockData(_) | Ie::OspToken { .. } | Ie::Unknown { .. } => {}
        }
    }
}
