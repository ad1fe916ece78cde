//! Wire-fixed protocol constants.
//!
//! Every value in this module is part of the IAX2 wire format and must not
//! change. Frame layouts are described in `frame`; this module holds the
//! numbering.

/// Protocol version carried in the VERSION IE. Always 2.
pub const IAX_PROTO_VERSION: u16 = 2;

/// Default UDP port.
pub const IAX_DEFAULT_PORT: u16 = 4569;

/// Bit 15 of the first word: set on full frames.
pub const FLAG_FULL: u16 = 0x8000;

/// Bit 15 of the dcallno word: set on retransmissions.
pub const FLAG_RETRANS: u16 = 0x8000;

/// Full-frame header length in bytes, IEs excluded.
pub const FULL_HDR_LEN: usize = 12;

/// Audio mini-frame header length.
pub const MINI_HDR_LEN: usize = 4;

/// Video mini-frame header length.
pub const VIDEO_HDR_LEN: usize = 6;

/// Meta-frame header length up to (and including) the 32-bit timestamp.
pub const META_HDR_LEN: usize = 8;

/// Highest call number expressible in 15 bits, plus one.
pub const MAX_CALLS: usize = 32768;

/// Frame types shared with the channel layer. The numbering is the wire
/// encoding of the full-frame `type` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    DtmfEnd = 1,
    Voice = 2,
    Video = 3,
    Control = 4,
    Null = 5,
    Iax = 6,
    Text = 7,
    Image = 8,
    Html = 9,
    Cng = 10,
    Modem = 11,
    DtmfBegin = 12,
}

impl FrameType {
    pub fn from_wire(value: u8) -> Option<Self> {
        Some(match value {
            1 => FrameType::DtmfEnd,
            2 => FrameType::Voice,
            3 => FrameType::Video,
            4 => FrameType::Control,
            5 => FrameType::Null,
            6 => FrameType::Iax,
            7 => FrameType::Text,
            8 => FrameType::Image,
            9 => FrameType::Html,
            10 => FrameType::Cng,
            11 => FrameType::Modem,
            12 => FrameType::DtmfBegin,
            _ => return None,
        })
    }

    /// True for the frame types that complete the three-way handshake when
    /// they arrive as the first full frame after ACCEPT.
    pub fn completes_handshake(self) -> bool {
        matches!(self, FrameType::Voice | FrameType::Video | FrameType::Iax)
    }
}

/// Subclasses of [`FrameType::Iax`] full frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IaxCommand {
    New = 1,
    Ping = 2,
    Pong = 3,
    Ack = 4,
    Hangup = 5,
    Reject = 6,
    Accept = 7,
    AuthReq = 8,
    AuthRep = 9,
    Inval = 10,
    LagRq = 11,
    LagRp = 12,
    RegReq = 13,
    RegAuth = 14,
    RegAck = 15,
    RegRej = 16,
    RegRel = 17,
    Vnak = 18,
    DpReq = 19,
    DpRep = 20,
    Dial = 21,
    TxReq = 22,
    TxCnt = 23,
    TxAcc = 24,
    TxReady = 25,
    TxRel = 26,
    TxRej = 27,
    Quelch = 28,
    Unquelch = 29,
    Poke = 30,
    Page = 31,
    Mwi = 32,
    Unsupport = 33,
    Transfer = 34,
    Provision = 35,
    FwDownl = 36,
    FwData = 37,
    TxMedia = 38,
    RtKey = 39,
    CallToken = 40,
}

impl IaxCommand {
    pub fn from_wire(value: u8) -> Option<Self> {
        Some(match value {
            1 => IaxCommand::New,
            2 => IaxCommand::Ping,
            3 => IaxCommand::Pong,
            4 => IaxCommand::Ack,
            5 => IaxCommand::Hangup,
            6 => IaxCommand::Reject,
            7 => IaxCommand::Accept,
            8 => IaxCommand::AuthReq,
            9 => IaxCommand::AuthRep,
            10 => IaxCommand::Inval,
            11 => IaxCommand::LagRq,
            12 => IaxCommand::LagRp,
            13 => IaxCommand::RegReq,
            14 => IaxCommand::RegAuth,
            15 => IaxCommand::RegAck,
            16 => IaxCommand::RegRej,
            17 => IaxCommand::RegRel,
            18 => IaxCommand::Vnak,
            19 => IaxCommand::DpReq,
            20 => IaxCommand::DpRep,
            21 => IaxCommand::Dial,
            22 => IaxCommand::TxReq,
            23 => IaxCommand::TxCnt,
            24 => IaxCommand::TxAcc,
            25 => IaxCommand::TxReady,
            26 => IaxCommand::TxRel,
            27 => IaxCommand::TxRej,
            28 => IaxCommand::Quelch,
            29 => IaxCommand::Unquelch,
            30 => IaxCommand::Poke,
            31 => IaxCommand::Page,
            32 => IaxCommand::Mwi,
            33 => IaxCommand::Unsupport,
            34 => IaxCommand::Transfer,
            35 => IaxCommand::Provision,
            36 => IaxCommand::FwDownl,
            37 => IaxCommand::FwData,
            38 => IaxCommand::TxMedia,
            39 => IaxCommand::RtKey,
            40 => IaxCommand::CallToken,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            IaxCommand::New => "NEW",
            IaxCommand::Ping => "PING",
            IaxCommand::Pong => "PONG",
            IaxCommand::Ack => "ACK",
            IaxCommand::Hangup => "HANGUP",
            IaxCommand::Reject => "REJECT",
            IaxCommand::Accept => "ACCEPT",
            IaxCommand::AuthReq => "AUTHREQ",
            IaxCommand::AuthRep => "AUTHREP",
            IaxCommand::Inval => "INVAL",
            IaxCommand::LagRq => "LAGRQ",
            IaxCommand::LagRp => "LAGRP",
            IaxCommand::RegReq => "REGREQ",
            IaxCommand::RegAuth => "REGAUTH",
            IaxCommand::RegAck => "REGACK",
            IaxCommand::RegRej => "REGREJ",
            IaxCommand::RegRel => "REGREL",
            IaxCommand::Vnak => "VNAK",
            IaxCommand::DpReq => "DPREQ",
            IaxCommand::DpRep => "DPREP",
            IaxCommand::Dial => "DIAL",
            IaxCommand::TxReq => "TXREQ",
            IaxCommand::TxCnt => "TXCNT",
            IaxCommand::TxAcc => "TXACC",
            IaxCommand::TxReady => "TXREADY",
            IaxCommand::TxRel => "TXREL",
            IaxCommand::TxRej => "TXREJ",
            IaxCommand::Quelch => "QUELCH",
            IaxCommand::Unquelch => "UNQUELCH",
            IaxCommand::Poke => "POKE",
            IaxCommand::Page => "PAGE",
            IaxCommand::Mwi => "MWI",
            IaxCommand::Unsupport => "UNSUPPORT",
            IaxCommand::Transfer => "TRANSFER",
            IaxCommand::Provision => "PROVISION",
            IaxCommand::FwDownl => "FWDOWNL",
            IaxCommand::FwData => "FWDATA",
            IaxCommand::TxMedia => "TXMEDIA",
            IaxCommand::RtKey => "RTKEY",
            IaxCommand::CallToken => "CALLTOKEN",
        }
    }
}

/// Control-frame subclasses (`FrameType::Control`). Wire numbering is shared
/// with the channel layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlKind {
    Hangup = 1,
    Ring = 2,
    Ringing = 3,
    Answer = 4,
    Busy = 5,
    TakeOffHook = 6,
    OffHook = 7,
    Congestion = 8,
    Flash = 9,
    Wink = 10,
    Option = 11,
    RadioKey = 12,
    RadioUnkey = 13,
    Progress = 14,
    Proceeding = 15,
    Hold = 16,
    Unhold = 17,
    VidUpdate = 18,
    T38 = 19,
    SrcUpdate = 20,
    Transfer = 21,
    ConnectedLine = 22,
    Redirecting = 23,
    T38Parameters = 24,
    Cc = 25,
    SrcChange = 26,
    ReadAction = 27,
    Aoc = 28,
    EndOfQ = 29,
    Incomplete = 30,
    Mcid = 31,
    UpdateRtpPeer = 32,
    PvtCauseCode = 33,
}

impl ControlKind {
    pub fn from_wire(value: u8) -> Option<Self> {
        Some(match value {
            1 => ControlKind::Hangup,
            2 => ControlKind::Ring,
            3 => ControlKind::Ringing,
            4 => ControlKind::Answer,
            5 => ControlKind::Busy,
            6 => ControlKind::TakeOffHook,
            7 => ControlKind::OffHook,
            8 => ControlKind::Congestion,
            9 => ControlKind::Flash,
            10 => ControlKind::Wink,
            11 => ControlKind::Option,
            12 => ControlKind::RadioKey,
            13 => ControlKind::RadioUnkey,
            14 => ControlKind::Progress,
            15 => ControlKind::Proceeding,
            16 => ControlKind::Hold,
            17 => ControlKind::Unhold,
            18 => ControlKind::VidUpdate,
            19 => ControlKind::T38,
            20 => ControlKind::SrcUpdate,
            21 => ControlKind::Transfer,
            22 => ControlKind::ConnectedLine,
            23 => ControlKind::Redirecting,
            24 => ControlKind::T38Parameters,
            25 => ControlKind::Cc,
            26 => ControlKind::SrcChange,
            27 => ControlKind::ReadAction,
            28 => ControlKind::Aoc,
            29 => ControlKind::EndOfQ,
            30 => ControlKind::Incomplete,
            31 => ControlKind::Mcid,
            32 => ControlKind::UpdateRtpPeer,
            33 => ControlKind::PvtCauseCode,
            _ => return None,
        })
    }

    /// Whether this control kind is permitted to cross the wire. Everything
    /// else is dropped at the boundary.
    pub fn allowed_on_wire(self) -> bool {
        matches!(
            self,
            ControlKind::Hangup
                | ControlKind::Ring
                | ControlKind::Ringing
                | ControlKind::Answer
                | ControlKind::Busy
                | ControlKind::Congestion
                | ControlKind::Progress
                | ControlKind::Proceeding
                | ControlKind::Hold
                | ControlKind::Unhold
                | ControlKind::VidUpdate
                | ControlKind::ConnectedLine
                | ControlKind::Redirecting
                | ControlKind::T38Parameters
                | ControlKind::Aoc
                | ControlKind::Incomplete
                | ControlKind::Mcid
                | ControlKind::Flash
                | ControlKind::Wink
                | ControlKind::Option
                | ControlKind::RadioKey
                | ControlKind::RadioUnkey
                | ControlKind::TakeOffHook
                | ControlKind::OffHook
        )
    }
}

/// Authentication method bits (AUTHMETHODS IE).
pub const AUTH_PLAINTEXT: u16 = 1 << 0;
pub const AUTH_MD5: u16 = 1 << 1;
pub const AUTH_RSA: u16 = 1 << 2;

/// Encryption method bits (ENCRYPTION IE).
pub const ENCRYPT_AES128: u16 = 1 << 0;
pub const ENCRYPT_KEYROTATE: u16 = 1 << 15;

/// Meta-frame commands.
pub const META_TRUNK: u8 = 1;
pub const META_VIDEO: u8 = 2;

/// Trunk meta `cmddata` values: which entry format the frame carries.
pub const META_TRUNK_SUPERMINI: u8 = 0;
pub const META_TRUNK_MINI: u8 = 1;

/// Sampling-rate mask bits (SAMPLINGRATE IE). 8 kHz is assumed when absent.
pub const RATE_8KHZ: u16 = 1 << 0;
pub const RATE_11KHZ: u16 = 1 << 1;
pub const RATE_16KHZ: u16 = 1 << 2;
pub const RATE_22KHZ: u16 = 1 << 3;
pub const RATE_44KHZ: u16 = 1 << 4;
pub const RATE_48KHZ: u16 = 1 << 5;

/// Q.931 cause codes the engine emits.
pub mod cause {
    pub const NORMAL_CLEARING: u8 = 16;
    pub const NORMAL_CIRCUIT_CONGESTION: u8 = 34;
    pub const CALL_REJECTED: u8 = 21;
    pub const DESTINATION_OUT_OF_ORDER: u8 = 27;
    pub const FACILITY_REJECTED: u8 = 29;
    pub const BEARERCAPABILITY_NOTAVAIL: u8 = 58;
}
