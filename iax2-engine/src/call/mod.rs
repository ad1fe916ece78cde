//! Per-call state: the slot, its life cycle and the table that multiplexes
//! 32 768 of them over one socket.

mod table;

pub use table::CallTable;

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use iax2_proto::codec_pref::CodecPref;
use iax2_transport::jitter::{JitterBuffer, JitterConfig};
use iax2_transport::reliable::TxQueue;
use iax2_transport::timestamp::{RxClock, TxClock};
use iax2_transport::Seqno;

use crate::crypto::EncryptionState;
use crate::sched::TimerId;

/// Main call life cycle. The registration and transfer exchanges keep their
/// own state beside this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Slot exists, nothing exchanged yet.
    Initial,
    /// NEW sent or received; waiting for ACCEPT.
    WaitAccept,
    /// AUTHREQ outstanding.
    Authenticating,
    /// Media may flow. `three_way_complete` on the slot records whether the
    /// post-ACCEPT handshake frame has arrived.
    Up,
    /// Final frame sent; waiting for its acknowledgment.
    Terminating,
    /// Torn down; the slot lingers only until the reaper runs.
    Dead,
}

/// Where a slot is in a native transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferState {
    #[default]
    None,
    /// TXREQ sent/received; probing the transfer path with TXCNT.
    Begin,
    /// Path verified (TXACC seen); waiting for the go-ahead.
    Ready,
    /// Call handed off to the new address.
    Released,
    /// Media-only transfer begun.
    MBegin,
    /// Media-only transfer path verified.
    MReady,
    /// Media flows to the transfer address, signalling stays.
    Media,
    /// Passing media through while the peers connect directly.
    MediaPass,
}

/// Which side created the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Why the slot exists, beyond a plain call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Call,
    /// Outbound qualify/poke exchange.
    Poke,
    /// Inbound or outbound registration exchange.
    Registration,
}

/// Scheduled work owned by a slot, cancelled wholesale at teardown.
#[derive(Debug, Default)]
pub struct SlotTimers {
    pub retrans: Option<TimerId>,
    pub ping: Option<TimerId>,
    pub lagrq: Option<TimerId>,
    pub maxtime: Option<TimerId>,
    pub keyrotate: Option<TimerId>,
    pub destroy: Option<TimerId>,
}

impl SlotTimers {
    pub fn drain(&mut self) -> Vec<TimerId> {
        [
            self.retrans.take(),
            self.ping.take(),
            self.lagrq.take(),
            self.maxtime.take(),
            self.keyrotate.take(),
            self.destroy.take(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

/// Caller identity presented in a NEW, kept for the PBX offer.
#[derive(Debug, Default, Clone)]
pub struct CallerInfo {
    pub calling_number: Option<String>,
    pub calling_name: Option<String>,
    pub calling_ani: Option<String>,
    pub calling_pres: Option<u8>,
    pub calling_ton: Option<u8>,
    pub calling_tns: Option<u16>,
    pub called_number: Option<String>,
    pub called_context: Option<String>,
    pub dnid: Option<String>,
    pub rdnis: Option<String>,
    pub language: Option<String>,
}

/// One leg of a call.
#[derive(Debug)]
pub struct CallSlot {
    pub callno: u16,
    /// The peer's source call number; 0 until its first full frame.
    pub peer_callno: u16,
    pub addr: SocketAddr,
    pub direction: Direction,
    pub kind: SlotKind,
    pub state: CallState,
    pub three_way_complete: bool,

    pub oseqno: Seqno,
    pub iseqno: Seqno,
    pub tx: TxQueue,
    pub tx_clock: TxClock,
    pub rx_clock: RxClock,
    pub jb: Option<JitterBuffer>,

    /// Our capability mask for this call.
    pub capability: u64,
    pub peer_capability: u64,
    /// Negotiated media format (one bit) once chosen.
    pub format: u64,
    pub peer_requested_format: u64,
    pub prefs: CodecPref,
    pub peer_prefs: CodecPref,

    pub username: Option<String>,
    /// Matched user (inbound) or peer (outbound) name.
    pub remote_identity: Option<String>,
    pub context: String,
    pub caller: CallerInfo,

    /// Token echoed on a re-sent NEW/REGREQ after the far end demanded one.
    pub calltoken: Option<Vec<u8>>,
    /// Challenge we issued (inbound auth) or must answer (outbound).
    pub challenge: Option<String>,
    pub auth_methods: u16,
    /// This slot holds one of its user's bounded outstanding AUTHREQs.
    pub authreq_charged: bool,
    /// Secret and key name used to answer an AUTHREQ on outbound calls.
    pub secret: Option<String>,
    pub outkey: Option<String>,

    pub enc: EncryptionState,
    /// ENCRYPT_* bits we offered or were offered.
    pub enc_offered: u16,
    pub force_encryption: bool,

    pub trunk: bool,
    /// Sender completed a call-token round trip before this slot existed.
    pub validated: bool,
    pub quelched: bool,
    pub moh_on_quelch: bool,

    pub transfer: TransferState,
    pub transfer_id: u32,
    pub transfer_addr: Option<SocketAddr>,
    pub transfer_peer_callno: u16,
    /// Matched media-only transfer (media keeps flowing here).
    pub transfer_media_addr: Option<SocketAddr>,
    /// The other leg when this server bridges two calls natively.
    pub bridged_with: Option<u16>,

    /// Measured PING round trip.
    pub pingtime: Duration,
    /// Timestamp and send instant of the PING/LAGRQ we are waiting on.
    pub ping_sent: Option<(u32, Instant)>,
    pub lagrq_sent: Option<(u32, Instant)>,
    /// Measured lag from LAGRQ/LAGRP.
    pub lag: Duration,

    /// Cause text/code to deliver when a deferred REJECT fires.
    pub pending_reject: Option<(String, u8)>,
    pub hangup_cause: Option<String>,
    pub hangup_causecode: Option<u8>,

    /// Registration slot bookkeeping: peer name for inbound REGREQ, index
    /// for outbound attempts.
    pub reg_peer: Option<String>,
    pub reg_index: Option<usize>,
    /// Peer name when this slot is a qualify poke.
    pub poke_peer: Option<String>,

    pub timers: SlotTimers,
    pub created: Instant,
    pub last_rx: Instant,
    pub final_sent: bool,
    pub destroy_initiated: bool,
    /// Timestamp of the last full voice frame we sent; a mini frame only
    /// works while its high 16 bits still match.
    pub last_full_voice_ts: Option<u32>,
    /// Format of the last full voice frame we sent (mini frames inherit it).
    pub last_voice_format: u64,
}

impl CallSlot {
    pub fn new(
        callno: u16,
        addr: SocketAddr,
        direction: Direction,
        kind: SlotKind,
        now: Instant,
    ) -> Self {
        Self {
            callno,
            peer_callno: 0,
            addr,
            direction,
            kind,
            state: CallState::Initial,
            three_way_complete: false,
            oseqno: Seqno(0),
            iseqno: Seqno(0),
            tx: TxQueue::new(),
            tx_clock: TxClock::new(),
            rx_clock: RxClock::new(),
            jb: None,
            capability: 0,
            peer_capability: 0,
            format: 0,
            peer_requested_format: 0,
            prefs: CodecPref::new(),
            peer_prefs: CodecPref::new(),
            username: None,
            remote_identity: None,
            context: String::new(),
            caller: CallerInfo::default(),
            calltoken: None,
            challenge: None,
            auth_methods: 0,
            authreq_charged: false,
            secret: None,
            outkey: None,
            enc: EncryptionState::default(),
            enc_offered: 0,
            force_encryption: false,
            trunk: false,
            validated: false,
            quelched: false,
            moh_on_quelch: false,
            transfer: TransferState::default(),
            transfer_id: 0,
            transfer_addr: None,
            transfer_peer_callno: 0,
            transfer_media_addr: None,
            bridged_with: None,
            pingtime: Duration::from_millis(40),
            ping_sent: None,
            lagrq_sent: None,
            lag: Duration::ZERO,
            pending_reject: None,
            hangup_cause: None,
            hangup_causecode: None,
            reg_peer: None,
            reg_index: None,
            poke_peer: None,
            timers: SlotTimers::default(),
            created: now,
            last_rx: now,
            final_sent: false,
            destroy_initiated: false,
            last_full_voice_ts: None,
            last_voice_format: 0,
        }
    }

    pub fn enable_jitterbuffer(&mut self, config: JitterConfig) {
        self.jb = Some(JitterBuffer::new(config));
    }

    /// Consumes the next outgoing sequence number.
    pub fn next_oseqno(&mut self) -> Seqno {
        let s = self.oseqno;
        self.oseqno = self.oseqno.next();
        s
    }

    pub fn is_up(&self) -> bool {
        self.state == CallState::Up
    }

    pub fn alive(&self) -> bool {
        !matches!(self.state, CallState::Dead)
    }

    /// Whether media for this call should flow to the transfer address.
    pub fn media_addr(&self) -> SocketAddr {
        match self.transfer {
            TransferState::Media | TransferState::MediaPass => {
                self.transfer_media_addr.unwrap_or(self.addr)
            }
            _ => self.addr,
        }
    }
}
