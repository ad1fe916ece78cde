//! The narrow seams to the outside: the datagram transport below and the
//! PBX channel layer above.

use std::io;
use std::net::{SocketAddr, UdpSocket};

use iax2_proto::constants::ControlKind;

/// Outbound datagram sink. The engine never owns a socket directly; tests
/// substitute a recorder.
pub trait Transport: Send + Sync {
    fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize>;
}

impl Transport for UdpSocket {
    fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, data, addr)
    }
}

/// What the PBX decides about an offered call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallDisposition {
    /// Take the call; the engine sends ACCEPT.
    Accept,
    /// Decline with a cause.
    Reject { cause: String, code: u8 },
    /// Let it ring; the PBX will answer (or hang up) later through the
    /// engine API.
    Ring,
}

/// An inbound call presented to the PBX.
#[derive(Debug, Clone)]
pub struct CallOffer {
    pub callno: u16,
    pub addr: SocketAddr,
    pub username: Option<String>,
    pub context: String,
    pub called_number: Option<String>,
    pub calling_number: Option<String>,
    pub calling_name: Option<String>,
    pub format: u64,
    pub capability: u64,
}

/// Registration life-cycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegEvent {
    /// A dynamic peer registered or moved; carries the new binding.
    Bound(SocketAddr),
    /// The peer unregistered or expired.
    Unbound,
    /// One of our outbound registrations was accepted.
    Accepted,
    /// One of our outbound registrations was rejected.
    Rejected,
}

/// Peer reachability notifications from the qualifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatusEvent {
    Reachable { ms: u32 },
    Unreachable,
}

/// Media handed up to the channel layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaDirection {
    Audio,
    Video { mark: bool },
}

/// Dialplan knowledge the engine can ask the PBX for (DPREQ handling).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialplanStatus {
    Exists,
    CanExist,
    NonExistent,
}

impl DialplanStatus {
    pub fn to_wire(self) -> u16 {
        match self {
            DialplanStatus::Exists => 1 << 0,
            DialplanStatus::CanExist => 1 << 1,
            DialplanStatus::NonExistent => 1 << 2,
        }
    }
}

/// The callback surface into the PBX channel layer. Every method has a
/// default so hosts and tests implement only what they care about.
pub trait ChannelEvents: Send + Sync {
    /// A validated, authenticated NEW arrived. The return value decides the
    /// immediate wire answer.
    fn on_call_offered(&self, offer: &CallOffer) -> CallDisposition {
        let _ = offer;
        CallDisposition::Accept
    }

    /// An outbound call we placed was accepted (format negotiated).
    fn on_accepted(&self, callno: u16, format: u64) {
        let _ = (callno, format);
    }

    /// The remote answered an outbound call.
    fn on_answered(&self, callno: u16) {
        let _ = callno;
    }

    /// Decoded media for an up call, jitter-buffered when enabled.
    fn on_media(&self, callno: u16, dir: MediaDirection, ts: u32, payload: &[u8]) {
        let _ = (callno, dir, ts, payload);
    }

    /// A control frame from the whitelist crossed the wire.
    fn on_control(&self, callno: u16, kind: ControlKind) {
        let _ = (callno, kind);
    }

    fn on_dtmf(&self, callno: u16, digit: char) {
        let _ = (callno, digit);
    }

    fn on_text(&self, callno: u16, text: &str) {
        let _ = (callno, text);
    }

    /// The call ended, locally or remotely.
    fn on_hangup(&self, callno: u16, cause: Option<&str>, code: Option<u8>) {
        let _ = (callno, cause, code);
    }

    fn on_registration(&self, peer: &str, event: RegEvent) {
        let _ = (peer, event);
    }

    fn on_peer_status(&self, peer: &str, event: PeerStatusEvent) {
        let _ = (peer, event);
    }

    /// A stand-alone message-waiting indication arrived.
    fn on_mwi(&self, callno: u16, msgcount: u16) {
        let _ = (callno, msgcount);
    }

    /// The remote asked us to blind-transfer the call to a number.
    fn on_transfer_requested(&self, callno: u16, number: &str) {
        let _ = (callno, number);
    }

    /// Waiting-message counts for a mailbox, for REGACK's MSGCOUNT IE.
    /// Returns (new, old).
    fn mailbox_count(&self, mailbox: &str) -> Option<(u16, u16)> {
        let _ = mailbox;
        None
    }

    /// DPREQ support: does this number exist in the context?
    fn dialplan_status(&self, context: &str, number: &str) -> DialplanStatus {
        let _ = (context, number);
        DialplanStatus::NonExistent
    }
}

/// A no-op event sink.
#[derive(Debug, Default)]
pub struct NullEvents;

impl ChannelEvents for NullEvents {}
