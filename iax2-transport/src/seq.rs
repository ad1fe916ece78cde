//! Sliding-window arithmetic over the 8-bit wire sequence numbers.
//!
//! The wire fields are a single byte; ordering is decided with unsigned
//! modulo-256 distances and a window of at most 128.

/// Half the sequence space. Distances below this are "forward".
pub const SEQ_WINDOW: u8 = 128;

/// An 8-bit sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Seqno(pub u8);

impl Seqno {
    pub fn next(self) -> Seqno {
        Seqno(self.0.wrapping_add(1))
    }

    /// Modulo-256 distance from `self` forward to `other`.
    pub fn distance_to(self, other: Seqno) -> u8 {
        other.0.wrapping_sub(self.0)
    }

    /// True when `other` lies strictly ahead of `self` within the window.
    pub fn precedes(self, other: Seqno) -> bool {
        let d = self.distance_to(other);
        d != 0 && d < SEQ_WINDOW
    }
}

impl std::fmt::Display for Seqno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u8> for Seqno {
    fn from(v: u8) -> Self {
        Seqno(v)
    }
}

/// Whether a frame with `oseqno` is released by an acknowledgment carrying
/// `iseqno` (everything up to `iseqno - 1` is acknowledged).
pub fn released_by(oseqno: Seqno, iseqno: Seqno) -> bool {
    let d = iseqno.0.wrapping_sub(oseqno.0);
    d != 0 && d <= SEQ_WINDOW
}

/// Whether a VNAK carrying `iseqno` asks for `oseqno` to be resent.
pub fn wanted_by_vnak(oseqno: Seqno, iseqno: Seqno) -> bool {
    oseqno.0.wrapping_sub(iseqno.0) < SEQ_WINDOW
}
