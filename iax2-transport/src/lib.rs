//! Per-call delivery machinery for IAX2: sequence windows, the reliable
//! retransmission queue, timestamp clocks and the jitter buffer.
//!
//! Nothing in this crate performs I/O or holds locks; every structure
//! belongs to exactly one call and is driven by its owner with explicit
//! `Instant`s, which keeps the whole layer deterministic under test.

pub mod error;
pub mod jitter;
pub mod reliable;
pub mod seq;
pub mod time;
pub mod timestamp;

pub use error::{TransportError, TransportResult};
pub use jitter::{JitterBuffer, JitterConfig, JitterFrame, JitterVerdict, MediaKind};
pub use reliable::{PendingFrame, Released, TxEvent, TxQueue};
pub use seq::Seqno;
pub use time::{ManualTimeProvider, SystemTimeProvider, TimeProvider};
pub use timestamp::{RxClock, TxClock};
