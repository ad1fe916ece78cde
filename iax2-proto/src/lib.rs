//! Bit-exact wire codec for the IAX2 protocol (RFC 5456).
//!
//! This crate owns everything about bytes on the wire and nothing about
//! state: frame family parsing and emission, information element TLVs,
//! compressed subclasses, the packed date/time, codec preference strings and
//! the legacy format bitfield. The transport and engine crates build on it.

pub mod codec_pref;
pub mod constants;
pub mod datetime;
pub mod dump;
pub mod error;
pub mod format;
pub mod frame;
pub mod ies;
pub mod subclass;

pub use constants::{ControlKind, FrameType, IaxCommand};
pub use error::{WireError, WireResult};
pub use frame::{Frame, FullFrame, MiniFrame, TrunkEntry, TrunkFrame, VideoFrame};
pub use ies::{build_ies, parse_ies, Ie, IeSet};
