use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("datagram shorter than its declared header ({need} bytes needed, {have} present)")]
    TooShort { need: usize, have: usize },
    #[error("information element {ie} length {len} spans past the frame")]
    BadIeLen { ie: u8, len: usize },
    #[error("unknown meta command {0}")]
    UnknownMeta(u8),
    #[error("unsupported protocol version {0}")]
    BadVersion(u16),
    #[error("frame type {0} is not defined")]
    BadFrameType(u8),
    #[error("trunk entry spans past the datagram")]
    BadTrunkEntry,
}

pub type WireResult<T> = Result<T, WireError>;
