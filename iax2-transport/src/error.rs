use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("retransmission retries exhausted for oseqno {0}")]
    RetriesExhausted(u8),
    #[error("jitter buffer is full")]
    JitterFull,
    #[error("frame timestamp {0} arrived after its drop deadline")]
    TooLate(u32),
}

pub type TransportResult<T> = Result<T, TransportError>;
