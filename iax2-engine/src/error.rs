use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("wire error: {0}")]
    Wire(#[from] iax2_proto::WireError),
    #[error("transport error: {0}")]
    Transport(#[from] iax2_transport::TransportError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("call number pool exhausted")]
    PoolExhausted,
    #[error("call number quota exceeded for {0}")]
    PeerLimitExceeded(std::net::SocketAddr),
    #[error("non-validated call number quota exceeded")]
    NonvalidatedQuotaExceeded,
    #[error("no such call {0}")]
    NoSuchCall(u16),
    #[error("call {0} is not in a state that permits this")]
    BadCallState(u16),
    #[error("unknown peer '{0}'")]
    UnknownPeer(String),
    #[error("authentication rejected: {0}")]
    AuthRejected(&'static str),
    #[error("call token invalid")]
    CallTokenInvalid,
    #[error("encryption required but not negotiated")]
    EncryptionRequired,
    #[error("could not decrypt frame")]
    DecryptFailed,
    #[error("RSA key error: {0}")]
    Rsa(#[from] rsa::Error),
    #[error("engine is shutting down")]
    Shutdown,
}

pub type EngineResult<T> = Result<T, EngineError>;
