//! The IAX2 protocol engine.
//!
//! One [`Engine`] value multiplexes up to 32 768 calls over a single UDP
//! socket pair: wire parsing and emission via `iax2-proto`, per-call
//! reliability and jitter buffering via `iax2-transport`, and everything
//! stateful here: the call-number table with its reuse quarantine and
//! anti-spoof call tokens, the per-call state machine, the peer/user
//! registry with dynamic registration and qualify pokes, trunking, and
//! AES-128 session encryption with mid-call key rotation.
//!
//! The host supplies a [`events::Transport`] (datagram sink) and a
//! [`events::ChannelEvents`] (the PBX callback surface); everything else is
//! internal. Tests drive an engine synchronously with a manual clock; a
//! production host wires up [`dispatcher::Dispatcher`],
//! [`dispatcher::NetRunner`] and [`dispatcher::TimerRunner`] for the
//! threaded data path.

pub mod acl;
pub mod auth;
pub mod call;
pub mod callno;
pub mod calltoken;
pub mod config;
pub mod crypto;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod registry;
pub mod sched;
pub mod trunk;

pub use config::{CallNumberLimits, CallTokenPolicy, CodecPriority, Config, PeerConfig, UserConfig};
pub use engine::{DialRequest, Engine, EngineBuilder};
pub use error::{EngineError, EngineResult};
pub use events::{
    CallDisposition, CallOffer, ChannelEvents, MediaDirection, PeerStatusEvent, RegEvent,
    Transport,
};
