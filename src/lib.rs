//! # Wiremesh
//!
//! Transport core of a relay-mesh overlay network: a client reaches a
//! target host through one or more untrusted relay hops, each hop either
//! a raw TLS socket or an HTTP/2 stream, carrying an opaque proof token
//! as part of tunnel setup.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   Relay handler                      │
//! │        (accept, verify, dial onward, splice)         │
//! ├─────────────────────────────────────────────────────┤
//! │                   Tunnel layer                       │
//! │          (bidirectional splice, deadlines)           │
//! ├─────────────────────────────────────────────────────┤
//! │                 Transport layer                      │
//! │   (TLS 1.3 dialer, h2 stream adapter, chaining)      │
//! ├─────────────────────────────────────────────────────┤
//! │                  Protocol layer                      │
//! │     (init payload, wire framing, OOB statuses)       │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Both substrates express the same logical contract: tunnel parameters
//! in (the [`protocol::Init`] payload), terminal status out (a
//! [`status::Status`]). The raw substrate frames both; the HTTP/2
//! substrate carries them as a request header and a response trailer.

pub mod config;
pub mod protocol;
pub mod relay;
pub mod status;
pub mod transport;
pub mod tunnel;

pub use config::Config;
pub use status::Status;

/// Default per-direction splice buffer size in bytes
pub const DEFAULT_BUF_SIZE: usize = 4096;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("HTTP/2 error: {0}")]
    H2(#[from] h2::Error),

    #[error("Config error: {0}")]
    Config(String),
}
