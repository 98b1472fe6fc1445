//! Transport layer
//!
//! The substrates are unified behind the [`Conn`] capability trait: the
//! relay handler and the splice engine only ever see something that can
//! read, write, close and (optionally) carry a deadline, never a
//! concrete socket or HTTP/2 stream.

mod dialer;
pub mod h2conn;
mod udp;

pub use dialer::{Transport, TransportOptions};
pub use udp::UdpConn;

use crate::protocol::frame::{FragReader, FragWriter};
use crate::protocol::ProtocolError;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::Instant;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("HTTP/2 error: {0}")]
    H2(#[from] h2::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("unsupported dial scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("invalid remote address: {0}")]
    InvalidRemote(String),

    #[error("no address found for {0}")]
    NoAddress(String),

    #[error("connection timed out")]
    Timeout,
}

impl From<tokio::time::error::Elapsed> for TransportError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        TransportError::Timeout
    }
}

impl TransportError {
    /// Distinguishes timeouts from everything else so callers can map
    /// them to a request-timeout rather than a gateway failure.
    pub fn is_timeout(&self) -> bool {
        match self {
            TransportError::Timeout => true,
            TransportError::Io(e) => e.kind() == io::ErrorKind::TimedOut,
            _ => false,
        }
    }
}

/// Capability interface satisfied by both substrates: raw sockets and
/// HTTP/2 stream adapters alike.
///
/// `set_deadline` follows the timer-closes-the-resource pattern: an
/// endpoint that supports it fails any I/O past the deadline. Endpoints
/// that return `false` get bounded externally by the splice engine.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {
    /// Arms (or, with `None`, disarms) the connection deadline,
    /// replacing any previous one. Returns `false` when the endpoint
    /// has no deadline support.
    fn set_deadline(&mut self, deadline: Option<Instant>) -> bool {
        let _ = deadline;
        false
    }
}

/// A type-erased connection.
pub type BoxConn = Box<dyn Conn>;

impl Conn for TcpStream {}

impl Conn for tokio::io::DuplexStream {}

impl<T: Conn + ?Sized> Conn for Box<T> {
    fn set_deadline(&mut self, deadline: Option<Instant>) -> bool {
        (**self).set_deadline(deadline)
    }
}

impl<S: Conn> Conn for tokio_rustls::client::TlsStream<S> {
    fn set_deadline(&mut self, deadline: Option<Instant>) -> bool {
        self.get_mut().0.set_deadline(deadline)
    }
}

impl<S: Conn> Conn for tokio_rustls::server::TlsStream<S> {
    fn set_deadline(&mut self, deadline: Option<Instant>) -> bool {
        self.get_mut().0.set_deadline(deadline)
    }
}

impl<C: Conn> Conn for FragReader<C> {
    fn set_deadline(&mut self, deadline: Option<Instant>) -> bool {
        self.get_mut().set_deadline(deadline)
    }
}

impl<C: Conn> Conn for FragWriter<C> {
    fn set_deadline(&mut self, deadline: Option<Instant>) -> bool {
        self.get_mut().set_deadline(deadline)
    }
}
