//! Protocol definitions: the tunnel-initiation payload and its rules
//!
//! Every logical connection starts with an [`Init`] payload. On the raw
//! substrate it is framed (see [`frame`]); on the HTTP/2 substrate it is
//! carried JSON-encoded in the [`INIT_HEADER`] request header.

pub mod frame;

use semver::Version;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Magic byte opening every raw-substrate frame header.
pub const MAGIC: u8 = 42;

/// Request header carrying the JSON-encoded init payload on the HTTP/2
/// substrate.
pub const INIT_HEADER: &str = "wl-init";

/// Response trailer carrying the JSON-encoded terminal status on the
/// HTTP/2 substrate.
pub const STATUS_TRAILER: &str = "wl-status";

/// Maximum accepted size of a framed init or status payload.
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

const PROTO_MAJOR: u64 = 0;
const PROTO_MINOR: u64 = 8;
const PROTO_PATCH: u64 = 0;

/// The compiled protocol version. Callers inject this (or a substitute)
/// into the relay and transport constructors; nothing in the crate reads
/// it implicitly, so differently-versioned instances can coexist.
pub fn proto_version() -> Version {
    Version::new(PROTO_MAJOR, PROTO_MINOR, PROTO_PATCH)
}

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("desynchronized stream: no magic byte found")]
    Desync,

    #[error("non-OOB frame where init payload expected")]
    UnexpectedFrame,

    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("unknown URL scheme in payload: {0}")]
    UnsupportedScheme(String),

    #[error("missing field in payload: {0}")]
    MissingField(&'static str),

    #[error("expecting version 0.{expected_minor}.x, got {got}")]
    VersionMismatch { expected_minor: u64, got: Version },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tunnel command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    #[serde(rename = "CONNECT")]
    Connect,
    #[serde(rename = "PING")]
    Ping,
}

/// Dial protocol for the onward connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Tcp4,
    Tcp6,
    Udp,
    Udp4,
    Udp6,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Tcp4 => "tcp4",
            Protocol::Tcp6 => "tcp6",
            Protocol::Udp => "udp",
            Protocol::Udp4 => "udp4",
            Protocol::Udp6 => "udp6",
        }
    }

    pub fn is_udp(&self) -> bool {
        matches!(self, Protocol::Udp | Protocol::Udp4 | Protocol::Udp6)
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque proof-of-payment token. Carried verbatim, verified by an
/// external collaborator, never interpreted here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(pub serde_json::Value);

/// The tunnel-initiation payload, constructed once per tunnel attempt,
/// serialized immediately and never mutated after validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Init {
    pub command: Command,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<Token>,
    pub version: Version,
}

impl Init {
    /// Validates the payload against the locally expected protocol
    /// version. PING bypasses all other validation.
    pub fn sanity_check(&self, expected_minor: u64) -> Result<(), ProtocolError> {
        if self.command == Command::Ping {
            return Ok(());
        }

        if self.protocol.is_none() {
            return Err(ProtocolError::MissingField("protocol"));
        }

        let remote = self
            .remote
            .as_ref()
            .ok_or(ProtocolError::MissingField("remote"))?;

        match remote.scheme() {
            "wireleap" | "https" | "target" => {}
            other => return Err(ProtocolError::UnsupportedScheme(other.to_string())),
        }

        // exact minor equality, not semver compatibility
        if self.version.minor != expected_minor {
            return Err(ProtocolError::VersionMismatch {
                expected_minor,
                got: self.version.clone(),
            });
        }

        Ok(())
    }

    /// Header key/value pair carrying this payload on the HTTP/2
    /// substrate.
    pub fn header(&self) -> Result<(&'static str, String), ProtocolError> {
        let value = serde_json::to_string(self)?;
        Ok((INIT_HEADER, value))
    }

    /// Parses and validates an init payload from its HTTP/2 request
    /// header value.
    pub fn from_header(value: &[u8], expected_minor: u64) -> Result<Self, ProtocolError> {
        let init: Init = serde_json::from_slice(value)?;
        init.sanity_check(expected_minor)?;
        Ok(init)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect_init(version: Version) -> Init {
        Init {
            command: Command::Connect,
            protocol: Some(Protocol::Tcp),
            remote: Some(Url::parse("target://localhost:8888").unwrap()),
            token: Some(Token(serde_json::json!({"sig": "abc", "nonce": 7}))),
            version,
        }
    }

    #[test]
    fn test_json_round_trip() {
        let init = connect_init(proto_version());
        let json = serde_json::to_string(&init).unwrap();
        assert!(json.contains("\"command\":\"CONNECT\""));
        assert!(json.contains("\"protocol\":\"tcp\""));

        let back: Init = serde_json::from_str(&json).unwrap();
        assert_eq!(back.command, Command::Connect);
        assert_eq!(back.protocol, Some(Protocol::Tcp));
        assert_eq!(back.remote, init.remote);
        // opaque token survives untouched
        assert_eq!(back.token, init.token);
        assert_eq!(back.version, init.version);
    }

    #[test]
    fn test_version_gate_exact_minor() {
        let minor = proto_version().minor;
        assert!(connect_init(Version::new(0, minor, 0))
            .sanity_check(minor)
            .is_ok());
        // patch and major do not rescue a minor mismatch
        assert!(connect_init(Version::new(0, minor + 1, 0))
            .sanity_check(minor)
            .is_err());
        assert!(connect_init(Version::new(1, minor + 1, 5))
            .sanity_check(minor)
            .is_err());
    }

    #[test]
    fn test_ping_bypasses_validation() {
        let init = Init {
            command: Command::Ping,
            protocol: None,
            remote: None,
            token: None,
            version: Version::new(9, 9, 9),
        };
        assert!(init.sanity_check(proto_version().minor).is_ok());
    }

    #[test]
    fn test_unknown_scheme_rejected() {
        let mut init = connect_init(proto_version());
        init.remote = Some(Url::parse("ftp://example.com").unwrap());
        match init.sanity_check(proto_version().minor) {
            Err(ProtocolError::UnsupportedScheme(s)) => assert_eq!(s, "ftp"),
            other => panic!("expected scheme rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_protocol_rejected() {
        let mut init = connect_init(proto_version());
        init.protocol = None;
        assert!(matches!(
            init.sanity_check(proto_version().minor),
            Err(ProtocolError::MissingField("protocol"))
        ));
    }

    #[test]
    fn test_header_round_trip() {
        let init = connect_init(proto_version());
        let (name, value) = init.header().unwrap();
        assert_eq!(name, INIT_HEADER);
        let back = Init::from_header(value.as_bytes(), proto_version().minor).unwrap();
        assert_eq!(back.remote, init.remote);
    }
}
