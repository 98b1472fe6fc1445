//! Structured terminal statuses
//!
//! A [`Status`] is the value a relay sends back to the initiator when a
//! tunnel attempt ends, successfully or not. On the raw substrate it
//! travels as an out-of-band frame; on the HTTP/2 substrate it travels
//! in a response trailer. The JSON encoding is fixed:
//!
//! ```json
//! {"code":502,"description":"gateway is unreachable or down","origin":"target"}
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;

/// A terminal status with a defined JSON encoding.
///
/// `origin` attributes the failure: `"target"` means the final
/// destination failed, anything else means the relay mesh did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: u16,
    #[serde(rename = "description")]
    pub desc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl Status {
    pub fn new(code: u16, desc: impl Into<String>) -> Self {
        Self {
            code,
            desc: desc.into(),
            origin: None,
            cause: None,
        }
    }

    pub fn with_origin(mut self, origin: Option<String>) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn is_ok(&self) -> bool {
        self.code == 200
    }

    pub fn ok() -> Self {
        Self::new(200, "OK")
    }

    pub fn pong() -> Self {
        Self::new(200, "PONG")
    }

    pub fn bad_request(desc: impl Into<String>) -> Self {
        Self::new(400, desc)
    }

    pub fn method_not_allowed() -> Self {
        Self::new(405, "HTTP method not allowed")
    }

    pub fn request_timeout(desc: impl Into<String>) -> Self {
        Self::new(408, desc)
    }

    pub fn gone(desc: impl Into<String>) -> Self {
        Self::new(410, desc)
    }

    pub fn bad_gateway(desc: impl Into<String>) -> Self {
        Self::new(502, desc)
    }

    pub fn to_json(&self) -> Vec<u8> {
        // Status contains only string/int fields, serialization is total
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_json(buf: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(buf)
    }

    /// Wraps the status into an `io::Error` so it can travel through
    /// generic read/write calls. [`Status::from_io_error`] recovers it.
    pub fn into_io_error(self) -> io::Error {
        io::Error::new(io::ErrorKind::Other, self)
    }

    /// Recovers a status carried by [`Status::into_io_error`].
    pub fn from_io_error(err: &io::Error) -> Option<&Status> {
        err.get_ref().and_then(|e| e.downcast_ref::<Status>())
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.origin {
            Some(o) => write!(f, "{} {} (origin: {})", self.code, self.desc, o),
            None => write!(f, "{} {}", self.code, self.desc),
        }
    }
}

impl std::error::Error for Status {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_field_names() {
        let st = Status::bad_gateway("unreachable").with_origin(Some("target".into()));
        let json = String::from_utf8(st.to_json()).unwrap();
        assert!(json.contains("\"code\":502"));
        assert!(json.contains("\"description\":\"unreachable\""));
        assert!(json.contains("\"origin\":\"target\""));
        assert!(!json.contains("cause"));

        let back = Status::from_json(json.as_bytes()).unwrap();
        assert_eq!(back, st);
    }

    #[test]
    fn test_io_error_carriage() {
        let st = Status::request_timeout("deadline exceeded");
        let err = st.clone().into_io_error();
        assert_eq!(Status::from_io_error(&err), Some(&st));

        let plain = io::Error::new(io::ErrorKind::BrokenPipe, "pipe");
        assert!(Status::from_io_error(&plain).is_none());
    }
}
