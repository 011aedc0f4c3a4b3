//! Frame types exchanged with the fabric
//!
//! Stream frames (BEGIN/DATA/END/ABORT) flow in the direction of the
//! stream; throttle frames (WINDOW/RESET/SIGNAL) flow against it. Stream
//! parity is encoded in the low bit of the stream id: odd ids are initial
//! streams, even ids are replies.

use bytes::Bytes;
use std::fmt;

/// Signal id delivered when a grant's expiry/challenge timer fires.
pub const GRANT_VALIDATION_SIGNAL: u64 = 1;

/// Capability bit: the peer accepts in-band re-authentication challenges.
pub const CHALLENGE_CAPABILITY: u8 = 1 << 0;

/// Check the challenge bit of a capability byte.
pub fn can_challenge(capabilities: u8) -> bool {
    capabilities & CHALLENGE_CAPABILITY != 0
}

/// Initial streams carry odd ids, reply streams even ids.
pub fn is_initial(stream_id: u64) -> bool {
    stream_id & 1 != 0
}

/// An ordered HTTP header list carried in BEGIN and SIGNAL extensions.
///
/// Pseudo-headers (`:path`, `:status`, `:method`) use their HTTP/2 names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpHeaders {
    headers: Vec<(String, String)>,
}

impl HttpHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style append.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(name, value);
        self
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    /// First header with the given name, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

/// Frame extension payload.
///
/// The proxy inspects HTTP extensions on BEGIN and writes them on
/// synthesized BEGIN/SIGNAL frames; anything else passes through opaque.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Extension {
    #[default]
    None,
    Http(HttpHeaders),
    Opaque(Bytes),
}

impl Extension {
    /// HTTP header list, if this extension carries one.
    pub fn http(&self) -> Option<&HttpHeaders> {
        match self {
            Extension::Http(headers) => Some(headers),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Begin {
    pub route_id: u64,
    pub stream_id: u64,
    pub trace_id: u64,
    pub authorization: u64,
    pub affinity: u64,
    pub capabilities: u8,
    pub extension: Extension,
}

#[derive(Debug, Clone)]
pub struct Data {
    pub route_id: u64,
    pub stream_id: u64,
    pub trace_id: u64,
    pub authorization: u64,
    pub group_id: u64,
    pub padding: u32,
    pub payload: Bytes,
    pub extension: Extension,
}

#[derive(Debug, Clone)]
pub struct End {
    pub route_id: u64,
    pub stream_id: u64,
    pub trace_id: u64,
    pub authorization: u64,
    pub extension: Extension,
}

#[derive(Debug, Clone)]
pub struct Abort {
    pub route_id: u64,
    pub stream_id: u64,
    pub trace_id: u64,
    pub authorization: u64,
}

#[derive(Debug, Clone)]
pub struct Window {
    pub route_id: u64,
    pub stream_id: u64,
    pub trace_id: u64,
    pub credit: u32,
    pub padding: u32,
    pub group_id: u64,
    pub capabilities: u8,
}

#[derive(Debug, Clone)]
pub struct Reset {
    pub route_id: u64,
    pub stream_id: u64,
    pub trace_id: u64,
    pub authorization: u64,
}

#[derive(Debug, Clone)]
pub struct Signal {
    pub route_id: u64,
    pub stream_id: u64,
    pub trace_id: u64,
    pub authorization: u64,
    pub signal_id: u64,
    pub extension: Extension,
}

/// Every frame kind the proxy consumes or produces.
#[derive(Debug, Clone)]
pub enum Frame {
    Begin(Begin),
    Data(Data),
    End(End),
    Abort(Abort),
    Window(Window),
    Reset(Reset),
    Signal(Signal),
}

impl Frame {
    pub fn stream_id(&self) -> u64 {
        match self {
            Frame::Begin(f) => f.stream_id,
            Frame::Data(f) => f.stream_id,
            Frame::End(f) => f.stream_id,
            Frame::Abort(f) => f.stream_id,
            Frame::Window(f) => f.stream_id,
            Frame::Reset(f) => f.stream_id,
            Frame::Signal(f) => f.stream_id,
        }
    }

    pub fn route_id(&self) -> u64 {
        match self {
            Frame::Begin(f) => f.route_id,
            Frame::Data(f) => f.route_id,
            Frame::End(f) => f.route_id,
            Frame::Abort(f) => f.route_id,
            Frame::Window(f) => f.route_id,
            Frame::Reset(f) => f.route_id,
            Frame::Signal(f) => f.route_id,
        }
    }

    /// Frame kind name, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Begin(_) => "BEGIN",
            Frame::Data(_) => "DATA",
            Frame::End(_) => "END",
            Frame::Abort(_) => "ABORT",
            Frame::Window(_) => "WINDOW",
            Frame::Reset(_) => "RESET",
            Frame::Signal(_) => "SIGNAL",
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[stream={}]", self.kind(), self.stream_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_parity() {
        assert!(is_initial(1));
        assert!(is_initial(0x11));
        assert!(!is_initial(2));
        assert!(!is_initial(0));
    }

    #[test]
    fn test_capability_bit() {
        assert!(can_challenge(CHALLENGE_CAPABILITY));
        assert!(can_challenge(0xFF));
        assert!(!can_challenge(0));
        assert!(!can_challenge(0xFE));
    }

    #[test]
    fn test_http_headers_first_match_wins() {
        let headers = HttpHeaders::new()
            .with(":path", "/events")
            .with("authorization", "Bearer abc")
            .with("authorization", "Bearer def");

        assert_eq!(headers.get(":path"), Some("/events"));
        assert_eq!(headers.get("authorization"), Some("Bearer abc"));
        assert_eq!(headers.get("content-type"), None);
    }
}
