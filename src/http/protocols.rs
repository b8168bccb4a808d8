//! HTTP protocol flags and per-connection protocol selection.
//!
//! # Responsibilities
//! - Represent the set of protocols an endpoint (or SNI entry) enables
//! - Decide which protocol a connection speaks from its TLS/ALPN facts
//!
//! # Design Decisions
//! - Selection is a pure function so every rule is unit-testable
//! - HTTP/2 without TLS is never guessed when HTTP/1.1 is also enabled
//! - HTTP/2 over TLS requires an explicit `h2` ALPN confirmation

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// ALPN identifier for HTTP/2 over TLS.
pub const ALPN_H2: &[u8] = b"h2";
/// ALPN identifier for HTTP/1.1.
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

/// A set of enabled HTTP protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HttpProtocols(u8);

impl HttpProtocols {
    pub const NONE: Self = Self(0);
    pub const HTTP1: Self = Self(0b001);
    pub const HTTP2: Self = Self(0b010);
    pub const HTTP3: Self = Self(0b100);
    pub const HTTP1_AND_HTTP2: Self = Self(0b011);
    pub const HTTP1_AND_HTTP2_AND_HTTP3: Self = Self(0b111);

    pub fn contains(self, other: Self) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// ALPN identifiers to offer during a TLS handshake, most preferred first.
    ///
    /// HTTP/3 is negotiated by the multiplexed transport, never over TCP TLS.
    pub fn alpn_protocols(self) -> Vec<Vec<u8>> {
        let mut alpn = Vec::with_capacity(2);
        if self.contains(Self::HTTP2) {
            alpn.push(ALPN_H2.to_vec());
        }
        if self.contains(Self::HTTP1) {
            alpn.push(ALPN_HTTP11.to_vec());
        }
        alpn
    }
}

impl fmt::Display for HttpProtocols {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "None");
        }
        let mut names = Vec::with_capacity(3);
        if self.contains(Self::HTTP1) {
            names.push("Http1");
        }
        if self.contains(Self::HTTP2) {
            names.push("Http2");
        }
        if self.contains(Self::HTTP3) {
            names.push("Http3");
        }
        write!(f, "{}", names.join("And"))
    }
}

/// Error returned when a protocol set name is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognised protocol set '{0}'; expected one of none, http1, http2, http3, http1_and_http2, http1_and_http2_and_http3")]
pub struct ParseProtocolsError(String);

impl FromStr for HttpProtocols {
    type Err = ParseProtocolsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "none" => Ok(Self::NONE),
            "http1" => Ok(Self::HTTP1),
            "http2" => Ok(Self::HTTP2),
            "http3" => Ok(Self::HTTP3),
            "http1andhttp2" => Ok(Self::HTTP1_AND_HTTP2),
            "http1andhttp2andhttp3" => Ok(Self::HTTP1_AND_HTTP2_AND_HTTP3),
            _ => Err(ParseProtocolsError(s.to_string())),
        }
    }
}

impl Serialize for HttpProtocols {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for HttpProtocols {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// The protocol a single connection speaks once selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpProtocol {
    Http1,
    Http2,
    Http3,
}

impl HttpProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpProtocol::Http1 => "http/1.1",
            HttpProtocol::Http2 => "h2",
            HttpProtocol::Http3 => "h3",
        }
    }

    fn flag(self) -> HttpProtocols {
        match self {
            HttpProtocol::Http1 => HttpProtocols::HTTP1,
            HttpProtocol::Http2 => HttpProtocols::HTTP2,
            HttpProtocol::Http3 => HttpProtocols::HTTP3,
        }
    }
}

impl fmt::Display for HttpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Facts about a connection that protocol selection depends on.
#[derive(Debug, Clone, Copy)]
pub struct SelectionInput<'a> {
    /// Whether the connection completed a TLS handshake.
    pub tls: bool,
    /// ALPN protocol negotiated during the handshake, if any.
    pub alpn: Option<&'a [u8]>,
    /// Whether the transport carries independent streams itself (QUIC).
    pub multiplexed: bool,
    /// Protocols enabled for this connection.
    pub enabled: HttpProtocols,
}

/// Reasons protocol selection can fail.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolSelectionError {
    #[error("an endpoint must be configured to serve at least one protocol")]
    NoProtocolEnabled,
    #[error("protocols {0} are not supported on a multiplexed transport")]
    UnsupportedOnMultiplexedTransport(HttpProtocols),
    #[error("HTTP/2 over TLS was not negotiated on an HTTP/2-only endpoint")]
    Http2NotNegotiated,
    #[error("protocols {0} cannot be served on this transport")]
    NoUsableProtocol(HttpProtocols),
}

/// Choose the protocol for a connection.
pub fn select_protocol(input: &SelectionInput<'_>) -> Result<HttpProtocol, ProtocolSelectionError> {
    let enabled = input.enabled;
    if enabled.is_empty() {
        return Err(ProtocolSelectionError::NoProtocolEnabled);
    }

    if input.multiplexed {
        if enabled.contains(HttpProtocols::HTTP3) {
            return Ok(HttpProtocol::Http3);
        }
        return Err(ProtocolSelectionError::UnsupportedOnMultiplexedTransport(enabled));
    }

    let http1 = enabled.contains(HttpProtocols::HTTP1);
    let http2 = enabled.contains(HttpProtocols::HTTP2);
    let alpn_h2 = input.alpn == Some(ALPN_H2);

    if !http1 && http2 && input.tls && !alpn_h2 {
        return Err(ProtocolSelectionError::Http2NotNegotiated);
    }

    if !input.tls && http1 {
        return Ok(HttpProtocol::Http1);
    }

    let selected = if http2 && (!input.tls || alpn_h2) {
        HttpProtocol::Http2
    } else {
        HttpProtocol::Http1
    };

    // Only reachable with an HTTP/3-only set on a stream transport.
    if !enabled.contains(selected.flag()) {
        return Err(ProtocolSelectionError::NoUsableProtocol(enabled));
    }
    Ok(selected)
}
