//! Server address string parsing.
//!
//! Grammar: `scheme://host[:port][/pathbase]`
//!
//! # Responsibilities
//! - Split an address into scheme, host, port and path base
//! - Classify the host into a bind target (unix socket, named pipe,
//!   localhost, IP literal, or any IP)
//!
//! # Design Decisions
//! - Malformed input is always an error, never a silent default
//! - `localhost` stays distinct from an IP so it can bind both loopback families
//! - A path base is rejected; it must be configured programmatically

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use crate::net::endpoint::ListenTarget;

const SCHEME_DELIMITER: &str = "://";
const UNIX_PIPE_HOST_PREFIX: &str = "unix:/";
const NAMED_PIPE_HOST_PREFIX: &str = "pipe:/";

/// Errors produced while parsing or classifying an address string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("invalid url: '{0}'")]
    MissingSchemeDelimiter(String),
    #[error("invalid url, host is empty: '{0}'")]
    EmptyHost(String),
    #[error("invalid port in url: '{0}'")]
    InvalidPort(String),
    #[error("unrecognized scheme in server address '{0}'; only 'http://' and 'https://' are supported")]
    UnsupportedScheme(String),
    #[error("a path base can only be configured programmatically, not through the address: '{0}'")]
    PathBaseNotAllowed(String),
    #[error("dynamic port binding is not supported when binding to localhost; use 127.0.0.1 or [::1] instead: '{0}'")]
    DynamicLocalhostPort(String),
}

/// Supported URL schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The raw components of an address string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingAddress {
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
    pub path_base: String,
    original: String,
}

impl BindingAddress {
    /// Split an address string into its components.
    ///
    /// Only the syntax is checked here; scheme and path-base rules are
    /// applied by [`parse_server_address`].
    pub fn parse(address: &str) -> Result<Self, AddressError> {
        let address = address.trim();
        let scheme_end = address
            .find(SCHEME_DELIMITER)
            .ok_or_else(|| AddressError::MissingSchemeDelimiter(address.to_string()))?;
        let scheme = address[..scheme_end].to_ascii_lowercase();
        let rest = &address[scheme_end + SCHEME_DELIMITER.len()..];

        // Socket paths contain '/', so the path base starts at the next ':'.
        if let Some(path) = strip_prefix_ignore_case(rest, UNIX_PIPE_HOST_PREFIX) {
            let (socket, path_base) = match path.find(':') {
                Some(idx) => (&path[..idx], &path[idx + 1..]),
                None => (path, ""),
            };
            return Ok(Self {
                scheme,
                host: format!("unix:/{}", socket),
                port: None,
                path_base: trim_path_base(path_base),
                original: address.to_string(),
            });
        }

        if let Some(pipe) = strip_prefix_ignore_case(rest, NAMED_PIPE_HOST_PREFIX) {
            let (name, path_base) = match pipe.find(':') {
                Some(idx) => (&pipe[..idx], &pipe[idx + 1..]),
                None => (pipe, ""),
            };
            return Ok(Self {
                scheme,
                host: format!("pipe:/{}", name),
                port: None,
                path_base: trim_path_base(path_base),
                original: address.to_string(),
            });
        }

        let (authority, path_base) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };

        let (host, port) = split_host_port(authority, address)?;
        if host.is_empty() {
            return Err(AddressError::EmptyHost(address.to_string()));
        }

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
            path_base: trim_path_base(path_base),
            original: address.to_string(),
        })
    }

    pub fn is_unix_socket(&self) -> bool {
        self.host.starts_with("unix:/")
    }

    pub fn is_named_pipe(&self) -> bool {
        self.host.starts_with("pipe:/")
    }

    /// Socket path for a unix-socket address.
    pub fn unix_socket_path(&self) -> Option<PathBuf> {
        self.host.strip_prefix("unix:").map(PathBuf::from)
    }

    /// Pipe name for a named-pipe address.
    pub fn named_pipe_name(&self) -> Option<&str> {
        self.host.strip_prefix("pipe:/")
    }

    pub fn original(&self) -> &str {
        &self.original
    }
}

impl fmt::Display for BindingAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

/// A fully classified address: scheme plus concrete bind target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    pub scheme: Scheme,
    pub target: ListenTarget,
}

impl ServerAddress {
    pub fn is_https(&self) -> bool {
        self.scheme == Scheme::Https
    }
}

/// Parse and classify an address string into a bind target.
pub fn parse_server_address(address: &str) -> Result<ServerAddress, AddressError> {
    let parsed = BindingAddress::parse(address)?;

    let scheme = match parsed.scheme.as_str() {
        "http" => Scheme::Http,
        "https" => Scheme::Https,
        _ => return Err(AddressError::UnsupportedScheme(address.to_string())),
    };

    if !parsed.path_base.is_empty() {
        return Err(AddressError::PathBaseNotAllowed(address.to_string()));
    }

    let target = if let Some(path) = parsed.unix_socket_path() {
        ListenTarget::Unix(path)
    } else if let Some(name) = parsed.named_pipe_name() {
        ListenTarget::NamedPipe(name.to_string())
    } else {
        let port = parsed.port.unwrap_or_else(|| scheme.default_port());
        let host = parsed.host.as_str();
        if host.eq_ignore_ascii_case("localhost") {
            if port == 0 {
                return Err(AddressError::DynamicLocalhostPort(address.to_string()));
            }
            ListenTarget::Localhost(port)
        } else if let Ok(ip) = host.parse::<IpAddr>() {
            ListenTarget::Ip(SocketAddr::new(ip, port))
        } else {
            if host != "*" && host != "+" {
                tracing::debug!(address = %address, host = %host, "Host is not an IP literal, binding to any IP");
            }
            ListenTarget::AnyIp(port)
        }
    };

    Ok(ServerAddress { scheme, target })
}

fn split_host_port<'a>(authority: &'a str, address: &str) -> Result<(&'a str, Option<u16>), AddressError> {
    // IPv6 literal: [::1]:5000
    if let Some(stripped) = authority.strip_prefix('[') {
        let close = stripped
            .find(']')
            .ok_or_else(|| AddressError::EmptyHost(address.to_string()))?;
        let host = &stripped[..close];
        let after = &stripped[close + 1..];
        let port = match after.strip_prefix(':') {
            Some(port) => Some(parse_port(port, address)?),
            None if after.is_empty() => None,
            None => return Err(AddressError::InvalidPort(address.to_string())),
        };
        return Ok((host, port));
    }

    match authority.rfind(':') {
        Some(idx) => {
            let port = parse_port(&authority[idx + 1..], address)?;
            Ok((&authority[..idx], Some(port)))
        }
        None => Ok((authority, None)),
    }
}

fn parse_port(raw: &str, address: &str) -> Result<u16, AddressError> {
    raw.parse::<u16>()
        .map_err(|_| AddressError::InvalidPort(address.to_string()))
}

fn trim_path_base(path_base: &str) -> String {
    path_base.trim_end_matches('/').to_string()
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    if value.len() >= prefix.len()
        && value.is_char_boundary(prefix.len())
        && value[..prefix.len()].eq_ignore_ascii_case(prefix)
    {
        Some(&value[prefix.len()..])
    } else {
        None
    }
}
