//! Listen endpoint descriptors.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::EndpointConfig;
use crate::http::HttpProtocols;
use crate::tls::TlsHandshake;

/// Where an endpoint binds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListenTarget {
    /// A concrete IP address and port.
    Ip(SocketAddr),
    /// Both IPv4 and IPv6 loopback on one port.
    Localhost(u16),
    /// Every interface on one port (dual-mode when IPv6 is available).
    AnyIp(u16),
    /// A unix domain socket path.
    Unix(PathBuf),
    /// A named pipe.
    NamedPipe(String),
}

impl ListenTarget {
    /// TCP port, if this target is IP based.
    pub fn port(&self) -> Option<u16> {
        match self {
            ListenTarget::Ip(addr) => Some(addr.port()),
            ListenTarget::Localhost(port) | ListenTarget::AnyIp(port) => Some(*port),
            ListenTarget::Unix(_) | ListenTarget::NamedPipe(_) => None,
        }
    }

    /// The two loopback addresses a localhost target expands into.
    pub fn loopback_pair(port: u16) -> [SocketAddr; 2] {
        [
            SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port),
            SocketAddr::new(Ipv6Addr::LOCALHOST.into(), port),
        ]
    }
}

impl fmt::Display for ListenTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenTarget::Ip(addr) => write!(f, "{}", addr),
            ListenTarget::Localhost(port) => write!(f, "localhost:{}", port),
            ListenTarget::AnyIp(port) => write!(f, "[::]:{}", port),
            ListenTarget::Unix(path) => write!(f, "unix:{}", path.display()),
            ListenTarget::NamedPipe(name) => write!(f, "pipe:/{}", name),
        }
    }
}

/// A resolved endpoint ready to bind: target plus protocol and TLS policy.
#[derive(Clone)]
pub struct ListenOptions {
    /// Endpoint name when it came from configuration.
    pub name: Option<String>,
    pub target: ListenTarget,
    pub protocols: HttpProtocols,
    /// TLS policy, including the SNI map; `None` for cleartext endpoints.
    pub tls: Option<Arc<TlsHandshake>>,
    /// Configuration snapshot this endpoint was built from, for reload diffs.
    pub config: Option<EndpointConfig>,
}

impl ListenOptions {
    pub fn new(target: ListenTarget) -> Self {
        Self {
            name: None,
            target,
            protocols: HttpProtocols::HTTP1_AND_HTTP2,
            tls: None,
            config: None,
        }
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    pub fn scheme(&self) -> &'static str {
        if self.is_tls() {
            "https"
        } else {
            "http"
        }
    }

    /// Display url, e.g. `https://127.0.0.1:5001`.
    pub fn url(&self) -> String {
        format!("{}://{}", self.scheme(), self.target)
    }

    /// Copy of these options bound to a different target.
    pub fn with_target(&self, target: ListenTarget) -> Self {
        Self {
            target,
            ..self.clone()
        }
    }
}

impl fmt::Debug for ListenOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenOptions")
            .field("name", &self.name)
            .field("target", &self.target)
            .field("protocols", &self.protocols)
            .field("tls", &self.is_tls())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_reflect_scheme_and_target() {
        let options = ListenOptions::new(ListenTarget::Localhost(5000));
        assert_eq!(options.url(), "http://localhost:5000");

        let unix = ListenOptions::new(ListenTarget::Unix(PathBuf::from("/tmp/a.sock")));
        assert_eq!(unix.url(), "http://unix:/tmp/a.sock");
        assert_eq!(unix.target.port(), None);
    }

    #[test]
    fn with_target_keeps_policy() {
        let mut options = ListenOptions::new(ListenTarget::Localhost(5000));
        options.protocols = HttpProtocols::HTTP1;
        let [v4, _] = ListenTarget::loopback_pair(5000);
        let copy = options.with_target(ListenTarget::Ip(v4));
        assert_eq!(copy.protocols, HttpProtocols::HTTP1);
        assert_eq!(copy.url(), "http://127.0.0.1:5000");
    }
}
