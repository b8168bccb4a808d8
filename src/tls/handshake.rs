//! SNI-driven TLS handshake.
//!
//! The ClientHello is read first, its server name picks the TLS options, and
//! only then is the handshake completed with that configuration. The whole
//! exchange runs under one deadline; expiry fails the connection, not just
//! the handshake call.

use std::io;
use std::time::Duration;

use rustls::server::Acceptor;
use rustls::ProtocolVersion;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;

use crate::http::HttpProtocols;
use crate::tls::sni::{SniError, SniOptionsSelector};

/// Why a TLS handshake failed.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("TLS handshake did not complete within {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Sni(#[from] SniError),

    #[error("TLS handshake failed")]
    Io(#[from] io::Error),
}

impl HandshakeError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            HandshakeError::Timeout(_) => "timeout",
            HandshakeError::Sni(_) => "sni",
            HandshakeError::Io(_) => "io",
        }
    }
}

/// Connection-scoped facts produced by a completed handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConnectionInfo {
    pub server_name: Option<String>,
    pub alpn: Option<Vec<u8>>,
    /// Protocols enabled for the matched host.
    pub protocols: HttpProtocols,
    pub protocol_version: Option<ProtocolVersion>,
    pub client_certificate_presented: bool,
}

/// TLS policy of one endpoint.
#[derive(Debug, Clone)]
pub struct TlsHandshake {
    selector: SniOptionsSelector,
    timeout: Duration,
}

impl TlsHandshake {
    pub fn new(selector: SniOptionsSelector, timeout: Duration) -> Self {
        Self { selector, timeout }
    }

    pub fn selector(&self) -> &SniOptionsSelector {
        &self.selector
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run the server side of a handshake on `io`.
    pub async fn accept<IO>(&self, io: IO) -> Result<(TlsStream<IO>, TlsConnectionInfo), HandshakeError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        tokio::time::timeout(self.timeout, self.handshake(io))
            .await
            .map_err(|_| HandshakeError::Timeout(self.timeout))?
    }

    async fn handshake<IO>(&self, io: IO) -> Result<(TlsStream<IO>, TlsConnectionInfo), HandshakeError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let start = LazyConfigAcceptor::new(Acceptor::default(), io).await?;
        let server_name = start.client_hello().server_name().map(str::to_string);
        let selected = self.selector.select(server_name.as_deref())?;

        let stream = start.into_stream(selected.server_config).await?;
        let (_, connection) = stream.get_ref();
        let info = TlsConnectionInfo {
            server_name,
            alpn: connection.alpn_protocol().map(<[u8]>::to_vec),
            protocols: selected.protocols,
            protocol_version: connection.protocol_version(),
            client_certificate_presented: connection.peer_certificates().is_some_and(|certs| !certs.is_empty()),
        };
        Ok((stream, info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::certificate::test_support::write_self_signed;
    use crate::tls::certificate::CertificateConfig;
    use crate::tls::sni::HttpsOptions;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn handshake(dir: &std::path::Path, timeout: Duration) -> TlsHandshake {
        let (cert, key) = write_self_signed(dir, "hs", &["localhost"]);
        let defaults = HttpsOptions {
            certificate: Some(Arc::new(CertificateConfig::from_files(cert, Some(key)))),
            ..HttpsOptions::default()
        };
        let selector = SniOptionsSelector::build(
            "https://127.0.0.1:5001",
            &defaults,
            &BTreeMap::new(),
            dir,
            Arc::new(rustls::crypto::ring::default_provider()),
        )
        .unwrap();
        TlsHandshake::new(selector, timeout)
    }

    #[tokio::test]
    async fn silent_client_hits_the_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let tls = handshake(dir.path(), Duration::from_millis(50));
        let (server, _client) = tokio::io::duplex(1024);
        let result = tls.accept(server).await;
        assert!(matches!(result, Err(HandshakeError::Timeout(_))));
    }

    #[tokio::test]
    async fn garbage_is_an_io_error() {
        use tokio::io::AsyncWriteExt;

        let dir = tempfile::tempdir().unwrap();
        let tls = handshake(dir.path(), Duration::from_secs(5));
        let (server, mut client) = tokio::io::duplex(1024);
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let result = tls.accept(server).await;
        assert!(matches!(result, Err(ref err) if err.kind() == "io"));
    }
}
