//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use switchyard::config::parse_config;
use switchyard::{Server, ServerConfig};

/// Parse a TOML configuration, panicking on errors.
pub fn config(toml_text: &str) -> ServerConfig {
    parse_config(toml_text).unwrap()
}

/// Socket address of a bound listener url such as `http://127.0.0.1:5123`.
pub fn socket_addr(url: &str) -> SocketAddr {
    let (_, rest) = url.split_once("://").unwrap();
    rest.parse().unwrap()
}

/// Address of the only listener of endpoint `name`.
pub async fn endpoint_addr(server: &Server, name: &str) -> SocketAddr {
    let urls = server.endpoint_urls(name).await;
    assert_eq!(urls.len(), 1, "expected one listener for {}: {:?}", name, urls);
    socket_addr(&urls[0])
}

/// Write a self-signed certificate and key for `names` into `dir`.
pub fn write_self_signed(dir: &Path, stem: &str, names: &[&str]) -> (PathBuf, PathBuf) {
    let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
    let certified = rcgen::generate_simple_self_signed(names).unwrap();
    let cert_path = dir.join(format!("{}.pem", stem));
    let key_path = dir.join(format!("{}.key", stem));
    std::fs::write(&cert_path, certified.cert.pem()).unwrap();
    std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();
    (cert_path, key_path)
}

/// Write one HTTP/1.1 request on `stream` and read until the peer closes or
/// a full response with `Content-Length` arrived.
pub async fn http1_exchange<S>(stream: &mut S, path: &str, host: &str, close: bool) -> String
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let connection = if close { "close" } else { "keep-alive" };
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: {}\r\n\r\n",
        path, host, connection
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if response_complete(&buf) {
            break;
        }
    }
    String::from_utf8(buf).unwrap()
}

fn response_complete(buf: &[u8]) -> bool {
    let text = String::from_utf8_lossy(buf);
    let Some((head, body)) = text.split_once("\r\n\r\n") else {
        return false;
    };
    head.lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .is_some_and(|len| body.len() >= len)
}

/// Plain GET with `Connection: close`.
pub async fn http1_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    http1_exchange(&mut stream, path, &addr.to_string(), true).await
}

/// TLS client trusting exactly the certificates in `trusted`, offering HTTP/1.1.
pub fn tls_connector(trusted: &[&Path]) -> TlsConnector {
    let mut roots = RootCertStore::empty();
    for path in trusted {
        let pem = std::fs::read(path).unwrap();
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            roots.add(cert.unwrap()).unwrap();
        }
    }
    let mut config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    TlsConnector::from(Arc::new(config))
}

/// Open a TLS connection to `addr` announcing `server_name` via SNI.
pub async fn tls_connect(
    connector: &TlsConnector,
    addr: SocketAddr,
    server_name: &str,
) -> std::io::Result<TlsStream<TcpStream>> {
    let stream = TcpStream::connect(addr).await?;
    let name = ServerName::try_from(server_name.to_string()).unwrap();
    connector.connect(name, stream).await
}
