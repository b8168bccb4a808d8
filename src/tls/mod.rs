//! TLS subsystem.
//!
//! # Data Flow
//! ```text
//! certificate files on disk
//!     → watcher.rs (modified-time tracking, change token)
//!     → certificate.rs (PEM chain + key → rustls signing key)
//!     → sni.rs (per-hostname options, built once per endpoint activation)
//!     → handshake.rs (ClientHello → SNI lookup → handshake under deadline)
//!     → HTTP layer (ALPN + per-host protocols drive protocol selection)
//! ```
//!
//! # Design Decisions
//! - rustls with the ring provider; no OpenSSL
//! - Certificate changes never patch running options: the server rebuilds
//!   the affected endpoints from configuration

pub mod certificate;
pub mod handshake;
pub mod sni;
pub mod watcher;

pub use certificate::{CertificateConfig, CertificateError, ClientCertificateMode, SslProtocol};
pub use handshake::{HandshakeError, TlsConnectionInfo, TlsHandshake};
pub use sni::{CertificateSelector, HttpsOptions, SniError, SniMap, SniOptionsSelector, TlsSetupError};
pub use watcher::{CertificatePathWatcher, ChangeToken, NotifyFileSystem, WatchError, WatchedFileSystem};

use std::sync::Arc;

use rustls::crypto::CryptoProvider;

/// The crypto provider every TLS configuration in this crate is built with.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}
