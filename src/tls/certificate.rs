//! Certificate configuration and loading.
//!
//! # Responsibilities
//! - Describe where a certificate lives (file pair or certificate store)
//! - Carry the "file has changed" flag the certificate watcher sets
//! - Load PEM chains and private keys into rustls signing keys
//! - Build client-certificate verifiers for the configured mode

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::danger::ClientCertVerifier;
use rustls::server::{NoClientAuth, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::{RootCertStore, SupportedProtocolVersion};
use serde::{Deserialize, Serialize};

/// Errors from loading certificates, keys, or client CA bundles.
#[derive(Debug, thiserror::Error)]
pub enum CertificateError {
    #[error("certificate configuration has neither a path nor a store subject")]
    MissingSource,

    #[error("certificate stores are not supported on this platform (subject '{0}')")]
    StoreUnsupported(String),

    #[error("password-protected private keys are not supported: {}", .0.display())]
    EncryptedKeyUnsupported(PathBuf),

    #[error("failed to read {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no certificates found in {}", .0.display())]
    NoCertificates(PathBuf),

    #[error("no private key found in {}", .0.display())]
    NoPrivateKey(PathBuf),

    #[error("private key in {} is not usable", .path.display())]
    InvalidKey {
        path: PathBuf,
        #[source]
        source: rustls::Error,
    },

    #[error("invalid client certificate authority bundle {}: {message}", .path.display())]
    ClientCa { path: PathBuf, message: String },

    #[error("client certificate mode {0} requires a client CA bundle")]
    MissingClientCa(ClientCertificateMode),

    #[error("TLS protocol configuration rejected")]
    Protocol(#[source] rustls::Error),
}

/// Where a server certificate comes from.
///
/// Equality compares configured values only. The change flag belongs to the
/// certificate watcher and is not compared.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CertificateConfig {
    /// PEM file holding the certificate chain (and the key when `key_path` is unset).
    pub path: Option<PathBuf>,
    /// PEM file holding the private key.
    pub key_path: Option<PathBuf>,
    /// Password for an encrypted private key.
    pub password: Option<String>,
    /// Certificate store subject name.
    pub subject: Option<String>,
    pub store: Option<String>,
    pub location: Option<String>,
    #[serde(default)]
    pub allow_invalid: bool,

    #[serde(skip)]
    file_has_changed: AtomicBool,
}

impl CertificateConfig {
    pub fn from_files(path: impl Into<PathBuf>, key_path: Option<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            key_path,
            ..Self::default()
        }
    }

    /// Backed by files the watcher can track.
    pub fn is_file_cert(&self) -> bool {
        self.path.is_some()
    }

    pub fn is_store_cert(&self) -> bool {
        self.subject.is_some()
    }

    pub fn file_has_changed(&self) -> bool {
        self.file_has_changed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_file_changed(&self) {
        self.file_has_changed.store(true, Ordering::Release);
    }

    /// Copy of the configured values with the change flag cleared.
    pub fn unflagged(&self) -> Self {
        let copy = self.clone();
        copy.file_has_changed.store(false, Ordering::Release);
        copy
    }

    /// Files this certificate reads, resolved against `content_root`.
    pub fn watched_paths(&self, content_root: &Path) -> Vec<PathBuf> {
        let mut paths = Vec::with_capacity(2);
        if let Some(path) = &self.path {
            paths.push(resolve_path(content_root, path));
        }
        if let Some(key_path) = &self.key_path {
            let resolved = resolve_path(content_root, key_path);
            if !paths.contains(&resolved) {
                paths.push(resolved);
            }
        }
        paths
    }
}

impl Clone for CertificateConfig {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            key_path: self.key_path.clone(),
            password: self.password.clone(),
            subject: self.subject.clone(),
            store: self.store.clone(),
            location: self.location.clone(),
            allow_invalid: self.allow_invalid,
            file_has_changed: AtomicBool::new(self.file_has_changed()),
        }
    }
}

impl PartialEq for CertificateConfig {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
            && self.key_path == other.key_path
            && self.password == other.password
            && self.subject == other.subject
            && self.store == other.store
            && self.location == other.location
            && self.allow_invalid == other.allow_invalid
    }
}

impl Eq for CertificateConfig {}

/// A TLS protocol version an endpoint may negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SslProtocol {
    Tls12,
    Tls13,
}

impl SslProtocol {
    pub fn version(self) -> &'static SupportedProtocolVersion {
        match self {
            SslProtocol::Tls12 => &rustls::version::TLS12,
            SslProtocol::Tls13 => &rustls::version::TLS13,
        }
    }
}

/// Protocol versions for a set of configured protocols; empty means the provider defaults.
pub fn protocol_versions(protocols: &[SslProtocol]) -> Vec<&'static SupportedProtocolVersion> {
    if protocols.is_empty() {
        return rustls::DEFAULT_VERSIONS.to_vec();
    }
    let mut versions: Vec<&'static SupportedProtocolVersion> = Vec::with_capacity(2);
    for protocol in protocols {
        let version = protocol.version();
        if !versions.iter().any(|v| v.version == version.version) {
            versions.push(version);
        }
    }
    versions
}

/// Whether, and how strictly, clients must present a certificate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientCertificateMode {
    #[default]
    NoCertificate,
    AllowCertificate,
    RequireCertificate,
}

impl fmt::Display for ClientCertificateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientCertificateMode::NoCertificate => "no_certificate",
            ClientCertificateMode::AllowCertificate => "allow_certificate",
            ClientCertificateMode::RequireCertificate => "require_certificate",
        };
        f.write_str(name)
    }
}

pub fn resolve_path(content_root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        content_root.join(path)
    }
}

fn open(path: &Path) -> Result<BufReader<File>, CertificateError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| CertificateError::Read {
            path: path.to_path_buf(),
            source,
        })
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, CertificateError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| CertificateError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(CertificateError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>, CertificateError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| CertificateError::Read {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| CertificateError::NoPrivateKey(path.to_path_buf()))
}

/// Load a certificate chain and its private key into a signing key.
pub fn load_certified_key(
    config: &CertificateConfig,
    content_root: &Path,
    provider: &CryptoProvider,
) -> Result<Arc<CertifiedKey>, CertificateError> {
    let path = match (&config.path, &config.subject) {
        (Some(path), _) => resolve_path(content_root, path),
        (None, Some(subject)) => return Err(CertificateError::StoreUnsupported(subject.clone())),
        (None, None) => return Err(CertificateError::MissingSource),
    };
    if config.password.is_some() {
        return Err(CertificateError::EncryptedKeyUnsupported(path));
    }

    let key_path = config
        .key_path
        .as_deref()
        .map(|key_path| resolve_path(content_root, key_path))
        .unwrap_or_else(|| path.clone());

    let chain = read_certs(&path)?;
    let key = read_key(&key_path)?;
    let signing_key = provider
        .key_provider
        .load_private_key(key)
        .map_err(|source| CertificateError::InvalidKey {
            path: key_path.clone(),
            source,
        })?;

    tracing::debug!(path = %path.display(), chain_len = chain.len(), "Loaded certificate");
    Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
}

/// Build the client certificate verifier for `mode`.
pub fn client_cert_verifier(
    mode: ClientCertificateMode,
    client_ca_path: Option<&Path>,
    content_root: &Path,
    provider: Arc<CryptoProvider>,
) -> Result<Arc<dyn ClientCertVerifier>, CertificateError> {
    if mode == ClientCertificateMode::NoCertificate {
        return Ok(Arc::new(NoClientAuth));
    }
    let ca_path = client_ca_path
        .map(|path| resolve_path(content_root, path))
        .ok_or(CertificateError::MissingClientCa(mode))?;

    let mut roots = RootCertStore::empty();
    for cert in read_certs(&ca_path)? {
        roots.add(cert).map_err(|err| CertificateError::ClientCa {
            path: ca_path.clone(),
            message: err.to_string(),
        })?;
    }

    let builder = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider);
    let builder = if mode == ClientCertificateMode::AllowCertificate {
        builder.allow_unauthenticated()
    } else {
        builder
    };
    builder.build().map_err(|err| CertificateError::ClientCa {
        path: ca_path,
        message: err.to_string(),
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::{Path, PathBuf};

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
}
