//! Per-hostname TLS options selection.
//!
//! # Responsibilities
//! - Resolve every SNI entry's certificate and effective settings once per
//!   endpoint activation, falling back to endpoint defaults field by field
//! - Match a client's server name against three tiers: exact names, `*.suffix`
//!   wildcards (longest suffix first), then an optional global `*`
//! - Defer to a certificate selector callback when an entry has no static
//!   certificate, on a clone of the cached TLS configuration
//!
//! # Design Decisions
//! - The tiers stay separate so the wildcard tie-break is explicit and testable
//! - Built options are immutable and shared by every connection

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rustls::crypto::CryptoProvider;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;

use crate::config::SniConfig;
use crate::http::HttpProtocols;
use crate::tls::certificate::{
    client_cert_verifier, load_certified_key, protocol_versions, CertificateConfig, CertificateError,
    ClientCertificateMode, SslProtocol,
};

const GLOBAL_PATTERN: &str = "*";
const WILDCARD_PREFIX: &str = "*.";

/// Failure to match a client's server name during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SniError {
    #[error("connection refused because no SNI server name was sent and no '*' entry is configured for endpoint {endpoint}")]
    NoServerName { endpoint: String },

    #[error("connection refused because the client's server name '{server_name}' is not configured for endpoint {endpoint}")]
    UnrecognizedServerName { endpoint: String, server_name: String },

    #[error("the certificate selector returned no certificate for server name '{0}'")]
    NoCertificateSelected(String),
}

/// Failure to build the TLS options of an endpoint.
#[derive(Debug, thiserror::Error)]
pub enum TlsSetupError {
    #[error("endpoint {endpoint}: SNI server name must not be empty")]
    EmptyServerName { endpoint: String },

    #[error("endpoint {endpoint}: no certificate configured for '{pattern}'")]
    NoCertificate { endpoint: String, pattern: String },

    #[error("endpoint {endpoint}: certificate for '{pattern}' could not be loaded")]
    Certificate {
        endpoint: String,
        pattern: String,
        #[source]
        source: CertificateError,
    },

    #[error("endpoint {endpoint}: invalid TLS protocol versions")]
    Protocol {
        endpoint: String,
        #[source]
        source: rustls::Error,
    },
}

/// Layered hostname lookup table.
#[derive(Debug, Clone)]
pub struct SniMap<T> {
    exact: HashMap<String, T>,
    /// `(".suffix", value)`, longest suffix first.
    wildcards: Vec<(String, T)>,
    global: Option<T>,
}

impl<T> Default for SniMap<T> {
    fn default() -> Self {
        Self {
            exact: HashMap::new(),
            wildcards: Vec::new(),
            global: None,
        }
    }
}

impl<T> SniMap<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry. Patterns are `host`, `*.suffix` or `*`; matching is
    /// case-insensitive. Returns false for an empty pattern.
    pub fn insert(&mut self, pattern: &str, value: T) -> bool {
        let pattern = pattern.trim().to_ascii_lowercase();
        if pattern.is_empty() {
            return false;
        }
        if pattern == GLOBAL_PATTERN {
            self.global = Some(value);
        } else if let Some(suffix) = pattern.strip_prefix(WILDCARD_PREFIX) {
            let suffix = format!(".{}", suffix);
            self.wildcards.retain(|(existing, _)| *existing != suffix);
            // Stable: equal lengths keep insertion order.
            let position = self
                .wildcards
                .iter()
                .position(|(existing, _)| existing.len() < suffix.len())
                .unwrap_or(self.wildcards.len());
            self.wildcards.insert(position, (suffix, value));
        } else {
            self.exact.insert(pattern, value);
        }
        true
    }

    /// Find the entry for `server_name`; `None` or empty means no SNI was sent.
    pub fn lookup(&self, server_name: Option<&str>) -> Option<&T> {
        let name = server_name.map(str::trim).filter(|name| !name.is_empty());
        let Some(name) = name else {
            return self.global.as_ref();
        };
        let name = name.to_ascii_lowercase();

        if let Some(value) = self.exact.get(&name) {
            return Some(value);
        }
        if let Some((_, value)) = self.wildcards.iter().find(|(suffix, _)| name.ends_with(suffix.as_str())) {
            return Some(value);
        }
        self.global.as_ref()
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.wildcards.len() + usize::from(self.global.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Programmatic certificate choice, consulted per connection.
pub type CertificateSelector = Arc<dyn Fn(Option<&str>) -> Option<Arc<CertifiedKey>> + Send + Sync>;

/// Endpoint-level HTTPS settings; SNI entries fall back to these.
#[derive(Clone)]
pub struct HttpsOptions {
    pub certificate: Option<Arc<CertificateConfig>>,
    pub certificate_selector: Option<CertificateSelector>,
    pub protocols: HttpProtocols,
    pub ssl_protocols: Vec<SslProtocol>,
    pub client_certificate_mode: ClientCertificateMode,
    pub client_ca_path: Option<PathBuf>,
    pub handshake_timeout: Duration,
}

impl Default for HttpsOptions {
    fn default() -> Self {
        Self {
            certificate: None,
            certificate_selector: None,
            protocols: HttpProtocols::HTTP1_AND_HTTP2,
            ssl_protocols: Vec::new(),
            client_certificate_mode: ClientCertificateMode::NoCertificate,
            client_ca_path: None,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl fmt::Debug for HttpsOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpsOptions")
            .field("certificate", &self.certificate)
            .field("certificate_selector", &self.certificate_selector.is_some())
            .field("protocols", &self.protocols)
            .field("ssl_protocols", &self.ssl_protocols)
            .field("client_certificate_mode", &self.client_certificate_mode)
            .field("client_ca_path", &self.client_ca_path)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}

#[derive(Debug)]
struct FixedCertResolver(Arc<CertifiedKey>);

impl ResolvesServerCert for FixedCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

/// Placeholder until a selector supplies the certificate.
#[derive(Debug)]
struct DeferredCertResolver;

impl ResolvesServerCert for DeferredCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        None
    }
}

/// Fully resolved options of one SNI entry.
#[derive(Clone)]
pub struct SniOptions {
    server_config: Arc<ServerConfig>,
    protocols: HttpProtocols,
    certificate_selector: Option<CertificateSelector>,
}

impl fmt::Debug for SniOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SniOptions")
            .field("protocols", &self.protocols)
            .field("alpn", &self.server_config.alpn_protocols)
            .field("dynamic_certificate", &self.certificate_selector.is_some())
            .finish()
    }
}

/// What the handshake continues with for one connection.
#[derive(Debug, Clone)]
pub struct SelectedOptions {
    pub server_config: Arc<ServerConfig>,
    /// Protocols enabled for this host; protocol selection honors them.
    pub protocols: HttpProtocols,
}

/// Resolves TLS options for a client's server name.
#[derive(Debug, Clone)]
pub struct SniOptionsSelector {
    endpoint: String,
    map: SniMap<SniOptions>,
}

impl SniOptionsSelector {
    /// Build every entry of `sni` (or a single `*` entry from `defaults`
    /// when `sni` is empty).
    pub fn build(
        endpoint: &str,
        defaults: &HttpsOptions,
        sni: &BTreeMap<String, SniConfig>,
        content_root: &Path,
        provider: Arc<CryptoProvider>,
    ) -> Result<Self, TlsSetupError> {
        let mut map = SniMap::new();

        if sni.is_empty() {
            let options = build_entry(endpoint, GLOBAL_PATTERN, defaults, None, content_root, &provider)?;
            map.insert(GLOBAL_PATTERN, options);
        }

        for (pattern, entry) in sni {
            let options = build_entry(endpoint, pattern, defaults, Some(entry), content_root, &provider)?;
            if !map.insert(pattern, options) {
                return Err(TlsSetupError::EmptyServerName {
                    endpoint: endpoint.to_string(),
                });
            }
        }

        tracing::debug!(endpoint = %endpoint, entries = map.len(), "Built SNI options");
        Ok(Self {
            endpoint: endpoint.to_string(),
            map,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Options for `server_name`.
    pub fn select(&self, server_name: Option<&str>) -> Result<SelectedOptions, SniError> {
        let options = self.map.lookup(server_name).ok_or_else(|| match server_name {
            Some(name) if !name.trim().is_empty() => SniError::UnrecognizedServerName {
                endpoint: self.endpoint.clone(),
                server_name: name.to_string(),
            },
            _ => SniError::NoServerName {
                endpoint: self.endpoint.clone(),
            },
        })?;

        let Some(selector) = &options.certificate_selector else {
            return Ok(SelectedOptions {
                server_config: Arc::clone(&options.server_config),
                protocols: options.protocols,
            });
        };

        let key = selector(server_name)
            .ok_or_else(|| SniError::NoCertificateSelected(server_name.unwrap_or_default().to_string()))?;
        // The cached config is shared across connections; mutate a copy.
        let mut server_config = (*options.server_config).clone();
        server_config.cert_resolver = Arc::new(FixedCertResolver(key));
        Ok(SelectedOptions {
            server_config: Arc::new(server_config),
            protocols: options.protocols,
        })
    }
}

fn build_entry(
    endpoint: &str,
    pattern: &str,
    defaults: &HttpsOptions,
    entry: Option<&SniConfig>,
    content_root: &Path,
    provider: &Arc<CryptoProvider>,
) -> Result<SniOptions, TlsSetupError> {
    if pattern.trim().is_empty() {
        return Err(TlsSetupError::EmptyServerName {
            endpoint: endpoint.to_string(),
        });
    }

    let certificate = entry
        .and_then(|e| e.certificate.as_ref())
        .or(defaults.certificate.as_ref());
    let protocols = entry.and_then(|e| e.protocols).unwrap_or(defaults.protocols);
    let ssl_protocols = entry
        .and_then(|e| e.ssl_protocols.as_deref())
        .unwrap_or(&defaults.ssl_protocols);
    let client_mode = entry
        .and_then(|e| e.client_certificate_mode)
        .unwrap_or(defaults.client_certificate_mode);
    let client_ca = entry
        .and_then(|e| e.client_ca_path.as_deref())
        .or(defaults.client_ca_path.as_deref());

    let certificate_error = |source| TlsSetupError::Certificate {
        endpoint: endpoint.to_string(),
        pattern: pattern.to_string(),
        source,
    };

    let (resolver, certificate_selector): (Arc<dyn ResolvesServerCert>, Option<CertificateSelector>) =
        match (certificate, &defaults.certificate_selector) {
            (Some(config), _) => {
                let key = load_certified_key(config, content_root, provider).map_err(certificate_error)?;
                (Arc::new(FixedCertResolver(key)), None)
            }
            (None, Some(selector)) => (Arc::new(DeferredCertResolver), Some(Arc::clone(selector))),
            (None, None) => {
                return Err(TlsSetupError::NoCertificate {
                    endpoint: endpoint.to_string(),
                    pattern: pattern.to_string(),
                })
            }
        };

    let verifier = client_cert_verifier(client_mode, client_ca, content_root, Arc::clone(provider))
        .map_err(certificate_error)?;
    let versions = protocol_versions(ssl_protocols);

    let mut server_config = ServerConfig::builder_with_provider(Arc::clone(provider))
        .with_protocol_versions(&versions)
        .map_err(|source| TlsSetupError::Protocol {
            endpoint: endpoint.to_string(),
            source,
        })?
        .with_client_cert_verifier(verifier)
        .with_cert_resolver(resolver);
    server_config.alpn_protocols = protocols.alpn_protocols();

    Ok(SniOptions {
        server_config: Arc::new(server_config),
        protocols,
        certificate_selector,
    })
}
