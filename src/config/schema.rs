//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::http::timeout::{HttpLimits, MinDataRate};
use crate::http::HttpProtocols;
use crate::tls::certificate::{CertificateConfig, ClientCertificateMode, SslProtocol};

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address list, content root and connection-level settings.
    pub server: ListenerConfig,

    /// Per-connection timing limits.
    pub limits: LimitsConfig,

    /// TLS policy for `https://` addresses and fallback for endpoints.
    pub https_defaults: HttpsDefaultsConfig,

    /// Named endpoints.
    pub endpoints: BTreeMap<String, EndpointConfig>,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl ServerConfig {
    /// Deep copy whose certificate configs share nothing with `self` and
    /// carry no change flags.
    pub fn detached(&self) -> Self {
        let mut copy = self.clone();
        copy.https_defaults.certificate = detach(&self.https_defaults.certificate);
        for endpoint in copy.endpoints.values_mut() {
            endpoint.detach_certificates();
        }
        copy
    }
}

fn detach(certificate: &Option<Arc<CertificateConfig>>) -> Option<Arc<CertificateConfig>> {
    certificate.as_ref().map(|c| Arc::new(c.unflagged()))
}

/// The `[server]` table.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Address strings, e.g. `http://localhost:5000`, `https://*:5001`.
    pub urls: Vec<String>,

    /// Prefer `urls` over `[endpoints]` when both are configured.
    pub prefer_host_urls: bool,

    /// Concurrent accept loops per listener; defaults to the listener's own maximum.
    pub max_accepts: Option<usize>,

    /// Maximum concurrent connections per endpoint (backpressure).
    pub max_concurrent_connections: Option<usize>,

    pub shutdown_timeout_secs: u64,

    /// Base directory for relative certificate paths.
    pub content_root: PathBuf,

    pub heartbeat_interval_ms: u64,
}

impl ListenerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            prefer_host_urls: false,
            max_accepts: None,
            max_concurrent_connections: None,
            shutdown_timeout_secs: 30,
            content_root: PathBuf::from("."),
            heartbeat_interval_ms: 1000,
        }
    }
}

/// The `[limits]` table.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub keep_alive_timeout_secs: u64,
    pub request_headers_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    /// `None` disables the check.
    pub min_request_body_data_rate: Option<MinDataRate>,
    pub min_response_data_rate: Option<MinDataRate>,
}

impl LimitsConfig {
    pub fn http_limits(&self) -> HttpLimits {
        HttpLimits {
            keep_alive_timeout: Duration::from_secs(self.keep_alive_timeout_secs),
            request_headers_timeout: Duration::from_secs(self.request_headers_timeout_secs),
            min_request_body_data_rate: self.min_request_body_data_rate,
            min_response_data_rate: self.min_response_data_rate,
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let limits = HttpLimits::default();
        Self {
            keep_alive_timeout_secs: limits.keep_alive_timeout.as_secs(),
            request_headers_timeout_secs: limits.request_headers_timeout.as_secs(),
            handshake_timeout_secs: 10,
            min_request_body_data_rate: limits.min_request_body_data_rate,
            min_response_data_rate: limits.min_response_data_rate,
        }
    }
}

/// The `[https_defaults]` table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpsDefaultsConfig {
    pub certificate: Option<Arc<CertificateConfig>>,
    pub ssl_protocols: Vec<SslProtocol>,
    pub client_certificate_mode: ClientCertificateMode,
    pub client_ca_path: Option<PathBuf>,
}

/// One `[endpoints.<name>]` table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct EndpointConfig {
    pub url: String,
    pub protocols: Option<HttpProtocols>,
    pub certificate: Option<Arc<CertificateConfig>>,
    pub ssl_protocols: Option<Vec<SslProtocol>>,
    pub client_certificate_mode: Option<ClientCertificateMode>,
    pub client_ca_path: Option<PathBuf>,
    /// Per-hostname overrides keyed by server name pattern.
    pub sni: BTreeMap<String, SniConfig>,
}

impl EndpointConfig {
    pub fn is_https(&self) -> bool {
        self.url
            .get(..8)
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case("https://"))
    }

    /// Every certificate config this endpoint references, SNI entries included.
    pub fn certificates(&self) -> Vec<Arc<CertificateConfig>> {
        self.certificate
            .iter()
            .chain(self.sni.values().filter_map(|sni| sni.certificate.as_ref()))
            .cloned()
            .collect()
    }

    /// True if any referenced file certificate changed on disk since it was loaded.
    pub fn has_changed_certificate(&self) -> bool {
        self.certificates().iter().any(|c| c.file_has_changed())
    }

    /// Copy with unset TLS fields taken from `defaults`.
    ///
    /// Inherited certificates are deep-copied so that every endpoint owns
    /// the instances it is subscribed with.
    pub fn with_https_defaults(&self, defaults: &HttpsDefaultsConfig) -> Self {
        let mut resolved = self.clone();
        if !self.is_https() {
            return resolved;
        }
        if resolved.certificate.is_none() {
            resolved.certificate = detach(&defaults.certificate);
        }
        if resolved.ssl_protocols.is_none() && !defaults.ssl_protocols.is_empty() {
            resolved.ssl_protocols = Some(defaults.ssl_protocols.clone());
        }
        if resolved.client_certificate_mode.is_none() {
            resolved.client_certificate_mode = Some(defaults.client_certificate_mode);
        }
        if resolved.client_ca_path.is_none() {
            resolved.client_ca_path = defaults.client_ca_path.clone();
        }
        resolved
    }

    fn detach_certificates(&mut self) {
        self.certificate = detach(&self.certificate);
        for sni in self.sni.values_mut() {
            sni.certificate = detach(&sni.certificate);
        }
    }
}

/// One `[endpoints.<name>.sni."<host>"]` table. Unset fields fall back to the endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SniConfig {
    pub certificate: Option<Arc<CertificateConfig>>,
    pub protocols: Option<HttpProtocols>,
    pub ssl_protocols: Option<Vec<SslProtocol>>,
    pub client_certificate_mode: Option<ClientCertificateMode>,
    pub client_ca_path: Option<PathBuf>,
}

/// The `[observability]` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Used when `RUST_LOG` is not set.
    pub log_level: String,
    pub log_format: LogFormat,
    pub metrics_enabled: bool,
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [server]
        urls = ["http://localhost:5000"]
        max_concurrent_connections = 1000

        [limits]
        keep_alive_timeout_secs = 60
        min_response_data_rate = { bytes_per_second = 100.0, grace_period_secs = 2.5 }

        [https_defaults]
        certificate = { path = "certs/default.pem", key_path = "certs/default.key" }
        ssl_protocols = ["tls13"]

        [endpoints.public]
        url = "https://*:5001"
        protocols = "http1AndHttp2"

        [endpoints.public.sni."*.example.org"]
        certificate = { path = "certs/example.pem" }
        protocols = "http1"

        [endpoints.internal]
        url = "http://127.0.0.1:5002"
    "#;

    #[test]
    fn parses_full_document() {
        let config: ServerConfig = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.server.urls, vec!["http://localhost:5000".to_string()]);
        assert_eq!(config.server.max_concurrent_connections, Some(1000));
        assert_eq!(config.server.shutdown_timeout_secs, 30);

        let limits = config.limits.http_limits();
        assert_eq!(limits.keep_alive_timeout, Duration::from_secs(60));
        assert_eq!(limits.request_headers_timeout, Duration::from_secs(30));
        assert_eq!(
            limits.min_response_data_rate,
            Some(MinDataRate::new(100.0, Duration::from_millis(2500)))
        );

        let public = &config.endpoints["public"];
        assert!(public.is_https());
        assert_eq!(public.protocols, Some(HttpProtocols::HTTP1_AND_HTTP2));
        assert_eq!(public.sni["*.example.org"].protocols, Some(HttpProtocols::HTTP1));
        assert!(!config.endpoints["internal"].is_https());
    }

    #[test]
    fn https_defaults_fill_only_unset_fields() {
        let config: ServerConfig = toml::from_str(SAMPLE).unwrap();
        let public = config.endpoints["public"].with_https_defaults(&config.https_defaults);
        let inherited = public.certificate.as_ref().unwrap();
        assert_eq!(inherited.path, Some(PathBuf::from("certs/default.pem")));
        assert!(!Arc::ptr_eq(inherited, config.https_defaults.certificate.as_ref().unwrap()));
        assert_eq!(public.ssl_protocols, Some(vec![SslProtocol::Tls13]));
        assert_eq!(public.client_certificate_mode, Some(ClientCertificateMode::NoCertificate));

        let internal = config.endpoints["internal"].with_https_defaults(&config.https_defaults);
        assert_eq!(internal, config.endpoints["internal"]);
    }

    #[test]
    fn detached_copy_is_equal_but_unshared() {
        let config: ServerConfig = toml::from_str(SAMPLE).unwrap();
        let original = config.endpoints["public"].sni["*.example.org"].certificate.clone().unwrap();
        original.mark_file_changed();

        let copy = config.detached();
        assert_eq!(copy, config);
        let detached = copy.endpoints["public"].sni["*.example.org"].certificate.clone().unwrap();
        assert!(!Arc::ptr_eq(&original, &detached));
        assert!(!detached.file_has_changed());
    }

    #[test]
    fn certificates_include_sni_entries() {
        let config: ServerConfig = toml::from_str(SAMPLE).unwrap();
        let public = config.endpoints["public"].with_https_defaults(&config.https_defaults);
        assert_eq!(public.certificates().len(), 2);
        assert!(!public.has_changed_certificate());

        public.certificates()[1].mark_file_changed();
        assert!(public.has_changed_certificate());
    }

    #[test]
    fn unknown_endpoint_keys_are_rejected() {
        let result = toml::from_str::<ServerConfig>(
            r#"
            [endpoints.a]
            url = "http://127.0.0.1:1"
            bogus = true
            "#,
        );
        assert!(result.is_err());
    }
}
