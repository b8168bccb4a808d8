//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check that every endpoint url parses and uses a supported scheme
//! - Reject TLS settings on cleartext endpoints
//! - Validate value ranges (timeouts > 0, data rates > 0)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;

use crate::config::schema::{EndpointConfig, ServerConfig};
use crate::net::address::parse_server_address;
use crate::tls::certificate::ClientCertificateMode;

/// One semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending key, e.g. `endpoints.public.url`.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    for (index, url) in config.server.urls.iter().enumerate() {
        if let Err(e) = parse_server_address(url) {
            errors.push(ValidationError::new(format!("server.urls[{}]", index), e.to_string()));
        }
    }
    if config.server.max_accepts == Some(0) {
        errors.push(ValidationError::new("server.max_accepts", "must be greater than zero"));
    }
    if config.server.max_concurrent_connections == Some(0) {
        errors.push(ValidationError::new(
            "server.max_concurrent_connections",
            "must be greater than zero",
        ));
    }
    if config.server.heartbeat_interval_ms == 0 {
        errors.push(ValidationError::new("server.heartbeat_interval_ms", "must be greater than zero"));
    }

    let limits = &config.limits;
    for (field, value) in [
        ("limits.keep_alive_timeout_secs", limits.keep_alive_timeout_secs),
        ("limits.request_headers_timeout_secs", limits.request_headers_timeout_secs),
        ("limits.handshake_timeout_secs", limits.handshake_timeout_secs),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than zero"));
        }
    }
    for (field, rate) in [
        ("limits.min_request_body_data_rate", &limits.min_request_body_data_rate),
        ("limits.min_response_data_rate", &limits.min_response_data_rate),
    ] {
        if let Some(rate) = rate {
            if rate.bytes_per_second.is_nan() || rate.bytes_per_second <= 0.0 {
                errors.push(ValidationError::new(field, "bytes_per_second must be greater than zero"));
            }
        }
    }

    let defaults = &config.https_defaults;
    if defaults.client_certificate_mode != ClientCertificateMode::NoCertificate && defaults.client_ca_path.is_none() {
        errors.push(ValidationError::new(
            "https_defaults.client_ca_path",
            format!("required when client_certificate_mode is {}", defaults.client_certificate_mode),
        ));
    }

    for (name, endpoint) in &config.endpoints {
        validate_endpoint(name, endpoint, config, &mut errors);
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<std::net::SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_endpoint(name: &str, endpoint: &EndpointConfig, config: &ServerConfig, errors: &mut Vec<ValidationError>) {
    let field = |key: &str| format!("endpoints.{}.{}", name, key);

    if let Err(e) = parse_server_address(&endpoint.url) {
        errors.push(ValidationError::new(field("url"), e.to_string()));
        return;
    }

    if !endpoint.is_https() {
        let https_only = [
            ("certificate", endpoint.certificate.is_some()),
            ("sni", !endpoint.sni.is_empty()),
            ("client_certificate_mode", endpoint.client_certificate_mode.is_some()),
            ("client_ca_path", endpoint.client_ca_path.is_some()),
            ("ssl_protocols", endpoint.ssl_protocols.is_some()),
        ];
        for (key, set) in https_only {
            if set {
                errors.push(ValidationError::new(field(key), "only valid for https endpoints"));
            }
        }
        return;
    }

    let resolved = endpoint.with_https_defaults(&config.https_defaults);
    let endpoint_mode = resolved.client_certificate_mode.unwrap_or_default();
    let endpoint_ca = resolved.client_ca_path.is_some();

    if resolved.certificate.is_none() && endpoint.sni.is_empty() {
        errors.push(ValidationError::new(
            field("certificate"),
            "https endpoint has no certificate and https_defaults.certificate is unset",
        ));
    }
    if endpoint_mode != ClientCertificateMode::NoCertificate && !endpoint_ca {
        errors.push(ValidationError::new(
            field("client_ca_path"),
            format!("required when client_certificate_mode is {}", endpoint_mode),
        ));
    }

    for (pattern, sni) in &endpoint.sni {
        let sni_field = |key: &str| format!("endpoints.{}.sni.\"{}\".{}", name, pattern, key);
        if pattern.trim().is_empty() {
            errors.push(ValidationError::new(format!("endpoints.{}.sni", name), "server name must not be empty"));
            continue;
        }
        if sni.certificate.is_none() && resolved.certificate.is_none() {
            errors.push(ValidationError::new(sni_field("certificate"), "no certificate for this server name"));
        }
        let mode = sni.client_certificate_mode.unwrap_or(endpoint_mode);
        if mode != ClientCertificateMode::NoCertificate && sni.client_ca_path.is_none() && !endpoint_ca {
            errors.push(ValidationError::new(
                sni_field("client_ca_path"),
                format!("required when client_certificate_mode is {}", mode),
            ));
        }
    }
}
