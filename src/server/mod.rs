//! Server orchestration.
//!
//! # Responsibilities
//! - Turn configuration into listen options (protocols, SNI, TLS policy)
//! - Bind every endpoint through the address resolver and start its dispatcher
//! - Subscribe running certificates to the certificate path watcher
//! - Drive the heartbeat and the background reload loop
//! - Stop gracefully: unbind, drain, then abort what is left
//!
//! # Data Flow
//! ```text
//! ServerConfig
//!     → OptionsBuilder (endpoint configs + https defaults → ListenOptions)
//!     → binder::bind_all (strategy, localhost expansion)
//!     → bind_listener + ConnectionDispatcher per bound target
//!
//! certificate change token ─┐
//! config file watcher ──────┼→ reload(config) → diff → stop/rebind changed endpoints
//! SIGHUP (binary) ──────────┘
//! ```
//!
//! # Design Decisions
//! - Only named endpoints take part in reloads; address bindings (`urls`)
//!   are fixed for the lifetime of a start
//! - Unchanged endpoints keep their running options and certificate
//!   instances, so their watch subscriptions survive a reload untouched
//! - Every option a reload needs is built before anything is stopped
//! - A reload that fails to bind rebinds the listeners it stopped and keeps
//!   the previous configuration in force

pub mod reload;

use std::future::Future;
use std::mem;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rustls::crypto::CryptoProvider;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{ConfigError, EndpointConfig, HttpsDefaultsConfig, ServerConfig};
use crate::http::{Application, HttpConnectionHandler, HttpLimits, HttpProtocols, HyperProcessorFactory, ProcessorFactory};
use crate::lifecycle::{Heartbeat, Shutdown, ShutdownSignal};
use crate::net::address::{parse_server_address, AddressError};
use crate::net::binder::{bind_all, AddressBindContext, BindError, BindStrategy, HttpsUpgrade};
use crate::net::connection::{ConnectionEndReason, ConnectionRegistry};
use crate::net::dispatcher::{AcceptLoops, ConnectionDispatcher};
use crate::net::endpoint::ListenOptions;
use crate::net::listener::{bind_listener, ConnectionLimit};
use crate::tls::{
    CertificateConfig, CertificatePathWatcher, CertificateSelector, HttpsOptions, SniOptionsSelector, TlsHandshake,
    TlsSetupError,
};

pub use reload::{diff_endpoints, CertificateChanges, EndpointDiff};

/// Grace period for aborted connections to unwind after the shutdown timeout.
const ABORT_GRACE: Duration = Duration::from_secs(1);

/// Top-level server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("server is already running")]
    AlreadyStarted,

    #[error("server is not running")]
    NotStarted,

    #[error("endpoint {name}: invalid url")]
    Address {
        name: String,
        #[source]
        source: AddressError,
    },

    #[error(transparent)]
    Tls(#[from] TlsSetupError),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// What a reload did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    pub stopped: Vec<String>,
    pub started: Vec<String>,
}

/// Builder for [`Server`].
pub struct ServerBuilder {
    config: ServerConfig,
    factory: Option<Arc<dyn ProcessorFactory>>,
    certificate_selector: Option<CertificateSelector>,
    watcher: Option<CertificatePathWatcher>,
    config_updates: Option<mpsc::UnboundedReceiver<ServerConfig>>,
}

impl ServerBuilder {
    /// Serve requests with `application` on hyper.
    pub fn application(mut self, application: Arc<dyn Application>) -> Self {
        self.factory = Some(Arc::new(HyperProcessorFactory::new(application)));
        self
    }

    /// Serve requests with a custom processor factory.
    pub fn processor_factory(mut self, factory: Arc<dyn ProcessorFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Pick certificates at handshake time for entries without a static one.
    pub fn certificate_selector(mut self, selector: CertificateSelector) -> Self {
        self.certificate_selector = Some(selector);
        self
    }

    /// Replace the notify-backed certificate watcher.
    pub fn certificate_watcher(mut self, watcher: CertificatePathWatcher) -> Self {
        self.watcher = Some(watcher);
        self
    }

    /// Reload whenever a new configuration arrives on `updates`.
    pub fn config_updates(mut self, updates: mpsc::UnboundedReceiver<ServerConfig>) -> Self {
        self.config_updates = Some(updates);
        self
    }

    pub fn build(self) -> Server {
        let config = self.config.detached();
        let watcher = self
            .watcher
            .unwrap_or_else(|| CertificatePathWatcher::with_notify(config.server.content_root.clone()));
        let factory = self
            .factory
            .unwrap_or_else(|| Arc::new(HyperProcessorFactory::new(Arc::new(crate::http::ConnectionInfoApplication))));

        Server {
            inner: Arc::new(ServerInner {
                factory,
                registry: Arc::new(ConnectionRegistry::new()),
                watcher,
                provider: crate::tls::crypto_provider(),
                certificate_selector: self.certificate_selector,
                state: tokio::sync::Mutex::new(ServerState {
                    config,
                    running: false,
                    uses_endpoints: false,
                    endpoints: Vec::new(),
                    bound_addresses: Vec::new(),
                    heartbeat: None,
                    background: None,
                    config_updates: self.config_updates,
                }),
            }),
        }
    }
}

/// A configured set of listening endpoints.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    factory: Arc<dyn ProcessorFactory>,
    registry: Arc<ConnectionRegistry>,
    watcher: CertificatePathWatcher,
    provider: Arc<CryptoProvider>,
    certificate_selector: Option<CertificateSelector>,
    state: tokio::sync::Mutex<ServerState>,
}

struct ServerState {
    config: ServerConfig,
    running: bool,
    /// Whether named endpoints (rather than addresses) were bound.
    uses_endpoints: bool,
    endpoints: Vec<RunningEndpoint>,
    bound_addresses: Vec<String>,
    heartbeat: Option<Heartbeat>,
    background: Option<(Shutdown, JoinHandle<()>)>,
    config_updates: Option<mpsc::UnboundedReceiver<ServerConfig>>,
}

/// One bound listener and its accept loops.
struct RunningEndpoint {
    options: ListenOptions,
    loops: AcceptLoops,
}

impl RunningEndpoint {
    fn certificates(&self) -> Vec<Arc<CertificateConfig>> {
        self.options
            .config
            .as_ref()
            .map(EndpointConfig::certificates)
            .unwrap_or_default()
    }
}

fn certificates_of<'a>(endpoints: impl IntoIterator<Item = &'a RunningEndpoint>) -> Vec<Arc<CertificateConfig>> {
    endpoints.into_iter().flat_map(RunningEndpoint::certificates).collect()
}

/// Per-listener settings taken from one configuration snapshot.
#[derive(Clone)]
struct BindSettings {
    limits: HttpLimits,
    max_accepts: Option<usize>,
    max_connections: Option<usize>,
}

impl BindSettings {
    fn from_config(config: &ServerConfig) -> Self {
        Self {
            limits: config.limits.http_limits(),
            max_accepts: config.server.max_accepts,
            max_connections: config.server.max_concurrent_connections,
        }
    }
}

impl Server {
    pub fn builder(config: ServerConfig) -> ServerBuilder {
        ServerBuilder {
            config,
            factory: None,
            certificate_selector: None,
            watcher: None,
            config_updates: None,
        }
    }

    pub fn new(config: ServerConfig, application: Arc<dyn Application>) -> Self {
        Self::builder(config).application(application).build()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.inner.registry
    }

    pub fn certificate_watcher(&self) -> &CertificatePathWatcher {
        &self.inner.watcher
    }

    /// Display urls of every bound listener, with OS-assigned ports filled in.
    pub async fn listener_urls(&self) -> Vec<String> {
        let state = self.inner.state.lock().await;
        state.endpoints.iter().map(|e| e.options.url()).collect()
    }

    /// Addresses as reported by the address resolver (`localhost` kept as is).
    pub async fn bound_addresses(&self) -> Vec<String> {
        self.inner.state.lock().await.bound_addresses.clone()
    }

    /// Bound listeners of one named endpoint.
    pub async fn endpoint_urls(&self, name: &str) -> Vec<String> {
        let state = self.inner.state.lock().await;
        state
            .endpoints
            .iter()
            .filter(|e| e.options.name.as_deref() == Some(name))
            .map(|e| e.options.url())
            .collect()
    }

    pub async fn is_running(&self) -> bool {
        self.inner.state.lock().await.running
    }

    /// Bind everything the configuration names and start accepting.
    pub async fn start(&self) -> Result<(), ServerError> {
        self.start_until(std::future::pending()).await
    }

    /// Like [`Server::start`], but gives up with [`BindError::Cancelled`] once
    /// `cancel` completes. Listeners bound so far are released.
    pub async fn start_until<C>(&self, cancel: C) -> Result<(), ServerError>
    where
        C: Future<Output = ()>,
    {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        if state.running {
            return Err(ServerError::AlreadyStarted);
        }

        let config = state.config.clone();
        let builder = inner.options_builder(&config);
        let mut context = AddressBindContext::new(builder.https_upgrade());
        context.addresses = config.server.urls.clone();
        context.prefer_addresses = config.server.prefer_host_urls;
        for (name, endpoint) in &config.endpoints {
            let resolved = endpoint.with_https_defaults(&config.https_defaults);
            context.endpoints.push(builder.endpoint(name, &resolved)?);
        }
        let strategy = context.strategy();

        let (started, result) = inner
            .bind_pass(&mut context, &BindSettings::from_config(&config), cancel)
            .await;
        if let Err(err) = result {
            for endpoint in &started {
                endpoint.loops.stop().await;
            }
            return Err(err.into());
        }

        inner.watcher.update_watches(&[], &certificates_of(&started));

        let shutdown = Shutdown::new();
        let task = spawn_reload_loop(Arc::clone(inner), state.config_updates.take(), shutdown.subscribe());
        state.background = Some((shutdown, task));
        state.heartbeat = Some(Heartbeat::start(
            Arc::clone(&inner.registry),
            config.server.heartbeat_interval(),
        ));
        state.uses_endpoints = matches!(strategy, BindStrategy::Endpoints | BindStrategy::OverrideWithEndpoints);
        state.endpoints = started;
        state.bound_addresses = context.bound_addresses;
        state.running = true;

        tracing::info!(
            addresses = %state.bound_addresses.join(", "),
            listeners = state.endpoints.len(),
            "Server started"
        );
        Ok(())
    }

    /// Apply a new configuration to the running server.
    pub async fn reload(&self, config: ServerConfig) -> Result<ReloadSummary, ServerError> {
        self.inner.reload(config, std::future::pending()).await
    }

    /// Like [`Server::reload`], but stops binding once `cancel` completes.
    /// A cancelled reload restores the endpoints it stopped.
    pub async fn reload_until<C>(&self, config: ServerConfig, cancel: C) -> Result<ReloadSummary, ServerError>
    where
        C: Future<Output = ()>,
    {
        self.inner.reload(config, cancel).await
    }

    /// Stop accepting, ask every connection to finish, and abort whatever is
    /// still open after `timeout`. Returns true if everything drained in time.
    pub async fn stop(&self, timeout: Duration) -> Result<bool, ServerError> {
        let inner = &self.inner;
        let (endpoints, heartbeat, background) = {
            let mut state = inner.state.lock().await;
            if !state.running {
                return Err(ServerError::NotStarted);
            }
            state.running = false;
            state.bound_addresses.clear();
            (
                mem::take(&mut state.endpoints),
                state.heartbeat.take(),
                state.background.take(),
            )
        };

        if let Some((shutdown, task)) = background {
            shutdown.trigger();
            let _ = task.await;
        }

        for endpoint in &endpoints {
            endpoint.loops.stop().await;
        }

        let requested = inner.registry.request_shutdown_all();
        tracing::info!(connections = requested, timeout_secs = timeout.as_secs_f64(), "Draining connections");

        let drained = inner.registry.wait_for_drain(timeout).await;
        if !drained {
            let aborted = inner.registry.abort_all(ConnectionEndReason::AppShutdownTimeout);
            tracing::warn!(aborted, "Shutdown timeout elapsed, aborting remaining connections");
            inner.registry.wait_for_drain(ABORT_GRACE).await;
        }

        if let Some(heartbeat) = heartbeat {
            heartbeat.stop().await;
        }
        inner.watcher.update_watches(&certificates_of(&endpoints), &[]);

        tracing::info!(drained, "Server stopped");
        Ok(drained)
    }
}

impl ServerInner {
    fn options_builder(&self, config: &ServerConfig) -> OptionsBuilder {
        OptionsBuilder {
            https_defaults: config.https_defaults.clone(),
            content_root: config.server.content_root.clone(),
            handshake_timeout: config.limits.handshake_timeout(),
            provider: Arc::clone(&self.provider),
            certificate_selector: self.certificate_selector.clone(),
        }
    }

    /// Bind one concrete endpoint and start its accept loops.
    async fn bind_endpoint(&self, options: ListenOptions, settings: &BindSettings) -> std::io::Result<RunningEndpoint> {
        let listener = bind_listener(&options.target).await?;
        let bound = options.with_target(listener.local_target());

        let handler = HttpConnectionHandler::new(
            Arc::clone(&self.factory),
            settings.limits.clone(),
            bound.protocols,
            bound.tls.clone(),
        );
        let dispatcher = ConnectionDispatcher::new(Arc::clone(&self.registry), Arc::new(handler))
            .with_max_accepts(settings.max_accepts)
            .with_connection_limit(settings.max_connections.map(ConnectionLimit::new));
        let loops = dispatcher.start(listener, &bound.url());

        Ok(RunningEndpoint { options: bound, loops })
    }

    /// Run the address resolver over `context`. Endpoints that bound before
    /// a failure are returned alongside the error.
    async fn bind_pass<C>(
        &self,
        context: &mut AddressBindContext,
        settings: &BindSettings,
        cancel: C,
    ) -> (Vec<RunningEndpoint>, Result<(), BindError>)
    where
        C: Future<Output = ()>,
    {
        let started = Mutex::new(Vec::new());
        let result = {
            let started = &started;
            bind_all(
                context,
                move |options| async move {
                    let endpoint = self.bind_endpoint(options, settings).await?;
                    let bound = endpoint.options.clone();
                    started.lock().unwrap_or_else(PoisonError::into_inner).push(endpoint);
                    Ok(bound)
                },
                cancel,
            )
            .await
        };
        (started.into_inner().unwrap_or_else(PoisonError::into_inner), result)
    }

    /// Rebind listeners a failed reload stopped. Certificates of listeners
    /// that cannot come back are no longer watched.
    async fn restore(&self, previous: Vec<ListenOptions>, settings: &BindSettings) -> Vec<RunningEndpoint> {
        let mut restored = Vec::with_capacity(previous.len());
        let mut lost = Vec::new();
        for options in previous {
            let address = options.url();
            let certificates = options.config.as_ref().map(EndpointConfig::certificates).unwrap_or_default();
            match self.bind_endpoint(options, settings).await {
                Ok(endpoint) => restored.push(endpoint),
                Err(err) => {
                    tracing::error!(address = %address, error = %err, "Failed to restore endpoint");
                    lost.extend(certificates);
                }
            }
        }
        self.watcher.update_watches(&lost, &[]);
        restored
    }

    async fn reload<C>(&self, config: ServerConfig, cancel: C) -> Result<ReloadSummary, ServerError>
    where
        C: Future<Output = ()>,
    {
        let config = config.detached();
        let mut state = self.state.lock().await;

        if !state.running {
            state.config = config;
            return Ok(ReloadSummary::default());
        }

        for endpoint in state.endpoints.iter().filter(|e| e.options.name.is_none()) {
            if endpoint.certificates().iter().any(|c| c.file_has_changed()) {
                tracing::warn!(
                    address = %endpoint.options.url(),
                    "Certificate changed for an address binding; restart to apply it"
                );
            }
        }

        if !state.uses_endpoints {
            tracing::info!("Addresses are bound instead of named endpoints, endpoint changes are not applied");
            state.config = config;
            return Ok(ReloadSummary::default());
        }

        let running: std::collections::BTreeMap<String, EndpointConfig> = state
            .endpoints
            .iter()
            .filter_map(|e| Some((e.options.name.clone()?, e.options.config.clone()?)))
            .collect();
        let desired: std::collections::BTreeMap<String, EndpointConfig> = config
            .endpoints
            .iter()
            .map(|(name, endpoint)| (name.clone(), endpoint.with_https_defaults(&config.https_defaults)))
            .collect();

        let diff = diff_endpoints(&running, &desired);
        if diff.is_empty() {
            tracing::debug!(endpoints = diff.unchanged.len(), "Reload found no endpoint changes");
            state.config = config;
            return Ok(ReloadSummary::default());
        }

        let builder = self.options_builder(&config);
        let mut pending = Vec::new();
        for name in diff.to_start() {
            match builder.endpoint(name, &desired[name]) {
                Ok(options) => pending.push(options),
                Err(err) => {
                    tracing::error!(endpoint = %name, error = %err, "Reload rejected, keeping the current endpoints");
                    return Err(err);
                }
            }
        }

        let to_stop: Vec<&String> = diff.to_stop().collect();
        let (stopping, kept): (Vec<RunningEndpoint>, Vec<RunningEndpoint>) = mem::take(&mut state.endpoints)
            .into_iter()
            .partition(|e| e.options.name.as_ref().is_some_and(|name| to_stop.contains(&name)));

        for endpoint in &stopping {
            endpoint.loops.stop().await;
            let asked = self.registry.request_shutdown_endpoint(endpoint.loops.endpoint());
            tracing::info!(
                endpoint = ?endpoint.options.name,
                address = %endpoint.options.url(),
                connections = asked,
                "Stopped endpoint"
            );
        }
        let removed_certificates = certificates_of(&stopping);
        let previous: Vec<ListenOptions> = stopping.iter().map(|e| e.options.clone()).collect();
        // The sockets close here, before anything rebinds their ports.
        drop(stopping);

        let mut started = Vec::new();
        if !pending.is_empty() {
            let mut context = AddressBindContext::new(builder.https_upgrade());
            context.endpoints = pending;
            let (bound, result) = self
                .bind_pass(&mut context, &BindSettings::from_config(&config), cancel)
                .await;
            if let Err(err) = result {
                for endpoint in &bound {
                    endpoint.loops.stop().await;
                    self.registry.request_shutdown_endpoint(endpoint.loops.endpoint());
                }
                drop(bound);

                let restored = self.restore(previous, &BindSettings::from_config(&state.config)).await;
                tracing::error!(
                    error = %err,
                    restored = restored.len(),
                    "Failed to bind reloaded endpoints, keeping the previous configuration"
                );
                state.endpoints = kept;
                state.endpoints.extend(restored);
                return Err(err.into());
            }
            started = bound;
        }

        self.watcher.update_watches(&removed_certificates, &certificates_of(&started));

        let summary = ReloadSummary {
            stopped: to_stop.into_iter().cloned().collect(),
            started: started.iter().filter_map(|e| e.options.name.clone()).collect(),
        };
        state.endpoints = kept;
        state.endpoints.extend(started);
        state.config = config;

        tracing::info!(stopped = ?summary.stopped, started = ?summary.started, "Configuration reloaded");
        Ok(summary)
    }
}

fn spawn_reload_loop(
    inner: Arc<ServerInner>,
    mut updates: Option<mpsc::UnboundedReceiver<ServerConfig>>,
    mut shutdown: ShutdownSignal,
) -> JoinHandle<()> {
    let mut changes = CertificateChanges::new(inner.watcher.clone());
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = changes.next() => {
                    tracing::info!("Certificate change detected, reloading endpoints");
                    let config = inner.state.lock().await.config.clone();
                    if let Err(err) = inner.reload(config, std::future::pending()).await {
                        tracing::error!(error = %err, "Certificate reload failed");
                    }
                }
                update = next_update(&mut updates) => match update {
                    Some(config) => {
                        if let Err(err) = inner.reload(config, std::future::pending()).await {
                            tracing::error!(error = %err, "Configuration reload failed");
                        }
                    }
                    None => updates = None,
                },
            }
        }
        tracing::debug!("Reload loop stopped");
    })
}

async fn next_update(updates: &mut Option<mpsc::UnboundedReceiver<ServerConfig>>) -> Option<ServerConfig> {
    match updates {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Builds listen options from one configuration snapshot.
#[derive(Clone)]
struct OptionsBuilder {
    https_defaults: HttpsDefaultsConfig,
    content_root: PathBuf,
    handshake_timeout: Duration,
    provider: Arc<CryptoProvider>,
    certificate_selector: Option<CertificateSelector>,
}

impl OptionsBuilder {
    /// Options for a named endpoint whose config already has defaults applied.
    fn endpoint(&self, name: &str, config: &EndpointConfig) -> Result<ListenOptions, ServerError> {
        let address = parse_server_address(&config.url).map_err(|source| ServerError::Address {
            name: name.to_string(),
            source,
        })?;
        let protocols = config.protocols.unwrap_or(HttpProtocols::HTTP1_AND_HTTP2);
        let tls = if address.is_https() {
            Some(Arc::new(self.tls(&config.url, config, protocols)?))
        } else {
            None
        };

        Ok(ListenOptions {
            name: Some(name.to_string()),
            target: address.target,
            protocols,
            tls,
            config: Some(config.clone()),
        })
    }

    /// Attach the default HTTPS policy to an endpoint parsed from an address.
    fn https_address(&self, options: ListenOptions) -> Result<ListenOptions, TlsSetupError> {
        let config = EndpointConfig {
            url: format!("https://{}", options.target),
            protocols: Some(options.protocols),
            ..EndpointConfig::default()
        }
        .with_https_defaults(&self.https_defaults);
        let tls = self.tls(&config.url, &config, options.protocols)?;

        Ok(ListenOptions {
            tls: Some(Arc::new(tls)),
            config: Some(config),
            ..options
        })
    }

    fn https_upgrade(&self) -> HttpsUpgrade {
        let builder = self.clone();
        Arc::new(move |options| builder.https_address(options).map_err(Into::into))
    }

    fn tls(&self, url: &str, config: &EndpointConfig, protocols: HttpProtocols) -> Result<TlsHandshake, TlsSetupError> {
        let https = HttpsOptions {
            certificate: config.certificate.clone(),
            certificate_selector: self.certificate_selector.clone(),
            protocols,
            ssl_protocols: config.ssl_protocols.clone().unwrap_or_default(),
            client_certificate_mode: config.client_certificate_mode.unwrap_or_default(),
            client_ca_path: config.client_ca_path.clone(),
            handshake_timeout: self.handshake_timeout,
        };
        let selector =
            SniOptionsSelector::build(url, &https, &config.sni, &self.content_root, Arc::clone(&self.provider))?;
        Ok(TlsHandshake::new(selector, https.handshake_timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::tls::certificate::test_support::write_self_signed;

    fn server(toml_text: &str) -> Server {
        Server::builder(parse_config(toml_text).unwrap()).build()
    }

    #[tokio::test]
    async fn start_binds_named_endpoints_with_assigned_ports() {
        let server = server(
            r#"
            [endpoints.a]
            url = "http://127.0.0.1:0"
            [endpoints.b]
            url = "http://127.0.0.1:0"
            "#,
        );
        server.start().await.unwrap();
        let urls = server.listener_urls().await;
        assert_eq!(urls.len(), 2);
        assert!(urls.iter().all(|u| u.starts_with("http://127.0.0.1:") && !u.ends_with(":0")));
        assert!(matches!(server.start().await, Err(ServerError::AlreadyStarted)));
        assert!(server.stop(Duration::from_secs(1)).await.unwrap());
        assert!(matches!(server.stop(Duration::from_secs(1)).await, Err(ServerError::NotStarted)));
    }

    #[tokio::test]
    async fn https_address_without_default_certificate_fails() {
        let server = server("[server]\nurls = [\"https://127.0.0.1:0\"]\n");
        match server.start().await {
            Err(ServerError::Bind(BindError::Https { .. })) => {}
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        assert!(!server.is_running().await);
    }

    #[tokio::test]
    async fn failed_start_releases_earlier_listeners() {
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = blocker.local_addr().unwrap().port();
        let server = server(&format!(
            "[endpoints.a]\nurl = \"http://127.0.0.1:0\"\n[endpoints.b]\nurl = \"http://127.0.0.1:{}\"\n",
            taken
        ));

        let err = server.start().await.unwrap_err();
        assert!(matches!(err, ServerError::Bind(BindError::AddressInUse { .. })));
        assert!(server.listener_urls().await.is_empty());
    }

    #[tokio::test]
    async fn reload_rebinds_only_changed_endpoints() {
        let server = server(
            r#"
            [endpoints.keep]
            url = "http://127.0.0.1:0"
            [endpoints.drop]
            url = "http://127.0.0.1:0"
            "#,
        );
        server.start().await.unwrap();
        let kept_before = server.endpoint_urls("keep").await;

        let next = parse_config(
            r#"
            [endpoints.keep]
            url = "http://127.0.0.1:0"
            [endpoints.added]
            url = "http://127.0.0.1:0"
            "#,
        )
        .unwrap();
        let summary = server.reload(next).await.unwrap();
        assert_eq!(summary.stopped, vec!["drop".to_string()]);
        assert_eq!(summary.started, vec!["added".to_string()]);
        assert_eq!(server.endpoint_urls("keep").await, kept_before);
        assert!(server.endpoint_urls("drop").await.is_empty());
        assert_eq!(server.endpoint_urls("added").await.len(), 1);

        server.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn invalid_reload_keeps_current_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let server = server("[endpoints.a]\nurl = \"http://127.0.0.1:0\"\n");
        server.start().await.unwrap();
        let before = server.listener_urls().await;

        let mut next = parse_config("[endpoints.a]\nurl = \"http://127.0.0.1:0\"\n").unwrap();
        next.endpoints.insert(
            "secure".to_string(),
            EndpointConfig {
                url: "https://127.0.0.1:0".to_string(),
                certificate: Some(Arc::new(CertificateConfig::from_files(dir.path().join("missing.pem"), None))),
                ..EndpointConfig::default()
            },
        );
        assert!(matches!(server.reload(next).await, Err(ServerError::Tls(_))));
        assert_eq!(server.listener_urls().await, before);

        server.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn failed_rebind_restores_the_stopped_endpoint() {
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = blocker.local_addr().unwrap().port();
        let original = "[endpoints.a]\nurl = \"http://127.0.0.1:0\"\n";
        let server = server(original);
        server.start().await.unwrap();
        let before = server.endpoint_urls("a").await;

        let moved = parse_config(&format!("[endpoints.a]\nurl = \"http://127.0.0.1:{}\"\n", taken)).unwrap();
        let err = server.reload(moved).await.unwrap_err();
        assert!(matches!(err, ServerError::Bind(BindError::AddressInUse { .. })));
        assert_eq!(server.endpoint_urls("a").await, before);

        // The running configuration is still the original one.
        let summary = server.reload(parse_config(original).unwrap()).await.unwrap();
        assert_eq!(summary, ReloadSummary::default());

        server.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_start_binds_nothing() {
        let server = server("[endpoints.a]\nurl = \"http://127.0.0.1:0\"\n");
        let err = server.start_until(async {}).await.unwrap_err();
        assert!(matches!(err, ServerError::Bind(BindError::Cancelled)));
        assert!(!server.is_running().await);
        assert!(server.listener_urls().await.is_empty());
    }

    #[tokio::test]
    async fn cancelled_reload_keeps_the_running_endpoints() {
        let original = "[endpoints.a]\nurl = \"http://127.0.0.1:0\"\n";
        let server = server(original);
        server.start().await.unwrap();
        let before = server.endpoint_urls("a").await;

        let next = parse_config("[endpoints.a]\nurl = \"http://127.0.0.1:0\"\n[endpoints.b]\nurl = \"http://127.0.0.1:0\"\n")
            .unwrap();
        let err = server.reload_until(next, async {}).await.unwrap_err();
        assert!(matches!(err, ServerError::Bind(BindError::Cancelled)));
        assert_eq!(server.endpoint_urls("a").await, before);
        assert!(server.endpoint_urls("b").await.is_empty());

        let summary = server.reload(parse_config(original).unwrap()).await.unwrap();
        assert_eq!(summary, ReloadSummary::default());

        server.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn certificates_are_watched_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = write_self_signed(dir.path(), "server", &["localhost"]);
        let config = format!(
            "[server]\ncontent_root = {:?}\n[endpoints.secure]\nurl = \"https://127.0.0.1:0\"\ncertificate = {{ path = \"server.pem\", key_path = \"server.key\" }}\n",
            dir.path()
        );
        let server = server(&config);
        server.start().await.unwrap();
        assert_eq!(server.certificate_watcher().subscriber_count(&cert), 1);
        assert_eq!(server.certificate_watcher().subscriber_count(&key), 1);

        server.stop(Duration::from_secs(1)).await.unwrap();
        assert!(!server.certificate_watcher().is_watching(&cert));
    }
}
