//! Address resolution and endpoint binding.
//!
//! # Responsibilities
//! - Pick a binding strategy from (endpoints?, addresses?, prefer addresses?)
//! - Resolve address strings into listen options before any bind attempt
//! - Bind every endpoint through a caller-supplied async callback
//! - Translate address-in-use failures into a descriptive error
//!
//! # Design Decisions
//! - The caller's output collections are cleared and repopulated on every
//!   call, so binding is idempotent across reloads
//! - Any single bind failure aborts the whole call; there is no partial retry
//! - `localhost` binds IPv4 and IPv6 loopback separately and tolerates one
//!   family being unavailable

use std::future::Future;
use std::io;
use std::sync::Arc;

use crate::net::address::{parse_server_address, AddressError};
use crate::net::endpoint::{ListenOptions, ListenTarget};
use crate::observability::metrics;

/// Address bound when nothing else is configured.
pub const DEFAULT_SERVER_ADDRESS: &str = "http://localhost:5000";

/// Attaches the default HTTPS policy to an endpoint parsed from an `https://` address.
pub type HttpsUpgrade =
    Arc<dyn Fn(ListenOptions) -> Result<ListenOptions, Box<dyn std::error::Error + Send + Sync>> + Send + Sync>;

/// Errors from resolving or binding endpoints.
#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error(transparent)]
    Address(#[from] AddressError),

    #[error("failed to bind to address {address}: address already in use")]
    AddressInUse {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind to address {address}")]
    Io {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind to address {address}: neither IPv4 nor IPv6 loopback could be bound (ipv4: {ipv4}, ipv6: {ipv6})")]
    LocalhostUnavailable {
        address: String,
        ipv4: io::Error,
        ipv6: io::Error,
    },

    #[error("unable to configure HTTPS endpoint {address}")]
    Https {
        address: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("endpoint binding was cancelled")]
    Cancelled,
}

/// How the configured endpoints and addresses are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindStrategy {
    /// Nothing configured: bind [`DEFAULT_SERVER_ADDRESS`].
    Default,
    /// Only endpoints configured.
    Endpoints,
    /// Only addresses configured.
    Addresses,
    /// Both configured, addresses preferred: endpoints are ignored.
    OverrideWithAddresses,
    /// Both configured, no preference: addresses are ignored.
    OverrideWithEndpoints,
}

impl BindStrategy {
    pub fn choose(has_endpoints: bool, has_addresses: bool, prefer_addresses: bool) -> Self {
        if prefer_addresses && has_addresses {
            if has_endpoints {
                BindStrategy::OverrideWithAddresses
            } else {
                BindStrategy::Addresses
            }
        } else if has_endpoints {
            if has_addresses {
                BindStrategy::OverrideWithEndpoints
            } else {
                BindStrategy::Endpoints
            }
        } else if has_addresses {
            BindStrategy::Addresses
        } else {
            BindStrategy::Default
        }
    }
}

/// Inputs and outputs of one binding pass.
pub struct AddressBindContext {
    /// Endpoints configured by name or programmatically.
    pub endpoints: Vec<ListenOptions>,
    /// Raw address strings.
    pub addresses: Vec<String>,
    pub prefer_addresses: bool,
    pub https_upgrade: HttpsUpgrade,

    /// Display urls of everything bound, for diagnostics.
    pub bound_addresses: Vec<String>,
    /// Every endpoint that bound successfully, for later teardown.
    pub bound_endpoints: Vec<ListenOptions>,
}

impl AddressBindContext {
    pub fn new(https_upgrade: HttpsUpgrade) -> Self {
        Self {
            endpoints: Vec::new(),
            addresses: Vec::new(),
            prefer_addresses: false,
            https_upgrade,
            bound_addresses: Vec::new(),
            bound_endpoints: Vec::new(),
        }
    }

    pub fn strategy(&self) -> BindStrategy {
        BindStrategy::choose(
            !self.endpoints.is_empty(),
            !self.addresses.is_empty(),
            self.prefer_addresses,
        )
    }
}

/// Resolve the context's endpoints and bind them all.
///
/// `bind` receives each concrete endpoint and returns it as actually bound
/// (e.g. with an OS-assigned port). `cancel` aborts the whole pass.
pub async fn bind_all<F, Fut, C>(
    context: &mut AddressBindContext,
    mut bind: F,
    cancel: C,
) -> Result<(), BindError>
where
    F: FnMut(ListenOptions) -> Fut,
    Fut: Future<Output = io::Result<ListenOptions>>,
    C: Future<Output = ()>,
{
    context.bound_addresses.clear();
    context.bound_endpoints.clear();

    let pending = resolve(context)?;

    let work = async {
        for options in pending {
            bind_endpoint(options, &mut bind, context).await?;
        }
        Ok::<(), BindError>(())
    };

    // Cancellation is checked before every step of the work.
    tokio::select! {
        biased;
        _ = cancel => {
            tracing::warn!("Endpoint binding cancelled");
            Err(BindError::Cancelled)
        }
        result = work => result,
    }
}

/// Turn the context into the list of endpoints to bind, applying the strategy.
fn resolve(context: &AddressBindContext) -> Result<Vec<ListenOptions>, BindError> {
    let strategy = context.strategy();
    match strategy {
        BindStrategy::Default => {
            tracing::debug!(
                address = DEFAULT_SERVER_ADDRESS,
                "No listening endpoints were configured, binding to the default address"
            );
            resolve_addresses(&[DEFAULT_SERVER_ADDRESS.to_string()], &context.https_upgrade)
        }
        BindStrategy::OverrideWithAddresses => {
            tracing::warn!(
                addresses = %context.addresses.join(", "),
                "Overriding configured endpoints because addresses are preferred"
            );
            resolve_addresses(&context.addresses, &context.https_upgrade)
        }
        BindStrategy::OverrideWithEndpoints => {
            tracing::warn!(
                addresses = %context.addresses.join(", "),
                "Ignoring addresses, binding to configured endpoints instead"
            );
            Ok(context.endpoints.clone())
        }
        BindStrategy::Endpoints => Ok(context.endpoints.clone()),
        BindStrategy::Addresses => resolve_addresses(&context.addresses, &context.https_upgrade),
    }
}

fn resolve_addresses(addresses: &[String], https_upgrade: &HttpsUpgrade) -> Result<Vec<ListenOptions>, BindError> {
    addresses
        .iter()
        .map(|address| {
            let parsed = parse_server_address(address)?;
            let https = parsed.is_https();
            let options = ListenOptions::new(parsed.target);
            if https {
                https_upgrade(options).map_err(|source| BindError::Https {
                    address: address.clone(),
                    source,
                })
            } else {
                Ok(options)
            }
        })
        .collect()
}

async fn bind_endpoint<F, Fut>(
    options: ListenOptions,
    bind: &mut F,
    context: &mut AddressBindContext,
) -> Result<(), BindError>
where
    F: FnMut(ListenOptions) -> Fut,
    Fut: Future<Output = io::Result<ListenOptions>>,
{
    if let ListenTarget::Localhost(port) = options.target {
        return bind_localhost(options, port, bind, context).await;
    }

    let address = options.url();
    match bind(options).await {
        Ok(bound) => {
            record_bound(context, bound.url(), bound);
            Ok(())
        }
        Err(source) => {
            metrics::record_bind(false);
            Err(translate_bind_error(address, source))
        }
    }
}

async fn bind_localhost<F, Fut>(
    options: ListenOptions,
    port: u16,
    bind: &mut F,
    context: &mut AddressBindContext,
) -> Result<(), BindError>
where
    F: FnMut(ListenOptions) -> Fut,
    Fut: Future<Output = io::Result<ListenOptions>>,
{
    let address = options.url();
    let [v4, v6] = ListenTarget::loopback_pair(port);
    let mut failures = Vec::with_capacity(2);

    for addr in [v4, v6] {
        match bind(options.with_target(ListenTarget::Ip(addr))).await {
            Ok(bound) => {
                context.bound_endpoints.push(bound);
                metrics::record_bind(true);
            }
            Err(source) if source.kind() == io::ErrorKind::AddrInUse => {
                metrics::record_bind(false);
                return Err(BindError::AddressInUse { address, source });
            }
            Err(source) => {
                tracing::warn!(
                    address = %address,
                    loopback = %addr,
                    error = %source,
                    "Unable to bind to loopback interface"
                );
                failures.push(source);
            }
        }
    }

    if failures.len() == 2 {
        metrics::record_bind(false);
        let ipv6 = failures.pop().unwrap_or_else(|| io::Error::other("ipv6 loopback unavailable"));
        let ipv4 = failures.pop().unwrap_or_else(|| io::Error::other("ipv4 loopback unavailable"));
        return Err(BindError::LocalhostUnavailable { address, ipv4, ipv6 });
    }

    tracing::info!(address = %address, "Now listening");
    context.bound_addresses.push(address);
    Ok(())
}

fn record_bound(context: &mut AddressBindContext, address: String, bound: ListenOptions) {
    tracing::info!(address = %address, "Now listening");
    metrics::record_bind(true);
    context.bound_addresses.push(address);
    context.bound_endpoints.push(bound);
}

fn translate_bind_error(address: String, source: io::Error) -> BindError {
    if source.kind() == io::ErrorKind::AddrInUse {
        BindError::AddressInUse { address, source }
    } else {
        BindError::Io { address, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Mutex;

    fn no_https() -> HttpsUpgrade {
        Arc::new(|_| Err("no default certificate".into()))
    }

    fn context(endpoints: &[&str], addresses: &[&str], prefer: bool) -> AddressBindContext {
        let mut ctx = AddressBindContext::new(no_https());
        ctx.endpoints = endpoints
            .iter()
            .map(|a| ListenOptions::new(ListenTarget::Ip(a.parse().unwrap())))
            .collect();
        ctx.addresses = addresses.iter().map(|a| a.to_string()).collect();
        ctx.prefer_addresses = prefer;
        ctx
    }

    #[test]
    fn strategy_table() {
        use BindStrategy::*;
        let cases = [
            ((false, false, false), Default),
            ((false, false, true), Default),
            ((true, false, false), Endpoints),
            ((true, false, true), Endpoints),
            ((false, true, false), Addresses),
            ((false, true, true), Addresses),
            ((true, true, false), OverrideWithEndpoints),
            ((true, true, true), OverrideWithAddresses),
        ];
        for ((endpoints, addresses, prefer), expected) in cases {
            assert_eq!(
                BindStrategy::choose(endpoints, addresses, prefer),
                expected,
                "endpoints={} addresses={} prefer={}",
                endpoints,
                addresses,
                prefer
            );
        }
    }

    async fn bind_recording(ctx: &mut AddressBindContext) -> (Result<(), BindError>, Vec<ListenTarget>) {
        let seen = Mutex::new(Vec::new());
        let result = bind_all(
            ctx,
            |options: ListenOptions| {
                seen.lock().unwrap().push(options.target.clone());
                async move { Ok(options) }
            },
            std::future::pending(),
        )
        .await;
        (result, seen.into_inner().unwrap())
    }

    #[tokio::test]
    async fn prefer_addresses_overrides_endpoints() {
        let mut ctx = context(&["127.0.0.1:7000"], &["http://127.0.0.1:7001"], true);
        let (result, seen) = bind_recording(&mut ctx).await;
        result.unwrap();
        assert_eq!(seen, vec![ListenTarget::Ip("127.0.0.1:7001".parse().unwrap())]);
        assert_eq!(ctx.bound_addresses, vec!["http://127.0.0.1:7001".to_string()]);
    }

    #[tokio::test]
    async fn endpoints_win_without_preference() {
        let mut ctx = context(&["127.0.0.1:7000"], &["http://127.0.0.1:7001"], false);
        let (result, seen) = bind_recording(&mut ctx).await;
        result.unwrap();
        assert_eq!(seen, vec![ListenTarget::Ip("127.0.0.1:7000".parse().unwrap())]);
    }

    #[tokio::test]
    async fn default_binds_both_loopbacks() {
        let mut ctx = context(&[], &[], false);
        let (result, seen) = bind_recording(&mut ctx).await;
        result.unwrap();
        let expected: Vec<ListenTarget> = ListenTarget::loopback_pair(5000).into_iter().map(ListenTarget::Ip).collect();
        assert_eq!(seen, expected);
        assert_eq!(ctx.bound_addresses, vec![DEFAULT_SERVER_ADDRESS.to_string()]);
        assert_eq!(ctx.bound_endpoints.len(), 2);
    }

    #[tokio::test]
    async fn outputs_are_repopulated_on_every_call() {
        let mut ctx = context(&["127.0.0.1:7000"], &[], false);
        bind_recording(&mut ctx).await.0.unwrap();
        bind_recording(&mut ctx).await.0.unwrap();
        assert_eq!(ctx.bound_endpoints.len(), 1);
        assert_eq!(ctx.bound_addresses.len(), 1);
    }

    #[tokio::test]
    async fn address_errors_stop_before_any_bind() {
        let mut ctx = context(&[], &["http://127.0.0.1:7001", "ftp://127.0.0.1:7002"], false);
        let (result, seen) = bind_recording(&mut ctx).await;
        assert!(matches!(result, Err(BindError::Address(AddressError::UnsupportedScheme(_)))));
        assert!(seen.is_empty());
    }

    #[tokio::test]
    async fn https_address_requires_upgrade() {
        let mut ctx = context(&[], &["https://127.0.0.1:7443"], false);
        let (result, seen) = bind_recording(&mut ctx).await;
        assert!(matches!(result, Err(BindError::Https { .. })));
        assert!(seen.is_empty());
    }

    #[tokio::test]
    async fn https_address_goes_through_upgrade() {
        let upgraded = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&upgraded);
        let mut ctx = context(&[], &["https://127.0.0.1:7443", "http://127.0.0.1:7080"], false);
        ctx.https_upgrade = Arc::new(move |options: ListenOptions| {
            record.lock().unwrap().push(options.target.clone());
            Ok(options)
        });

        let (result, seen) = bind_recording(&mut ctx).await;
        result.unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(
            *upgraded.lock().unwrap(),
            vec![ListenTarget::Ip("127.0.0.1:7443".parse().unwrap())]
        );
    }

    #[tokio::test]
    async fn address_in_use_is_translated_and_aborts() {
        let mut ctx = context(&["127.0.0.1:7000", "127.0.0.1:7001"], &[], false);
        let mut calls = 0;
        let result = bind_all(
            &mut ctx,
            |options: ListenOptions| {
                calls += 1;
                async move {
                    let _ = options;
                    Err(io::Error::new(io::ErrorKind::AddrInUse, "in use"))
                }
            },
            std::future::pending(),
        )
        .await;
        match result {
            Err(BindError::AddressInUse { address, .. }) => assert_eq!(address, "http://127.0.0.1:7000"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(calls, 1);
        assert!(ctx.bound_endpoints.is_empty());
    }

    #[tokio::test]
    async fn localhost_tolerates_one_unavailable_family() {
        let mut ctx = context(&[], &["http://localhost:7100"], false);
        let result = bind_all(
            &mut ctx,
            |options: ListenOptions| async move {
                match options.target {
                    ListenTarget::Ip(SocketAddr::V6(_)) => {
                        Err(io::Error::new(io::ErrorKind::AddrNotAvailable, "no ipv6"))
                    }
                    _ => Ok(options),
                }
            },
            std::future::pending(),
        )
        .await;
        result.unwrap();
        assert_eq!(ctx.bound_endpoints.len(), 1);
        assert_eq!(ctx.bound_addresses, vec!["http://localhost:7100".to_string()]);
    }

    #[tokio::test]
    async fn localhost_fails_when_both_families_fail() {
        let mut ctx = context(&[], &["http://localhost:7100"], false);
        let result = bind_all(
            &mut ctx,
            |_options: ListenOptions| async move { Err(io::Error::new(io::ErrorKind::AddrNotAvailable, "down")) },
            std::future::pending(),
        )
        .await;
        assert!(matches!(result, Err(BindError::LocalhostUnavailable { .. })));
    }

    #[tokio::test]
    async fn cancellation_aborts_binding() {
        let mut ctx = context(&["127.0.0.1:7000"], &[], false);
        let result = bind_all(
            &mut ctx,
            |_options: ListenOptions| std::future::pending::<io::Result<ListenOptions>>(),
            async {},
        )
        .await;
        assert!(matches!(result, Err(BindError::Cancelled)));
    }
}
