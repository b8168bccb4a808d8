//! Request processors for HTTP/1.1 and HTTP/2 backed by hyper.
//!
//! # Responsibilities
//! - Serve one connection with hyper's HTTP/1.1 or HTTP/2 engine
//! - Map "stop processing next request" onto hyper's graceful shutdown
//! - Map abort onto dropping the connection
//! - Keep the keep-alive timeout armed only while no request is in flight
//! - Feed transport and request body progress to the connection's timeouts
//!
//! HTTP/3 needs a multiplexed (QUIC) transport engine and is reported as
//! unsupported by this factory.

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::sync::watch;

use crate::http::processor::{
    ConnectionAbortedError, ProcessorContext, ProcessorError, ProcessorFactory, RequestProcessor,
};
use crate::http::protocols::HttpProtocol;
use crate::http::timeout::TimeoutReason;
use crate::http::timing::{RequestBody, TimedIo};
use crate::net::connection::{ConnectionEndReason, ConnectionId, PeerAddress, Transport};

pub type Request = hyper::Request<RequestBody>;
pub type Response = hyper::Response<String>;

/// Facts about the connection a request arrived on.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub connection_id: ConnectionId,
    pub protocol: HttpProtocol,
    pub remote: PeerAddress,
    pub server_name: Option<String>,
}

/// The application callback requests are handed to.
pub trait Application: Send + Sync + 'static {
    fn call(&self, request: Request, context: RequestContext) -> BoxFuture<'static, Response>;
}

impl<F> Application for F
where
    F: Fn(Request, RequestContext) -> BoxFuture<'static, Response> + Send + Sync + 'static,
{
    fn call(&self, request: Request, context: RequestContext) -> BoxFuture<'static, Response> {
        self(request, context)
    }
}

/// Answers every request with a short plain-text description of the connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConnectionInfoApplication;

impl Application for ConnectionInfoApplication {
    fn call(&self, request: Request, context: RequestContext) -> BoxFuture<'static, Response> {
        let body = format!(
            "switchyard\nconnection: {}\nprotocol: {}\nremote: {}\nserver_name: {}\npath: {}\n",
            context.connection_id,
            context.protocol,
            context.remote,
            context.server_name.as_deref().unwrap_or("-"),
            request.uri().path(),
        );
        async move {
            let mut response = Response::new(body);
            response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
            );
            response
        }
        .boxed()
    }
}

/// Builds [`HyperProcessor`]s serving one application.
#[derive(Clone)]
pub struct HyperProcessorFactory {
    application: Arc<dyn Application>,
}

impl HyperProcessorFactory {
    pub fn new(application: Arc<dyn Application>) -> Self {
        Self { application }
    }
}

impl ProcessorFactory for HyperProcessorFactory {
    fn create(
        &self,
        protocol: HttpProtocol,
        context: ProcessorContext,
    ) -> Result<Arc<dyn RequestProcessor>, ProcessorError> {
        match protocol {
            HttpProtocol::Http1 | HttpProtocol::Http2 => Ok(Arc::new(HyperProcessor::new(
                protocol,
                context,
                Arc::clone(&self.application),
            ))),
            HttpProtocol::Http3 => Err(ProcessorError::UnsupportedProtocol(protocol)),
        }
    }
}

/// One hyper-served connection.
pub struct HyperProcessor {
    protocol: HttpProtocol,
    context: ProcessorContext,
    application: Arc<dyn Application>,
    in_flight: Arc<AtomicUsize>,
    stop_tx: watch::Sender<bool>,
    abort_tx: watch::Sender<bool>,
    end_reason: Mutex<Option<ConnectionEndReason>>,
}

impl HyperProcessor {
    fn new(protocol: HttpProtocol, context: ProcessorContext, application: Arc<dyn Application>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        let (abort_tx, _) = watch::channel(false);
        Self {
            protocol,
            context,
            application,
            in_flight: Arc::new(AtomicUsize::new(0)),
            stop_tx,
            abort_tx,
            end_reason: Mutex::new(None),
        }
    }

    /// First reason the connection was asked to end, if any.
    pub fn end_reason(&self) -> Option<ConnectionEndReason> {
        *self.end_reason.lock().expect("end reason mutex poisoned")
    }

    fn record_end_reason(&self, reason: ConnectionEndReason) {
        let mut slot = self.end_reason.lock().expect("end reason mutex poisoned");
        if slot.is_none() {
            *slot = Some(reason);
        }
    }

    fn builder(&self) -> auto::Builder<TokioExecutor> {
        let builder = auto::Builder::new(TokioExecutor::new());
        match self.protocol {
            HttpProtocol::Http2 => builder.http2_only(),
            _ => builder.http1_only(),
        }
    }
}

async fn signalled(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|set| *set).await;
}

/// Decrements the in-flight count and re-arms keep-alive when the last
/// request finishes, even if the application future is dropped.
struct InFlightGuard {
    in_flight: Arc<AtomicUsize>,
    context: ProcessorContext,
}

impl InFlightGuard {
    fn enter(in_flight: Arc<AtomicUsize>, context: ProcessorContext) -> Self {
        if in_flight.fetch_add(1, Ordering::AcqRel) == 0 {
            context.timeout_control.cancel_timeout();
        }
        Self { in_flight, context }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.context
                .timeout_control
                .reset_timeout(self.context.limits.keep_alive_timeout, TimeoutReason::KeepAlive);
        }
    }
}

impl RequestProcessor for HyperProcessor {
    fn run(&self, transport: Transport) -> BoxFuture<'_, Result<(), ProcessorError>> {
        async move {
            let limits = &self.context.limits;
            let io = match transport {
                Transport::Stream(io) => TimedIo::new(io, Arc::clone(&self.context.timeout_control))
                    .with_request_headers_timeout(
                        (self.protocol == HttpProtocol::Http1).then_some(limits.request_headers_timeout),
                    )
                    .with_min_response_data_rate(limits.min_response_data_rate),
                Transport::Multiplexed(_) => return Err(ProcessorError::TransportMismatch(self.protocol)),
            };
            let io = TokioIo::new(io);

            let request_context = RequestContext {
                connection_id: self.context.connection_id,
                protocol: self.protocol,
                remote: self.context.remote.clone(),
                server_name: self.context.server_name.clone(),
            };
            let application = Arc::clone(&self.application);
            let in_flight = Arc::clone(&self.in_flight);
            let processor_context = self.context.clone();
            let service = service_fn(move |request: hyper::Request<Incoming>| {
                let guard = InFlightGuard::enter(Arc::clone(&in_flight), processor_context.clone());
                let control = Arc::clone(&processor_context.timeout_control);
                let rate = processor_context.limits.min_request_body_data_rate;
                let request = request.map(|body| RequestBody::new(body, control, rate));
                let response = application.call(request, request_context.clone());
                async move {
                    let response = response.await;
                    drop(guard);
                    Ok::<_, Infallible>(response)
                }
            });

            let builder = self.builder();
            let connection = builder.serve_connection(io, service);
            tokio::pin!(connection);

            let stop = signalled(self.stop_tx.subscribe());
            let abort = signalled(self.abort_tx.subscribe());
            tokio::pin!(stop);
            tokio::pin!(abort);
            let mut stopping = false;

            loop {
                tokio::select! {
                    result = connection.as_mut() => {
                        return result.map_err(|err| ProcessorError::Protocol(err.to_string()));
                    }
                    _ = &mut stop, if !stopping => {
                        stopping = true;
                        connection.as_mut().graceful_shutdown();
                    }
                    _ = &mut abort => {
                        tracing::debug!(
                            connection_id = %self.context.connection_id,
                            reason = ?self.end_reason(),
                            "Dropping aborted connection"
                        );
                        return Ok(());
                    }
                }
            }
        }
        .boxed()
    }

    fn stop_processing_next_request(&self, reason: ConnectionEndReason) {
        tracing::debug!(connection_id = %self.context.connection_id, reason = %reason, "Stopping after current request");
        self.record_end_reason(reason);
        self.stop_tx.send_replace(true);
    }

    fn handle_request_headers_timeout(&self) {
        self.abort(
            ConnectionAbortedError::new("request headers were not received in time"),
            ConnectionEndReason::RequestHeadersTimeout,
        );
    }

    fn handle_read_data_rate_timeout(&self) {
        self.abort(
            ConnectionAbortedError::new("the request body data rate dropped below the configured minimum"),
            ConnectionEndReason::MinRequestBodyDataRate,
        );
    }

    fn tick(&self, _now: Instant) {}

    fn abort(&self, error: ConnectionAbortedError, reason: ConnectionEndReason) {
        tracing::debug!(
            connection_id = %self.context.connection_id,
            reason = %reason,
            error = %error,
            "Aborting connection"
        );
        self.record_end_reason(reason);
        self.abort_tx.send_replace(true);
    }

    fn on_input_or_output_completed(&self) {
        self.record_end_reason(ConnectionEndReason::TransportCompleted);
        self.abort_tx.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::timeout::{HttpLimits, MinDataRate, TimeoutControl};
    use hyper::body::Body;
    use std::pin::Pin;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn context(keep_alive: Duration) -> ProcessorContext {
        ProcessorContext {
            connection_id: ConnectionId::new(),
            local: PeerAddress::Unknown,
            remote: PeerAddress::Unknown,
            timeout_control: Arc::new(TimeoutControl::new()),
            limits: HttpLimits {
                keep_alive_timeout: keep_alive,
                ..HttpLimits::default()
            },
            server_name: None,
        }
    }

    fn factory() -> HyperProcessorFactory {
        HyperProcessorFactory::new(Arc::new(ConnectionInfoApplication))
    }

    #[test]
    fn http3_is_unsupported() {
        let result = factory().create(HttpProtocol::Http3, context(Duration::from_secs(1)));
        assert!(matches!(result, Err(ProcessorError::UnsupportedProtocol(HttpProtocol::Http3))));
    }

    #[tokio::test]
    async fn serves_http1_and_rearms_keep_alive() {
        let ctx = context(Duration::from_secs(30));
        let timeouts = ctx.timeout_control.clone();
        let processor = factory().create(HttpProtocol::Http1, ctx).unwrap();
        let (server_io, mut client) = tokio::io::duplex(4096);

        let running = {
            let processor = processor.clone();
            tokio::spawn(async move { processor.run(Transport::Stream(Box::new(server_io))).await })
        };

        client
            .write_all(b"GET /hello HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut buf = vec![0u8; 1024];
        let n = client.read(&mut buf).await.unwrap();
        let text = String::from_utf8_lossy(&buf[..n]);
        assert!(text.starts_with("HTTP/1.1 200 OK"), "{}", text);

        // Response finished: the connection is idle again.
        tokio::time::timeout(Duration::from_secs(5), async {
            while timeouts.armed() != Some(TimeoutReason::KeepAlive) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("keep-alive re-armed");

        processor.stop_processing_next_request(ConnectionEndReason::KeepAliveTimeout);
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("graceful stop completes")
            .unwrap()
            .unwrap();
    }

    fn spawn_run(
        processor: &Arc<dyn RequestProcessor>,
        io: tokio::io::DuplexStream,
    ) -> tokio::task::JoinHandle<Result<(), ProcessorError>> {
        let processor = processor.clone();
        tokio::spawn(async move { processor.run(Transport::Stream(Box::new(io))).await })
    }

    async fn wait_for_tick(timeouts: &TimeoutControl, ahead: Duration, expected: TimeoutReason) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while timeouts.tick(Instant::now() + ahead) != Some(expected) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{} never reported", expected));
    }

    #[tokio::test]
    async fn response_to_a_stalled_reader_is_rate_limited() {
        let mut ctx = context(Duration::from_secs(30));
        ctx.limits.min_response_data_rate = Some(MinDataRate::new(1000.0, Duration::from_millis(100)));
        let timeouts = ctx.timeout_control.clone();
        let big = |_: Request, _: RequestContext| -> BoxFuture<'static, Response> {
            async { Response::new("x".repeat(256 * 1024)) }.boxed()
        };
        let processor = HyperProcessorFactory::new(Arc::new(big)).create(HttpProtocol::Http1, ctx).unwrap();
        let (server_io, mut client) = tokio::io::duplex(64);
        let running = spawn_run(&processor, server_io);

        client.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").await.unwrap();
        wait_for_tick(&timeouts, Duration::from_secs(2), TimeoutReason::WriteDataRate).await;

        processor.abort(ConnectionAbortedError::new("test"), ConnectionEndReason::MinResponseDataRate);
        tokio::time::timeout(Duration::from_secs(5), running).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn trickled_request_body_is_rate_limited() {
        let ctx = context(Duration::from_secs(30));
        let timeouts = ctx.timeout_control.clone();
        let drain = |request: Request, _: RequestContext| -> BoxFuture<'static, Response> {
            async move {
                let mut body = request.into_body();
                while let Some(frame) = futures_util::future::poll_fn(|cx| Pin::new(&mut body).poll_frame(cx)).await {
                    if frame.is_err() {
                        break;
                    }
                }
                Response::new(String::new())
            }
            .boxed()
        };
        let processor = HyperProcessorFactory::new(Arc::new(drain)).create(HttpProtocol::Http1, ctx).unwrap();
        let (server_io, mut client) = tokio::io::duplex(4096);
        let running = spawn_run(&processor, server_io);

        client
            .write_all(b"POST / HTTP/1.1\r\nHost: localhost\r\nContent-Length: 1000\r\n\r\nabc")
            .await
            .unwrap();
        wait_for_tick(&timeouts, Duration::from_secs(10), TimeoutReason::ReadDataRate).await;

        processor.handle_read_data_rate_timeout();
        tokio::time::timeout(Duration::from_secs(5), running).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn abort_drops_the_connection() {
        let processor = factory().create(HttpProtocol::Http1, context(Duration::from_secs(30))).unwrap();
        let (server_io, _client) = tokio::io::duplex(4096);
        let running = {
            let processor = processor.clone();
            tokio::spawn(async move { processor.run(Transport::Stream(Box::new(server_io))).await })
        };
        processor.abort(ConnectionAbortedError::new("test"), ConnectionEndReason::AbortedByApp);
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("abort completes")
            .unwrap()
            .unwrap();
    }
}
