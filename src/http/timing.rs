//! Connection I/O and request bodies that feed [`TimeoutControl`].
//!
//! # Responsibilities
//! - Count bytes moved over the transport for the data-rate checks
//! - Swap an idle keep-alive timeout for the request-headers timeout as soon
//!   as the first byte of an HTTP/1.1 request arrives
//! - Time response writes while the peer is applying backpressure
//! - Time request body reads from the first body poll until the body ends
//!
//! Nothing here enforces a limit; the heartbeat does, through
//! [`TimeoutControl::tick`].

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::http::timeout::{MinDataRate, TimeoutControl, TimeoutReason};

/// Transport wrapper reporting reads and writes to a connection's timeouts.
pub struct TimedIo<S> {
    inner: S,
    control: Arc<TimeoutControl>,
    request_headers_timeout: Option<Duration>,
    min_response_data_rate: Option<MinDataRate>,
}

impl<S> TimedIo<S> {
    pub fn new(inner: S, control: Arc<TimeoutControl>) -> Self {
        Self {
            inner,
            control,
            request_headers_timeout: None,
            min_response_data_rate: None,
        }
    }

    /// Arm `timeout` when request bytes arrive on an idle connection.
    ///
    /// Only meaningful for HTTP/1.1: an HTTP/2 peer sends control frames
    /// while idle.
    pub fn with_request_headers_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_headers_timeout = timeout;
        self
    }

    pub fn with_min_response_data_rate(mut self, rate: Option<MinDataRate>) -> Self {
        self.min_response_data_rate = rate;
        self
    }

    fn on_written(&self, poll: &Poll<io::Result<usize>>) {
        match poll {
            Poll::Ready(Ok(written)) => self.control.bytes_written(*written as u64),
            Poll::Pending => {
                if let Some(rate) = self.min_response_data_rate {
                    self.control.start_timing_write(rate);
                }
            }
            Poll::Ready(Err(_)) => {}
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TimedIo<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);

        if let Poll::Ready(Ok(())) = poll {
            let read = buf.filled().len() - before;
            if read > 0 {
                this.control.bytes_read(read as u64);
                if let Some(timeout) = this.request_headers_timeout {
                    this.control
                        .replace_timeout(TimeoutReason::KeepAlive, timeout, TimeoutReason::RequestHeaders);
                }
            }
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TimedIo<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, data);
        this.on_written(&poll);
        poll
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write_vectored(cx, bufs);
        this.on_written(&poll);
        poll
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_flush(cx);
        if let Poll::Ready(Ok(())) = poll {
            this.control.stop_timing_write();
        }
        poll
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Request body handed to the application.
///
/// Reads are timed against the minimum request body data rate from the first
/// poll until the body ends or is dropped.
pub struct RequestBody {
    inner: Incoming,
    control: Arc<TimeoutControl>,
    rate: Option<MinDataRate>,
    timing: bool,
}

impl RequestBody {
    pub(crate) fn new(inner: Incoming, control: Arc<TimeoutControl>, rate: Option<MinDataRate>) -> Self {
        Self {
            inner,
            control,
            rate,
            timing: false,
        }
    }

    fn finish(&mut self) {
        if self.timing {
            self.timing = false;
            self.control.stop_timing_read();
        }
    }
}

impl Body for RequestBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, hyper::Error>>> {
        let this = self.get_mut();
        if !this.timing && !this.inner.is_end_stream() {
            if let Some(rate) = this.rate {
                this.timing = this.control.start_timing_read(rate);
            }
        }

        let poll = Pin::new(&mut this.inner).poll_frame(cx);
        if matches!(poll, Poll::Ready(None) | Poll::Ready(Some(Err(_)))) {
            this.finish();
        }
        poll
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for RequestBody {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn first_request_bytes_swap_keep_alive_for_headers_timeout() {
        let control = Arc::new(TimeoutControl::new());
        control.reset_timeout(Duration::from_secs(130), TimeoutReason::KeepAlive);
        let (server, mut client) = tokio::io::duplex(64);
        let mut io = TimedIo::new(server, control.clone()).with_request_headers_timeout(Some(Duration::from_secs(1)));

        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        let mut buf = [0u8; 64];
        io.read(&mut buf).await.unwrap();
        assert_eq!(control.armed(), Some(TimeoutReason::RequestHeaders));
        assert_eq!(
            control.tick(Instant::now() + Duration::from_secs(2)),
            Some(TimeoutReason::RequestHeaders)
        );
    }

    #[tokio::test]
    async fn reads_during_a_request_leave_timeouts_alone() {
        let control = Arc::new(TimeoutControl::new());
        let (server, mut client) = tokio::io::duplex(64);
        let mut io = TimedIo::new(server, control.clone()).with_request_headers_timeout(Some(Duration::from_secs(1)));

        client.write_all(b"body bytes").await.unwrap();
        let mut buf = [0u8; 64];
        io.read(&mut buf).await.unwrap();
        assert_eq!(control.armed(), None);
    }

    #[tokio::test]
    async fn stalled_writes_are_timed_until_flushed() {
        let control = Arc::new(TimeoutControl::new());
        let (server, mut client) = tokio::io::duplex(16);
        let mut io = TimedIo::new(server, control.clone())
            .with_min_response_data_rate(Some(MinDataRate::new(1000.0, Duration::from_millis(100))));

        let writer = tokio::spawn(async move {
            io.write_all(&[b'x'; 64]).await.unwrap();
            io.flush().await.unwrap();
            io
        });

        // The duplex buffer is full, so the writer is parked.
        tokio::time::timeout(Duration::from_secs(5), async {
            while control.tick(Instant::now() + Duration::from_secs(10)) != Some(TimeoutReason::WriteDataRate) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("stalled write reported");

        let mut sink = vec![0u8; 64];
        client.read_exact(&mut sink).await.unwrap();
        let _io = writer.await.unwrap();
        assert_eq!(control.tick(Instant::now() + Duration::from_secs(10)), None);
    }
}
