//! Body plumbing: boxed proxy bodies and the tee that records previews.

use crate::capture::{entry::headers_from, CaptureEntry, CaptureStore};
use crate::error::ConnectionError;
use crate::state::StatsCollector;
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Frame, SizeHint};
use std::io;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::time::Sleep;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn full(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// First `limit` bytes of a body plus its total length.
#[derive(Debug)]
pub struct BodyPreview {
    limit: usize,
    data: BytesMut,
    total: u64,
}

impl BodyPreview {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            data: BytesMut::new(),
            total: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.total += chunk.len() as u64;
        let room = self.limit.saturating_sub(self.data.len());
        if room > 0 {
            self.data.extend_from_slice(&chunk[..chunk.len().min(room)]);
        }
    }

    pub fn snapshot(&self) -> (Bytes, u64) {
        (Bytes::copy_from_slice(&self.data), self.total)
    }
}

pub(crate) type SharedPreview = Arc<Mutex<BodyPreview>>;

pub(crate) fn shared_preview(limit: usize) -> SharedPreview {
    Arc::new(Mutex::new(BodyPreview::new(limit)))
}

fn snapshot(preview: &SharedPreview) -> (Bytes, u64) {
    preview
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .snapshot()
}

type OnEnd = Box<dyn FnOnce(Option<String>) + Send>;

/// Passes frames through untouched while copying data into a preview.
///
/// `on_end` runs exactly once: when the inner body ends or fails, or when
/// the body is dropped early. A drop after the last frame counts as a clean end.
/// With an idle timeout, a body that yields no frame for that long fails.
pub struct TappedBody<B: Body> {
    inner: B,
    preview: SharedPreview,
    on_end: Option<OnEnd>,
    idle: Option<(Duration, Pin<Box<Sleep>>)>,
}

impl<B: Body> TappedBody<B> {
    pub(crate) fn new(inner: B, preview: SharedPreview) -> Self {
        Self {
            inner,
            preview,
            on_end: None,
            idle: None,
        }
    }

    pub(crate) fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle = Some((timeout, Box::pin(tokio::time::sleep(timeout))));
        self
    }

    pub(crate) fn on_end(mut self, f: impl FnOnce(Option<String>) + Send + 'static) -> Self {
        self.on_end = Some(Box::new(f));
        self
    }

    fn finish(&mut self, error: Option<String>) {
        if let Some(on_end) = self.on_end.take() {
            on_end(error);
        }
    }
}

impl<B> Body for TappedBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Self::Error>>> {
        let this = &mut *self;
        let polled = match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(polled) => polled,
            Poll::Pending => {
                let Some((timeout, sleep)) = this.idle.as_mut() else {
                    return Poll::Pending;
                };
                if sleep.as_mut().poll(cx).is_pending() {
                    return Poll::Pending;
                }
                let message = format!("body idle for {}s", timeout.as_secs_f32());
                this.idle = None;
                this.finish(Some(message.clone()));
                return Poll::Ready(Some(Err(
                    io::Error::new(io::ErrorKind::TimedOut, message).into()
                )));
            }
        };

        if let Some((timeout, sleep)) = this.idle.as_mut() {
            sleep.as_mut().reset(tokio::time::Instant::now() + *timeout);
        }

        match polled {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    this.preview
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(data);
                }
                if this.inner.is_end_stream() {
                    this.finish(None);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Some(Err(e)) => {
                let e: BoxError = e.into();
                this.finish(Some(e.to_string()));
                Poll::Ready(Some(Err(e)))
            }
            None => {
                this.finish(None);
                Poll::Ready(None)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<B: Body> Drop for TappedBody<B> {
    fn drop(&mut self) {
        if self.on_end.is_some() {
            let error = (!self.inner.is_end_stream()).then(|| "body aborted before completion".to_string());
            self.finish(error);
        }
    }
}

/// Accumulates one transaction and appends it to the store when it ends.
pub(crate) struct CaptureRecorder {
    entry: CaptureEntry,
    started: Instant,
    request_body: SharedPreview,
    store: Arc<CaptureStore>,
    stats: Arc<StatsCollector>,
}

impl CaptureRecorder {
    pub(crate) fn new(
        entry: CaptureEntry,
        request_body: SharedPreview,
        store: Arc<CaptureStore>,
        stats: Arc<StatsCollector>,
    ) -> Self {
        Self {
            entry,
            started: Instant::now(),
            request_body,
            store,
            stats,
        }
    }

    pub(crate) fn response_head(&mut self, status: StatusCode, headers: &HeaderMap) {
        self.entry.status = Some(status.as_u16());
        self.entry.response_headers = headers_from(headers);
    }

    /// Record the transaction once the response body has finished streaming.
    pub(crate) fn finish(mut self, response_body: &SharedPreview, error: Option<String>) {
        let (body, size) = snapshot(response_body);
        self.entry.response_body = body;
        self.entry.response_body_size = size;
        self.entry.error = error;
        self.record();
    }

    /// Record a transaction that never got an upstream response.
    pub(crate) fn fail(mut self, error: &ConnectionError) {
        self.entry.status = Some(StatusCode::BAD_GATEWAY.as_u16());
        self.entry.error = Some(error.to_string());
        self.record();
    }

    fn record(mut self) {
        let (body, size) = snapshot(&self.request_body);
        self.entry.request_body = body;
        self.entry.request_body_size = size;
        self.entry.duration = self.started.elapsed();

        self.stats.record_capture(self.entry.is_error());
        let stored = self.store.append(self.entry);
        tracing::debug!(
            id = stored.id,
            method = %stored.method,
            url = %stored.url(),
            status = ?stored.status,
            duration_ms = stored.duration.as_millis() as u64,
            error = stored.error.as_deref(),
            "Captured transaction"
        );
    }
}
