//! Tee-capture body wrapper.
//!
//! [`TeeBody`] sits between hyper and an inner body. Every data frame is
//! copied into a capture buffer and then handed on *unchanged*; the frame
//! that leaves is the very `Bytes` that came in. Trailer frames are recorded
//! the same way.
//!
//! The capture lives behind an `Arc` so the request context can detach it
//! when the request completes, even if the wrapped body is still owned by a
//! connection task somewhere else.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use bytes::{Bytes, BytesMut};
use http::HeaderMap;
use http_body::{Body, Frame, SizeHint};
use http_body_util::combinators::UnsyncBoxBody;
use parking_lot::Mutex;

use crate::context::RequestContext;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The body type of every response the proxy sends to clients.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

// ── Capture ───────────────────────────────────────────────────────────────────

/// Destination for one direction's captured bytes and trailers.
#[derive(Debug, Default)]
pub(crate) struct Capture {
    state: Mutex<CaptureState>,
}

#[derive(Debug, Default)]
struct CaptureState {
    buf: Option<BytesMut>,
    trailers: HeaderMap,
    closed: bool,
}

impl Capture {
    /// `buf` is `None` when body capture is off; trailers are still recorded.
    pub(crate) fn new(buf: Option<BytesMut>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CaptureState { buf, ..CaptureState::default() }),
        })
    }

    fn write(&self, data: &[u8]) {
        if let Some(buf) = self.state.lock().buf.as_mut() {
            buf.extend_from_slice(data);
        }
    }

    pub(crate) fn record_trailers(&self, trailers: &HeaderMap) {
        let mut state = self.state.lock();
        if !state.closed {
            state.trailers.extend(trailers.clone());
        }
    }

    /// Detaches the buffer and trailers. Anything still streaming through
    /// the wrapper afterwards is forwarded but no longer recorded.
    pub(crate) fn close(&self) -> (Option<BytesMut>, HeaderMap) {
        let mut state = self.state.lock();
        state.closed = true;
        (state.buf.take(), std::mem::take(&mut state.trailers))
    }
}

// ── TeeBody ───────────────────────────────────────────────────────────────────

/// A body that records what flows through it without altering it.
///
/// A response-side `TeeBody` also owns the [`RequestContext`]: the context is
/// completed (taps run, buffers returned) as soon as the stream ends, errors,
/// or the body is dropped, whichever comes first.
pub struct TeeBody<B> {
    inner: B,
    capture: Arc<Capture>,
    context: Option<RequestContext>,
}

impl<B> TeeBody<B> {
    pub(crate) fn new(inner: B, capture: Arc<Capture>) -> Self {
        Self { inner, capture, context: None }
    }

    pub(crate) fn completing(mut self, context: RequestContext) -> Self {
        self.context = Some(context);
        self
    }

    fn complete(&mut self) {
        // Dropping the context runs the completion.
        self.context.take();
    }
}

impl<B> Body for TeeBody<B>
where
    B: Body<Data = Bytes> + Unpin,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    this.capture.write(data);
                } else if let Some(trailers) = frame.trailers_ref() {
                    this.capture.record_trailers(trailers);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Some(Err(e)) => {
                this.complete();
                Poll::Ready(Some(Err(e)))
            }
            None => {
                this.complete();
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
