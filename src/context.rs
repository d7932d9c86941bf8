//! Request-scoped state.
//!
//! A [`RequestContext`] is created by the router for every inbound request
//! and threaded by value through the handler's rewrite and modify phases.
//! It ends up owned by the response body; when that body finishes (or is
//! dropped because the client went away) the context completes: captures
//! are detached and the tap runs, then the capture buffers go back to the pool.
//!
//! Nothing in here is shared between requests.

use std::sync::Arc;

use tracing::Span;

use crate::body::Capture;
use crate::handler::InterceptHandler;
use crate::record::{Direction, RequestResponse};

/// Scratch state for one in-flight request.
pub struct RequestContext {
    handler: Option<Arc<InterceptHandler>>,
    record: Option<RequestResponse>,
    span: Span,
    closers: Vec<(Direction, Arc<Capture>)>,
}

impl RequestContext {
    pub(crate) fn new(span: Span) -> Self {
        Self {
            handler: None,
            record: None,
            span,
            closers: Vec::new(),
        }
    }

    /// Binds the handler now processing this request and the record it is
    /// building.
    pub(crate) fn attach(&mut self, handler: Arc<InterceptHandler>, record: RequestResponse) {
        self.handler = Some(handler);
        self.record = Some(record);
    }

    pub(crate) fn record_mut(&mut self) -> Option<&mut RequestResponse> {
        self.record.as_mut()
    }

    /// Registers a capture to be detached when the request completes.
    pub(crate) fn track(&mut self, direction: Direction, capture: Arc<Capture>) {
        self.closers.push((direction, capture));
    }

    /// The record under construction, once a handler has picked the request up.
    pub fn record(&self) -> Option<&RequestResponse> {
        self.record.as_ref()
    }

    /// The request's logging span.
    pub fn span(&self) -> &Span {
        &self.span
    }

    fn complete(&mut self) {
        let closers = std::mem::take(&mut self.closers);
        match (self.handler.take(), self.record.take()) {
            (Some(handler), Some(record)) => handler.finish(record, closers, &self.span),
            _ => {
                for (_, capture) in closers {
                    capture.close();
                }
            }
        }
    }
}

impl Drop for RequestContext {
    fn drop(&mut self) {
        self.complete();
    }
}

// ── TapContext ────────────────────────────────────────────────────────────────

/// What a tap gets to know about the route that served a request.
#[derive(Clone, Copy, Debug)]
pub struct TapContext<'a> {
    span: &'a Span,
    route: &'a str,
    attributes: &'a [(String, String)],
}

impl<'a> TapContext<'a> {
    pub fn new(span: &'a Span, route: &'a str, attributes: &'a [(String, String)]) -> Self {
        Self { span, route, attributes }
    }

    /// The request's span. Events emitted inside it carry method and path.
    pub fn span(&self) -> &'a Span {
        self.span
    }

    /// The registration's patterns, e.g. `"GET /orders, POST /orders"`.
    pub fn route(&self) -> &'a str {
        self.route
    }

    /// Extra log attributes configured for the route.
    pub fn attributes(&self) -> &'a [(String, String)] {
        self.attributes
    }
}
