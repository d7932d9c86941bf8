//! The tap trait and its basic implementations.
//!
//! # How taps are stored
//!
//! Every route holds its tap as a [`BoxedTap`], an `Arc<dyn Tap>`. The same
//! tap value may back several routes and is called from many connection
//! tasks at once, so taps must be `Send + Sync` and keep any mutable state
//! behind their own synchronization.
//!
//! ```text
//! |cx, rr| { … }                        ← closure, or any type with `impl Tap`
//!        ↓ router.register(patterns, FnTap(closure), opts)
//! Arc::new(FnTap(closure))              ← shared across requests
//!        ↓ stored as BoxedTap = Arc<dyn Tap>
//! tap.serve(&cx, &record)               ← once per completed request
//! ```
//!
//! # Failure model
//!
//! [`Tap::serve`] returns nothing. By the time it runs, the response is
//! already on its way to the client. A tap logs its own problems; a tap that
//! panics is caught and logged by the caller, and the client never notices.

pub mod log;
pub mod multi;
pub mod template;

use std::any::Any;
use std::sync::Arc;

use tracing::debug;

use crate::context::TapContext;
use crate::record::RequestResponse;

/// An observer of completed request/response pairs.
pub trait Tap: Send + Sync + 'static {
    /// Called once per request, after the response has been prepared.
    ///
    /// Captured bodies in `rr` are pooled buffers that are reused right
    /// after this call returns; copy them if you need them later.
    fn serve(&self, cx: &TapContext<'_>, rr: &RequestResponse);
}

/// A type-erased tap shared across routes and requests.
pub type BoxedTap = Arc<dyn Tap>;

impl<T: Tap + ?Sized> Tap for Arc<T> {
    fn serve(&self, cx: &TapContext<'_>, rr: &RequestResponse) {
        (**self).serve(cx, rr)
    }
}

impl<T: Tap + ?Sized> Tap for Box<T> {
    fn serve(&self, cx: &TapContext<'_>, rr: &RequestResponse) {
        (**self).serve(cx, rr)
    }
}

/// Adapts a closure into a [`Tap`].
///
/// ```rust
/// use wiretap::{FnTap, RequestResponse, TapContext};
///
/// let tap = FnTap(|_cx: &TapContext<'_>, rr: &RequestResponse| {
///     println!("{} {} -> {}", rr.method, rr.url, rr.status);
/// });
/// ```
pub struct FnTap<F>(pub F);

impl<F> Tap for FnTap<F>
where
    F: Fn(&TapContext<'_>, &RequestResponse) + Send + Sync + 'static,
{
    fn serve(&self, cx: &TapContext<'_>, rr: &RequestResponse) {
        (self.0)(cx, rr)
    }
}

/// The tap behind the implicit catch-all route. Observes nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NopTap;

impl Tap for NopTap {
    fn serve(&self, cx: &TapContext<'_>, _rr: &RequestResponse) {
        debug!(parent: cx.span(), tap = "nop", "called");
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
