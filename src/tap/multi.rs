//! Ordered composition of taps.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::error;

use crate::context::TapContext;
use crate::record::RequestResponse;
use crate::tap::{BoxedTap, Tap, panic_message};

/// Calls every tap in order, each exactly once per request.
///
/// A tap that panics is logged and skipped; the taps after it still run.
#[derive(Clone, Default)]
pub struct MultiTap {
    taps: Vec<BoxedTap>,
}

impl MultiTap {
    pub fn new(taps: Vec<BoxedTap>) -> Self {
        Self { taps }
    }

    /// Appends a tap. Returns `self` for chaining.
    pub fn with(mut self, tap: impl Tap) -> Self {
        self.taps.push(Arc::new(tap));
        self
    }

    pub fn len(&self) -> usize {
        self.taps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.taps.is_empty()
    }
}

impl FromIterator<BoxedTap> for MultiTap {
    fn from_iter<I: IntoIterator<Item = BoxedTap>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl Tap for MultiTap {
    fn serve(&self, cx: &TapContext<'_>, rr: &RequestResponse) {
        for (index, tap) in self.taps.iter().enumerate() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| tap.serve(cx, rr))) {
                error!(parent: cx.span(), index, panic = panic_message(&*payload), "tap panicked");
            }
        }
    }
}
