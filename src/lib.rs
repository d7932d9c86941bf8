//! # wiretap
//!
//! An HTTP reverse proxy that lets you watch the traffic going through it.
//!
//! Every request is forwarded to a single upstream and its response is
//! streamed back to the client unchanged. Alongside, the proxy assembles a
//! [`RequestResponse`] record of the exchange (headers, optionally bodies,
//! optionally decoded and patched JSON) and hands it to the [`Tap`]
//! registered for the route once the response has been sent.
//!
//! ## What a tap sees
//!
//! - Headers, filtered per route by include/exclude lists ([`HeaderFilter`])
//! - Bodies, when capture is switched on, in pooled buffers ([`BufferPool`])
//! - JSON bodies decoded to a [`serde_json::Value`] when the content type is
//!   JSON, with an optional [`BodyPatch`] applied to that copy only
//! - Trailers, status, protocol versions, and timing
//!
//! What the client receives is never affected by a tap: the bytes on the
//! wire are the upstream's bytes, and a failing tap is logged and skipped.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use wiretap::{LogTap, MultiTap, Router, Server, TapOptions, TemplateTap};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), wiretap::Error> {
//!     let mut router = Router::new("http://127.0.0.1:18080")?;
//!
//!     router.register(
//!         &["GET /orders/{id}", "POST /orders"],
//!         MultiTap::default()
//!             .with(LogTap::default())
//!             .with(TemplateTap::new("{{ data.method }} {{ data.url.full }} {{ data.status }}\n")?),
//!         TapOptions::capture_all()
//!             .with_response_body_patch(r#"[{"op":"remove","path":"/card"}]"#)
//!             .with_exclude_headers(["cookie"]),
//!     )?;
//!
//!     Server::bind("0.0.0.0:8080")?.serve(router).await
//! }
//! ```
//!
//! The same setup can be written as YAML and loaded with [`ProxyConfig`].

mod body;
mod bufpool;
mod context;
mod error;
mod handler;
mod headers;
mod options;
mod patch;
mod record;
mod router;
mod server;
mod transfer;

pub mod config;
pub mod tap;

pub use body::ProxyBody;
pub use bufpool::BufferPool;
pub use config::ProxyConfig;
pub use context::{RequestContext, TapContext};
pub use error::Error;
pub use handler::{DEFAULT_SLOW_TAP_THRESHOLD, DEFAULT_UPSTREAM_TIMEOUT, InterceptHandler};
pub use headers::{Blocklist, ContentTypeError, HeaderFilter, canonical_header_names, check_json};
pub use options::TapOptions;
pub use patch::BodyPatch;
pub use record::{Direction, RequestResponse};
pub use router::{RoutePattern, Router};
pub use server::{DEFAULT_SHUTDOWN_TIMEOUT, Server, shutdown_signal};
pub use tap::log::LogTap;
pub use tap::multi::MultiTap;
pub use tap::template::{OutputFormat, TemplateTap};
pub use tap::{BoxedTap, FnTap, NopTap, Tap};
pub use transfer::TransferBufferPool;
