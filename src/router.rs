//! Radix-tree request router.
//!
//! One pair of trees per HTTP method plus one pair for patterns without a
//! method: an exact tree for plain and `{param}` paths, and a subtree tree
//! for paths ending in `/`. Each registration gets its own
//! [`InterceptHandler`]; every pattern of that registration points at the
//! same handler.
//!
//! # Pattern syntax
//!
//! ```text
//! [METHOD ]PATH
//!
//! "GET /orders/{id}"   GET and HEAD on /orders/<anything>
//! "POST /orders"       POST on exactly /orders
//! "/static/"           any method on /static/ and everything below it
//! "/"                  any method, any path
//! ```
//!
//! Lookup consults the request method's trees first (a `HEAD` request also
//! consults `GET`), then the method-less ones. Exact matches win over
//! subtrees, and among subtrees the longest directory wins, so
//! `"GET /orders/"` and `"GET /orders/{id}"` can be registered together. A
//! request nothing matches goes to the default route, a no-op tap installed
//! on first use unless a bare `"/"` pattern was registered.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use http::{Method, Request, Response};
use hyper::body::Incoming;
use matchit::Router as MatchitRouter;
use tracing::{Instrument, debug, field, info_span};

use crate::body::ProxyBody;
use crate::bufpool::BufferPool;
use crate::context::RequestContext;
use crate::error::Error;
use crate::handler::{InterceptHandler, Settings, Upstream};
use crate::options::{RouteOptions, TapOptions};
use crate::server::Relays;
use crate::tap::{NopTap, Tap};

type Tree = MatchitRouter<Arc<InterceptHandler>>;

#[derive(Clone, Default)]
struct Trees {
    exact: Tree,
    // Keyed by directory, e.g. `/static/` or `/orders/{id}/`.
    subtree: Tree,
}

impl Trees {
    fn insert(&mut self, pattern: &RoutePattern, handler: &Arc<InterceptHandler>) -> Result<(), Error> {
        let tree = if pattern.is_subtree() { &mut self.subtree } else { &mut self.exact };
        tree.insert(pattern.path.clone(), Arc::clone(handler)).map_err(|e| Error::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })
    }
}

// ── RoutePattern ──────────────────────────────────────────────────────────────

/// A parsed `[METHOD ]PATH` pattern.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RoutePattern {
    method: Option<Method>,
    path: String,
}

impl RoutePattern {
    pub fn method(&self) -> Option<&Method> {
        self.method.as_ref()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// `true` for the pattern that matches every request.
    pub fn is_catch_all(&self) -> bool {
        self.method.is_none() && self.path == "/"
    }

    /// `true` when the pattern covers its directory and everything below it.
    pub fn is_subtree(&self) -> bool {
        self.path.ends_with('/')
    }
}

impl FromStr for RoutePattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| Error::InvalidPattern {
            pattern: s.to_owned(),
            reason: reason.to_owned(),
        };

        let trimmed = s.trim();
        let (method, path) = match trimmed.split_once(char::is_whitespace) {
            Some((method, path)) => {
                let method = Method::from_bytes(method.as_bytes()).map_err(|_| invalid("bad method"))?;
                (Some(method), path.trim_start())
            }
            None => (None, trimmed),
        };

        if !path.starts_with('/') {
            return Err(invalid("path must start with `/`"));
        }
        if path.contains(char::is_whitespace) {
            return Err(invalid("unexpected whitespace in path"));
        }
        Ok(Self { method, path: path.to_owned() })
    }
}

impl fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.method {
            Some(method) => write!(f, "{method} {}", self.path),
            None => f.write_str(&self.path),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────────────

/// The proxy's routing table.
///
/// Build it once at startup with [`Router::register`]; pass it to
/// [`Server::serve`](crate::Server::serve).
///
/// ```rust,no_run
/// use wiretap::{LogTap, Router, TapOptions};
///
/// # fn main() -> Result<(), wiretap::Error> {
/// let mut router = Router::new("http://127.0.0.1:8080")?;
/// router.register(
///     &["GET /orders/{id}", "POST /orders"],
///     LogTap::default(),
///     TapOptions::default().with_response_body(true).with_response_json(true),
/// )?;
/// # Ok(())
/// # }
/// ```
pub struct Router {
    upstream: Arc<Upstream>,
    settings: Settings,
    routes: HashMap<Method, Trees>,
    any_method: Trees,
    has_catch_all: bool,
    // The only state written while serving, besides `relays`.
    default_route: OnceLock<Arc<InterceptHandler>>,
    relays: Relays,
}

impl Router {
    /// A router forwarding to `upstream`, e.g. `http://10.0.0.5:8080/api`.
    pub fn new(upstream: &str) -> Result<Self, Error> {
        Ok(Self {
            upstream: Arc::new(Upstream::new(upstream)?),
            settings: Settings::default(),
            routes: HashMap::new(),
            any_method: Trees::default(),
            has_catch_all: false,
            default_route: OnceLock::new(),
            relays: Relays::default(),
        })
    }

    /// Capture buffers for routes registered after this call come from `pool`.
    pub fn with_buffer_pool(mut self, pool: Arc<BufferPool>) -> Self {
        self.settings.pool = pool;
        self
    }

    /// How long to wait for the upstream's response headers. Applies to
    /// routes registered after this call.
    pub fn with_upstream_timeout(mut self, timeout: Duration) -> Self {
        self.settings.upstream_timeout = timeout;
        self
    }

    /// Tap calls slower than `threshold` are logged as warnings. Applies to
    /// routes registered after this call.
    pub fn with_slow_tap_threshold(mut self, threshold: Duration) -> Self {
        self.settings.slow_tap = threshold;
        self
    }

    /// Routes every pattern in `patterns` to one new handler calling `tap`.
    ///
    /// Nothing is registered if any pattern or option is invalid.
    pub fn register<S: AsRef<str>>(
        &mut self,
        patterns: &[S],
        tap: impl Tap,
        options: TapOptions,
    ) -> Result<(), Error> {
        let patterns = patterns
            .iter()
            .map(|p| p.as_ref().parse())
            .collect::<Result<Vec<RoutePattern>, _>>()?;
        if patterns.is_empty() {
            return Err(Error::InvalidPattern {
                pattern: String::new(),
                reason: "no patterns given".to_owned(),
            });
        }

        let route = patterns.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
        let handler = Arc::new(InterceptHandler::new(
            route,
            Arc::clone(&self.upstream),
            Arc::new(tap),
            options.compile()?,
            self.settings.clone(),
        ));

        // Insert into copies so a conflict halfway through leaves no trace.
        let mut routes = self.routes.clone();
        let mut any_method = self.any_method.clone();
        for pattern in &patterns {
            let trees = match &pattern.method {
                Some(method) => routes.entry(method.clone()).or_default(),
                None => &mut any_method,
            };
            trees.insert(pattern, &handler)?;
        }

        self.routes = routes;
        self.any_method = any_method;
        self.has_catch_all |= patterns.iter().any(RoutePattern::is_catch_all);
        debug!(route = handler.route(), "route registered");
        Ok(())
    }

    /// The handler that serves `method` on `path`.
    pub fn handler_for(&self, method: &Method, path: &str) -> Arc<InterceptHandler> {
        self.lookup(method, path).unwrap_or_else(|| Arc::clone(self.default_route()))
    }

    /// Whether a bare `"/"` pattern has been registered.
    pub fn has_catch_all(&self) -> bool {
        self.has_catch_all
    }

    /// Whether the no-op default route has been installed.
    pub fn default_route_installed(&self) -> bool {
        self.default_route.get().is_some()
    }

    fn lookup(&self, method: &Method, path: &str) -> Option<Arc<InterceptHandler>> {
        let head_as_get = if *method == Method::HEAD { self.routes.get(&Method::GET) } else { None };
        let candidates = [self.routes.get(method), head_as_get, Some(&self.any_method)];
        let candidates = candidates.iter().flatten();

        let find = |tree: &Tree, path: &str| tree.at(path).ok().map(|m| Arc::clone(m.value));

        if let Some(found) = candidates.clone().find_map(|trees| find(&trees.exact, path)) {
            return Some(found);
        }

        // Longest enclosing directory first: `/a/b/c` tries `/a/b/`, `/a/`, `/`.
        path.match_indices('/').rev().find_map(|(i, _)| {
            let dir = &path[..=i];
            candidates.clone().find_map(|trees| find(&trees.subtree, dir))
        })
    }

    /// Upgraded connections still being relayed.
    pub(crate) fn relays(&self) -> &Relays {
        &self.relays
    }

    /// Installs the default route on first use. Concurrent first calls all
    /// get the same handler.
    fn default_route(&self) -> &Arc<InterceptHandler> {
        self.default_route.get_or_init(|| {
            debug!("installing default route");
            Arc::new(InterceptHandler::new(
                "/".to_owned(),
                Arc::clone(&self.upstream),
                Arc::new(NopTap),
                RouteOptions::passthrough(),
                self.settings.clone(),
            ))
        })
    }

    /// Routes one request. Never fails.
    pub(crate) async fn dispatch(&self, req: Request<Incoming>, peer: SocketAddr) -> Response<ProxyBody> {
        let handler = self.handler_for(req.method(), req.uri().path());

        let span = info_span!(
            "tap_request",
            method = %req.method(),
            path = req.uri().path(),
            route = handler.route(),
            attrs = field::Empty,
        );
        let attrs = handler.log_attributes();
        if !attrs.is_empty() {
            let joined = attrs.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(" ");
            span.record("attrs", joined.as_str());
        }

        let cx = RequestContext::new(span.clone());
        handler.serve(req, peer, cx, &self.relays).instrument(span).await
    }
}
