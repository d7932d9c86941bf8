//! The intercepting proxy handler.
//!
//! One [`InterceptHandler`] exists per [`Router::register`](crate::Router::register)
//! call and is shared by every request its patterns match. It owns no
//! per-request state; that lives in the [`RequestContext`] the router creates.
//!
//! A request passes through three phases:
//!
//! ```text
//! rewrite          ← before any byte reaches the upstream
//!    ↓               record begun, URL retargeted, request body wrapped in a tee
//! upstream round-trip
//!    ↓
//! modify_response  ← upstream answered, body not yet streamed to the client
//!    ↓               status and headers recorded, response body wrapped in a tee
//! finish           ← response body ended, failed or was dropped
//!                    bodies detached, JSON decoded and patched, tap called,
//!                    buffers returned to the pool
//! ```
//!
//! The client always receives the upstream's bytes unchanged. Everything the
//! handler decodes or patches is a copy made for the tap.

use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST};
use http::uri::{Authority, Scheme};
use http::{HeaderValue, Request, Response, StatusCode, Uri, Version};
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::upgrade::OnUpgrade;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use tracing::{Instrument, Span, debug, error, warn};

use crate::body::{BoxError, Capture, ProxyBody, TeeBody};
use crate::bufpool::BufferPool;
use crate::context::{RequestContext, TapContext};
use crate::error::Error;
use crate::headers::{check_json, is_upgrade_request, set_forwarded, strip_hop_by_hop};
use crate::options::RouteOptions;
use crate::record::{Direction, RequestResponse, decode_json, proto};
use crate::server::Relays;
use crate::tap::{BoxedTap, panic_message};
use crate::transfer::{TransferBufferPool, copy_bidirectional};

pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Tap calls slower than this are logged as warnings.
pub const DEFAULT_SLOW_TAP_THRESHOLD: Duration = Duration::from_secs(1);

/// Router-wide knobs every handler is created with.
#[derive(Clone, Debug)]
pub(crate) struct Settings {
    pub(crate) pool: Arc<BufferPool>,
    pub(crate) upstream_timeout: Duration,
    pub(crate) slow_tap: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            pool: BufferPool::shared(),
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
            slow_tap: DEFAULT_SLOW_TAP_THRESHOLD,
        }
    }
}

// ── Upstream ──────────────────────────────────────────────────────────────────

/// The single backend every route forwards to, plus the client that reaches it.
pub(crate) struct Upstream {
    scheme: Scheme,
    authority: Authority,
    base_path: String,
    base_query: Option<String>,
    client: Client<HttpConnector, TeeBody<Incoming>>,
    transfer: Arc<TransferBufferPool>,
}

impl Upstream {
    pub(crate) fn new(url: &str) -> Result<Self, Error> {
        let invalid = |reason: &str| Error::InvalidUpstream {
            url: url.to_owned(),
            reason: reason.to_owned(),
        };

        let uri: Uri = url.parse().map_err(|e: http::uri::InvalidUri| invalid(&e.to_string()))?;
        let parts = uri.into_parts();
        let scheme = parts.scheme.ok_or_else(|| invalid("missing scheme"))?;
        if scheme != Scheme::HTTP {
            return Err(invalid("only http:// upstreams are supported"));
        }
        let authority = parts.authority.ok_or_else(|| invalid("missing host"))?;
        let (base_path, base_query) = match parts.path_and_query {
            Some(pq) => (pq.path().to_owned(), pq.query().map(str::to_owned)),
            None => (String::new(), None),
        };

        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .build(HttpConnector::new());

        Ok(Self {
            scheme,
            authority,
            base_path,
            base_query,
            client,
            transfer: Arc::new(TransferBufferPool::default()),
        })
    }

    /// Maps an inbound request URI onto the upstream: paths are joined with
    /// exactly one slash at the seam, queries are concatenated upstream first.
    pub(crate) fn target(&self, inbound: &Uri) -> Result<Uri, http::Error> {
        let path = join_paths(&self.base_path, inbound.path());
        let query: Vec<&str> = [self.base_query.as_deref(), inbound.query()]
            .into_iter()
            .flatten()
            .filter(|q| !q.is_empty())
            .collect();
        let path_and_query = if query.is_empty() {
            path
        } else {
            format!("{path}?{}", query.join("&"))
        };

        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()
    }
}

fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{base}{}", &path[1..]),
        (false, false) => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}

// ── InterceptHandler ──────────────────────────────────────────────────────────

/// Captures one route's traffic and hands each completed exchange to its tap.
pub struct InterceptHandler {
    route: String,
    upstream: Arc<Upstream>,
    tap: BoxedTap,
    options: RouteOptions,
    settings: Settings,
}

impl InterceptHandler {
    pub(crate) fn new(
        route: String,
        upstream: Arc<Upstream>,
        tap: BoxedTap,
        options: RouteOptions,
        settings: Settings,
    ) -> Self {
        Self { route, upstream, tap, options, settings }
    }

    /// The registration's patterns, comma separated.
    pub fn route(&self) -> &str {
        &self.route
    }

    pub(crate) fn log_attributes(&self) -> &[(String, String)] {
        &self.options.log_attributes
    }

    /// Proxies one request. Never fails: upstream problems become `502` or
    /// `504` responses and are recorded like any other outcome.
    pub(crate) async fn serve(
        self: Arc<Self>,
        mut req: Request<Incoming>,
        peer: SocketAddr,
        mut cx: RequestContext,
        relays: &Relays,
    ) -> Response<ProxyBody> {
        let upgrade = is_upgrade_request(req.headers());
        let client_upgrade = upgrade.then(|| hyper::upgrade::on(&mut req));

        let outgoing = match self.rewrite(req, peer, &mut cx, upgrade) {
            Ok(outgoing) => outgoing,
            Err(e) => {
                error!(error = %e, "cannot build upstream request");
                return fail(cx, StatusCode::BAD_GATEWAY);
            }
        };

        let timeout = self.settings.upstream_timeout;
        let sent = tokio::time::timeout(timeout, self.upstream.client.request(outgoing)).await;
        let mut resp = match sent {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                warn!(error = %e, connect = e.is_connect(), "upstream request failed");
                return fail(cx, StatusCode::BAD_GATEWAY);
            }
            Err(_) => {
                warn!(?timeout, "upstream timed out");
                return fail(cx, StatusCode::GATEWAY_TIMEOUT);
            }
        };

        if resp.status() == StatusCode::SWITCHING_PROTOCOLS
            && let Some(client_upgrade) = client_upgrade
        {
            let upstream_upgrade = hyper::upgrade::on(&mut resp);
            let transfer = Arc::clone(&self.upstream.transfer);
            relays.spawn(relay(client_upgrade, upstream_upgrade, transfer).in_current_span());
        }

        self.modify_response(resp, cx)
    }

    /// Pre-forward phase. Builds the record and the request that goes upstream.
    fn rewrite(
        self: &Arc<Self>,
        req: Request<Incoming>,
        peer: SocketAddr,
        cx: &mut RequestContext,
        upgrade: bool,
    ) -> Result<Request<TeeBody<Incoming>>, http::Error> {
        let (mut parts, body) = req.into_parts();
        let mut rr = RequestResponse::begin();

        // HTTP/2 clients carry the host in the URI authority only.
        let host = parts.headers.get(HOST).cloned().or_else(|| {
            parts
                .uri
                .authority()
                .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
        });
        let target = self.upstream.target(&parts.uri);

        strip_hop_by_hop(&mut parts.headers, upgrade);
        set_forwarded(&mut parts.headers, peer, host.as_ref());
        if let Some(host) = &host {
            parts.headers.insert(HOST, host.clone());
        }

        rr.host = host
            .as_ref()
            .and_then(|h| h.to_str().ok())
            .unwrap_or_default()
            .to_owned();
        rr.method = parts.method.clone();
        rr.req_proto = proto(parts.version).to_owned();
        rr.req_header = self.options.filter.snapshot(&parts.headers);
        rr.req_content_type = parts.headers.get(CONTENT_TYPE).cloned();
        rr.url = target.as_ref().map_or_else(|_| parts.uri.clone(), Clone::clone);

        let capture = Capture::new(self.options.request.capture.then(|| self.settings.pool.get()));
        cx.track(Direction::Request, Arc::clone(&capture));
        cx.attach(Arc::clone(self), rr);

        parts.uri = target?;
        parts.version = Version::HTTP_11;
        Ok(Request::from_parts(parts, TeeBody::new(body, capture)))
    }

    /// Post-response phase. The returned body owns `cx` and completes it.
    fn modify_response(&self, resp: Response<Incoming>, mut cx: RequestContext) -> Response<ProxyBody> {
        let (mut parts, body) = resp.into_parts();
        strip_hop_by_hop(&mut parts.headers, parts.status == StatusCode::SWITCHING_PROTOCOLS);

        let capture = Capture::new(self.options.response.capture.then(|| self.settings.pool.get()));
        cx.track(Direction::Response, Arc::clone(&capture));

        if let Some(rr) = cx.record_mut() {
            rr.stamp_end();
            rr.set_status(parts.status);
            rr.resp_proto = proto(parts.version).to_owned();
            rr.resp_header = self.options.filter.snapshot(&parts.headers);
            rr.resp_content_type = parts.headers.get(CONTENT_TYPE).cloned();
        }

        let body = TeeBody::new(body, capture)
            .completing(cx)
            .map_err(|e| -> BoxError { Box::new(e) })
            .boxed_unsync();
        Response::from_parts(parts, body)
    }

    /// Completes a request: runs once, from the context's drop.
    pub(crate) fn finish(
        &self,
        mut rr: RequestResponse,
        closers: Vec<(Direction, Arc<Capture>)>,
        span: &Span,
    ) {
        let _enter = span.enter();
        rr.stamp_end();

        for (direction, capture) in closers {
            let (body, trailers) = capture.close();
            *rr.body_slot(direction) = body;
            *rr.trailers_mut(direction) = self.options.filter.snapshot(&trailers);
        }
        self.decode(&mut rr, Direction::Request);
        self.decode(&mut rr, Direction::Response);

        let cx = TapContext::new(span, &self.route, &self.options.log_attributes);
        let started = Instant::now();
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| self.tap.serve(&cx, &rr))) {
            error!(panic = panic_message(&*payload), "tap panicked");
        }
        let elapsed = started.elapsed();
        if elapsed > self.settings.slow_tap {
            warn!(?elapsed, threshold = ?self.settings.slow_tap, "slow tap");
        }

        self.settings.pool.put(rr.req_body.take());
        self.settings.pool.put(rr.resp_body.take());
    }

    fn decode(&self, rr: &mut RequestResponse, direction: Direction) {
        let opts = self.options.direction(direction);
        if !opts.decode_json {
            return;
        }
        let Some(body) = rr.body(direction).filter(|b| !b.is_empty()) else {
            return;
        };
        if let Err(reason) = check_json(rr.content_type(direction)) {
            debug!(%direction, %reason, "skipping JSON decode");
            return;
        }
        let mut value = match decode_json(body) {
            Ok(value) => value,
            Err(e) => {
                warn!(%direction, error = %e, "captured body is not valid JSON");
                return;
            }
        };
        if let Some(patch) = &opts.patch
            && let Err(e) = patch.apply(&mut value)
        {
            warn!(%direction, error = %e, "body patch failed, tap sees the unpatched body");
        }
        *rr.body_json_mut(direction) = Some(value);
    }
}

/// Answers with `status` and no body. Dropping `cx` runs the tap.
fn fail(mut cx: RequestContext, status: StatusCode) -> Response<ProxyBody> {
    if let Some(rr) = cx.record_mut() {
        rr.stamp_end();
        rr.set_status(status);
        rr.resp_proto = proto(Version::HTTP_11).to_owned();
    }
    drop(cx);

    let body = Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync();
    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    resp
}

/// Relays an upgraded connection until both sides close.
async fn relay(client: OnUpgrade, upstream: OnUpgrade, pool: Arc<TransferBufferPool>) {
    let (client, upstream) = match tokio::try_join!(client, upstream) {
        Ok(pair) => pair,
        Err(e) => {
            warn!(error = %e, "upgrade failed");
            return;
        }
    };
    match copy_bidirectional(TokioIo::new(client), TokioIo::new(upstream), &pool).await {
        Ok((up, down)) => debug!(client_to_upstream = up, upstream_to_client = down, "upgraded connection closed"),
        Err(e) => debug!(error = %e, "upgraded connection closed with error"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::TapOptions;
    use crate::tap::FnTap;
    use bytes::BytesMut;
    use http::HeaderMap;
    use serde_json::{Value, json};
    use std::sync::mpsc;

    fn upstream(url: &str) -> Upstream {
        Upstream::new(url).unwrap()
    }

    #[tokio::test]
    async fn target_joins_paths_with_one_slash() {
        let up = upstream("http://backend:8080");
        let uri = up.target(&"/orders/7".parse().unwrap()).unwrap();
        assert_eq!(uri, "http://backend:8080/orders/7");

        let up = upstream("http://backend/api/");
        assert_eq!(up.target(&"/orders".parse().unwrap()).unwrap(), "http://backend/api/orders");

        let up = upstream("http://backend/api");
        assert_eq!(up.target(&"/orders".parse().unwrap()).unwrap(), "http://backend/api/orders");
    }

    #[tokio::test]
    async fn target_merges_queries_upstream_first() {
        let up = upstream("http://backend/api?key=1");
        let uri = up.target(&"/search?q=rust".parse().unwrap()).unwrap();
        assert_eq!(uri, "http://backend/api/search?key=1&q=rust");

        let uri = up.target(&"/search".parse().unwrap()).unwrap();
        assert_eq!(uri.query(), Some("key=1"));
    }

    #[tokio::test]
    async fn unusable_upstreams_are_rejected() {
        for url in ["backend:8080", "https://backend", "/just/a/path", "http://"] {
            assert!(
                matches!(Upstream::new(url), Err(Error::InvalidUpstream { .. })),
                "{url} should be rejected"
            );
        }
    }

    fn settings(pool: Arc<BufferPool>) -> Settings {
        Settings { pool, ..Settings::default() }
    }

    type Seen = (Option<Value>, Option<Value>, Vec<u8>);

    fn handler(opts: TapOptions, tx: mpsc::Sender<Seen>, pool: Arc<BufferPool>) -> InterceptHandler {
        let tx = parking_lot::Mutex::new(tx);
        let tap = FnTap(move |_cx: &TapContext<'_>, rr: &RequestResponse| {
            let raw = rr.resp_body.as_deref().unwrap_or_default().to_vec();
            let _ = tx.lock().send((rr.req_body_json.clone(), rr.resp_body_json.clone(), raw));
        });
        InterceptHandler::new(
            "/".into(),
            Arc::new(upstream("http://backend")),
            Arc::new(tap),
            opts.compile().unwrap(),
            settings(pool),
        )
    }

    fn record(req_ct: &str, resp_ct: &str) -> RequestResponse {
        let mut rr = RequestResponse::begin();
        rr.req_content_type = Some(HeaderValue::from_str(req_ct).unwrap());
        rr.resp_content_type = Some(HeaderValue::from_str(resp_ct).unwrap());
        rr
    }

    fn closers(req: &[u8], resp: &[u8]) -> Vec<(Direction, Arc<Capture>)> {
        vec![
            (Direction::Request, Capture::new(Some(BytesMut::from(req)))),
            (Direction::Response, Capture::new(Some(BytesMut::from(resp)))),
        ]
    }

    #[tokio::test]
    async fn finish_decodes_json_by_content_type() {
        let (tx, rx) = mpsc::channel();
        let h = handler(TapOptions::capture_all(), tx, BufferPool::shared());

        h.finish(
            record("text/plain", "application/json; charset=utf-8"),
            closers(br#"{"ignored":true}"#, br#"{"a":1}"#),
            &Span::none(),
        );

        let (req_json, resp_json, raw) = rx.recv().unwrap();
        assert_eq!(req_json, None);
        assert_eq!(resp_json, Some(json!({"a": 1})));
        assert_eq!(raw, br#"{"a":1}"#);
    }

    #[tokio::test]
    async fn finish_patches_only_the_decoded_copy() {
        let (tx, rx) = mpsc::channel();
        let opts = TapOptions::capture_all().with_response_body_patch(r#"[{"op":"remove","path":"/token"}]"#);
        let h = handler(opts, tx, BufferPool::shared());

        let body = br#"{"token":"s3cr3t","user":"ada"}"#;
        h.finish(record("application/json", "application/json"), closers(b"", body), &Span::none());

        let (_, resp_json, raw) = rx.recv().unwrap();
        assert_eq!(resp_json, Some(json!({"user": "ada"})));
        assert_eq!(raw, body);
    }

    #[tokio::test]
    async fn failing_patch_leaves_value_unpatched() {
        let (tx, rx) = mpsc::channel();
        let opts = TapOptions::capture_all().with_response_body_patch(r#"[{"op":"remove","path":"/missing"}]"#);
        let h = handler(opts, tx, BufferPool::shared());

        h.finish(record("application/json", "application/json"), closers(b"", br#"{"a":1}"#), &Span::none());

        let (_, resp_json, _) = rx.recv().unwrap();
        assert_eq!(resp_json, Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn buffers_return_to_the_pool_after_the_tap() {
        let (tx, _rx) = mpsc::channel();
        let pool = Arc::new(BufferPool::new());
        let h = handler(TapOptions::capture_all(), tx, Arc::clone(&pool));

        h.finish(record("application/json", "application/json"), closers(b"{}", b"{}"), &Span::none());
        assert_eq!(pool.retained(), 2);
    }

    fn exploding(_: &TapContext<'_>, _: &RequestResponse) {
        panic!("boom");
    }

    #[tokio::test]
    async fn panicking_tap_still_returns_buffers() {
        let pool = Arc::new(BufferPool::new());
        let h = InterceptHandler::new(
            "/".into(),
            Arc::new(upstream("http://backend")),
            Arc::new(FnTap(exploding)),
            TapOptions::capture_all().compile().unwrap(),
            settings(Arc::clone(&pool)),
        );

        h.finish(RequestResponse::begin(), closers(b"x", b"y"), &Span::none());
        assert_eq!(pool.retained(), 2);
    }

    #[tokio::test]
    async fn trailers_go_through_the_header_filter() {
        let seen = Arc::new(parking_lot::Mutex::new(HeaderMap::new()));
        let sink = Arc::clone(&seen);
        let h = InterceptHandler::new(
            "/".into(),
            Arc::new(upstream("http://backend")),
            Arc::new(FnTap(move |_: &TapContext<'_>, rr: &RequestResponse| {
                *sink.lock() = rr.resp_trailer.clone();
            })),
            TapOptions::default().with_exclude_headers(["x-secret"]).compile().unwrap(),
            Settings::default(),
        );

        let capture = Capture::new(None);
        let mut trailers = HeaderMap::new();
        trailers.insert("x-secret", HeaderValue::from_static("1"));
        trailers.insert("grpc-status", HeaderValue::from_static("0"));
        capture.record_trailers(&trailers);

        h.finish(RequestResponse::begin(), vec![(Direction::Response, capture)], &Span::none());
        let seen = seen.lock();
        assert!(seen.contains_key("grpc-status"));
        assert!(!seen.contains_key("x-secret"));
    }
}
