#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use wiretap::{Direction, RequestResponse, Router, Server, Tap, TapContext};

pub const WAIT: Duration = Duration::from_secs(5);

// ── Upstream ──────────────────────────────────────────────────────────────────

/// What the upstream received.
#[derive(Debug)]
pub struct Seen {
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A plain hyper server standing in for the proxied service.
///
/// - `/json` answers `{"token":"abc","a":1}` as `application/json; charset=utf-8`
/// - `/text` answers `{"a":1}` as `text/plain`
/// - anything else echoes the request body with the request's content type
pub struct Upstream {
    pub addr: SocketAddr,
    pub seen: mpsc::UnboundedReceiver<Seen>,
    task: JoinHandle<()>,
}

impl Upstream {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, seen) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { return };
                let tx = tx.clone();
                tokio::spawn(async move {
                    let svc = service_fn(move |req| answer(req, tx.clone()));
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), svc)
                        .await;
                });
            }
        });

        Self { addr, seen, task }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub async fn next_seen(&mut self) -> Seen {
        tokio::time::timeout(WAIT, self.seen.recv()).await.unwrap().unwrap()
    }
}

impl Drop for Upstream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn answer(req: Request<Incoming>, tx: mpsc::UnboundedSender<Seen>) -> Result<Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();
    let body = body.collect().await.map(|b| b.to_bytes()).unwrap_or_default();
    let path_and_query = parts.uri.path_and_query().map(ToString::to_string).unwrap_or_default();

    let resp = match parts.uri.path() {
        "/json" => Response::builder()
            .header("content-type", "application/json; charset=utf-8")
            .header("x-upstream", "yes")
            .body(Full::new(Bytes::from_static(br#"{"token":"abc","a":1}"#))),
        "/text" => Response::builder()
            .header("content-type", "text/plain")
            .body(Full::new(Bytes::from_static(br#"{"a":1}"#))),
        _ => {
            let mut builder = Response::builder().status(StatusCode::OK);
            if let Some(ct) = parts.headers.get("content-type") {
                builder = builder.header("content-type", ct);
            }
            builder.body(Full::new(body.clone()))
        }
    };

    let _ = tx.send(Seen {
        method: parts.method,
        path_and_query,
        headers: parts.headers,
        body,
    });
    Ok(resp.unwrap())
}

/// An address nothing listens on.
pub async fn closed_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

// ── Proxy ─────────────────────────────────────────────────────────────────────

pub struct Proxy {
    pub addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<(), wiretap::Error>>,
}

impl Proxy {
    pub async fn start(router: Router) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(Server::from_listener(listener).serve_with_shutdown(router, async {
            let _ = rx.await;
        }));
        Self { addr, stop: Some(stop), task }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub async fn stop(mut self) -> Result<(), wiretap::Error> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        tokio::time::timeout(WAIT, &mut self.task).await.unwrap().unwrap()
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ── Client ────────────────────────────────────────────────────────────────────

pub type HttpClient = Client<HttpConnector, Full<Bytes>>;

pub fn client() -> HttpClient {
    Client::builder(TokioExecutor::new()).build_http()
}

pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub async fn send(client: &HttpClient, req: Request<Full<Bytes>>) -> Reply {
    let resp = tokio::time::timeout(WAIT, client.request(req)).await.unwrap().unwrap();
    let (parts, body) = resp.into_parts();
    let body = body.collect().await.unwrap().to_bytes();
    Reply { status: parts.status, headers: parts.headers, body }
}

pub async fn get(client: &HttpClient, url: &str) -> Reply {
    let req = Request::get(url).body(Full::new(Bytes::new())).unwrap();
    send(client, req).await
}

pub async fn post(client: &HttpClient, url: &str, content_type: &str, body: &'static [u8]) -> Reply {
    let req = Request::post(url)
        .header("content-type", content_type)
        .body(Full::new(Bytes::from_static(body)))
        .unwrap();
    send(client, req).await
}

// ── Tap observation ───────────────────────────────────────────────────────────

/// An owned copy of what a tap was shown. Captured bodies are pooled and
/// only valid during the call, hence the copy.
#[derive(Debug)]
pub struct Observed {
    pub route: String,
    pub host: String,
    pub method: Method,
    pub url: String,
    pub status_code: u16,
    pub status: String,
    pub req_header: HeaderMap,
    pub resp_header: HeaderMap,
    pub req_body: Option<Vec<u8>>,
    pub resp_body: Option<Vec<u8>>,
    pub req_json: Option<Value>,
    pub resp_json: Option<Value>,
}

impl Observed {
    fn from_record(cx: &TapContext<'_>, rr: &RequestResponse) -> Self {
        Self {
            route: cx.route().to_owned(),
            host: rr.host.clone(),
            method: rr.method.clone(),
            url: rr.url.to_string(),
            status_code: rr.status_code,
            status: rr.status.clone(),
            req_header: rr.req_header.clone(),
            resp_header: rr.resp_header.clone(),
            req_body: rr.body(Direction::Request).map(<[u8]>::to_vec),
            resp_body: rr.body(Direction::Response).map(<[u8]>::to_vec),
            req_json: rr.body_json(Direction::Request).cloned(),
            resp_json: rr.body_json(Direction::Response).cloned(),
        }
    }
}

/// Forwards an [`Observed`] copy of every record to a channel.
#[derive(Clone)]
pub struct ChannelTap(mpsc::UnboundedSender<Observed>);

impl ChannelTap {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Observed>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }
}

impl Tap for ChannelTap {
    fn serve(&self, cx: &TapContext<'_>, rr: &RequestResponse) {
        let _ = self.0.send(Observed::from_record(cx, rr));
    }
}

pub async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap()
}

/// Fails if anything arrives within a short grace period.
pub async fn nothing_more<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>) {
    if let Ok(Some(extra)) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
        panic!("unexpected tap call: {extra:?}");
    }
}
