mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::*;
use http::{Method, Request, StatusCode};
use http_body_util::Full;
use parking_lot::Mutex;
use serde_json::json;
use wiretap::{
    BufferPool, FnTap, LogTap, MultiTap, RequestResponse, Router, TapContext, TapOptions, TemplateTap,
};

#[tokio::test]
async fn forwards_bytes_unchanged_whatever_is_captured() {
    let mut upstream = Upstream::start().await;
    let (tap, mut taps) = ChannelTap::new();

    let mut router = Router::new(&upstream.url()).unwrap();
    router
        .register(
            &["POST /captured"],
            tap.clone(),
            TapOptions::capture_all()
                .with_request_body_patch(r#"[{"op":"remove","path":"/card"}]"#)
                .with_response_body_patch(r#"[{"op":"replace","path":"/item","value":"redacted"}]"#),
        )
        .unwrap();
    router.register(&["POST /plain"], tap, TapOptions::default()).unwrap();
    let proxy = Proxy::start(router).await;
    let client = client();

    let payload: &'static [u8] = br#"{"item":"book","card":"4111"}"#;
    for path in ["/captured", "/plain"] {
        let reply = post(&client, &proxy.url(path), "application/json", payload).await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.body, Bytes::from_static(payload), "{path}: client bytes");
        assert_eq!(upstream.next_seen().await.body, Bytes::from_static(payload), "{path}: upstream bytes");
    }

    let (mut first, mut second) = (next(&mut taps).await, next(&mut taps).await);
    if first.route != "POST /captured" {
        std::mem::swap(&mut first, &mut second);
    }
    let (captured, plain) = (first, second);
    assert_eq!(captured.req_body.as_deref(), Some(payload));
    assert_eq!(captured.resp_body.as_deref(), Some(payload));
    assert_eq!(captured.req_json, Some(json!({"item": "book"})));
    assert_eq!(captured.resp_json, Some(json!({"item": "redacted", "card": "4111"})));

    assert_eq!(plain.route, "POST /plain");
    assert!(plain.req_body.is_none() && plain.resp_body.is_none());

    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn oversized_capture_buffers_are_not_retained() {
    let upstream = Upstream::start().await;
    let (tap, mut taps) = ChannelTap::new();
    let pool = Arc::new(BufferPool::with_limits(1024, 16));

    let mut router = Router::new(&upstream.url()).unwrap().with_buffer_pool(Arc::clone(&pool));
    router
        .register(&["/"], tap, TapOptions::default().with_request_body(true))
        .unwrap();
    let proxy = Proxy::start(router).await;
    let client = client();

    let big = Bytes::from(vec![b'x'; 64 * 1024]);
    let req = Request::post(proxy.url("/upload")).body(Full::new(big.clone())).unwrap();
    let reply = send(&client, req).await;
    assert_eq!(reply.body, big);
    assert_eq!(next(&mut taps).await.req_body.map(|b| b.len()), Some(big.len()));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pool.retained(), 0);

    post(&client, &proxy.url("/small"), "text/plain", b"hi").await;
    next(&mut taps).await;
    let deadline = tokio::time::Instant::now() + WAIT;
    while pool.retained() == 0 {
        assert!(tokio::time::Instant::now() < deadline, "small buffer never returned");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(pool.retained(), 1);
}

#[tokio::test]
async fn every_tap_runs_once_in_order_when_one_panics() {
    let upstream = Upstream::start().await;
    let calls = Arc::new(Mutex::new(Vec::new()));
    let (tap, mut taps) = ChannelTap::new();

    let record = |id: &'static str| {
        let calls = Arc::clone(&calls);
        FnTap(move |_: &TapContext<'_>, _: &RequestResponse| calls.lock().push(id))
    };
    let multi = MultiTap::default()
        .with(record("first"))
        .with(FnTap(broken))
        .with(record("third"))
        .with(tap);

    let mut router = Router::new(&upstream.url()).unwrap();
    router.register(&["GET /"], multi, TapOptions::default()).unwrap();
    let proxy = Proxy::start(router).await;
    let client = client();

    let reply = get(&client, &proxy.url("/anything")).await;
    assert_eq!(reply.status, StatusCode::OK);

    next(&mut taps).await;
    assert_eq!(*calls.lock(), vec!["first", "third"]);
    nothing_more(&mut taps).await;
}

#[tokio::test]
async fn blocked_headers_never_reach_log_attributes() {
    let mut upstream = Upstream::start().await;
    let (tx, mut attrs) = tokio::sync::mpsc::unbounded_channel();
    let log = LogTap::default();

    let mut router = Router::new(&upstream.url()).unwrap();
    router
        .register(
            &["/"],
            FnTap(move |cx: &TapContext<'_>, rr: &RequestResponse| {
                let _ = tx.send(serde_json::Value::Object(log.attributes(cx, rr)).to_string());
            }),
            TapOptions::default(),
        )
        .unwrap();
    let proxy = Proxy::start(router).await;
    let client = client();

    let req = Request::get(proxy.url("/"))
        .header("AUTHORIZATION", "Bearer s3cr3t")
        .header("x-request-id", "r-1")
        .body(Full::new(Bytes::new()))
        .unwrap();
    send(&client, req).await;

    // Forwarded as is, just never logged.
    assert_eq!(upstream.next_seen().await.headers["authorization"], "Bearer s3cr3t");
    let logged = next(&mut attrs).await;
    assert!(!logged.contains("s3cr3t"), "{logged}");
    assert!(logged.contains("r-1"), "{logged}");
}

#[tokio::test]
async fn json_is_decoded_only_for_json_content_types() {
    let upstream = Upstream::start().await;
    let (tap, mut taps) = ChannelTap::new();

    let mut router = Router::new(&upstream.url()).unwrap();
    router
        .register(
            &["GET /"],
            tap,
            TapOptions::default().with_response_body(true).with_response_json(true),
        )
        .unwrap();
    let proxy = Proxy::start(router).await;
    let client = client();

    let reply = get(&client, &proxy.url("/json")).await;
    assert_eq!(reply.body, Bytes::from_static(br#"{"token":"abc","a":1}"#));
    let json = next(&mut taps).await;
    assert_eq!(json.resp_json, Some(json!({"token": "abc", "a": 1})));
    assert_eq!(json.resp_body.as_deref(), Some(&br#"{"token":"abc","a":1}"#[..]));

    get(&client, &proxy.url("/text")).await;
    let text = next(&mut taps).await;
    assert!(text.resp_json.is_none());
    assert_eq!(text.resp_body.as_deref(), Some(&br#"{"a":1}"#[..]));
}

#[tokio::test]
async fn request_body_is_not_captured_unless_asked() {
    let mut upstream = Upstream::start().await;
    let (tap, mut taps) = ChannelTap::new();

    let mut router = Router::new(&upstream.url()).unwrap();
    router.register(&["POST /"], tap, TapOptions::default()).unwrap();
    let proxy = Proxy::start(router).await;
    let client = client();

    post(&client, &proxy.url("/submit"), "text/plain", b"hello").await;

    assert_eq!(upstream.next_seen().await.body, Bytes::from_static(b"hello"));
    let seen = next(&mut taps).await;
    assert_eq!(seen.method, Method::POST);
    assert!(seen.req_body.is_none());
    assert!(seen.req_json.is_none());
}

#[tokio::test]
async fn unregistered_proxy_still_forwards_everything() {
    let mut upstream = Upstream::start().await;
    let proxy = Proxy::start(Router::new(&upstream.url()).unwrap()).await;
    let client = client();

    let replies = join_all(
        (0..8)
            .map(|i| {
                let client = client.clone();
                let url = proxy.url(&format!("/any/{i}"));
                tokio::spawn(async move { get(&client, &url).await.status })
            })
            .collect(),
    )
    .await;
    assert!(replies.iter().all(|s| *s == StatusCode::OK));

    for _ in 0..8 {
        assert!(upstream.next_seen().await.path_and_query.starts_with("/any/"));
    }
}

#[tokio::test]
async fn template_output_is_one_contiguous_block_per_request() {
    let upstream = Upstream::start().await;
    let sink = SharedSink::default();
    let (tap, mut taps) = ChannelTap::new();

    let template = TemplateTap::new(
        "begin {{ data.url.path }}\n{% for i in range(20) %}{{ data.url.path }} {{ i }}\n{% endfor %}end {{ data.url.path }}{{ \"\\n\" }}",
    )
    .unwrap()
    .with_sink(sink.clone());

    let mut router = Router::new(&upstream.url()).unwrap();
    router
        .register(&["/"], MultiTap::default().with(template).with(tap), TapOptions::default())
        .unwrap();
    let proxy = Proxy::start(router).await;
    let client = client();

    let requests = 16;
    join_all(
        (0..requests)
            .map(|i| {
                let client = client.clone();
                let url = proxy.url(&format!("/r{i}"));
                tokio::spawn(async move { get(&client, &url).await.status })
            })
            .collect(),
    )
    .await;
    for _ in 0..requests {
        next(&mut taps).await;
    }

    let text = sink.text();
    let mut lines = text.lines();
    let mut blocks = 0;
    while let Some(first) = lines.next() {
        let path = first.strip_prefix("begin ").unwrap();
        for i in 0..20 {
            assert_eq!(lines.next(), Some(format!("{path} {i}").as_str()));
        }
        assert_eq!(lines.next(), Some(format!("end {path}").as_str()));
        blocks += 1;
    }
    assert_eq!(blocks, requests);
}

#[tokio::test]
async fn forwarding_preserves_host_and_adds_forwarded_headers() {
    let mut upstream = Upstream::start().await;
    let (tap, mut taps) = ChannelTap::new();

    let mut router = Router::new(&format!("{}/base?fixed=1", upstream.url())).unwrap();
    router
        .register(&["GET /orders/{id}"], tap, TapOptions::default().with_exclude_headers(["x-private"]))
        .unwrap();
    let proxy = Proxy::start(router).await;
    let client = client();

    let req = Request::get(proxy.url("/orders/7?expand=items"))
        .header("host", "shop.example")
        .header("x-private", "p")
        .header("keep-alive", "timeout=5")
        .body(Full::new(Bytes::new()))
        .unwrap();
    send(&client, req).await;

    let seen = upstream.next_seen().await;
    assert_eq!(seen.path_and_query, "/base/orders/7?fixed=1&expand=items");
    assert_eq!(seen.headers["host"], "shop.example");
    assert_eq!(seen.headers["x-forwarded-host"], "shop.example");
    assert_eq!(seen.headers["x-forwarded-for"], "127.0.0.1");
    assert_eq!(seen.headers["x-forwarded-proto"], "http");
    assert_eq!(seen.headers["x-private"], "p");
    assert!(!seen.headers.contains_key("keep-alive"));

    let observed = next(&mut taps).await;
    assert_eq!(observed.route, "GET /orders/{id}");
    assert_eq!(observed.host, "shop.example");
    assert_eq!(observed.url, format!("{}/base/orders/7?fixed=1&expand=items", upstream.url()));
    assert!(!observed.req_header.contains_key("x-private"));
    assert_eq!(observed.status, "200 OK");
}

#[tokio::test]
async fn head_requests_use_get_routes() {
    let upstream = Upstream::start().await;
    let (tap, mut taps) = ChannelTap::new();

    let mut router = Router::new(&upstream.url()).unwrap();
    router.register(&["GET /json"], tap, TapOptions::default()).unwrap();
    let proxy = Proxy::start(router).await;
    let client = client();

    let req = Request::head(proxy.url("/json")).body(Full::new(Bytes::new())).unwrap();
    let reply = send(&client, req).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert!(reply.body.is_empty());

    let seen = next(&mut taps).await;
    assert_eq!(seen.method, Method::HEAD);
    assert_eq!(seen.route, "GET /json");
}

// ── helpers ───────────────────────────────────────────────────────────────────

fn broken(_: &TapContext<'_>, _: &RequestResponse) {
    panic!("broken tap");
}

async fn join_all<T: Send + 'static>(handles: Vec<tokio::task::JoinHandle<T>>) -> Vec<T> {
    let mut out = Vec::with_capacity(handles.len());
    for handle in handles {
        out.push(tokio::time::timeout(WAIT, handle).await.unwrap().unwrap());
    }
    out
}

#[derive(Clone, Default)]
struct SharedSink(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SharedSink {
    fn text(&self) -> String {
        String::from_utf8(self.0.lock().clone()).unwrap()
    }
}
