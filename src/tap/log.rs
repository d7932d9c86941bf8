//! Structured audit logging.

use std::fmt;
use std::io::Write;
use std::sync::Arc;

use chrono::Utc;
use http::HeaderMap;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{Level, error};

use crate::context::TapContext;
use crate::headers::{Blocklist, check_json};
use crate::record::{Direction, RequestResponse, decode_json};
use crate::tap::Tap;

/// Emits one `tracing` event per request, message `"upstream called"`,
/// target `wiretap::tap`.
///
/// Header values on the [`Blocklist`] never reach the log, whatever the
/// route's header filter admitted. Each attribute group (the four header
/// and trailer groups, the decoded bodies, the extra route attributes) is
/// its own field; see [`LogTap::attributes`] for the same set as one map.
///
/// With a sink the event is not sent to `tracing`. Instead one JSON line
/// (`time`, `level`, `msg` and the attributes, nested as they are) is
/// appended to the sink under its lock.
#[derive(Clone)]
pub struct LogTap {
    level: Level,
    blocked: Blocklist,
    sink: Option<Arc<Mutex<Box<dyn Write + Send>>>>,
}

impl LogTap {
    pub fn new(level: Level) -> Self {
        Self { level, blocked: Blocklist::default(), sink: None }
    }

    pub fn with_blocklist(mut self, blocked: Blocklist) -> Self {
        self.blocked = blocked;
        self
    }

    pub fn with_sink<W: Write + Send + 'static>(mut self, sink: W) -> Self {
        self.sink = Some(Arc::new(Mutex::new(Box::new(sink))));
        self
    }

    pub fn level(&self) -> Level {
        self.level
    }

    /// The attribute set one event carries.
    pub fn attributes(&self, cx: &TapContext<'_>, rr: &RequestResponse) -> Map<String, Value> {
        let mut attrs = Map::new();
        attrs.insert("host".into(), rr.host.clone().into());
        attrs.insert("method".into(), rr.method.as_str().into());
        attrs.insert("path".into(), rr.path().into());
        attrs.insert("url".into(), rr.url.to_string().into());
        attrs.insert("status".into(), rr.status.clone().into());
        attrs.insert("duration_ms".into(), (rr.duration.as_secs_f64() * 1000.0).into());
        attrs.insert("request_header".into(), self.header_group(&rr.req_header));
        attrs.insert("request_trailer".into(), self.header_group(&rr.req_trailer));
        attrs.insert("response_header".into(), self.header_group(&rr.resp_header));
        attrs.insert("response_trailer".into(), self.header_group(&rr.resp_trailer));

        if let Some(body) = body_json(rr, Direction::Request) {
            attrs.insert("request_body_json".into(), body);
        }
        if let Some(body) = body_json(rr, Direction::Response) {
            attrs.insert("response_body_json".into(), body);
        }

        if !cx.route().is_empty() {
            attrs.insert("route".into(), cx.route().into());
        }
        for (key, value) in cx.attributes() {
            attrs.insert(key.clone(), value.clone().into());
        }
        attrs
    }

    fn header_group(&self, headers: &HeaderMap) -> Value {
        let mut group = Map::new();
        for name in headers.keys() {
            if self.blocked.is_blocked(name) {
                continue;
            }
            let joined = headers
                .get_all(name)
                .iter()
                .map(|v| String::from_utf8_lossy(v.as_bytes()))
                .collect::<Vec<_>>()
                .join(", ");
            group.insert(name.as_str().to_owned(), joined.into());
        }
        Value::Object(group)
    }

    fn write_line(&self, cx: &TapContext<'_>, sink: &Mutex<Box<dyn Write + Send>>, attrs: Map<String, Value>) {
        let mut entry = Map::new();
        entry.insert("time".into(), Utc::now().to_rfc3339().into());
        entry.insert("level".into(), self.level.as_str().into());
        entry.insert("msg".into(), "upstream called".into());
        entry.extend(attrs);

        let mut line = match serde_json::to_vec(&entry) {
            Ok(line) => line,
            Err(e) => {
                error!(parent: cx.span(), error = %e, "cannot encode log line");
                return;
            }
        };
        line.push(b'\n');

        let mut sink = sink.lock();
        if let Err(e) = sink.write_all(&line).and_then(|()| sink.flush()) {
            error!(parent: cx.span(), error = %e, "cannot write log line");
        }
    }
}

impl fmt::Debug for LogTap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogTap")
            .field("level", &self.level)
            .field("blocked", &self.blocked)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

impl Default for LogTap {
    fn default() -> Self {
        Self::new(Level::INFO)
    }
}

/// The decoded body, or a decode of the captured bytes when the route only
/// captured them.
fn body_json(rr: &RequestResponse, direction: Direction) -> Option<Value> {
    if let Some(value) = rr.body_json(direction) {
        return Some(value.clone());
    }
    let body = rr.body(direction).filter(|b| !b.is_empty())?;
    check_json(rr.content_type(direction)).ok()?;
    decode_json(body).ok()
}

/// One field per attribute group. `tracing` records field values as
/// scalars, so each group lands as its own compact JSON text.
struct Fields {
    url: String,
    duration_ms: f64,
    request_header: Value,
    request_trailer: Value,
    response_header: Value,
    response_trailer: Value,
    request_body_json: Option<Value>,
    response_body_json: Option<Value>,
    extra: Option<Value>,
}

impl Fields {
    fn split(mut attrs: Map<String, Value>) -> Self {
        let mut take = |key: &str| attrs.remove(key).unwrap_or(Value::Null);
        let url = take("url").as_str().unwrap_or_default().to_owned();
        let duration_ms = take("duration_ms").as_f64().unwrap_or_default();
        let request_header = take("request_header");
        let request_trailer = take("request_trailer");
        let response_header = take("response_header");
        let response_trailer = take("response_trailer");
        let request_body_json = attrs.remove("request_body_json");
        let response_body_json = attrs.remove("response_body_json");
        for key in ["host", "method", "path", "status", "route"] {
            attrs.remove(key);
        }
        Self {
            url,
            duration_ms,
            request_header,
            request_trailer,
            response_header,
            response_trailer,
            request_body_json,
            response_body_json,
            extra: (!attrs.is_empty()).then_some(Value::Object(attrs)),
        }
    }
}

// `tracing` needs the level at the call site.
macro_rules! emit {
    ($level:expr, $cx:expr, $rr:expr, $fields:expr) => {{
        let fields = &$fields;
        let route = Some($cx.route()).filter(|r| !r.is_empty());
        tracing::event!(
            target: "wiretap::tap",
            parent: $cx.span(),
            $level,
            host = %$rr.host,
            method = %$rr.method,
            path = $rr.path(),
            url = fields.url.as_str(),
            status = $rr.status_code,
            duration_ms = fields.duration_ms,
            request_header = %fields.request_header,
            request_trailer = %fields.request_trailer,
            response_header = %fields.response_header,
            response_trailer = %fields.response_trailer,
            request_body_json = fields.request_body_json.as_ref().map(tracing::field::display),
            response_body_json = fields.response_body_json.as_ref().map(tracing::field::display),
            route = route,
            attrs = fields.extra.as_ref().map(tracing::field::display),
            "upstream called"
        )
    }};
}

impl Tap for LogTap {
    fn serve(&self, cx: &TapContext<'_>, rr: &RequestResponse) {
        let attrs = self.attributes(cx, rr);
        if let Some(sink) = &self.sink {
            self.write_line(cx, sink, attrs);
            return;
        }
        let fields = Fields::split(attrs);
        match self.level {
            Level::ERROR => emit!(Level::ERROR, cx, rr, fields),
            Level::WARN => emit!(Level::WARN, cx, rr, fields),
            Level::INFO => emit!(Level::INFO, cx, rr, fields),
            Level::DEBUG => emit!(Level::DEBUG, cx, rr, fields),
            _ => emit!(Level::TRACE, cx, rr, fields),
        }
    }
}
