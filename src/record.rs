//! The per-request correlation record handed to taps.

use std::fmt;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, Version};
use serde::ser::{SerializeMap, SerializeStruct};
use serde::{Serialize, Serializer};
use serde_json::Value;

/// Which half of the exchange a setting or a captured body belongs to.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Direction {
    Request,
    Response,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Request => "request",
            Self::Response => "response",
        })
    }
}

/// Everything observed about one proxied request/response pair.
///
/// Built in two passes (before forwarding, after the upstream answers), then
/// handed to the route's tap by shared reference.
///
/// The captured bodies are pooled buffers. They are valid for the duration of
/// [`Tap::serve`](crate::Tap::serve) only; a tap that needs the bytes later
/// must copy them.
#[derive(Debug)]
pub struct RequestResponse {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration: Duration,

    /// The `Host` the client asked for.
    pub host: String,
    /// The upstream URL the request was forwarded to.
    pub url: Uri,
    pub req_proto: String,
    pub method: Method,
    pub req_header: HeaderMap,
    pub req_trailer: HeaderMap,
    pub req_body: Option<BytesMut>,
    pub req_body_json: Option<Value>,

    pub status_code: u16,
    /// Status line text, e.g. `"200 OK"`.
    pub status: String,
    pub resp_proto: String,
    pub resp_header: HeaderMap,
    pub resp_trailer: HeaderMap,
    pub resp_body: Option<BytesMut>,
    pub resp_body_json: Option<Value>,

    started: Instant,
    ended: bool,
    // Content types as they appeared on the wire, before header filtering.
    pub(crate) req_content_type: Option<HeaderValue>,
    pub(crate) resp_content_type: Option<HeaderValue>,
}

impl RequestResponse {
    /// A fresh record with the start time stamped now.
    pub fn begin() -> Self {
        let start = Utc::now();
        Self {
            start,
            end: start,
            duration: Duration::ZERO,
            host: String::new(),
            url: Uri::default(),
            req_proto: String::new(),
            method: Method::GET,
            req_header: HeaderMap::new(),
            req_trailer: HeaderMap::new(),
            req_body: None,
            req_body_json: None,
            status_code: 0,
            status: String::new(),
            resp_proto: String::new(),
            resp_header: HeaderMap::new(),
            resp_trailer: HeaderMap::new(),
            resp_body: None,
            resp_body_json: None,
            started: Instant::now(),
            ended: false,
            req_content_type: None,
            resp_content_type: None,
        }
    }

    /// Stamps the end time and duration. Only the first call has an effect.
    pub(crate) fn stamp_end(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;
        self.duration = self.started.elapsed();
        self.end = self.start
            + chrono::Duration::from_std(self.duration).unwrap_or(chrono::Duration::zero());
    }

    pub(crate) fn set_status(&mut self, status: StatusCode) {
        self.status_code = status.as_u16();
        self.status = status_text(status);
    }

    pub fn path(&self) -> &str {
        self.url.path()
    }

    pub fn body(&self, direction: Direction) -> Option<&[u8]> {
        match direction {
            Direction::Request => self.req_body.as_deref(),
            Direction::Response => self.resp_body.as_deref(),
        }
    }

    pub fn body_json(&self, direction: Direction) -> Option<&Value> {
        match direction {
            Direction::Request => self.req_body_json.as_ref(),
            Direction::Response => self.resp_body_json.as_ref(),
        }
    }

    pub fn headers(&self, direction: Direction) -> &HeaderMap {
        match direction {
            Direction::Request => &self.req_header,
            Direction::Response => &self.resp_header,
        }
    }

    pub fn trailers(&self, direction: Direction) -> &HeaderMap {
        match direction {
            Direction::Request => &self.req_trailer,
            Direction::Response => &self.resp_trailer,
        }
    }

    pub(crate) fn body_json_mut(&mut self, direction: Direction) -> &mut Option<Value> {
        match direction {
            Direction::Request => &mut self.req_body_json,
            Direction::Response => &mut self.resp_body_json,
        }
    }

    pub(crate) fn body_slot(&mut self, direction: Direction) -> &mut Option<BytesMut> {
        match direction {
            Direction::Request => &mut self.req_body,
            Direction::Response => &mut self.resp_body,
        }
    }

    pub(crate) fn trailers_mut(&mut self, direction: Direction) -> &mut HeaderMap {
        match direction {
            Direction::Request => &mut self.req_trailer,
            Direction::Response => &mut self.resp_trailer,
        }
    }

    pub(crate) fn content_type(&self, direction: Direction) -> Option<&HeaderValue> {
        match direction {
            Direction::Request => self.req_content_type.as_ref(),
            Direction::Response => self.resp_content_type.as_ref(),
        }
    }
}

/// `HTTP/1.1`-style protocol string.
pub(crate) fn proto(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}

pub(crate) fn status_text(status: StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => format!("{} {reason}", status.as_str()),
        None => status.as_str().to_owned(),
    }
}

/// Decodes the first JSON value in `body`. Trailing bytes are ignored.
pub(crate) fn decode_json(body: &[u8]) -> Result<Value, serde_json::Error> {
    match serde_json::Deserializer::from_slice(body).into_iter::<Value>().next() {
        Some(value) => value,
        // Empty or whitespace-only: let the plain decoder report EOF.
        None => serde_json::from_slice(body),
    }
}

// ── Serialization ─────────────────────────────────────────────────────────────
//
// Templates see the record through serde. Header maps become name → value
// maps, bodies become (lossy) UTF-8 strings, the URL is broken into parts.

struct Headers<'a>(&'a HeaderMap);

impl Serialize for Headers<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.keys_len()))?;
        for name in self.0.keys() {
            let joined = self
                .0
                .get_all(name)
                .iter()
                .map(|v| String::from_utf8_lossy(v.as_bytes()))
                .collect::<Vec<_>>()
                .join(", ");
            map.serialize_entry(name.as_str(), &joined)?;
        }
        map.end()
    }
}

struct Url<'a>(&'a Uri);

impl Serialize for Url<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let uri = self.0;
        let mut s = serializer.serialize_struct("Url", 5)?;
        s.serialize_field("scheme", &uri.scheme_str().unwrap_or(""))?;
        s.serialize_field("host", &uri.authority().map(|a| a.as_str()).unwrap_or(""))?;
        s.serialize_field("path", uri.path())?;
        s.serialize_field("query", &uri.query().unwrap_or(""))?;
        s.serialize_field("full", &uri.to_string())?;
        s.end()
    }
}

fn lossy(body: &Option<BytesMut>) -> Option<String> {
    body.as_deref().map(|b| String::from_utf8_lossy(b).into_owned())
}

impl Serialize for RequestResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("RequestResponse", 18)?;
        s.serialize_field("start", &self.start)?;
        s.serialize_field("end", &self.end)?;
        s.serialize_field("duration_ms", &(self.duration.as_secs_f64() * 1000.0))?;
        s.serialize_field("host", &self.host)?;
        s.serialize_field("url", &Url(&self.url))?;
        s.serialize_field("req_proto", &self.req_proto)?;
        s.serialize_field("method", self.method.as_str())?;
        s.serialize_field("req_header", &Headers(&self.req_header))?;
        s.serialize_field("req_trailer", &Headers(&self.req_trailer))?;
        s.serialize_field("req_body", &lossy(&self.req_body))?;
        s.serialize_field("req_body_json", &self.req_body_json)?;
        s.serialize_field("status_code", &self.status_code)?;
        s.serialize_field("status", &self.status)?;
        s.serialize_field("resp_proto", &self.resp_proto)?;
        s.serialize_field("resp_header", &Headers(&self.resp_header))?;
        s.serialize_field("resp_trailer", &Headers(&self.resp_trailer))?;
        s.serialize_field("resp_body", &lossy(&self.resp_body))?;
        s.serialize_field("resp_body_json", &self.resp_body_json)?;
        s.end()
    }
}
