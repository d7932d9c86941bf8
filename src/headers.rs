//! Header filtering, redaction, and forwarding hygiene.
//!
//! Header names are compared as [`HeaderName`]s, which the `http` crate
//! stores lowercased. `Authorization`, `AUTHORIZATION` and `authorization`
//! are therefore one and the same name everywhere in this module.

use std::net::SocketAddr;

use http::header::{self, HeaderMap, HeaderName, HeaderValue};

use crate::error::Error;

/// Parses and canonicalizes a list of header names.
pub fn canonical_header_names<S: AsRef<str>>(names: &[S]) -> Result<Vec<HeaderName>, Error> {
    names
        .iter()
        .map(|n| {
            let n = n.as_ref().trim();
            HeaderName::from_bytes(n.as_bytes()).map_err(|_| Error::InvalidHeaderName(n.to_owned()))
        })
        .collect()
}

// ── HeaderFilter ──────────────────────────────────────────────────────────────

/// Decides which headers make it into the snapshot a tap sees.
///
/// An empty include list admits every header; a non-empty one admits only the
/// listed names. The exclude list is applied afterwards.
#[derive(Clone, Debug, Default)]
pub struct HeaderFilter {
    include: Vec<HeaderName>,
    exclude: Vec<HeaderName>,
}

impl HeaderFilter {
    pub fn new<S: AsRef<str>>(include: &[S], exclude: &[S]) -> Result<Self, Error> {
        let include = canonical_header_names(include)?;
        let exclude = canonical_header_names(exclude)?;

        if let Some(both) = include.iter().find(|n| exclude.contains(n)) {
            return Err(Error::InvalidOptions(format!(
                "header `{both}` is both included and excluded"
            )));
        }

        Ok(Self { include, exclude })
    }

    pub fn allows(&self, name: &HeaderName) -> bool {
        (self.include.is_empty() || self.include.contains(name)) && !self.exclude.contains(name)
    }

    /// Clones the admitted headers out of `headers`.
    pub fn snapshot(&self, headers: &HeaderMap) -> HeaderMap {
        if self.include.is_empty() && self.exclude.is_empty() {
            return headers.clone();
        }
        let mut out = HeaderMap::with_capacity(headers.len());
        for (name, value) in headers {
            if self.allows(name) {
                out.append(name.clone(), value.clone());
            }
        }
        out
    }
}

// ── Sensitive headers ─────────────────────────────────────────────────────────

/// Headers whose values are never written to logs, whatever a route's
/// include list says.
#[derive(Clone, Debug)]
pub struct Blocklist {
    names: Vec<HeaderName>,
}

impl Blocklist {
    pub fn new(names: Vec<HeaderName>) -> Self {
        Self { names }
    }

    pub fn is_blocked(&self, name: &HeaderName) -> bool {
        self.names.contains(name)
    }

    /// Adds more names to the list.
    pub fn extend<I: IntoIterator<Item = HeaderName>>(&mut self, names: I) {
        for name in names {
            if !self.names.contains(&name) {
                self.names.push(name);
            }
        }
    }
}

impl Default for Blocklist {
    fn default() -> Self {
        Self::new(vec![header::AUTHORIZATION, header::PROXY_AUTHORIZATION])
    }
}

// ── Content type ──────────────────────────────────────────────────────────────

/// Why a body was not treated as JSON. Never fatal: decoding is skipped.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ContentTypeError {
    #[error("no Content-Type header")]
    Missing,
    #[error("cannot parse Content-Type `{0}`")]
    Unparsable(String),
    #[error("expected application/json, got {0}")]
    NotJson(String),
}

/// Checks that a `Content-Type` value names exactly `application/json`.
/// Parameters such as `charset` must be well formed but are otherwise
/// ignored.
pub fn check_json(content_type: Option<&HeaderValue>) -> Result<(), ContentTypeError> {
    let raw = content_type.ok_or(ContentTypeError::Missing)?;
    let raw = raw.to_str().map_err(|_| {
        ContentTypeError::Unparsable(String::from_utf8_lossy(raw.as_bytes()).into_owned())
    })?;

    let (media_type, params) = raw.split_at(raw.find(';').unwrap_or(raw.len()));
    let media_type = media_type.trim();
    let Some((ty, subtype)) = media_type.split_once('/') else {
        return Err(ContentTypeError::Unparsable(raw.to_owned()));
    };
    if !is_token(ty) || !is_token(subtype) || !params_are_valid(params) {
        return Err(ContentTypeError::Unparsable(raw.to_owned()));
    }

    if ty.eq_ignore_ascii_case("application") && subtype.eq_ignore_ascii_case("json") {
        Ok(())
    } else {
        Err(ContentTypeError::NotJson(media_type.to_ascii_lowercase()))
    }
}

// RFC 9110 token characters.
fn is_token(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(is_token_byte)
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

// `; name=value` pairs with unique names, each value a token or a quoted
// string. One trailing `;` is tolerated.
fn params_are_valid(mut rest: &str) -> bool {
    let mut seen: Vec<&str> = Vec::new();
    loop {
        rest = rest.trim_start();
        let Some(param) = rest.strip_prefix(';') else {
            return rest.is_empty();
        };
        let param = param.trim_start();
        if param.is_empty() {
            return true;
        }
        let Some((name, value)) = param.split_once('=') else {
            return false;
        };
        let name = name.trim_end();
        if !is_token(name) || seen.iter().any(|s| s.eq_ignore_ascii_case(name)) {
            return false;
        }
        seen.push(name);
        match skip_param_value(value.trim_start()) {
            Some(after) => rest = after,
            None => return false,
        }
    }
}

/// What follows a parameter value, or `None` if there is no valid value.
fn skip_param_value(s: &str) -> Option<&str> {
    if let Some(quoted) = s.strip_prefix('"') {
        let mut escaped = false;
        for (i, c) in quoted.char_indices() {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => return Some(&quoted[i + 1..]),
                _ => {}
            }
        }
        return None;
    }
    let end = s.bytes().position(|b| !is_token_byte(b)).unwrap_or(s.len());
    (end > 0).then(|| &s[end..])
}

// ── Forwarding ────────────────────────────────────────────────────────────────

const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

pub(crate) fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers.contains_key(header::UPGRADE)
        && headers
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

/// Removes hop-by-hop headers, including any named in `Connection`.
///
/// With `keep_upgrade`, `Connection: upgrade` and `Upgrade` survive so the
/// upgrade handshake can reach the other side.
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap, keep_upgrade: bool) {
    let upgrade = headers.get(header::UPGRADE).cloned();

    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }

    // `TE: trailers` is the one TE value that may travel.
    let te_trailers = headers
        .get(header::TE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("trailers"));
    if !te_trailers {
        headers.remove(header::TE);
    }

    if keep_upgrade && let Some(upgrade) = upgrade {
        headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
        headers.insert(header::UPGRADE, upgrade);
    }
}

/// Sets `X-Forwarded-For` (appending the peer to any existing chain),
/// `X-Forwarded-Host` and `X-Forwarded-Proto`.
pub(crate) fn set_forwarded(headers: &mut HeaderMap, peer: SocketAddr, host: Option<&HeaderValue>) {
    const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
    const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
    const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

    let client_ip = peer.ip().to_string();
    let prior: Vec<&str> = headers
        .get_all(&X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    let chain = if prior.is_empty() {
        client_ip
    } else {
        format!("{}, {client_ip}", prior.join(", "))
    };
    if let Ok(value) = HeaderValue::from_str(&chain) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    match host {
        Some(host) => {
            headers.insert(X_FORWARDED_HOST, host.clone());
        }
        None => {
            headers.remove(X_FORWARDED_HOST);
        }
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
}
