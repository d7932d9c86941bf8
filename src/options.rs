//! Per-registration tap options.

use crate::error::Error;
use crate::headers::HeaderFilter;
use crate::patch::BodyPatch;
use crate::record::Direction;

/// Everything a route registration can switch on or off.
///
/// Build with struct-update syntax or the `with_*` helpers; the combination
/// is validated once, when the route is registered.
///
/// ```rust
/// use wiretap::TapOptions;
///
/// let opts = TapOptions::default()
///     .with_response_body(true)
///     .with_response_json(true)
///     .with_response_body_patch(r#"[{"op":"remove","path":"/token"}]"#)
///     .with_exclude_headers(["cookie"])
///     .with_log_attribute("team", "payments");
/// ```
#[derive(Clone, Debug, Default)]
pub struct TapOptions {
    pub include_headers: Vec<String>,
    pub exclude_headers: Vec<String>,
    pub capture_request_body: bool,
    pub capture_response_body: bool,
    /// Requires `capture_request_body`.
    pub decode_request_json: bool,
    /// Requires `capture_response_body`.
    pub decode_response_json: bool,
    /// Raw JSON Patch document. Requires `decode_request_json`.
    pub request_body_patch: Option<Vec<u8>>,
    /// Raw JSON Patch document. Requires `decode_response_json`.
    pub response_body_patch: Option<Vec<u8>>,
    /// Extra key/value pairs attached to this route's log output.
    pub log_attributes: Vec<(String, String)>,
}

impl TapOptions {
    pub fn with_include_headers<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include_headers = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_exclude_headers<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_headers = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_request_body(mut self, yes: bool) -> Self {
        self.capture_request_body = yes;
        self
    }

    pub fn with_response_body(mut self, yes: bool) -> Self {
        self.capture_response_body = yes;
        self
    }

    pub fn with_request_json(mut self, yes: bool) -> Self {
        self.decode_request_json = yes;
        self
    }

    pub fn with_response_json(mut self, yes: bool) -> Self {
        self.decode_response_json = yes;
        self
    }

    pub fn with_request_body_patch(mut self, doc: impl Into<Vec<u8>>) -> Self {
        self.request_body_patch = Some(doc.into());
        self
    }

    pub fn with_response_body_patch(mut self, doc: impl Into<Vec<u8>>) -> Self {
        self.response_body_patch = Some(doc.into());
        self
    }

    pub fn with_log_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.log_attributes.push((key.into(), value.into()));
        self
    }

    /// Capture and decode both bodies.
    pub fn capture_all() -> Self {
        Self {
            capture_request_body: true,
            capture_response_body: true,
            decode_request_json: true,
            decode_response_json: true,
            ..Self::default()
        }
    }

    /// Checks the combination without registering anything.
    pub fn validate(&self) -> Result<(), Error> {
        self.clone().compile().map(|_| ())
    }

    /// Validates the combination and decodes patch documents.
    pub(crate) fn compile(self) -> Result<RouteOptions, Error> {
        let filter = HeaderFilter::new(&self.include_headers, &self.exclude_headers)?;
        let request = DirectionOptions::compile(
            Direction::Request,
            self.capture_request_body,
            self.decode_request_json,
            self.request_body_patch.as_deref(),
        )?;
        let response = DirectionOptions::compile(
            Direction::Response,
            self.capture_response_body,
            self.decode_response_json,
            self.response_body_patch.as_deref(),
        )?;
        Ok(RouteOptions {
            filter,
            request,
            response,
            log_attributes: self.log_attributes,
        })
    }
}

// ── Compiled form ─────────────────────────────────────────────────────────────

#[derive(Debug)]
pub(crate) struct DirectionOptions {
    pub(crate) capture: bool,
    pub(crate) decode_json: bool,
    pub(crate) patch: Option<BodyPatch>,
}

impl DirectionOptions {
    fn compile(
        direction: Direction,
        capture: bool,
        decode_json: bool,
        patch: Option<&[u8]>,
    ) -> Result<Self, Error> {
        if decode_json && !capture {
            return Err(Error::InvalidOptions(format!(
                "{direction} JSON decoding needs {direction} body capture"
            )));
        }
        let patch = patch
            .map(|doc| BodyPatch::from_slice(doc).map_err(|source| Error::InvalidPatch { direction, source }))
            .transpose()?;
        if patch.is_some() && !decode_json {
            return Err(Error::InvalidOptions(format!(
                "{direction} body patch needs {direction} JSON decoding"
            )));
        }
        Ok(Self { capture, decode_json, patch })
    }
}

/// Validated options as the handler uses them.
#[derive(Debug)]
pub(crate) struct RouteOptions {
    pub(crate) filter: HeaderFilter,
    pub(crate) request: DirectionOptions,
    pub(crate) response: DirectionOptions,
    pub(crate) log_attributes: Vec<(String, String)>,
}

impl RouteOptions {
    /// Observe headers only: no capture, no decoding, no filter.
    pub(crate) fn passthrough() -> Self {
        let off = || DirectionOptions { capture: false, decode_json: false, patch: None };
        Self {
            filter: HeaderFilter::default(),
            request: off(),
            response: off(),
            log_attributes: Vec::new(),
        }
    }

    pub(crate) fn direction(&self, direction: Direction) -> &DirectionOptions {
        match direction {
            Direction::Request => &self.request,
            Direction::Response => &self.response,
        }
    }
}
