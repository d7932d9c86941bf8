//! Unified error type.

use std::time::Duration;

use crate::record::Direction;

/// The error type returned by wiretap's fallible operations.
///
/// Everything here is a setup-time or lifecycle failure. Request-time
/// problems (an upstream that refuses connections, a tap that panics, a body
/// that is not valid JSON) never surface as an `Error`: the client gets the
/// upstream's answer or a `502`, and the problem is logged.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Binding the listener or accepting a connection failed.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid listen address `{addr}`: {source}")]
    InvalidAddress {
        addr: String,
        source: std::net::AddrParseError,
    },

    #[error("invalid upstream `{url}`: {reason}")]
    InvalidUpstream { url: String, reason: String },

    #[error("invalid route pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("invalid header name `{0}`")]
    InvalidHeaderName(String),

    /// A JSON Patch document could not be decoded. Raised at registration,
    /// never while serving.
    #[error("invalid {direction} body patch: {source}")]
    InvalidPatch {
        direction: Direction,
        source: serde_json::Error,
    },

    #[error("invalid template: {0}")]
    InvalidTemplate(#[from] minijinja::Error),

    /// A [`TapOptions`](crate::TapOptions) combination that cannot work.
    #[error("invalid tap options: {0}")]
    InvalidOptions(String),

    #[error("config: {0}")]
    Config(String),

    /// In-flight requests did not drain within the shutdown window.
    #[error("shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Config(e.to_string())
    }
}
