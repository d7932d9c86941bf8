//! Declarative proxy configuration.
//!
//! ```yaml
//! listenAddress: 0.0.0.0:8080
//! upstream: http://127.0.0.1:18080
//! upstreamTimeout: 10s
//! header:
//!   exclude: [cookie]
//! taps:
//!   - name: orders
//!     patterns: ["GET /orders/{id}", "POST /orders"]
//!     logTap:
//!       level: info
//!     response:
//!       body: true
//!       bodyJSON: true
//!       bodyPatch:
//!         - { op: remove, path: /token }
//! ```

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::{Level, info};

use crate::error::Error;
use crate::handler::DEFAULT_UPSTREAM_TIMEOUT;
use crate::options::TapOptions;
use crate::router::Router;
use crate::server::{DEFAULT_SHUTDOWN_TIMEOUT, Server};
use crate::tap::BoxedTap;
use crate::tap::log::LogTap;
use crate::tap::multi::MultiTap;
use crate::tap::template::{DEFAULT_TEMPLATE, OutputFormat, TemplateTap};

fn default_listen_address() -> String {
    "0.0.0.0:8080".to_owned()
}

fn default_upstream_timeout() -> Duration {
    DEFAULT_UPSTREAM_TIMEOUT
}

fn default_shutdown_timeout() -> Duration {
    DEFAULT_SHUTDOWN_TIMEOUT
}

fn default_template() -> String {
    DEFAULT_TEMPLATE.to_owned()
}

fn default_log_level() -> String {
    "info".to_owned()
}

/// Top-level configuration document.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    /// `host:port`. A bare `:port` listens on every interface.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    pub upstream: String,

    #[serde(default = "default_upstream_timeout", with = "humantime_serde")]
    pub upstream_timeout: Duration,

    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Header lists used by taps that do not set their own.
    #[serde(default)]
    pub header: HeaderConfig,

    #[serde(default)]
    pub taps: Vec<TapConfig>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    /// An `EnvFilter` directive, e.g. `info` or `wiretap=debug`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Where the process log goes. Standard output when unset.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { log_level: default_log_level(), log_file: None }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct HeaderConfig {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl HeaderConfig {
    fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }
}

/// One registration: a set of patterns and the taps serving them.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TapConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub header: Option<HeaderConfig>,
    #[serde(default)]
    pub log_tap: Option<LogTapConfig>,
    #[serde(default)]
    pub template_tap: Option<TemplateTapConfig>,
    #[serde(default, alias = "requestIn")]
    pub request: Option<BodyConfig>,
    #[serde(default)]
    pub response: Option<BodyConfig>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogTapConfig {
    /// `trace` to `error`; defaults to `info`.
    #[serde(default)]
    pub level: Option<String>,
    /// Append JSON lines to this file instead of logging through `tracing`.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateTapConfig {
    #[serde(default = "default_template")]
    pub template: String,
    #[serde(default)]
    pub format: OutputFormat,
    #[serde(default)]
    pub group: String,
    /// Append rendered output to this file instead of logging it.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for TemplateTapConfig {
    fn default() -> Self {
        Self {
            template: default_template(),
            format: OutputFormat::default(),
            group: String::new(),
            log_file: None,
        }
    }
}

/// Capture settings for one direction.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BodyConfig {
    #[serde(default)]
    pub body: bool,
    #[serde(default, rename = "bodyJSON")]
    pub body_json: bool,
    /// JSON Patch operations (RFC 6902) applied to the decoded body.
    #[serde(default)]
    pub body_patch: Vec<Value>,
}

impl BodyConfig {
    fn patch_document(&self) -> Result<Option<Vec<u8>>, Error> {
        if self.body_patch.is_empty() {
            return Ok(None);
        }
        serde_json::to_vec(&self.body_patch)
            .map(Some)
            .map_err(|e| Error::Config(format!("cannot encode body patch: {e}")))
    }
}

impl ProxyConfig {
    pub fn from_yaml(text: &str) -> Result<Self, Error> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// A router with every configured tap registered.
    pub fn build_router(&self) -> Result<Router, Error> {
        let mut router = Router::new(&self.upstream)?.with_upstream_timeout(self.upstream_timeout);
        if self.taps.is_empty() {
            info!("no taps configured");
        }
        for (index, tap) in self.taps.iter().enumerate() {
            let name = if tap.name.is_empty() { format!("#{index}") } else { tap.name.clone() };
            if tap.patterns.is_empty() {
                return Err(Error::Config(format!("tap `{name}` has no patterns")));
            }
            let built = build_tap(&name, tap)?;
            let options = self.tap_options(tap)?;
            info!(tap = %name, patterns = ?tap.patterns, "adding tap");
            router.register(&tap.patterns, built, options)?;
        }
        Ok(router)
    }

    /// A server bound to `listen_address` with the configured shutdown window.
    pub fn server(&self) -> Result<Server, Error> {
        let addr = match self.listen_address.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{port}"),
            None => self.listen_address.clone(),
        };
        Ok(Server::bind(&addr)?.with_shutdown_timeout(self.shutdown_timeout))
    }

    fn tap_options(&self, tap: &TapConfig) -> Result<TapOptions, Error> {
        let header = match &tap.header {
            Some(h) if !h.is_empty() => h,
            _ => &self.header,
        };
        let mut opts = TapOptions::default()
            .with_include_headers(header.include.iter().cloned())
            .with_exclude_headers(header.exclude.iter().cloned());
        if !tap.name.is_empty() {
            opts = opts.with_log_attribute("tap", tap.name.clone());
        }
        if let Some(req) = &tap.request {
            opts = opts.with_request_body(req.body).with_request_json(req.body_json);
            if let Some(doc) = req.patch_document()? {
                opts = opts.with_request_body_patch(doc);
            }
        }
        if let Some(resp) = &tap.response {
            opts = opts.with_response_body(resp.body).with_response_json(resp.body_json);
            if let Some(doc) = resp.patch_document()? {
                opts = opts.with_response_body_patch(doc);
            }
        }
        Ok(opts)
    }
}

fn build_tap(name: &str, tap: &TapConfig) -> Result<BoxedTap, Error> {
    let mut taps: Vec<BoxedTap> = Vec::new();

    if let Some(log) = &tap.log_tap {
        let level = match log.level.as_deref() {
            None | Some("") => Level::INFO,
            Some(level) => level
                .parse()
                .map_err(|_| Error::Config(format!("tap `{name}`: unknown log level `{level}`")))?,
        };
        let mut log_tap = LogTap::new(level);
        if let Some(path) = &log.log_file {
            log_tap = log_tap.with_sink(append(path)?);
        }
        taps.push(Arc::new(log_tap));
    }

    if let Some(cfg) = &tap.template_tap {
        let mut template = TemplateTap::new(cfg.template.clone())?
            .with_format(cfg.format)
            .with_group(cfg.group.clone());
        if let Some(path) = &cfg.log_file {
            template = template.with_sink(append(path)?);
        }
        taps.push(Arc::new(template));
    }

    match taps.len() {
        0 => Err(Error::Config(format!("tap `{name}` configures no tap kind"))),
        1 => Ok(taps.remove(0)),
        _ => Ok(Arc::new(MultiTap::new(taps))),
    }
}

fn append(path: &Path) -> Result<File, Error> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}
