//! Template-rendered audit output.
//!
//! The template is Jinja-style ([`minijinja`]) and sees two values:
//!
//! - `data`: the [`RequestResponse`], serialized (see its `Serialize` impl)
//! - `time`: the render time, RFC 3339
//!
//! ```text
//! {{ data.method }} {{ data.url.path }} -> {{ data.status_code }}
//! ```

use std::fmt;
use std::io::Write;
use std::str::FromStr;
use std::sync::Arc;

use bytes::BufMut;
use chrono::Utc;
use minijinja::{Environment, context};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info};

use crate::bufpool::BufferPool;
use crate::context::TapContext;
use crate::error::Error;
use crate::record::RequestResponse;
use crate::tap::Tap;

pub const DEFAULT_TEMPLATE: &str = "Time={{ data.start }}, Method={{ data.method }}, Host={{ data.host }}, \
     URL={{ data.url.scheme }}://{{ data.url.host }}{{ data.url.path }}{{ \"\\n\" }}";

const TEMPLATE_NAME: &str = "tap";

/// What a [`TemplateTap`] does with a rendered template.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Use the rendered text as is.
    #[default]
    Text,
    /// Parse the rendered text as JSON and log the value.
    Json,
}

impl FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(Error::Config(format!("unknown template output format `{other}`"))),
        }
    }
}

type Sink = Mutex<Box<dyn Write + Send>>;

/// Renders a template per request.
///
/// Without a sink the output is logged as an `"audit log"` event, the
/// rendered value in its `data` field and the group name in `group`. With one,
/// the rendered bytes (text format) or the compact JSON line (json format)
/// are written to it; each write holds the sink's lock, so outputs of
/// concurrent requests never interleave.
pub struct TemplateTap {
    env: Environment<'static>,
    format: OutputFormat,
    group: Option<String>,
    sink: Option<Sink>,
    pool: Arc<BufferPool>,
}

impl TemplateTap {
    /// Compiles `template`. Syntax errors surface here, not per request.
    pub fn new(template: impl Into<String>) -> Result<Self, Error> {
        let mut env = Environment::new();
        env.add_template_owned(TEMPLATE_NAME, template.into())?;
        Ok(Self {
            env,
            format: OutputFormat::Text,
            group: None,
            sink: None,
            pool: BufferPool::shared(),
        })
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Names the output: sink lines are nested under `group`, logged events
    /// carry it as their `group` field. Empty means no group.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        let group = group.into();
        self.group = (!group.is_empty()).then_some(group);
        self
    }

    pub fn with_sink<W: Write + Send + 'static>(mut self, sink: W) -> Self {
        self.sink = Some(Mutex::new(Box::new(sink)));
        self
    }

    pub fn with_buffer_pool(mut self, pool: Arc<BufferPool>) -> Self {
        self.pool = pool;
        self
    }

    fn render(&self, rr: &RequestResponse, out: &mut impl Write) -> Result<(), minijinja::Error> {
        let template = self.env.get_template(TEMPLATE_NAME)?;
        template.render_captured_to(context! { data => rr, time => Utc::now().to_rfc3339() }, out)?;
        Ok(())
    }

    fn emit(&self, cx: &TapContext<'_>, rendered: &[u8]) {
        match self.format {
            OutputFormat::Text => {
                if let Some(sink) = &self.sink {
                    write_locked(cx, sink, rendered);
                    return;
                }
                let text = String::from_utf8_lossy(rendered);
                info!(parent: cx.span(), group = self.group.as_deref(), data = %text, "audit log");
            }
            OutputFormat::Json => {
                let value: Value = match serde_json::from_slice(rendered) {
                    Ok(value) => value,
                    Err(e) => {
                        error!(parent: cx.span(), error = %e, "rendered template is not JSON");
                        return;
                    }
                };
                match &self.sink {
                    Some(sink) => {
                        let value = match &self.group {
                            Some(group) => serde_json::json!({ group: value }),
                            None => value,
                        };
                        let mut line = value.to_string().into_bytes();
                        line.push(b'\n');
                        write_locked(cx, sink, &line);
                    }
                    None => info!(parent: cx.span(), group = self.group.as_deref(), data = %value, "audit log"),
                }
            }
        }
    }
}

fn write_locked(cx: &TapContext<'_>, sink: &Sink, bytes: &[u8]) {
    let mut sink = sink.lock();
    if let Err(e) = sink.write_all(bytes).and_then(|()| sink.flush()) {
        error!(parent: cx.span(), error = %e, "cannot write template output");
    }
}

impl Tap for TemplateTap {
    fn serve(&self, cx: &TapContext<'_>, rr: &RequestResponse) {
        let mut out = self.pool.get().writer();
        let rendered = self.render(rr, &mut out);
        let buf = out.into_inner();

        match rendered {
            Ok(()) => self.emit(cx, &buf),
            Err(e) => error!(parent: cx.span(), error = %e, "cannot execute template"),
        }
        self.pool.put(buf);
    }
}

impl fmt::Debug for TemplateTap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemplateTap")
            .field("format", &self.format)
            .field("group", &self.group)
            .field("sink", &self.sink.is_some())
            .finish_non_exhaustive()
    }
}
