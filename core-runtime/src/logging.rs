//! # Tracing Setup
//!
//! One subscriber for the whole streaming core: an output layer in the chosen
//! [`LogFormat`], an [`EnvFilter`] that keeps our crates at the configured
//! level and HTTP plumbing at `warn`, and an optional layer that mirrors every
//! surviving event to the host's [`LoggerSink`].
//!
//! Download and cache code logs signed CDN URLs and absolute cache paths.
//! Call sites pass them through [`redact_url`] and [`strip_path`]; the host
//! layer additionally masks fields by name before they leave the process.
//!
//! ```ignore
//! let config = LoggingConfig::default()
//!     .with_level(LogLevel::Debug)
//!     .with_sink(Arc::new(ConsoleLogger::default()))
//!     .with_env_overrides()?;
//! init_logging(config)?;
//! ```

use crate::error::{Error, Result};

use bridge_traits::time::{LogEntry, LogLevel, LoggerSink};

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Overrides the filter directives, e.g. `core_streaming::download=trace`.
pub const FILTER_ENV: &str = "STREAMING_LOG";
/// Overrides the output format: `pretty`, `json` or `compact`.
pub const FORMAT_ENV: &str = "STREAMING_LOG_FORMAT";

const CORE_TARGETS: &[&str] = &[
    "streaming_workspace",
    "core_runtime",
    "core_streaming",
    "bridge_desktop",
];
const HTTP_TARGETS: &[&str] = &["hyper", "hyper_util", "h2", "reqwest", "rustls"];

const REDACTED: &str = "[REDACTED]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, colored. Default in debug builds.
    Pretty,
    /// One flattened JSON object per event. Default in release builds.
    Json,
    Compact,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Pretty => "pretty",
            LogFormat::Json => "json",
            LogFormat::Compact => "compact",
        }
    }
}

impl Default for LogFormat {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            LogFormat::Pretty
        } else {
            LogFormat::Json
        }
    }
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            "compact" => Ok(LogFormat::Compact),
            other => Err(Error::Config(format!("Unknown log format: {other}"))),
        }
    }
}

/// How the subscriber is assembled. Build with the `with_*` methods and hand
/// to [`init_logging`].
#[derive(Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Level for the core's own crates when no custom filter is set.
    pub level: LogLevel,
    /// Full `EnvFilter` directives, replacing the level-based default.
    pub filter: Option<String>,
    /// Mask fields forwarded to the sink by name.
    pub redact: bool,
    pub sink: Option<Arc<dyn LoggerSink>>,
    /// Log span open/close (pretty, compact) or attach the current span (json).
    pub span_events: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: LogLevel::Info,
            filter: None,
            redact: true,
            sink: None,
            span_events: false,
        }
    }
}

impl LoggingConfig {
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_redaction(mut self, redact: bool) -> Self {
        self.redact = redact;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn LoggerSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_span_events(mut self, enable: bool) -> Self {
        self.span_events = enable;
        self
    }

    /// Apply [`FILTER_ENV`] and [`FORMAT_ENV`] when set.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.overridden(
            std::env::var(FILTER_ENV).ok(),
            std::env::var(FORMAT_ENV).ok(),
        )
    }

    fn overridden(mut self, filter: Option<String>, format: Option<String>) -> Result<Self> {
        if let Some(filter) = filter.filter(|f| !f.trim().is_empty()) {
            self.filter = Some(filter);
        }
        if let Some(format) = format {
            self.format = format.parse()?;
        }
        Ok(self)
    }

    fn directives(&self) -> String {
        if let Some(filter) = &self.filter {
            return filter.clone();
        }
        let level = level_directive(self.level);
        CORE_TARGETS
            .iter()
            .map(|target| format!("{target}={level}"))
            .chain(HTTP_TARGETS.iter().map(|target| format!("{target}=warn")))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn env_filter(&self) -> Result<EnvFilter> {
        EnvFilter::try_new(self.directives())
            .map_err(|e| Error::Config(format!("Invalid log filter: {e}")))
    }
}

/// Install the global subscriber. Fails if one is already installed or the
/// filter does not parse.
pub fn init_logging(config: LoggingConfig) -> Result<()> {
    let filter = config.env_filter()?;
    let spans = if config.span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let output = match config.format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .pretty()
            .with_span_events(spans)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .compact()
            .with_span_events(spans)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(config.span_events)
            .with_span_list(false)
            .with_writer(std::io::stderr)
            .boxed(),
    };
    let host = config
        .sink
        .map(|sink| HostLogLayer::new(sink, config.redact));

    tracing_subscriber::registry()
        .with(output)
        .with(host)
        .with(filter)
        .try_init()
        .map_err(|e| Error::Config(format!("Logging already initialized: {e}")))
}

fn level_directive(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Trace => "trace",
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
}

fn to_log_level(level: &tracing::Level) -> LogLevel {
    match *level {
        tracing::Level::TRACE => LogLevel::Trace,
        tracing::Level::DEBUG => LogLevel::Debug,
        tracing::Level::INFO => LogLevel::Info,
        tracing::Level::WARN => LogLevel::Warn,
        tracing::Level::ERROR => LogLevel::Error,
    }
}

/// Mirrors events into a [`LoggerSink`].
struct HostLogLayer {
    sink: Arc<dyn LoggerSink>,
    redact: bool,
}

impl HostLogLayer {
    fn new(sink: Arc<dyn LoggerSink>, redact: bool) -> Self {
        Self { sink, redact }
    }

    fn entry<S>(&self, event: &Event<'_>, ctx: &Context<'_, S>) -> Option<LogEntry>
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
    {
        let metadata = event.metadata();
        let level = to_log_level(metadata.level());
        if level < self.sink.min_level() {
            return None;
        }

        let mut fields = FieldCollector::default();
        event.record(&mut fields);

        let message = fields
            .message
            .take()
            .unwrap_or_else(|| metadata.name().to_string());
        let mut entry = LogEntry::new(level, metadata.target(), message);
        for (name, value) in fields.values {
            let value = if self.redact {
                redact_field(&name, &value)
            } else {
                value
            };
            entry.fields.insert(name, value);
        }
        if let Some(span) = ctx.event_span(event) {
            entry = entry.with_span_id(span.name());
        }
        Some(entry)
    }
}

impl<S> Layer<S> for HostLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let Some(entry) = self.entry(event, &ctx) else {
            return;
        };
        let sink = Arc::clone(&self.sink);

        // Sinks are async; inside a runtime they must not block a worker.
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = sink.log(entry).await {
                        eprintln!("Host log sink failed: {e}");
                    }
                });
            }
            Err(_) => {
                if let Err(e) = futures::executor::block_on(sink.log(entry)) {
                    eprintln!("Host log sink failed: {e}");
                }
            }
        }
    }
}

#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    values: HashMap<String, String>,
}

impl FieldCollector {
    fn push(&mut self, field: &Field, value: String) {
        match field.name() {
            "message" => self.message = Some(value),
            name => {
                self.values.insert(name.to_string(), value);
            }
        }
    }
}

impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.push(field, value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.push(field, value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.push(field, value.to_string());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.push(field, value.to_string());
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.push(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.push(field, format!("{value:?}"));
    }
}

/// What a field name says about its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Secret,
    Url,
    Path,
    Plain,
}

impl FieldKind {
    fn of(name: &str) -> Self {
        const SECRET: &[&str] = &[
            "token",
            "password",
            "secret",
            "api_key",
            "authorization",
            "cookie",
            "signature",
        ];
        let name = name.to_ascii_lowercase();
        if SECRET.iter().any(|s| name.contains(s)) {
            FieldKind::Secret
        } else if name.contains("url") || name.contains("location") {
            FieldKind::Url
        } else if name.contains("path") || name == "file" {
            FieldKind::Path
        } else {
            FieldKind::Plain
        }
    }
}

fn redact_field(name: &str, value: &str) -> String {
    match FieldKind::of(name) {
        FieldKind::Secret => REDACTED.to_string(),
        FieldKind::Url => redact_url(value).to_string(),
        FieldKind::Path => strip_path(value).to_string(),
        FieldKind::Plain => value.to_string(),
    }
}

/// `[REDACTED]` for credential-like field names, `value` otherwise.
pub fn redact_if_sensitive(field_name: &str, value: &str) -> String {
    match FieldKind::of(field_name) {
        FieldKind::Secret => REDACTED.to_string(),
        _ => value.to_string(),
    }
}

/// Last component of a Unix or Windows path.
pub fn strip_path(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// URL without its query string or fragment, where CDNs put expiring
/// signatures.
pub fn redact_url(url: &str) -> &str {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    &url[..end]
}
