//! Structured logging configuration.
//!
//! Log entries go through `tracing-subscriber`, either as pretty text for
//! development or as one JSON object per line:
//!
//! ```json
//! {"timestamp":"2026-01-15T10:30:00.000Z","level":"INFO","target":"permgate","fields":{"message":"server listening"}}
//! ```
//!
//! `RUST_LOG` takes precedence over the configured level.

use permgate_server::config::LoggingSettings;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    prelude::*,
    EnvFilter,
};

/// Configuration for structured logging.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Whether to use JSON format (true) or text format (false)
    pub json_format: bool,
    /// The default log level if RUST_LOG is not set
    pub default_level: Level,
    /// Whether to include span events (enter/exit)
    pub include_spans: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            json_format: false,
            default_level: Level::INFO,
            include_spans: false,
        }
    }
}

impl LoggingConfig {
    /// JSON output at INFO.
    pub fn json() -> Self {
        Self {
            json_format: true,
            ..Default::default()
        }
    }

    /// Pretty text output at INFO.
    pub fn text() -> Self {
        Self {
            json_format: false,
            ..Default::default()
        }
    }

    /// Derives the logging setup from the `logging` config section.
    pub fn from_settings(settings: &LoggingSettings) -> Self {
        let base = if settings.json {
            Self::json()
        } else {
            Self::text()
        };
        base.with_level(parse_log_level(&settings.level))
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.default_level = level;
        self
    }

    /// Include span enter/exit events in the output.
    pub fn with_spans(mut self) -> Self {
        self.include_spans = true;
        self
    }
}

/// Parses a level name case-insensitively, falling back to INFO.
pub fn parse_log_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Installs the global subscriber.
///
/// Only the first call has any effect; later calls are ignored because the
/// subscriber is process-global.
pub fn init_logging(config: LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_level.to_string()));

    let span_events = if config.include_spans {
        FmtSpan::ENTER | FmtSpan::EXIT
    } else {
        FmtSpan::NONE
    };

    if config.json_format {
        let subscriber = tracing_subscriber::registry().with(filter).with(
            fmt::layer()
                .json()
                .with_span_events(span_events)
                .with_current_span(true)
                .with_target(true)
                .with_file(false)
                .with_line_number(false),
        );
        let _ = tracing::subscriber::set_global_default(subscriber);
    } else {
        let subscriber = tracing_subscriber::registry().with(filter).with(
            fmt::layer()
                .pretty()
                .with_span_events(span_events)
                .with_target(true),
        );
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

/// Builds a JSON subscriber writing to `writer`, for capturing logs in tests.
pub fn create_json_layer<W>(writer: W) -> impl tracing::Subscriber + Send + Sync
where
    W: for<'writer> tracing_subscriber::fmt::MakeWriter<'writer> + Send + Sync + 'static,
{
    tracing_subscriber::registry()
        .with(EnvFilter::new("trace"))
        .with(
            fmt::layer()
                .json()
                .with_writer(writer)
                .with_target(true)
                .with_current_span(true),
        )
}
