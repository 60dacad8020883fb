//! Logging setup for the command-line tool.
//!
//! Supports two modes:
//! - Development: Pretty-printed human-readable logs
//! - Machine consumption: JSON-formatted logs
//!
//! Set `FUSED_MOE_LOG_FORMAT=json` for JSON logs.
//! Set `RUST_LOG` to control log levels (default: info).
//!
//! Logs go to stderr so that reports printed on stdout stay parseable.

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Log format mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Pretty-printed human-readable logs (default).
    Pretty,
    /// JSON-formatted logs.
    Json,
}

impl LogFormat {
    /// Detect log format from environment.
    pub fn from_env() -> Self {
        Self::from_value(&std::env::var("FUSED_MOE_LOG_FORMAT").unwrap_or_default())
    }

    pub fn from_value(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Initialize logging from `RUST_LOG` and `FUSED_MOE_LOG_FORMAT`.
pub fn init() {
    init_with_level_and_format(None, LogFormat::from_env());
}

/// Initialize logging with an explicit level and format.
///
/// `RUST_LOG` still wins over `level` when set. A second initialization in
/// the same process is ignored.
pub fn init_with_level_and_format(level: Option<&str>, format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.unwrap_or("info")));

    let result = match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init(),
    };
    if let Err(e) = result {
        eprintln!("Logging already initialized: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_from_value() {
        assert_eq!(LogFormat::from_value("json"), LogFormat::Json);
        assert_eq!(LogFormat::from_value(" JSON "), LogFormat::Json);
        assert_eq!(LogFormat::from_value("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::from_value(""), LogFormat::Pretty);
    }

    #[test]
    fn test_double_init_is_harmless() {
        init_with_level_and_format(Some("warn"), LogFormat::Pretty);
        init_with_level_and_format(Some("warn"), LogFormat::Json);
    }
}
