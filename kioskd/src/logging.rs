use std::io;
use std::str::FromStr;

use thiserror::Error;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub const DEFAULT_FILTER: &str =
    "kioskd=info,drive_core=info,kiosk_player=info,tower_http=warn,hyper=warn,reqwest=warn";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("unknown log format: {0}")]
    UnknownFormat(String),
    #[error("invalid log filter: {0}")]
    Filter(String),
    #[error("failed to initialize logging: {0}")]
    Init(String),
}

impl FromStr for LogFormat {
    type Err = LoggingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(LoggingError::UnknownFormat(other.to_string())),
        }
    }
}

/// `RUST_LOG` when set, [`DEFAULT_FILTER`] otherwise.
pub fn build_filter(rust_log: Option<&str>) -> Result<EnvFilter, LoggingError> {
    let directives = rust_log
        .filter(|value| !value.trim().is_empty())
        .unwrap_or(DEFAULT_FILTER);
    EnvFilter::try_new(directives).map_err(|err| LoggingError::Filter(err.to_string()))
}

/// Installs the global subscriber. Output goes to stderr so `--sync-once`
/// can print its report on stdout.
pub fn init_logging(format: LogFormat) -> Result<(), LoggingError> {
    let rust_log = std::env::var("RUST_LOG").ok();
    let filter = build_filter(rust_log.as_deref())?;
    let registry = tracing_subscriber::registry().with(filter);

    let result = match format {
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().pretty().with_writer(io::stderr))
            .try_init(),
        LogFormat::Compact => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(true)
                    .with_writer(io::stderr),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_writer(io::stderr),
            )
            .try_init(),
    };
    result.map_err(|err| LoggingError::Init(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_formats_case_insensitively() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!(" compact ".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!(matches!(
            "xml".parse::<LogFormat>(),
            Err(LoggingError::UnknownFormat(_))
        ));
    }

    #[test]
    fn default_filter_is_used_without_rust_log() {
        let filter = build_filter(None).unwrap();
        assert!(filter.to_string().contains("kioskd=info"));
        let blank = build_filter(Some("  ")).unwrap();
        assert!(blank.to_string().contains("drive_core=info"));
    }

    #[test]
    fn rust_log_overrides_default_filter() {
        let filter = build_filter(Some("kioskd=debug")).unwrap();
        assert_eq!(filter.to_string(), "kioskd=debug");
    }
}
