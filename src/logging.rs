//! Daemon logging
//!
//! Structured logging through `tracing`, plain or JSON. `RUST_LOG` wins over
//! the configured level. QEMU's own log lines are re-emitted with
//! `target: "qemu"`, so `RUST_LOG=qemu=debug` isolates them.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text
    #[default]
    Plain,
    /// One JSON object per line
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "plain" => Ok(Self::Plain),
            "json" => Ok(Self::Json),
            _ => Err(format!("Invalid log format: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid log level: {}", s)),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trace => write!(f, "trace"),
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Include file and line number in logs
    pub file_and_line: bool,
    /// Log span enter/exit
    pub span_events: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Plain,
            file_and_line: false,
            span_events: false,
        }
    }
}

impl LoggingConfig {
    pub fn with_level(level: LogLevel) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Read HYPERPOD_LOG_LEVEL and HYPERPOD_LOG_FORMAT; unparsable values
    /// fall back to the defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let level = lookup("HYPERPOD_LOG_LEVEL")
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();
        let format = lookup("HYPERPOD_LOG_FORMAT")
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();
        Self {
            level,
            format,
            ..Default::default()
        }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.level.to_string()))
    }

    fn span_events(&self) -> FmtSpan {
        if self.span_events {
            FmtSpan::FULL
        } else {
            FmtSpan::NONE
        }
    }

    /// Install the global subscriber. Fails if one is already set.
    pub fn init(&self) -> Result<()> {
        match self.format {
            LogFormat::Plain => {
                let layer = fmt::layer()
                    .with_file(self.file_and_line)
                    .with_line_number(self.file_and_line)
                    .with_target(true)
                    .with_span_events(self.span_events())
                    .with_writer(std::io::stderr)
                    .with_filter(self.filter());
                tracing_subscriber::registry().with(layer).try_init()?;
            }
            LogFormat::Json => {
                let layer = fmt::layer()
                    .json()
                    .with_file(self.file_and_line)
                    .with_line_number(self.file_and_line)
                    .with_target(true)
                    .with_span_events(self.span_events())
                    .with_writer(std::io::stderr)
                    .with_filter(self.filter());
                tracing_subscriber::registry().with(layer).try_init()?;
            }
        }

        tracing::debug!(level = %self.level, format = ?self.format, "logging initialized");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parse() {
        assert_eq!("WARNING".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert_eq!("debug".parse::<LogLevel>(), Ok(LogLevel::Debug));
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!("JSON".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_log_level_into_tracing() {
        let level: tracing::Level = LogLevel::Trace.into();
        assert_eq!(level, tracing::Level::TRACE);
    }

    #[test]
    fn test_from_env_lookup() {
        let config = LoggingConfig::from_lookup(|key| match key {
            "HYPERPOD_LOG_LEVEL" => Some("error".to_string()),
            "HYPERPOD_LOG_FORMAT" => Some("bogus".to_string()),
            _ => None,
        });

        assert_eq!(config.level, LogLevel::Error);
        assert_eq!(config.format, LogFormat::Plain);
    }

    #[test]
    fn test_second_init_fails() {
        let config = LoggingConfig::with_level(LogLevel::Debug);
        let _ = config.init();
        assert!(config.init().is_err());
    }
}
