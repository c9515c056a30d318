//! Process-wide tracing setup shared by `civisd` and `civis-wkr`.
//!
//! Level and format come from `CIVIS_LOG_LEVEL` / `CIVIS_LOG_FORMAT`; an
//! explicit `RUST_LOG` filter takes precedence over the level.

use crate::config::{EnvParser, vars};
use thiserror::Error;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
    pub target: LogTarget,
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter '{filter}': {message}")]
    Filter { filter: String, message: String },

    #[error("global subscriber already installed")]
    AlreadyInitialized,
}

impl LogConfig {
    /// Read level and format from the environment, falling back to `default_level`.
    ///
    /// Invalid values are reported on stderr since logging is not up yet.
    pub fn from_env(default_level: &str) -> Self {
        let mut parser = EnvParser::new();
        let level = parser.get_log_level(vars::LOG_LEVEL, default_level).value;
        let raw_format = parser.get_string(vars::LOG_FORMAT, "pretty").value;
        let format = LogFormat::parse(&raw_format).unwrap_or_else(|| {
            eprintln!("civis: unknown log format '{raw_format}', using pretty");
            LogFormat::Pretty
        });
        for error in parser.take_errors() {
            eprintln!("civis: {error}");
        }
        Self {
            level,
            format,
            target: LogTarget::Stdout,
        }
    }

    /// Workers share stdout with the test framework, so they log to stderr.
    pub fn with_stderr(mut self) -> Self {
        self.target = LogTarget::Stderr;
        self
    }

    pub fn with_level(mut self, level: &str) -> Self {
        self.level = level.to_string();
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    fn filter(&self) -> Result<EnvFilter, LoggingError> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        EnvFilter::try_new(&self.level).map_err(|e| LoggingError::Filter {
            filter: self.level.clone(),
            message: e.to_string(),
        })
    }
}

/// Install the global subscriber described by `config`.
pub fn init_logging(config: &LogConfig) -> Result<(), LoggingError> {
    let filter = config.filter()?;
    let registry = tracing_subscriber::registry().with(filter);
    let result = match (config.format, config.target) {
        (LogFormat::Json, LogTarget::Stdout) => registry
            .with(fmt::layer().json().with_current_span(false))
            .try_init(),
        (LogFormat::Json, LogTarget::Stderr) => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        (LogFormat::Pretty, LogTarget::Stdout) => {
            registry.with(fmt::layer().with_target(true)).try_init()
        }
        (LogFormat::Pretty, LogTarget::Stderr) => registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .try_init(),
    };
    result.map_err(|_| LoggingError::AlreadyInitialized)
}
