use crate::errors::types::{Error, Result};
use std::str::FromStr;
use tracing::level_filters::LevelFilter;
use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

/// How the process-wide `tracing` subscriber is installed
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is not set
    pub level: Level,
    /// Extra per-target directives, e.g. `b2bua_dialog_core::transaction=trace`
    pub directives: Vec<String>,
    /// Include file and line of each event
    pub file_info: bool,
    /// Write through libtest's capture instead of straight to stdout
    pub test_writer: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: Level::INFO,
            directives: Vec::new(),
            file_info: false,
            test_writer: false,
        }
    }
}

impl LoggingConfig {
    pub fn new(level: Level) -> Self {
        LoggingConfig {
            level,
            ..Default::default()
        }
    }

    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    pub fn with_file_info(mut self) -> Self {
        self.file_info = true;
        self
    }

    /// Output captured per test, shown only for failing tests
    pub fn for_tests(mut self) -> Self {
        self.test_writer = true;
        self
    }

    /// `RUST_LOG` when set, `level` otherwise, plus the configured directives
    pub fn filter(&self) -> Result<EnvFilter> {
        let mut filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::default().add_directive(LevelFilter::from_level(self.level).into()));
        for directive in &self.directives {
            let parsed = directive
                .parse()
                .map_err(|e| Error::Config(format!("Invalid log directive '{}': {}", directive, e)))?;
            filter = filter.add_directive(parsed);
        }
        Ok(filter)
    }
}

/// Install the global subscriber.
///
/// Fails when a directive does not parse or a subscriber is already
/// installed; tests calling this once per test ignore the second case.
pub fn setup_logging(config: LoggingConfig) -> Result<()> {
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(config.filter()?)
        .with_file(config.file_info)
        .with_line_number(config.file_info);

    let installed = if config.test_writer {
        subscriber.with_test_writer().try_init()
    } else {
        subscriber.try_init()
    };
    installed.map_err(|e| Error::Logging(e.to_string()))
}

/// Parse a log level from a string
pub fn parse_log_level(level: &str) -> Result<Level> {
    Level::from_str(level).map_err(|_| Error::Config(format!("Invalid log level: {}", level)))
}
