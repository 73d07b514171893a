//! Tracing setup for Undertow
//!
//! Console logs follow the user's chosen level. The log file keeps every
//! slot assignment, eviction and copy made by the storage crates so a run
//! can be replayed afterwards, while third-party crates stay at `info`.

use std::fs::{File, create_dir_all};
use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use crate::{Result, UndertowError};

/// File name of the per-run debug log inside the logs directory.
pub const LOG_FILE_NAME: &str = "undertow-last-run.log";

/// Environment variable replacing [`FILE_LOG_DIRECTIVES`].
pub const FILE_LOG_ENV: &str = "UNDERTOW_FILE_LOG";

/// Filter of the log file: full trace of the storage crates only.
pub const FILE_LOG_DIRECTIVES: &str = "info,undertow_core=trace,undertow=trace";

/// Builds the log file filter, honoring [`FILE_LOG_ENV`].
fn file_filter() -> EnvFilter {
    EnvFilter::try_from_env(FILE_LOG_ENV).unwrap_or_else(|_| EnvFilter::new(FILE_LOG_DIRECTIVES))
}

/// Initialize tracing with console output at `console_level` plus a trace file
///
/// The file lands in `<logs_dir>/undertow-last-run.log` (`./logs` by default)
/// and is overwritten on every run. Returns its path.
///
/// # Errors
///
/// - `UndertowError::Io` - If the logs directory or log file cannot be created
/// - `UndertowError::Configuration` - If a global subscriber is already set
pub fn init_tracing(console_level: Level, logs_dir: Option<&Path>) -> Result<PathBuf> {
    let logs_path = logs_dir.unwrap_or_else(|| Path::new("logs"));
    create_dir_all(logs_path)?;

    let log_file_path = logs_path.join(LOG_FILE_NAME);
    let log_file = File::create(&log_file_path)?;

    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_level.to_string()));

    let console_layer = fmt::layer()
        .with_target(false)
        .without_time()
        .with_filter(console_filter);

    let file_layer = fmt::layer()
        .with_thread_names(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(log_file)
        .with_filter(file_filter());

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| UndertowError::Configuration {
            reason: format!("tracing already initialized: {e}"),
        })?;

    tracing::debug!(
        "Tracing initialized: console={}, file={}",
        console_level,
        log_file_path.display()
    );

    Ok(log_file_path)
}

/// CLI log levels for user control
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CliLogLevel {
    /// Only error messages
    Error,
    /// Warning and error messages
    Warn,
    /// Informational, warning, and error messages
    Info,
    /// Debug, informational, warning, and error messages
    Debug,
    /// All messages including per-copy tracing
    Trace,
}

impl CliLogLevel {
    /// Converts CLI log level to tracing Level enum.
    ///
    /// # Examples
    /// ```
    /// use undertow_core::tracing_setup::CliLogLevel;
    ///
    /// let level = CliLogLevel::Info.as_tracing_level();
    /// assert_eq!(level, tracing::Level::INFO);
    /// ```
    pub fn as_tracing_level(self) -> Level {
        match self {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

impl std::str::FromStr for CliLogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(CliLogLevel::Error),
            "warn" => Ok(CliLogLevel::Warn),
            "info" => Ok(CliLogLevel::Info),
            "debug" => Ok(CliLogLevel::Debug),
            "trace" => Ok(CliLogLevel::Trace),
            _ => Err(format!("Invalid log level: {s}")),
        }
    }
}

impl std::fmt::Display for CliLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliLogLevel::Error => write!(f, "error"),
            CliLogLevel::Warn => write!(f, "warn"),
            CliLogLevel::Info => write!(f, "info"),
            CliLogLevel::Debug => write!(f, "debug"),
            CliLogLevel::Trace => write!(f, "trace"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parsing() {
        assert_eq!("WARN".parse::<CliLogLevel>(), Ok(CliLogLevel::Warn));
        assert_eq!("trace".parse::<CliLogLevel>(), Ok(CliLogLevel::Trace));
        assert!("verbose".parse::<CliLogLevel>().is_err());
        assert_eq!(CliLogLevel::Debug.to_string(), "debug");
        assert_eq!(CliLogLevel::Error.as_tracing_level(), Level::ERROR);
    }

    #[test]
    fn test_init_tracing_creates_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let logs_dir = dir.path().join("logs");

        let path = init_tracing(Level::WARN, Some(&logs_dir)).unwrap();

        assert_eq!(path, logs_dir.join(LOG_FILE_NAME));
        assert!(path.exists());
    }

    #[test]
    fn test_init_tracing_reports_unwritable_logs_dir() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();

        let result = init_tracing(Level::WARN, Some(&blocker));
        assert!(matches!(result, Err(UndertowError::Io(_))));
    }

    #[test]
    fn test_file_filter_directives_parse() {
        let filter = EnvFilter::new(FILE_LOG_DIRECTIVES);
        assert!(filter.to_string().contains("undertow_core=trace"));
    }
}
