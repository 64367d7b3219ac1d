//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/reportd/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/reportd/` (~/.config/reportd/)
//! - Data: `$XDG_DATA_HOME/reportd/` (~/.local/share/reportd/)
//! - State/Logs: `$XDG_STATE_HOME/reportd/` (~/.local/state/reportd/)
//! - Runtime: `$XDG_RUNTIME_DIR/reportd/` (pid files, falls back to the temp dir)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Returns XDG_RUNTIME_DIR or the system temp dir
fn xdg_runtime_dir() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => std::env::temp_dir(),
    }
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Backend selection and collector policy
    #[serde(default)]
    pub reporting: ReportingConfig,

    /// Local filesystem spool transport
    #[serde(default)]
    pub spool: SpoolConfig,

    /// SQLite storage backend
    #[serde(default)]
    pub sqlite: SqliteConfig,

    /// JSON lines storage backend
    #[serde(default)]
    pub json_lines: JsonLinesConfig,

    /// Daemon mode and pidfile
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Supported transports
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Interactions are spooled as files and picked up by the collector
    #[default]
    LocalFilesystem,
    /// Interactions are written to storage in-process (not usable by the collector)
    DirectStore,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::LocalFilesystem => "local_filesystem",
            TransportKind::DirectStore => "direct_store",
        }
    }
}

/// Supported storage backends
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    #[default]
    Sqlite,
    JsonLines,
}

impl StorageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKind::Sqlite => "sqlite",
            StorageKind::JsonLines => "json_lines",
        }
    }
}

/// Backend selection and collector policy
#[derive(Debug, Deserialize, Default, Clone)]
pub struct ReportingConfig {
    /// Where interactions come from
    #[serde(default)]
    pub transport: TransportKind,

    /// Where interactions are persisted
    #[serde(default)]
    pub storage: StorageKind,

    /// Abort startup when storage validation fails (default: log and continue)
    #[serde(default)]
    pub strict_validation: bool,

    /// Keep interactions whose import failed here instead of dropping them
    pub dead_letter_dir: Option<PathBuf>,
}

/// Local filesystem spool transport configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SpoolConfig {
    /// Directory interactions are spooled into
    #[serde(default = "default_spool_path")]
    pub path: PathBuf,

    /// Longest a single fetch blocks waiting for work, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            path: default_spool_path(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl SpoolConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_spool_path() -> PathBuf {
    Config::data_dir().join("spool")
}

fn default_poll_interval_ms() -> u64 {
    500
}

/// SQLite storage configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SqliteConfig {
    #[serde(default = "default_sqlite_path")]
    pub path: PathBuf,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: default_sqlite_path(),
        }
    }
}

fn default_sqlite_path() -> PathBuf {
    Config::database_path()
}

/// JSON lines storage configuration
#[derive(Debug, Deserialize, Clone)]
pub struct JsonLinesConfig {
    #[serde(default = "default_json_lines_path")]
    pub path: PathBuf,
}

impl Default for JsonLinesConfig {
    fn default() -> Self {
        Self {
            path: default_json_lines_path(),
        }
    }
}

fn default_json_lines_path() -> PathBuf {
    Config::data_dir().join("interactions.jsonl")
}

/// Daemon mode configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DaemonConfig {
    /// Take the pidfile lock (and detach unless `foreground` is set)
    #[serde(default)]
    pub enabled: bool,

    /// Exclusive lock file holding the collector's pid
    #[serde(default = "default_pidfile")]
    pub pidfile: PathBuf,

    /// Hold the pidfile but stay attached (for supervisors such as systemd)
    #[serde(default)]
    pub foreground: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            pidfile: default_pidfile(),
            foreground: false,
        }
    }
}

fn default_pidfile() -> PathBuf {
    xdg_runtime_dir()
        .join("reportd")
        .join("reportd-collector.pid")
}

/// How much the collector logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Verbosity {
    /// Warnings and errors
    #[default]
    Default,
    /// Adds per-interaction import lines
    Verbose,
    /// Everything
    Debug,
}

impl Verbosity {
    /// Debug wins over verbose
    pub fn from_flags(debug: bool, verbose: bool) -> Self {
        if debug {
            Verbosity::Debug
        } else if verbose {
            Verbosity::Verbose
        } else {
            Verbosity::Default
        }
    }

    /// Filter directive for tracing
    pub fn as_filter(&self) -> &'static str {
        match self {
            Verbosity::Default => "warn",
            Verbosity::Verbose => "info",
            Verbosity::Debug => "debug",
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub verbose: bool,

    /// Log to stderr
    #[serde(default = "default_true")]
    pub console: bool,

    /// Log to the local syslog daemon
    #[serde(default)]
    pub syslog: bool,

    /// Log to a rolling file
    #[serde(default = "default_true")]
    pub file: bool,

    /// Log file location (rotated daily next to this path)
    #[serde(default = "default_log_path")]
    pub file_path: PathBuf,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            debug: false,
            verbose: false,
            console: true,
            syslog: false,
            file: true,
            file_path: default_log_path(),
            max_files: default_max_log_files(),
        }
    }
}

impl LoggingConfig {
    pub fn verbosity(&self) -> Verbosity {
        Verbosity::from_flags(self.debug, self.verbose)
    }
}

fn default_true() -> bool {
    true
}

fn default_log_path() -> PathBuf {
    Config::log_path()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.spool.poll_interval_ms == 0 {
            return Err(Error::Config(
                "spool.poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.logging.max_files == 0 {
            return Err(Error::Config(
                "logging.max_files must be greater than 0".to_string(),
            ));
        }
        if self.daemon.enabled && self.daemon.pidfile.file_name().is_none() {
            return Err(Error::Config(format!(
                "daemon.pidfile must name a file, got {:?}",
                self.daemon.pidfile
            )));
        }
        Ok(())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/reportd/config.toml` (~/.config/reportd/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("reportd").join("config.toml")
    }

    /// Returns the data directory path (spool, database)
    ///
    /// `$XDG_DATA_HOME/reportd/` (~/.local/share/reportd/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("reportd")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/reportd/` (~/.local/state/reportd/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("reportd")
    }

    /// Returns the database file path
    ///
    /// `$XDG_DATA_HOME/reportd/reports.db` (~/.local/share/reportd/reports.db)
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("reports.db")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/reportd/reportd-collector.log`
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("reportd-collector.log")
    }
}
