//! Logging setup on top of `tracing-subscriber`
//!
//! Console output is human-readable or JSON. An optional log file always
//! receives JSON lines.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: full filter directive, wins over everything else
//! - `ACCELFORGE_LOG_LEVEL`: error, warn, info, debug or trace
//! - `ACCELFORGE_LOG_FORMAT`: "human" or "json"
//! - `ACCELFORGE_LOG_FILE`: path of an additional JSON log file

use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const ENV_LOG_LEVEL: &str = "ACCELFORGE_LOG_LEVEL";
pub const ENV_LOG_FORMAT: &str = "ACCELFORGE_LOG_FORMAT";
pub const ENV_LOG_FILE: &str = "ACCELFORGE_LOG_FILE";

static INITIALIZED: OnceCell<()> = OnceCell::new();

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log level: {0}")]
    InvalidLevel(String),

    #[error("invalid log format: {0}")]
    InvalidFormat(String),

    #[error("invalid filter directive: {0}")]
    InvalidFilter(String),

    #[error("cannot open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Another global subscriber was installed outside this module
    #[error("global subscriber already set: {0}")]
    SubscriberConflict(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl FromStr for LogLevel {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(LoggingError::InvalidLevel(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

impl FromStr for LogFormat {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "human" | "pretty" | "console" => Ok(LogFormat::Human),
            "json" => Ok(LogFormat::Json),
            _ => Err(LoggingError::InvalidFormat(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Include source file and line on console output
    pub file_info: bool,
    pub log_file: Option<PathBuf>,
}

impl LoggingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file_info(mut self, file_info: bool) -> Self {
        self.file_info = file_info;
        self
    }

    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    /// Defaults overridden by `ACCELFORGE_LOG_*`
    pub fn from_env() -> Result<Self, LoggingError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, LoggingError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            config.level = level.parse()?;
        }
        if let Some(format) = lookup(ENV_LOG_FORMAT) {
            config.format = format.parse()?;
        }
        if let Some(path) = lookup(ENV_LOG_FILE).filter(|p| !p.trim().is_empty()) {
            config.log_file = Some(PathBuf::from(path));
        }
        Ok(config)
    }
}

/// Install the global subscriber once; later calls return `Ok(())`
pub fn init(config: &LoggingConfig) -> Result<(), LoggingError> {
    INITIALIZED.get_or_try_init(|| install(config)).map(|_| ())
}

/// [`init`] with [`LoggingConfig::from_env`]
pub fn init_from_env() -> Result<(), LoggingError> {
    if is_initialized() {
        return Ok(());
    }
    init(&LoggingConfig::from_env()?)
}

/// Best-effort [`init_from_env`]; configuration problems go to stderr
pub fn init_default() {
    if let Err(e) = init_from_env() {
        eprintln!("accelforge: logging disabled: {}", e);
    }
}

pub fn is_initialized() -> bool {
    INITIALIZED.get().is_some()
}

fn install(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = env_filter(config.level)?;

    let file_layer = match &config.log_file {
        Some(path) => Some(
            fmt::layer()
                .json()
                .with_writer(Mutex::new(open_log_file(path)?))
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true),
        ),
        None => None,
    };
    let registry = tracing_subscriber::registry().with(filter).with(file_layer);

    let result = match config.format {
        LogFormat::Human => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_file(config.file_info)
                    .with_line_number(config.file_info),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(false)
                    .with_file(config.file_info)
                    .with_line_number(config.file_info),
            )
            .try_init(),
    };
    result.map_err(|e| LoggingError::SubscriberConflict(e.to_string()))
}

/// `RUST_LOG` if set, otherwise `level`
fn env_filter(level: LogLevel) -> Result<EnvFilter, LoggingError> {
    match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) => {
            EnvFilter::try_new(directives).map_err(|e| LoggingError::InvalidFilter(e.to_string()))
        }
        Err(_) => Ok(EnvFilter::new(level.as_str())),
    }
}

fn open_log_file(path: &Path) -> Result<File, LoggingError> {
    let wrap = |source| LoggingError::LogFile {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(wrap)?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(wrap)
}
