//! Subscriber setup for arena diagnostics
//!
//! Arenas log through `tracing`: chunk growth and release at `debug`, registry
//! lifecycle at `info`, misuse and exhaustion at `warn`/`error`, per-allocation
//! decisions at `trace`. Binaries and tests that do not install their own
//! subscriber call [`init_logging_default`] or [`init_for_run`].
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: standard tracing filter, wins over everything else
//! - `ARENAFORGE_LOG_LEVEL`: error, warn, info, debug or trace
//! - `ARENAFORGE_LOG_FORMAT`: "human" or "json"
//! - `ARENAFORGE_LOG_FILE`: JSON log file; multi-rank runs write `<file>.<rank>`

use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ArenaConfig;

static SUBSCRIBER: OnceCell<()> = OnceCell::new();

const LOG_LEVEL_ENV: &str = "ARENAFORGE_LOG_LEVEL";
const LOG_FORMAT_ENV: &str = "ARENAFORGE_LOG_FORMAT";
const LOG_FILE_ENV: &str = "ARENAFORGE_LOG_FILE";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter '{0}'")]
    InvalidFilter(String),

    #[error("cannot create log directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot open log file {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Another global subscriber is already installed
    #[error("subscriber already installed: {0}")]
    AlreadyInstalled(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Level implied by the registry `verbose` parameter
    ///
    /// 0 keeps warnings, 1 adds lifecycle, 2 adds chunk traffic, 3+ traces
    /// every allocation.
    pub fn from_verbose(verbose: i32) -> Self {
        match verbose {
            i32::MIN..=0 => LogLevel::Warn,
            1 => LogLevel::Info,
            2 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    pub fn as_filter_str(self) -> &'static str {
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
            _ => Err(LoggingError::InvalidFilter(s.to_string())),
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
            "human" | "pretty" => Ok(LogFormat::Human),
            "json" => Ok(LogFormat::Json),
            _ => Err(LoggingError::InvalidFilter(s.to_string())),
        }
    }
}

/// Where and how arena diagnostics are written
#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Include source file and line
    pub show_source: bool,
    /// JSON log file, suffixed with the rank when one is set
    pub log_file: Option<PathBuf>,
    pub rank: Option<usize>,
}

impl LoggingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// `ARENAFORGE_LOG_*` settings; unparsable values are ignored
    pub fn from_env() -> Self {
        let var = |key: &str| std::env::var(key).ok();
        LoggingConfig {
            level: var(LOG_LEVEL_ENV)
                .and_then(|s| s.parse().ok())
                .unwrap_or_default(),
            format: var(LOG_FORMAT_ENV)
                .and_then(|s| s.parse().ok())
                .unwrap_or_default(),
            log_file: var(LOG_FILE_ENV).map(PathBuf::from),
            ..Self::default()
        }
    }

    /// Environment settings, with the level raised to what `verbose` asks for
    /// and the log file split per rank
    pub fn for_run(config: &ArenaConfig) -> Self {
        let env = Self::from_env();
        LoggingConfig {
            level: env.level.max(LogLevel::from_verbose(config.verbose)),
            rank: Some(config.rank),
            ..env
        }
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_source_locations(mut self, show: bool) -> Self {
        self.show_source = show;
        self
    }

    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    pub fn with_rank(mut self, rank: usize) -> Self {
        self.rank = Some(rank);
        self
    }

    /// Log file actually opened: `<file>.<rank>` when a rank is set
    pub fn resolved_log_file(&self) -> Option<PathBuf> {
        let path = self.log_file.as_ref()?;
        Some(match self.rank {
            Some(rank) => PathBuf::from(format!("{}.{}", path.display(), rank)),
            None => path.clone(),
        })
    }
}

/// Install a subscriber from the environment; later calls do nothing
pub fn init_logging_default() {
    init_with_config(&LoggingConfig::from_env());
}

/// Install a subscriber matching the run's arena configuration
pub fn init_for_run(config: &ArenaConfig) {
    init_with_config(&LoggingConfig::for_run(config));
}

/// Install a subscriber once; a failure is reported on stderr
pub fn init_with_config(config: &LoggingConfig) {
    SUBSCRIBER.get_or_init(|| {
        if let Err(e) = install(config) {
            eprintln!("arenaforge: logging disabled: {}", e);
        }
    });
}

pub fn is_initialized() -> bool {
    SUBSCRIBER.get().is_some()
}

fn install(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = env_filter(config.level)?;
    let file_layer = match config.resolved_log_file() {
        Some(path) => Some(
            fmt::layer()
                .json()
                .with_writer(open_log_file(&path)?)
                .with_thread_ids(true)
                .with_ansi(false),
        ),
        None => None,
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    let installed = match config.format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_file(config.show_source)
                    .with_line_number(config.show_source),
            )
            .try_init(),
        LogFormat::Human => registry
            .with(
                fmt::layer()
                    .with_thread_ids(true)
                    .with_file(config.show_source)
                    .with_line_number(config.show_source),
            )
            .try_init(),
    };
    installed.map_err(|e| LoggingError::AlreadyInstalled(e.to_string()))
}

fn open_log_file(path: &Path) -> Result<File, LoggingError> {
    if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|source| LoggingError::Directory {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| LoggingError::File {
            path: path.to_path_buf(),
            source,
        })
}

/// `RUST_LOG` if set, otherwise `level`
fn env_filter(level: LogLevel) -> Result<EnvFilter, LoggingError> {
    match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(spec) => EnvFilter::try_new(&spec).map_err(|_| LoggingError::InvalidFilter(spec)),
        Err(_) => Ok(EnvFilter::new(level.as_filter_str())),
    }
}
