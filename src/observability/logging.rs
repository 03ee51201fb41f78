//! Structured logging system using tracing crate
//!
//! ## Log Format Options
//!
//! - `json` - Structured JSON format for production and log aggregation systems
//! - `pretty` - Human-readable format with colors and indentation for development
//! - `compact` - Terminal-friendly format with colors but minimal spacing
//!
//! ## Settings
//!
//! - `--log.level` / `LOG_LEVEL`: debug, info, warn, error or fatal (default info)
//! - `--log.format` / `LOG_FORMAT`: json, pretty or compact (default json)
//! - `--log.file` / `LOG_FILE`: stderr, stdout or a file path (default stderr)
//! - `RUST_LOG`: Override log filtering (follows env_logger format)
//!
//! ## Runtime level toggling
//!
//! The filter sits behind a reload layer. [`LevelWatcher`] flips between
//! the configured level and DEBUG on every SIGUSR1:
//!
//! ```bash
//! kill -USR1 $(pidof mqtt-messenger)
//! ```

use crate::config::LogSettings;
use futures::stream::StreamExt;
use once_cell::sync::OnceCell;
use signal_hook::consts::signal::{SIGINT, SIGUSR1};
use signal_hook_tokio::Signals;
use std::env;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter, Registry};

/// Dependencies that are too chatty at debug level
const NOISY_TARGETS: &[&str] = &["rumqttc=warn", "hyper=warn", "warp=warn"];

static LEVEL_HANDLE: OnceCell<LevelHandle> = OnceCell::new();

/// Logging setup errors
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Failed to open log file {}: {source}", path.display())]
    OpenFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),
    #[error("Logging already initialized: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
    #[error("Failed to reload log filter: {0}")]
    Reload(#[from] reload::Error),
    #[error("Failed to install signal handler: {0}")]
    Signal(#[source] std::io::Error),
}

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON format for structured logging (machine-readable)
    Json,
    /// Pretty format with colors and indentation (human-readable)
    Pretty,
    /// Compact format with colors but minimal spacing (terminal-friendly)
    Compact,
}

impl LogFormat {
    /// Parse log format from string
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json, // Default to JSON for production
        }
    }
}

/// Parse a level name; `fatal` maps to ERROR and unknown names to INFO
pub fn parse_level(s: &str) -> Level {
    match s.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" | "fatal" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Where log lines are written
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    Stderr,
    Stdout,
    /// Appended to
    File(PathBuf),
}

impl LogOutput {
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "" | "stderr" => LogOutput::Stderr,
            "stdout" => LogOutput::Stdout,
            path => LogOutput::File(PathBuf::from(path)),
        }
    }

    fn is_terminal(&self) -> bool {
        !matches!(self, LogOutput::File(_))
    }

    fn make_writer(&self) -> Result<BoxMakeWriter, LoggingError> {
        Ok(match self {
            LogOutput::Stderr => BoxMakeWriter::new(std::io::stderr),
            LogOutput::Stdout => BoxMakeWriter::new(std::io::stdout),
            LogOutput::File(path) => {
                let file: File = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| LoggingError::OpenFile {
                        path: path.clone(),
                        source,
                    })?;
                BoxMakeWriter::new(Mutex::new(file))
            }
        })
    }
}

/// Filter directives for a level, with dependency noise reduced
pub fn filter_directives(level: Level) -> String {
    let mut directives = vec![level.as_str().to_lowercase()];
    directives.extend(NOISY_TARGETS.iter().map(|d| d.to_string()));
    directives.join(",")
}

/// Configured level plus the debug toggle (pure)
#[derive(Debug, Clone)]
pub struct LevelState {
    configured: Level,
    base_directives: String,
    elevated: bool,
}

impl LevelState {
    pub fn new(configured: Level, base_directives: String) -> Self {
        Self {
            configured,
            base_directives,
            elevated: false,
        }
    }

    /// Flip between the configured level and DEBUG; returns the new level
    pub fn toggle(&mut self) -> Level {
        self.elevated = !self.elevated;
        self.effective()
    }

    pub fn effective(&self) -> Level {
        if self.elevated {
            Level::DEBUG
        } else {
            self.configured
        }
    }

    pub fn is_elevated(&self) -> bool {
        self.elevated
    }

    /// Directives for the current state
    pub fn directives(&self) -> String {
        if self.elevated {
            filter_directives(Level::DEBUG)
        } else {
            self.base_directives.clone()
        }
    }
}

/// Runtime control over the installed log filter
#[derive(Clone)]
pub struct LevelHandle {
    state: Arc<Mutex<LevelState>>,
    reload: reload::Handle<EnvFilter, Registry>,
}

impl LevelHandle {
    /// Toggle DEBUG on or off; returns the level now in effect
    pub fn toggle_debug(&self) -> Result<Level, LoggingError> {
        let (level, directives) = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let level = state.toggle();
            (level, state.directives())
        };
        self.reload.reload(EnvFilter::try_new(directives)?)?;
        Ok(level)
    }

    /// Level currently in effect
    pub fn current(&self) -> Level {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .effective()
    }
}

/// Handle installed by [`init_logging`], if logging was initialized
pub fn level_handle() -> Option<&'static LevelHandle> {
    LEVEL_HANDLE.get()
}

/// Initialize logging from settings.
///
/// `RUST_LOG`, when set, replaces the configured level.
pub fn init_logging(settings: &LogSettings) -> Result<LevelHandle, LoggingError> {
    let level = parse_level(&settings.level);
    let format = LogFormat::parse(&settings.format);
    let output = LogOutput::parse(&settings.file);

    // Allow RUST_LOG to override
    let base_directives = env::var("RUST_LOG").unwrap_or_else(|_| filter_directives(level));
    let (filter, reload_handle) = reload::Layer::new(EnvFilter::try_new(&base_directives)?);
    let writer = output.make_writer()?;
    let ansi = output.is_terminal();

    let subscriber = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => {
            subscriber
                .with(fmt::layer().json().with_writer(writer))
                .try_init()?;
        }
        LogFormat::Pretty => {
            subscriber
                .with(fmt::layer().pretty().with_ansi(ansi).with_writer(writer))
                .try_init()?;
        }
        LogFormat::Compact => {
            subscriber
                .with(
                    fmt::layer()
                        .compact()
                        .with_ansi(ansi)
                        .with_target(false)
                        .with_writer(writer),
                )
                .try_init()?;
        }
    }

    let handle = LevelHandle {
        state: Arc::new(Mutex::new(LevelState::new(level, base_directives))),
        reload: reload_handle,
    };
    let _ = LEVEL_HANDLE.set(handle.clone());
    Ok(handle)
}

/// Background task toggling DEBUG on SIGUSR1 until SIGINT or [`stop`](Self::stop)
pub struct LevelWatcher {
    signals: signal_hook_tokio::Handle,
    task: JoinHandle<()>,
}

impl LevelWatcher {
    pub fn spawn(level: LevelHandle) -> Result<Self, LoggingError> {
        let signals = Signals::new([SIGUSR1, SIGINT]).map_err(LoggingError::Signal)?;
        let handle = signals.handle();
        let task = tokio::spawn(watch_signals(signals, level));
        Ok(Self {
            signals: handle,
            task,
        })
    }

    /// Stop listening and wait for the task to finish
    pub async fn stop(self) {
        self.signals.close();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Log level watcher ended abnormally");
        }
    }
}

async fn watch_signals(mut signals: Signals, level: LevelHandle) {
    while let Some(signal) = signals.next().await {
        match signal {
            SIGUSR1 => match level.toggle_debug() {
                Ok(current) => info!(level = %current, "Log level toggled"),
                Err(e) => warn!(error = %e, "Failed to toggle log level"),
            },
            SIGINT => {
                debug!("Interrupt received, stopping log level watcher");
                break;
            }
            _ => {}
        }
    }
}

/// Create an MQTT operation span
#[macro_export]
macro_rules! mqtt_span {
    ($($field:tt)*) => {
        tracing::info_span!("mqtt_operation", $($field)*)
    };
}

/// Create a lifecycle event span
#[macro_export]
macro_rules! lifecycle_span {
    ($($field:tt)*) => {
        tracing::info_span!("lifecycle_event", $($field)*)
    };
}

// Re-export macros for convenience
pub use {lifecycle_span, mqtt_span};
