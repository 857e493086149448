//! Log installation.
//!
//! ## Learning: Reloadable Filters
//!
//! ```text
//! Registry ─▶ reload::Layer<EnvFilter> ─▶ fmt layer ─▶ writer
//!                    ▲                                  │
//!              ReloadHandle                  file (non-blocking) or stderr
//!                    │
//!        internal `set_log_level` program
//! ```
//!
//! stdout carries the RPC stream, so logs go to stderr unless
//! `RIBOSOME_LOG_FILE` names a file. The filter sits behind a reload layer;
//! its handle is given to the plugin state as a [`LogHandler`], which lets
//! the editor change verbosity of a running plugin.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use ribosome_core::LogHandler;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, reload};

use crate::{HostError, HostResult};

/// Selects the file sink.
pub const LOG_FILE_VAR: &str = "RIBOSOME_LOG_FILE";

/// Selects the line format.
pub const LOG_FORMAT_VAR: &str = "RIBOSOME_FILE_LOG_FMT";

type ReloadHandle = reload::Handle<EnvFilter, Registry>;

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Full,
    Compact,
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" | "" => Ok(Self::Full),
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(HostError::Logging(format!("unknown log format `{}`", other))),
        }
    }
}

/// Where and how to log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogSettings {
    /// Filter directive used when `RUST_LOG` is unset
    pub level: String,
    /// Log file; stderr when absent
    pub file: Option<String>,
    pub format: LogFormat,
}

impl LogSettings {
    /// Reads the sink and format from the environment.
    pub fn from_env(level: impl Into<String>) -> HostResult<Self> {
        let file = std::env::var(LOG_FILE_VAR).ok().filter(|f| !f.trim().is_empty());
        let format = match std::env::var(LOG_FORMAT_VAR) {
            Ok(value) => value.parse()?,
            Err(_) => LogFormat::default(),
        };
        Ok(Self {
            level: level.into(),
            file,
            format,
        })
    }

    fn build_filter(&self) -> HostResult<EnvFilter> {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.level))
            .map_err(|e| HostError::Logging(e.to_string()))
    }
}

/// Keeps the file writer flushing and the filter reloadable.
///
/// Dropping the guard flushes buffered log lines.
pub struct LogGuard {
    _worker: Option<WorkerGuard>,
    handler: Arc<ReloadLogHandler>,
}

impl LogGuard {
    /// The runtime handle to the installed filter.
    pub fn handler(&self) -> Arc<dyn LogHandler> {
        self.handler.clone()
    }
}

/// Installs the global subscriber.
pub fn install(settings: &LogSettings) -> HostResult<LogGuard> {
    let filter = settings.build_filter()?;
    let initial = filter.to_string();
    let (filter, handle) = reload::Layer::new(filter);

    let (writer, worker) = match &settings.file {
        Some(file) => {
            let (writer, guard) = file_writer(Path::new(file))?;
            (writer, Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };
    let ansi = settings.file.is_none();

    let layer = match settings.format {
        LogFormat::Full => fmt::layer().with_writer(writer).with_ansi(ansi).boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_writer(writer)
            .with_ansi(ansi)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_writer(writer)
            .with_ansi(ansi)
            .boxed(),
        LogFormat::Json => fmt::layer().json().with_writer(writer).boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .map_err(|e| HostError::Logging(e.to_string()))?;

    Ok(LogGuard {
        _worker: worker,
        handler: Arc::new(ReloadLogHandler::new(handle, initial)),
    })
}

fn file_writer(path: &Path) -> HostResult<(BoxMakeWriter, WorkerGuard)> {
    let file_name = path
        .file_name()
        .ok_or_else(|| HostError::Logging(format!("not a file: {}", path.display())))?;
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(directory)?;
    let appender = tracing_appender::rolling::never(directory, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    Ok((BoxMakeWriter::new(writer), guard))
}

/// A [`LogHandler`] that swaps the filter of an installed subscriber.
pub struct ReloadLogHandler {
    handle: ReloadHandle,
    level: Mutex<String>,
}

impl ReloadLogHandler {
    pub fn new(handle: ReloadHandle, level: impl Into<String>) -> Self {
        Self {
            handle,
            level: Mutex::new(level.into()),
        }
    }
}

impl LogHandler for ReloadLogHandler {
    fn set_level(&self, level: &str) -> Result<(), String> {
        let filter = EnvFilter::try_new(level).map_err(|e| e.to_string())?;
        self.handle.reload(filter).map_err(|e| e.to_string())?;
        let mut current = self.level.lock().map_err(|e| e.to_string())?;
        *current = level.to_string();
        tracing::info!(level, "log level changed");
        Ok(())
    }

    fn level(&self) -> String {
        match self.level.lock() {
            Ok(level) => level.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}
