//! Structured logging for mailgate
//!
//! One global `tracing` subscriber: stderr in the configured format, plus an
//! optional private log file written in the same format without colors.
//!
//! # Correlation Fields
//!
//! Use these field names consistently in spans and events:
//! - `trace_id`: Execution record identifier
//! - `action`, `status`: Execution kind and lifecycle state
//! - `cache_key`: List cache key
//! - `channel`, `thread_ts`: Chat scope
//!
//! Never log mail bodies. Log the audit digest instead.

pub use crate::config::LogFormat;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

static INSTALLED: OnceLock<()> = OnceLock::new();

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default level; `RUST_LOG` directives take precedence
    pub level: String,

    pub format: LogFormat,

    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

impl From<&crate::config::GeneralConfig> for LogConfig {
    fn from(general: &crate::config::GeneralConfig) -> Self {
        Self {
            level: general.log_level.clone(),
            format: general.log_format,
            file: general.log_file.as_ref().map(PathBuf::from),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("{0}")]
    InvalidLevel(String),

    #[error("failed to create log file: {0}")]
    FileCreate(#[from] io::Error),

    #[error("failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Accepted values for `general.log_level`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(format!(
                "unknown log level: {s}. Expected one of: trace, debug, info, warn, error"
            )),
        }
    }
}

/// Open (or create) the log file, owner-only on unix
fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        let mut dirs = std::fs::DirBuilder::new();
        dirs.recursive(true);
        #[cfg(unix)]
        std::os::unix::fs::DirBuilderExt::mode(&mut dirs, 0o700);
        dirs.create(parent)?;
    }

    let mut options = std::fs::OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    std::os::unix::fs::OpenOptionsExt::mode(&mut options, 0o600);
    options.open(path)
}

/// One formatting layer over `writer`
fn format_layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_ansi(ansi)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_timer(SystemTime)
            .with_writer(writer)
            .with_target(true)
            .with_current_span(true)
            .with_span_list(false)
            .flatten_event(true)
            .boxed(),
    }
}

/// Initialize the global logging subscriber
///
/// Call once at startup; later calls return `LogError::AlreadyInitialized`.
/// `RUST_LOG` (e.g. `RUST_LOG=mailgate_core=debug`) adds directives on top of
/// the configured default level.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    let level: LogLevel = config.level.parse().map_err(LogError::InvalidLevel)?;
    if INSTALLED.get().is_some() {
        return Err(LogError::AlreadyInitialized);
    }

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from(level).into())
        .from_env_lossy();

    let mut layers: Vec<BoxedLayer> = vec![format_layer(config.format, io::stderr, true)];
    if let Some(path) = config.file.as_deref() {
        let file = open_log_file(path)?;
        layers.push(format_layer(config.format, Mutex::new(file), false));
    }

    let subscriber = tracing_subscriber::registry().with(layers).with(filter);
    tracing::subscriber::set_global_default(subscriber)?;
    let _ = INSTALLED.set(());

    tracing::debug!(
        log_level = %config.level,
        log_format = %config.format,
        log_file = ?config.file,
        "logging initialized"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Capture {
        buffer: Arc<Mutex<Vec<u8>>>,
    }

    impl Capture {
        fn lines(&self) -> Vec<String> {
            let bytes = self.buffer.lock().unwrap().clone();
            String::from_utf8(bytes)
                .unwrap()
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(str::to_string)
                .collect()
        }
    }

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.buffer.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Capture {
        type Writer = Self;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn log_format_from_str() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn log_level_parses_into_filter() {
        let warn: LogLevel = "warning".parse().unwrap();
        assert_eq!(LevelFilter::from(warn), LevelFilter::WARN);
        assert_eq!(
            LevelFilter::from(" ERROR".parse::<LogLevel>().unwrap()),
            LevelFilter::ERROR
        );
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn init_rejects_unknown_level_before_installing() {
        let config = LogConfig {
            level: "loud".to_string(),
            ..LogConfig::default()
        };
        assert!(matches!(init_logging(&config), Err(LogError::InvalidLevel(_))));
    }

    #[test]
    fn log_config_from_general_section() {
        let general = crate::config::GeneralConfig {
            log_level: "debug".to_string(),
            log_format: LogFormat::Json,
            log_file: Some("/tmp/mailgate.log".to_string()),
            data_dir: "/tmp".to_string(),
        };
        let config = LogConfig::from(&general);
        assert_eq!(config.level, "debug");
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.file, Some(PathBuf::from("/tmp/mailgate.log")));
    }

    #[test]
    fn json_layer_carries_correlation_fields() {
        let capture = Capture::default();
        let subscriber = tracing_subscriber::registry()
            .with(format_layer(LogFormat::Json, capture.clone(), false))
            .with(EnvFilter::new("info"));

        tracing::subscriber::with_default(subscriber, || {
            tracing::debug!(trace_id = "exec_hidden", "filtered out");
            tracing::info!(trace_id = "exec_a1", status = "confirmed", "transition");
        });

        let lines = capture.lines();
        assert_eq!(lines.len(), 1);
        let parsed: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert!(parsed.get("timestamp").is_some());
        assert_eq!(parsed["trace_id"], "exec_a1");
        assert_eq!(parsed["status"], "confirmed");
    }

    #[test]
    fn pretty_layer_writes_plain_text_without_ansi() {
        let capture = Capture::default();
        let layer = format_layer(LogFormat::Pretty, capture.clone(), false);
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(cache_key = "gmail|user=U1", "cache miss");
        });

        let lines = capture.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("cache miss"));
        assert!(lines[0].contains("cache_key=\"gmail|user=U1\""));
        assert!(!lines[0].contains('\u{1b}'));
    }

    #[cfg(unix)]
    #[test]
    fn log_file_is_created_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("mailgate.log");
        let _file = open_log_file(&path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o700);
    }
}
