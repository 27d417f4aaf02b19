//! Unified logging bootstrap for plcsrv services
//!
//! Console output plus a daily rolling log file, both behind one reloadable
//! `EnvFilter` so the level can be changed while the service runs.

use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    filter,
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    reload,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Environment variable that overrides the log root directory
pub const LOG_DIR_ENV: &str = "PLCSRV_LOG_DIR";

/// Custom format for log level with brackets: `[INFO]`, `[WARN]`, etc.
fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

fn level_color(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "\x1b[35m",
        Level::DEBUG => "\x1b[34m",
        Level::INFO => "\x1b[32m",
        Level::WARN => "\x1b[33m",
        Level::ERROR => "\x1b[31m",
    }
}

/// Event formatter that outputs: `timestamp [LEVEL] target: message`
///
/// Example output: `2026-10-16T08:12:03.102311Z [INFO] plcsrv::session: [STATUS] ...`
struct BracketedLevelFormat {
    with_target: bool,
}

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            write!(writer, "{}{}\x1b[0m ", level_color(&level), format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        if self.with_target {
            write!(writer, "{}: ", event.metadata().target())?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

// ============================================================================
// Log Root Directory
// ============================================================================

static LOG_ROOT: OnceLock<PathBuf> = OnceLock::new();

/// Initialize the log root directory
///
/// Priority:
/// 1. `PLCSRV_LOG_DIR` environment variable
/// 2. `config_dir` (from CLI or configuration file)
/// 3. `logs`
pub fn init_log_root(config_dir: Option<&str>) -> PathBuf {
    LOG_ROOT
        .get_or_init(|| {
            std::env::var(LOG_DIR_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|_| {
                    config_dir
                        .map(PathBuf::from)
                        .unwrap_or_else(|| PathBuf::from("logs"))
                })
        })
        .clone()
}

/// Get log root directory
///
/// Falls back to the environment or `logs` when [`init_log_root`] was never
/// called. Test binaries log into the system temp directory instead.
pub fn get_log_root() -> PathBuf {
    LOG_ROOT.get().cloned().unwrap_or_else(|| {
        std::env::var(LOG_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                if is_test_environment() {
                    std::env::temp_dir().join("plcsrv-test-logs")
                } else {
                    PathBuf::from("logs")
                }
            })
    })
}

fn is_test_environment() -> bool {
    if std::env::var("CARGO_TARGET_TMPDIR").is_ok() {
        return true;
    }

    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.to_str().map(|s| s.contains("/deps/")))
        .unwrap_or(false)
}

// ============================================================================
// Subscriber setup
// ============================================================================

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

type EnvFilterReloadHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;
static LOG_FILTER_HANDLE: OnceLock<EnvFilterReloadHandle> = OnceLock::new();
static CURRENT_LOG_LEVEL: OnceLock<Mutex<String>> = OnceLock::new();

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name, used as the default filter target and file prefix
    pub service_name: String,
    /// Base directory for log files
    pub log_dir: PathBuf,
    /// Console log level (used when `RUST_LOG` is not set)
    pub console_level: Level,
    /// Write a log file in addition to the console
    pub enable_file: bool,
    /// JSON lines in the log file instead of the bracketed format
    pub enable_json: bool,
    /// ANSI colors on the console
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "plcsrv".to_string(),
            log_dir: get_log_root(),
            console_level: Level::INFO,
            enable_file: true,
            enable_json: false,
            ansi: true,
        }
    }
}

/// Build the default filter directive for a service
///
/// `info` globally, one level more verbose for the service's own crate when
/// the console level is `info` or quieter.
pub fn default_filter(service_name: &str, level: Level) -> String {
    let own_level = if level >= Level::DEBUG {
        level
    } else {
        Level::DEBUG
    };
    format!(
        "{},{}={}",
        level.as_str().to_lowercase(),
        service_name,
        own_level.as_str().to_lowercase()
    )
}

/// Install the global subscriber
///
/// `RUST_LOG` wins over the configured level. Calling this twice returns an
/// error from the second `init`.
pub fn init_with_config(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let filter_str = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| default_filter(&config.service_name, config.console_level));
    let env_filter = EnvFilter::try_new(&filter_str)?;

    let (reload_filter, reload_handle) = reload::Layer::new(env_filter);
    let _ = LOG_FILTER_HANDLE.set(reload_handle);
    let current = CURRENT_LOG_LEVEL.get_or_init(|| Mutex::new(String::new()));
    if let Ok(mut slot) = current.lock() {
        *slot = filter_str.clone();
    }

    let console_layer = fmt::layer()
        .with_ansi(config.ansi)
        .event_format(BracketedLevelFormat { with_target: false })
        .boxed();

    let file_layer = if config.enable_file {
        std::fs::create_dir_all(&config.log_dir)?;
        let appender = tracing_appender::rolling::daily(
            &config.log_dir,
            format!("{}.log", config.service_name),
        );
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        let _ = FILE_GUARD.set(guard);

        let layer = if config.enable_json {
            fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_target(true)
                .with_filter(filter::LevelFilter::TRACE)
                .boxed()
        } else {
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .event_format(BracketedLevelFormat { with_target: true })
                .boxed()
        };
        Some(layer)
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(reload_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::info!(
        "Logging: {} @ {:?} (filter: {})",
        config.service_name,
        config.log_dir,
        filter_str
    );
    Ok(())
}

/// Dynamically set the log filter at runtime
///
/// Accepts a plain level (`debug`) or a full directive (`info,plcsrv=trace`).
pub fn set_log_level(level: &str) -> Result<(), String> {
    let handle = LOG_FILTER_HANDLE
        .get()
        .ok_or("Logging not initialized with reload support")?;

    let new_filter =
        EnvFilter::try_new(level).map_err(|e| format!("Invalid log level '{}': {}", level, e))?;

    handle
        .reload(new_filter)
        .map_err(|e| format!("Failed to reload log filter: {}", e))?;

    if let Some(current) = CURRENT_LOG_LEVEL.get() {
        if let Ok(mut guard) = current.lock() {
            *guard = level.to_string();
        }
    }

    tracing::info!("Log level changed to: {}", level);
    Ok(())
}

/// Get the current log filter directive
pub fn get_log_level() -> String {
    CURRENT_LOG_LEVEL
        .get()
        .and_then(|m| m.lock().ok())
        .map(|guard| guard.clone())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_raises_service_verbosity() {
        assert_eq!(default_filter("plcsrv", Level::INFO), "info,plcsrv=debug");
        assert_eq!(default_filter("plcsrv", Level::WARN), "warn,plcsrv=debug");
        assert_eq!(default_filter("plcsrv", Level::TRACE), "trace,plcsrv=trace");
    }

    #[test]
    fn test_format_level_brackets() {
        assert_eq!(format_level(&Level::WARN), "[WARN]");
        assert_eq!(format_level(&Level::ERROR), "[ERROR]");
    }

    #[test]
    fn test_runtime_level_change() {
        let config = LogConfig {
            enable_file: false,
            ansi: false,
            ..Default::default()
        };
        init_with_config(config).unwrap();

        set_log_level("info,plcsrv=trace").unwrap();
        assert_eq!(get_log_level(), "info,plcsrv=trace");
        assert!(init_with_config(LogConfig::default()).is_err());
    }

    #[test]
    fn test_log_root_in_tests_is_not_project_dir() {
        if std::env::var(LOG_DIR_ENV).is_err() && LOG_ROOT.get().is_none() {
            let root = get_log_root();
            assert!(root.ends_with("plcsrv-test-logs"));
        }
    }
}
