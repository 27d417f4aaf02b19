//! Service bootstrap
//!
//! Command-line arguments, configuration loading and logging setup for the
//! `plcsrv` binary.

use clap::Parser;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::catalog::Catalog;
use crate::config::{LoggingConfig, PlcConfig};
use crate::error::{PlcError, Result};
use common::ValueSource;

/// Service name used for log files and filter targets
pub const SERVICE_NAME: &str = "plcsrv";

/// Environment variable overriding the PLC host of every endpoint
pub const PLC_HOST_ENV: &str = "PLCSRV_PLC_HOST";

/// Environment variable for the console log level
pub const LOG_LEVEL_ENV: &str = "PLCSRV_LOG_LEVEL";

/// Command-line arguments for plcsrv
#[derive(Parser, Debug, Clone, Default)]
#[command(
    name = "plcsrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "S7-400 polling and reconnection service",
    long_about = None
)]
pub struct Args {
    /// Path to the YAML configuration file
    #[arg(short = 'c', long, env = "PLCSRV_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long)]
    pub log_level: Option<String>,

    /// Directory for log files
    #[arg(long)]
    pub log_dir: Option<String>,

    /// PLC host, replaces the host of every configured endpoint
    #[arg(long)]
    pub plc_host: Option<String>,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,

    /// Validation mode - only validate configuration without starting service
    #[arg(long)]
    pub validate: bool,

    /// Print the effective configuration as YAML and exit
    #[arg(long)]
    pub print_config: bool,

    /// Let the simulated PLC move the cranes
    #[arg(long)]
    pub simulate_motion: bool,
}

/// Parse a log level string, defaulting to `INFO`
pub fn parse_log_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" | "warning" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}

/// Load the configuration file and apply command-line overrides
pub fn load_configuration(args: &Args) -> Result<PlcConfig> {
    let mut config = PlcConfig::load(args.config.as_deref())?;

    let (host, source) = common::resolve_string(args.plc_host.clone(), PLC_HOST_ENV, None, "");
    if source != ValueSource::Default {
        debug!("PLC host override from {:?}: {}", source, host);
        config.override_host(&host);
    }
    Ok(config)
}

/// Render the effective configuration (file, environment and overrides merged)
pub fn render_configuration(config: &PlcConfig) -> Result<String> {
    serde_yaml::to_string(config)
        .map_err(|e| PlcError::config(format!("Failed to render configuration: {}", e)))
}

/// Initialize logging
///
/// Log root directory priority:
/// 1. PLCSRV_LOG_DIR environment variable
/// 2. `--log-dir`, then `logging.dir` from the configuration
/// 3. Default "logs"
pub fn initialize_logging(args: &Args, logging: &LoggingConfig) -> Result<()> {
    let config_dir = args.log_dir.as_deref().or(logging.dir.as_deref());
    let log_root = common::logging::init_log_root(config_dir);

    let (level, _) = common::resolve_string(
        args.log_level.clone(),
        LOG_LEVEL_ENV,
        logging.level.clone(),
        "info",
    );

    let log_config = common::logging::LogConfig {
        service_name: SERVICE_NAME.to_string(),
        log_dir: log_root.join(SERVICE_NAME),
        console_level: parse_log_level(&level),
        enable_file: true,
        enable_json: logging.json,
        ansi: !args.no_color,
    };

    common::logging::init_with_config(log_config)
        .map_err(|e| PlcError::config(format!("Failed to init logging: {}", e)))
}

/// Validate the configuration against the catalog and describe it
pub fn validate_configuration(config: &PlcConfig, catalog: &Catalog) -> Result<()> {
    config.validate(catalog)?;

    info!("Found {} endpoint(s)", config.endpoints.len());
    for endpoint in &config.endpoints {
        info!(
            "  Endpoint {}: {} (cycle {}ms, {} retries every {}ms, keep-alive {}ms)",
            endpoint.id,
            endpoint.target(),
            endpoint.cycle_ms,
            endpoint.max_retries,
            endpoint.retry_interval_ms,
            endpoint.keep_alive_ms
        );
    }

    info!("Found {} device(s)", config.devices.len());
    for device in &config.devices {
        let addresses = catalog.addresses_for_device(device.id.as_str()).len();
        let cycle = config
            .device_cycle(device)
            .map_or(0, |c| c.as_millis());
        info!(
            "  Device {} on {}: {} addresses every {}ms",
            device.id, device.endpoint, addresses, cycle
        );
    }
    Ok(())
}
