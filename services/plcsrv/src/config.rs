//! Service configuration
//!
//! Loaded with figment: built-in defaults (the field deployment), then the
//! YAML file, then `PLCSRV_*` environment variables (`__` separates nested
//! keys, e.g. `PLCSRV_SCHEDULER__MAX_CONSECUTIVE_FAILURES=8`).

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::catalog::Catalog;
use crate::error::{PlcError, Result};
use crate::runtime::reconnect::RetryPolicy;
use crate::transport::ConnectTarget;
use crate::value::DeviceId;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "PLCSRV_";

// ============================================================================
// Defaults
// ============================================================================

fn default_endpoint_id() -> String {
    "s7-400".to_string()
}
fn default_host() -> String {
    "10.21.178.100".to_string()
}
fn default_port() -> u16 {
    102
}
fn default_slot() -> u16 {
    3
}
fn default_cycle_ms() -> u64 {
    1000
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_interval_ms() -> u64 {
    2000
}
fn default_keep_alive_ms() -> u64 {
    5000
}
fn default_max_consecutive_failures() -> u32 {
    5
}
fn default_persistent_retry_ms() -> u64 {
    60_000
}
fn default_queue_capacity() -> usize {
    64
}
fn default_true() -> bool {
    true
}

// ============================================================================
// Types
// ============================================================================

/// One physical PLC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEndpoint {
    #[serde(default = "default_endpoint_id")]
    pub id: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub rack: u16,
    #[serde(default = "default_slot")]
    pub slot: u16,
    /// Default poll cadence for devices on this PLC
    #[serde(default = "default_cycle_ms")]
    pub cycle_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Timeout for reads and writes, defaults to `connect_timeout_ms`
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    /// Connect attempts per cycle
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    #[serde(default = "default_keep_alive_ms")]
    pub keep_alive_ms: u64,
}

impl Default for DeviceEndpoint {
    fn default() -> Self {
        Self {
            id: default_endpoint_id(),
            host: default_host(),
            port: default_port(),
            rack: 0,
            slot: default_slot(),
            cycle_ms: default_cycle_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: None,
            max_retries: default_max_retries(),
            retry_interval_ms: default_retry_interval_ms(),
            keep_alive_ms: default_keep_alive_ms(),
        }
    }
}

impl DeviceEndpoint {
    pub fn target(&self) -> ConnectTarget {
        ConnectTarget {
            host: self.host.clone(),
            port: self.port,
            rack: self.rack,
            slot: self.slot,
        }
    }

    pub fn cycle(&self) -> Duration {
        Duration::from_millis(self.cycle_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.unwrap_or(self.connect_timeout_ms))
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.max_retries, self.retry_interval())
    }
}

/// A logical device polled from an endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoredDevice {
    pub id: DeviceId,
    #[serde(default = "default_endpoint_id")]
    pub endpoint: String,
    /// Overrides the endpoint's cadence
    #[serde(default)]
    pub cycle_ms: Option<u64>,
}

impl MonitoredDevice {
    fn new(id: &str, cycle_ms: Option<u64>) -> Self {
        Self {
            id: DeviceId::from(id),
            endpoint: default_endpoint_id(),
            cycle_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Consecutive failed polls before a forced reconnect
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Reconnect interval once `max_retries` reconnect cycles in a row have
    /// failed and the device is reported as a persistent failure
    #[serde(default = "default_persistent_retry_ms")]
    pub persistent_retry_ms: u64,
}

impl SchedulerConfig {
    pub fn persistent_retry(&self) -> Duration {
        Duration::from_millis(self.persistent_retry_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: default_max_consecutive_failures(),
            persistent_retry_ms: default_persistent_retry_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcasterConfig {
    /// Pending updates per subscriber before the oldest is dropped
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandConfig {
    /// Read written addresses back and compare
    #[serde(default = "default_true")]
    pub verify_writes: bool,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            verify_writes: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default)]
    pub json: bool,
}

/// Root configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlcConfig {
    pub endpoints: Vec<DeviceEndpoint>,
    pub devices: Vec<MonitoredDevice>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub broadcaster: BroadcasterConfig,
    #[serde(default)]
    pub commands: CommandConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for PlcConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![DeviceEndpoint::default()],
            devices: vec![
                MonitoredDevice::new("tlv1", None),
                MonitoredDevice::new("tlv2", None),
                MonitoredDevice::new("ct", Some(30_000)),
                MonitoredDevice::new("pt", None),
            ],
            scheduler: SchedulerConfig::default(),
            broadcaster: BroadcasterConfig::default(),
            commands: CommandConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

impl PlcConfig {
    fn base() -> Figment {
        Figment::from(Serialized::defaults(PlcConfig::default()))
    }

    fn env() -> Env {
        Env::prefixed(ENV_PREFIX).split("__")
    }

    /// Defaults, then the optional YAML file, then environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Self::base();
        if let Some(path) = path {
            if !path.exists() {
                return Err(PlcError::config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            debug!("Loading configuration from {}", path.display());
            figment = figment.merge(Yaml::file(path));
        }
        let config: PlcConfig = figment.merge(Self::env()).extract()?;
        Ok(config)
    }

    /// Defaults overlaid with a YAML document (no environment)
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(Self::base().merge(Yaml::string(yaml)).extract()?)
    }

    pub fn endpoint(&self, id: &str) -> Option<&DeviceEndpoint> {
        self.endpoints.iter().find(|e| e.id == id)
    }

    /// Poll cadence of a device: its own override or its endpoint's
    pub fn device_cycle(&self, device: &MonitoredDevice) -> Option<Duration> {
        match device.cycle_ms {
            Some(ms) => Some(Duration::from_millis(ms)),
            None => self.endpoint(&device.endpoint).map(DeviceEndpoint::cycle),
        }
    }

    /// Point every endpoint at another host (CLI / env override)
    pub fn override_host(&mut self, host: &str) {
        for endpoint in &mut self.endpoints {
            endpoint.host = host.to_string();
        }
    }

    /// Check references and timings against the catalog
    pub fn validate(&self, catalog: &Catalog) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(PlcError::config("No endpoints configured"));
        }
        if self.devices.is_empty() {
            return Err(PlcError::config("No devices configured"));
        }

        let mut endpoint_ids = HashSet::new();
        let mut plcs = HashMap::new();
        for endpoint in &self.endpoints {
            if !endpoint_ids.insert(endpoint.id.as_str()) {
                return Err(PlcError::config(format!(
                    "Duplicate endpoint id: {}",
                    endpoint.id
                )));
            }
            let unit = (
                endpoint.host.trim().to_ascii_lowercase(),
                endpoint.port,
                endpoint.rack,
                endpoint.slot,
            );
            if let Some(other) = plcs.insert(unit, endpoint.id.as_str()) {
                return Err(PlcError::config(format!(
                    "Endpoints {} and {} address the same PLC ({}); devices on one PLC share one endpoint",
                    other,
                    endpoint.id,
                    endpoint.target()
                )));
            }
            if endpoint.host.trim().is_empty() {
                return Err(PlcError::config(format!(
                    "Endpoint {} has an empty host",
                    endpoint.id
                )));
            }
            let timings = [
                ("cycle_ms", endpoint.cycle_ms),
                ("connect_timeout_ms", endpoint.connect_timeout_ms),
                ("keep_alive_ms", endpoint.keep_alive_ms),
                ("request_timeout_ms", endpoint.request_timeout_ms.unwrap_or(1)),
            ];
            if let Some((name, _)) = timings.iter().find(|(_, v)| *v == 0) {
                return Err(PlcError::config(format!(
                    "Endpoint {}: {} must be greater than zero",
                    endpoint.id, name
                )));
            }
            if endpoint.max_retries == 0 {
                return Err(PlcError::config(format!(
                    "Endpoint {}: max_retries must be at least 1",
                    endpoint.id
                )));
            }
        }

        let mut device_ids = HashSet::new();
        for device in &self.devices {
            if !device_ids.insert(device.id.as_str()) {
                return Err(PlcError::config(format!("Duplicate device id: {}", device.id)));
            }
            catalog.device(device.id.as_str())?;
            if self.endpoint(&device.endpoint).is_none() {
                return Err(PlcError::config(format!(
                    "Device {} references unknown endpoint {}",
                    device.id, device.endpoint
                )));
            }
            if device.cycle_ms == Some(0) {
                return Err(PlcError::config(format!(
                    "Device {}: cycle_ms must be greater than zero",
                    device.id
                )));
            }
        }

        if self.scheduler.max_consecutive_failures == 0 {
            return Err(PlcError::config(
                "scheduler.max_consecutive_failures must be at least 1",
            ));
        }
        if self.scheduler.persistent_retry_ms == 0 {
            return Err(PlcError::config(
                "scheduler.persistent_retry_ms must be greater than zero",
            ));
        }
        if self.broadcaster.queue_capacity == 0 {
            return Err(PlcError::config("broadcaster.queue_capacity must be at least 1"));
        }
        Ok(())
    }
}
