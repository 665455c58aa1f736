//! Configuration for the Modbus control layer.

use fieldgate_common::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::equipment::Equipment;
use crate::network::NetworkRange;
use crate::preset;
use crate::register::RegisterType;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read or is not valid JSON5.
    #[error(transparent)]
    Load(#[from] fieldgate_common::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Device I/O settings
    #[serde(default)]
    pub modbus: ModbusConfig,

    /// Slave-id discovery settings
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Network sweep settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// Equipment records to seed the in-memory store with
    #[serde(default)]
    pub equipment: Vec<Equipment>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// What to do when a device already has an operation in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Wait for the current operation to finish.
    #[default]
    Queue,
    /// Fail immediately with a busy error.
    Reject,
}

/// Device I/O configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusConfig {
    /// Timeout for every request and connection attempt, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Behavior for concurrent requests against the same device
    #[serde(default)]
    pub busy_policy: BusyPolicy,

    /// Read coils back after a normal-mode write
    #[serde(default = "default_true")]
    pub verify_writes: bool,

    /// Line settings used for serial (RTU) equipment addresses
    #[serde(default)]
    pub serial: SerialConfig,
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            busy_policy: BusyPolicy::default(),
            verify_writes: true,
            serial: SerialConfig::default(),
        }
    }
}

impl ModbusConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

/// Serial line settings for RTU devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Baud rate (default: 9600)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Data bits (default: 8)
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    /// Parity: "none", "even", or "odd" (default: "none")
    #[serde(default = "default_parity")]
    pub parity: String,
    /// Stop bits: 1 or 2 (default: 1)
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            parity: default_parity(),
            stop_bits: default_stop_bits(),
        }
    }
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_parity() -> String {
    "none".to_string()
}

fn default_stop_bits() -> u8 {
    1
}

/// Slave-id discovery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Per-probe timeout used when a scan request does not give one
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,

    /// Register type read by each probe (holding or input)
    #[serde(default = "default_probe_register_type")]
    pub probe_register_type: RegisterType,

    /// First register read by each probe
    #[serde(default)]
    pub probe_address: u16,

    /// Registers read by each probe
    #[serde(default = "default_probe_quantity")]
    pub probe_quantity: u16,

    /// Pause between probes, in milliseconds
    #[serde(default)]
    pub inter_probe_delay_ms: u64,

    /// Name prefix for equipment created from discovered slaves
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,

    /// Preset attached to equipment created from discovered slaves
    #[serde(default)]
    pub default_preset: Option<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_probe_timeout_ms(),
            probe_register_type: default_probe_register_type(),
            probe_address: 0,
            probe_quantity: default_probe_quantity(),
            inter_probe_delay_ms: 0,
            name_prefix: default_name_prefix(),
            default_preset: None,
        }
    }
}

fn default_probe_timeout_ms() -> u64 {
    500
}

fn default_probe_register_type() -> RegisterType {
    RegisterType::Holding
}

fn default_probe_quantity() -> u16 {
    4
}

fn default_name_prefix() -> String {
    "Slave".to_string()
}

/// Network sweep configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// IPv4 ranges to sweep ("10.0.0.0/24", "10.0.0.5-10.0.0.40", "10.0.0.7")
    #[serde(default)]
    pub ranges: Vec<String>,

    /// TCP ports probed on every host
    #[serde(default = "default_ports")]
    pub ports: Vec<u16>,

    /// Connect and identification timeout, in milliseconds
    #[serde(default = "default_network_timeout_ms")]
    pub timeout_ms: u64,

    /// Hosts probed in parallel
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Unit id used for identification requests
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ranges: Vec::new(),
            ports: default_ports(),
            timeout_ms: default_network_timeout_ms(),
            concurrency: default_concurrency(),
            unit_id: default_unit_id(),
        }
    }
}

fn default_ports() -> Vec<u16> {
    vec![502]
}

fn default_network_timeout_ms() -> u64 {
    300
}

fn default_concurrency() -> usize {
    32
}

fn default_unit_id() -> u8 {
    1
}

impl GatewayConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: GatewayConfig = fieldgate_common::load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = fieldgate_common::parse_config(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.modbus.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "modbus.timeout_ms must be greater than 0".to_string(),
            ));
        }

        match self.modbus.serial.parity.to_lowercase().as_str() {
            "none" | "even" | "odd" => {}
            other => {
                return Err(ConfigError::Validation(format!(
                    "invalid parity '{}' (use none, even, or odd)",
                    other
                )));
            }
        }

        if self.discovery.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "discovery.timeout_ms must be greater than 0".to_string(),
            ));
        }

        if !matches!(
            self.discovery.probe_register_type,
            RegisterType::Holding | RegisterType::Input
        ) {
            return Err(ConfigError::Validation(format!(
                "discovery.probe_register_type must be holding or input, got {}",
                self.discovery.probe_register_type
            )));
        }

        if !(1..=125).contains(&self.discovery.probe_quantity) {
            return Err(ConfigError::Validation(
                "discovery.probe_quantity must be 1-125".to_string(),
            ));
        }

        if let Some(key) = &self.discovery.default_preset {
            if preset::load_preset(key).is_err() {
                return Err(ConfigError::Validation(format!(
                    "discovery.default_preset: unknown preset '{}'",
                    key
                )));
            }
        }

        if self.network.concurrency == 0 {
            return Err(ConfigError::Validation(
                "network.concurrency must be at least 1".to_string(),
            ));
        }

        if self.network.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "network.timeout_ms must be greater than 0".to_string(),
            ));
        }

        for range in &self.network.ranges {
            NetworkRange::parse(range)
                .map_err(|e| ConfigError::Validation(format!("network.ranges: {}", e)))?;
        }

        let mut ids = HashSet::new();
        for equipment in &self.equipment {
            equipment
                .validate()
                .map_err(|e| ConfigError::Validation(format!("equipment '{}': {}", equipment.id, e)))?;

            if !ids.insert(equipment.id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate equipment id '{}'",
                    equipment.id
                )));
            }
        }

        Ok(())
    }
}
