use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Battery hysteresis band. Only constructible with `0 <= low < high <= 100`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    low_percent: f32,
    high_percent: f32,
}

impl Thresholds {
    pub fn new(low_percent: f32, high_percent: f32) -> Result<Self, ConfigError> {
        let thresholds = Self {
            low_percent,
            high_percent,
        };
        thresholds.validate()?;
        Ok(thresholds)
    }

    pub fn low(&self) -> f32 {
        self.low_percent
    }

    pub fn high(&self) -> f32 {
        self.high_percent
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for value in [self.low_percent, self.high_percent] {
            if !value.is_finite() || !(0.0..=100.0).contains(&value) {
                return Err(ConfigError::ThresholdRange(value));
            }
        }
        if self.low_percent >= self.high_percent {
            return Err(ConfigError::InvertedThresholds {
                low: self.low_percent,
                high: self.high_percent,
            });
        }
        Ok(())
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            low_percent: 20.0,
            high_percent: 80.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub ping_timeout_ms: u64,
    pub watchdog_interval_ms: u64,
    pub command_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    pub max_reconcile_rounds: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ping_timeout_ms: 300_000,
            watchdog_interval_ms: 10_000,
            command_timeout_ms: 5_000,
            shutdown_grace_ms: 5_000,
            max_reconcile_rounds: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    pub client_id: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            user: String::new(),
            pass: String::new(),
            client_id: "smartplug-controller".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlugDriver {
    Mqtt,
    Simulated,
}

impl PlugDriver {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mqtt" => Some(Self::Mqtt),
            "simulated" | "sim" | "dry-run" => Some(Self::Simulated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub device_id: String,
    #[serde(default)]
    pub device_ip: String,
    /// MQTT topic base of the plug; defaults to `device_id`.
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default = "default_dp_id")]
    pub dp_id: u8,
}

fn default_dp_id() -> u8 {
    1
}

impl DeviceConfig {
    pub fn topic_base(&self) -> &str {
        self.topic
            .as_deref()
            .filter(|topic| !topic.is_empty())
            .unwrap_or(&self.device_id)
    }

    /// `device_id@device_ip`, safe to log.
    pub fn label(&self) -> String {
        if self.device_ip.is_empty() {
            self.device_id.clone()
        } else {
            format!("{}@{}", self.device_id, self.device_ip)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub server: ServerConfig,
    pub thresholds: Thresholds,
    pub engine: EngineConfig,
    pub mqtt: MqttConfig,
    pub driver: PlugDriver,
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceConfig>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            thresholds: Thresholds::default(),
            engine: EngineConfig::default(),
            mqtt: MqttConfig::default(),
            driver: PlugDriver::Mqtt,
            devices: BTreeMap::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.thresholds.validate()?;

        let durations = [
            ("ping timeout", self.engine.ping_timeout_ms),
            ("watchdog interval", self.engine.watchdog_interval_ms),
            ("command timeout", self.engine.command_timeout_ms),
        ];
        for (name, value) in durations {
            if value == 0 {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        if self.engine.max_reconcile_rounds == 0 {
            return Err(ConfigError::ZeroDuration("max reconcile rounds"));
        }
        Ok(())
    }
}

pub fn normalize_identifier(identifier: &str) -> String {
    identifier.trim().to_uppercase()
}

/// Result of parsing a device mapping. Entries carrying a Tuya local key are
/// accepted but the key itself is dropped; `ignored_local_keys` names them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceMapping {
    pub devices: BTreeMap<String, DeviceConfig>,
    pub rejected: Vec<ConfigError>,
    pub ignored_local_keys: Vec<String>,
}

/// Parses `NAME=DEVICE_ID:DEVICE_IP[:LOCAL_KEY]` entries separated by commas.
/// Malformed entries are skipped and reported in `rejected`. Topic overrides
/// are only available through the JSON mapping file.
pub fn parse_device_mapping(raw: &str) -> DeviceMapping {
    let mut mapping = DeviceMapping::default();

    for entry in raw.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
        let Some((name, device_info)) = entry.split_once('=') else {
            mapping.rejected.push(invalid(name_only(entry), "missing '=' separator"));
            continue;
        };

        let name = normalize_identifier(name);
        if name.is_empty() {
            mapping.rejected.push(invalid("", "empty computer name"));
            continue;
        }

        // The key may itself contain ':', so everything after the IP is the key.
        let parts: Vec<&str> = device_info.splitn(3, ':').map(str::trim).collect();
        let (device_id, device_ip, local_key) = match parts.as_slice() {
            [id, ip] => (*id, *ip, None),
            [id, ip, key] => (*id, *ip, Some(*key)),
            _ => {
                mapping
                    .rejected
                    .push(invalid(&name, "expected DEVICE_ID:DEVICE_IP[:LOCAL_KEY]"));
                continue;
            }
        };

        if device_id.is_empty() {
            mapping.rejected.push(invalid(&name, "empty device id"));
            continue;
        }
        if local_key.is_some_and(|key| !key.is_empty()) {
            mapping.ignored_local_keys.push(name.clone());
        }

        mapping.devices.insert(
            name,
            DeviceConfig {
                device_id: device_id.to_string(),
                device_ip: device_ip.to_string(),
                topic: None,
                dp_id: default_dp_id(),
            },
        );
    }

    mapping
}

#[derive(Deserialize)]
struct MappingEntry {
    device_id: String,
    #[serde(default)]
    device_ip: String,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default = "default_dp_id")]
    dp_id: u8,
    #[serde(default)]
    local_key: Option<String>,
}

/// Parses the JSON mapping file:
/// `{ "NAME": { "device_id", "device_ip"?, "topic"?, "dp_id"?, "local_key"? } }`.
pub fn parse_device_mapping_json(raw: &str) -> Result<DeviceMapping, serde_json::Error> {
    let entries: BTreeMap<String, MappingEntry> = serde_json::from_str(raw)?;
    let mut mapping = DeviceMapping::default();

    for (name, entry) in entries {
        let name = normalize_identifier(&name);
        let device_id = entry.device_id.trim().to_string();
        if device_id.is_empty() {
            mapping.rejected.push(invalid(&name, "empty device id"));
            continue;
        }
        if entry.local_key.is_some_and(|key| !key.trim().is_empty()) {
            mapping.ignored_local_keys.push(name.clone());
        }

        mapping.devices.insert(
            name,
            DeviceConfig {
                device_id,
                device_ip: entry.device_ip.trim().to_string(),
                topic: entry
                    .topic
                    .map(|topic| topic.trim().to_string())
                    .filter(|topic| !topic.is_empty()),
                dp_id: entry.dp_id,
            },
        );
    }

    Ok(mapping)
}

// Entries may carry a local key; only the part before '=' or ':' is echoed.
fn name_only(entry: &str) -> &str {
    entry.split([':', '=']).next().unwrap_or_default().trim()
}

fn invalid(entry: &str, reason: &'static str) -> ConfigError {
    ConfigError::InvalidMapping {
        entry: entry.to_string(),
        reason,
    }
}
