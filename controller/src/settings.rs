use std::{collections::BTreeMap, io::ErrorKind, path::PathBuf, str::FromStr};

use anyhow::{anyhow, Context};
use smartplug_common::{
    config::{parse_device_mapping, parse_device_mapping_json, DeviceMapping},
    DeviceConfig, PlugDriver, RuntimeConfig, Thresholds,
};
use tracing::{error, info, warn};

const DEFAULT_MAPPING_FILE: &str = "config/device_mapping.json";

/// Loads configuration from the process environment and the device mapping
/// file. Any invalid value is fatal.
pub async fn load() -> anyhow::Result<RuntimeConfig> {
    let lookup = |name: &str| std::env::var(name).ok();
    let mut config = from_lookup(lookup)?;

    let mapping_path = lookup("DEVICE_MAPPING_FILE")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_MAPPING_FILE));
    let mapping_file = match tokio::fs::read_to_string(&mapping_path).await {
        Ok(raw) => Some(raw),
        Err(err) if err.kind() == ErrorKind::NotFound => None,
        Err(err) => {
            error!("failed to read {}: {err}", mapping_path.display());
            None
        }
    };

    config.devices = resolve_devices(mapping_file.as_deref(), lookup("DEVICE_MAPPING").as_deref());
    config
        .validate()
        .context("invalid controller configuration")?;
    Ok(config)
}

fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<RuntimeConfig> {
    let mut config = RuntimeConfig::default();

    if let Some(host) = lookup("SERVER_HOST") {
        config.server.host = host;
    }
    if let Some(port) = parse_var(&lookup, "SERVER_PORT")? {
        config.server.port = port;
    }

    let low = parse_var(&lookup, "LOW_BATTERY_THRESHOLD")?.unwrap_or(config.thresholds.low());
    let high = parse_var(&lookup, "HIGH_BATTERY_THRESHOLD")?.unwrap_or(config.thresholds.high());
    config.thresholds = Thresholds::new(low, high).context("invalid battery thresholds")?;

    let engine = &mut config.engine;
    if let Some(secs) = parse_var::<u64>(&lookup, "PING_TIMEOUT")? {
        engine.ping_timeout_ms = secs.saturating_mul(1_000);
    }
    if let Some(secs) = parse_var::<u64>(&lookup, "WATCHDOG_INTERVAL")? {
        engine.watchdog_interval_ms = secs.saturating_mul(1_000);
    }
    if let Some(secs) = parse_var::<f64>(&lookup, "COMMAND_TIMEOUT")? {
        engine.command_timeout_ms = (secs.max(0.0) * 1_000.0) as u64;
    }
    if let Some(secs) = parse_var::<f64>(&lookup, "SHUTDOWN_GRACE")? {
        engine.shutdown_grace_ms = (secs.max(0.0) * 1_000.0) as u64;
    }

    if let Some(driver) = lookup("PLUG_DRIVER") {
        config.driver = PlugDriver::parse(&driver)
            .ok_or_else(|| anyhow!("PLUG_DRIVER must be 'mqtt' or 'simulated', got '{driver}'"))?;
    }

    if let Some(host) = lookup("MQTT_HOST") {
        config.mqtt.host = host;
    }
    if let Some(port) = parse_var(&lookup, "MQTT_PORT")? {
        config.mqtt.port = port;
    }
    if let Some(user) = lookup("MQTT_USER") {
        config.mqtt.user = user;
    }
    if let Some(pass) = lookup("MQTT_PASS") {
        config.mqtt.pass = pass;
    }
    if let Some(client_id) = lookup("MQTT_CLIENT_ID") {
        config.mqtt.client_id = client_id;
    }

    Ok(config)
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse::<T>()
        .map(Some)
        .map_err(|err| anyhow!("invalid {name} value '{raw}': {err}"))
}

/// JSON mapping file wins when it yields devices; otherwise the
/// `DEVICE_MAPPING` variable is used.
fn resolve_devices(
    mapping_file: Option<&str>,
    mapping_env: Option<&str>,
) -> BTreeMap<String, DeviceConfig> {
    if let Some(raw) = mapping_file {
        match parse_device_mapping_json(raw) {
            Ok(mapping) if !mapping.devices.is_empty() => {
                return accept_mapping("mapping file", mapping);
            }
            Ok(mapping) => report_skipped(&mapping),
            Err(err) => error!("failed to parse device mapping file: {err}"),
        }
    }

    let Some(raw) = mapping_env.filter(|raw| !raw.trim().is_empty()) else {
        warn!("no device mappings found in DEVICE_MAPPING or the mapping file");
        return BTreeMap::new();
    };

    accept_mapping("DEVICE_MAPPING", parse_device_mapping(raw))
}

fn accept_mapping(source: &str, mapping: DeviceMapping) -> BTreeMap<String, DeviceConfig> {
    report_skipped(&mapping);
    log_devices(source, &mapping.devices);
    mapping.devices
}

fn report_skipped(mapping: &DeviceMapping) {
    for err in &mapping.rejected {
        warn!("{err}");
    }
    for name in &mapping.ignored_local_keys {
        warn!("{name}: local_key ignored, plugs are switched over MQTT");
    }
}

fn log_devices(source: &str, devices: &BTreeMap<String, DeviceConfig>) {
    info!("loaded {} device(s) from {source}", devices.len());
    for (name, device) in devices {
        info!("  - {name}: {}", device.label());
    }
}
