//! Tasmota-style power topics for MQTT-driven plugs.
//!
//! Commands go to `cmnd/<base>/POWER<dp>` (`ON`, `OFF`, or empty to query);
//! the plug answers on `stat/<base>/POWER<dp>`.

use crate::{error::DeviceError, types::DeviceIntent};

pub const PAYLOAD_ON: &str = "ON";
pub const PAYLOAD_OFF: &str = "OFF";
pub const PAYLOAD_QUERY: &str = "";

pub fn power_key(dp_id: u8) -> String {
    if dp_id <= 1 {
        "POWER".to_string()
    } else {
        format!("POWER{dp_id}")
    }
}

pub fn command_topic(base: &str, dp_id: u8) -> String {
    format!("cmnd/{base}/{}", power_key(dp_id))
}

pub fn state_topic(base: &str, dp_id: u8) -> String {
    format!("stat/{base}/{}", power_key(dp_id))
}

pub fn intent_payload(intent: DeviceIntent) -> &'static str {
    match intent {
        DeviceIntent::On => PAYLOAD_ON,
        DeviceIntent::Off => PAYLOAD_OFF,
    }
}

/// Normalizes a power reply. Accepts plain values (`ON`, `1`, `true`, ...)
/// or a JSON object carrying `POWER` / `POWER<dp>`.
pub fn parse_power_payload(payload: &str, dp_id: u8) -> Result<DeviceIntent, DeviceError> {
    let trimmed = payload.trim();

    if trimmed.starts_with('{') {
        let value: serde_json::Value = serde_json::from_str(trimmed)
            .map_err(|err| DeviceError::MalformedResponse(format!("invalid json: {err}")))?;
        let key = power_key(dp_id);
        let field = value
            .get(&key)
            .or_else(|| value.get("POWER1").filter(|_| dp_id <= 1))
            .ok_or_else(|| DeviceError::MalformedResponse(format!("missing {key} field")))?;
        return parse_json_value(field);
    }

    parse_text_value(trimmed)
}

fn parse_json_value(value: &serde_json::Value) -> Result<DeviceIntent, DeviceError> {
    match value {
        serde_json::Value::Bool(on) => Ok(bool_intent(*on)),
        serde_json::Value::Number(number) => number
            .as_f64()
            .map(|n| bool_intent(n != 0.0))
            .ok_or_else(|| DeviceError::MalformedResponse(number.to_string())),
        serde_json::Value::String(text) => parse_text_value(text),
        other => Err(DeviceError::MalformedResponse(other.to_string())),
    }
}

fn parse_text_value(text: &str) -> Result<DeviceIntent, DeviceError> {
    match text.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(DeviceIntent::On),
        "0" | "false" | "off" | "no" => Ok(DeviceIntent::Off),
        other => Err(DeviceError::MalformedResponse(format!(
            "unrecognized power value '{other}'"
        ))),
    }
}

fn bool_intent(on: bool) -> DeviceIntent {
    if on {
        DeviceIntent::On
    } else {
        DeviceIntent::Off
    }
}
