use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ReportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceIntent {
    On,
    Off,
}

impl DeviceIntent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "ON",
            Self::Off => "OFF",
        }
    }
}

/// Last state the plug itself was observed or commanded into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PlugState {
    On,
    Off,
    Unknown,
}

impl PlugState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "ON",
            Self::Off => "OFF",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn matches(self, intent: DeviceIntent) -> bool {
        self == Self::from(intent)
    }
}

impl From<DeviceIntent> for PlugState {
    fn from(intent: DeviceIntent) -> Self {
        match intent {
            DeviceIntent::On => Self::On,
            DeviceIntent::Off => Self::Off,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Activity {
    NeverReported,
    Active,
    Stale,
}

impl Activity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NeverReported => "NEVER_REPORTED",
            Self::Active => "ACTIVE",
            Self::Stale => "STALE",
        }
    }
}

/// Wire payload posted by the reporter to `/update`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatteryReport {
    pub battery_percent: f32,
    pub is_charging: bool,
    pub is_gaming: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatterySnapshot {
    pub percent: f32,
    pub is_charging: bool,
    pub is_gaming: bool,
    pub observed_at_ms: u64,
    pub received_at: DateTime<Utc>,
    pub source: String,
}

impl BatterySnapshot {
    pub fn new(
        report: &BatteryReport,
        source: impl Into<String>,
        observed_at_ms: u64,
        received_at: DateTime<Utc>,
    ) -> Result<Self, ReportError> {
        let percent = report.battery_percent;
        if !percent.is_finite() || !(0.0..=100.0).contains(&percent) {
            return Err(ReportError::PercentOutOfRange(percent));
        }

        Ok(Self {
            percent,
            is_charging: report.is_charging,
            is_gaming: report.is_gaming,
            observed_at_ms,
            received_at,
            source: source.into(),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatteryView {
    #[serde(rename = "batteryPercent")]
    pub battery_percent: f32,
    #[serde(rename = "isCharging")]
    pub is_charging: bool,
    #[serde(rename = "isGaming")]
    pub is_gaming: bool,
    pub source: String,
    #[serde(rename = "lastUpdated")]
    pub last_updated: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "deviceIp")]
    pub device_ip: String,
    pub intent: Option<&'static str>,
    #[serde(rename = "knownState")]
    pub known_state: &'static str,
    pub activity: &'static str,
    #[serde(rename = "forcedOff")]
    pub forced_off: bool,
    #[serde(rename = "commandFailing")]
    pub command_failing: bool,
    #[serde(rename = "lastError")]
    pub last_error: Option<String>,
    #[serde(rename = "consecutiveFailures")]
    pub consecutive_failures: u32,
    #[serde(rename = "lastPing")]
    pub last_ping: Option<String>,
    #[serde(rename = "lastCommandedAt")]
    pub last_commanded_at: Option<String>,
    pub battery: Option<BatteryView>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(percent: f32) -> BatteryReport {
        BatteryReport {
            battery_percent: percent,
            is_charging: false,
            is_gaming: false,
        }
    }

    #[test]
    fn snapshot_accepts_bounds() {
        assert!(BatterySnapshot::new(&report(0.0), "A", 0, Utc::now()).is_ok());
        assert!(BatterySnapshot::new(&report(100.0), "A", 0, Utc::now()).is_ok());
    }

    #[test]
    fn snapshot_rejects_out_of_range_and_nan() {
        for percent in [-0.5, 100.5, f32::NAN, f32::INFINITY] {
            let err = BatterySnapshot::new(&report(percent), "A", 0, Utc::now());
            assert!(matches!(err, Err(ReportError::PercentOutOfRange(_))));
        }
    }

    #[test]
    fn plug_state_matches_intent() {
        assert!(PlugState::On.matches(DeviceIntent::On));
        assert!(!PlugState::Off.matches(DeviceIntent::On));
        assert!(!PlugState::Unknown.matches(DeviceIntent::Off));
    }
}
