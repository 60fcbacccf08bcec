use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::Context;

pub const POWER_SUPPLY_ROOT: &str = "/sys/class/power_supply";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatteryReading {
    pub percent: f32,
    pub power_plugged: bool,
}

impl BatteryReading {
    pub fn status_label(&self) -> &'static str {
        status_label(self.percent, self.power_plugged)
    }
}

pub fn status_label(percent: f32, power_plugged: bool) -> &'static str {
    if power_plugged {
        if percent >= 100.0 {
            "Fully charged"
        } else {
            "Charging"
        }
    } else if percent <= 10.0 {
        "Critical"
    } else if percent <= 20.0 {
        "Low"
    } else {
        "Discharging"
    }
}

/// Reads the first `BAT*` supply under `root`. `Ok(None)` means the machine
/// has no battery.
pub async fn read(root: &Path) -> anyhow::Result<Option<BatteryReading>> {
    let Some(battery) = find_battery(root).await? else {
        return Ok(None);
    };

    let capacity = tokio::fs::read_to_string(battery.join("capacity"))
        .await
        .with_context(|| format!("failed to read {}/capacity", battery.display()))?;
    let percent = capacity
        .trim()
        .parse::<f32>()
        .with_context(|| format!("invalid battery capacity '{}'", capacity.trim()))?
        .clamp(0.0, 100.0);

    let status = match tokio::fs::read_to_string(battery.join("status")).await {
        Ok(status) => status,
        Err(err) if err.kind() == ErrorKind::NotFound => String::new(),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read {}/status", battery.display()))
        }
    };

    Ok(Some(BatteryReading {
        percent,
        power_plugged: is_plugged(status.trim()),
    }))
}

async fn find_battery(root: &Path) -> anyhow::Result<Option<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to list {}", root.display()))
        }
    };

    let mut batteries = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_name().to_string_lossy().starts_with("BAT") {
            batteries.push(entry.path());
        }
    }
    batteries.sort();
    Ok(batteries.into_iter().next())
}

// "Not charging" is reported on AC when the firmware holds charge below 100%.
fn is_plugged(status: &str) -> bool {
    matches!(status, "Charging" | "Full" | "Not charging")
}
