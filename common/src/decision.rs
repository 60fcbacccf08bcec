use crate::{
    config::Thresholds,
    types::{BatterySnapshot, DeviceIntent},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    Gaming,
    LowBattery,
    Charged,
    Inactive,
}

impl DecisionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gaming => "gaming",
            Self::LowBattery => "low_battery",
            Self::Charged => "charged",
            Self::Inactive => "inactive",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Set(DeviceIntent, DecisionReason),
    /// Inside the hysteresis band: keep whatever was decided before.
    Hold,
}

/// Which rule fires for a snapshot. Rules are ordered; the first match wins.
pub fn classify(snapshot: &BatterySnapshot, thresholds: &Thresholds) -> Verdict {
    if snapshot.is_gaming {
        Verdict::Set(DeviceIntent::On, DecisionReason::Gaming)
    } else if snapshot.percent <= thresholds.low() && !snapshot.is_charging {
        Verdict::Set(DeviceIntent::On, DecisionReason::LowBattery)
    } else if snapshot.percent >= thresholds.high() {
        Verdict::Set(DeviceIntent::Off, DecisionReason::Charged)
    } else {
        Verdict::Hold
    }
}

pub fn decide(
    previous: DeviceIntent,
    snapshot: &BatterySnapshot,
    thresholds: &Thresholds,
) -> DeviceIntent {
    match classify(snapshot, thresholds) {
        Verdict::Set(intent, _) => intent,
        Verdict::Hold => previous,
    }
}
