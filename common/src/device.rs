use chrono::{DateTime, Utc};

use crate::{
    config::{DeviceConfig, RuntimeConfig, Thresholds},
    decision::{classify, DecisionReason, Verdict},
    error::DeviceError,
    types::{Activity, BatterySnapshot, BatteryView, DeviceIntent, DeviceStatus, PlugState},
};

#[derive(Debug, Clone)]
pub enum DeviceEvent {
    ReportReceived(BatterySnapshot),
    WatchdogTick,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    IntentChanged {
        identifier: String,
        from: Option<DeviceIntent>,
        to: DeviceIntent,
        reason: DecisionReason,
    },
    DeviceStale {
        identifier: String,
        silent_ms: u64,
    },
    CommandDispatched {
        identifier: String,
        intent: DeviceIntent,
    },
    CommandSkipped {
        identifier: String,
        intent: DeviceIntent,
    },
    CommandFailed {
        identifier: String,
        intent: DeviceIntent,
        error: DeviceError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilePlan {
    Idle,
    /// Device state is unknown; read it before deciding whether to command.
    Query(DeviceIntent),
    Command(DeviceIntent),
}

#[derive(Debug, Clone, Copy)]
pub struct Policy {
    pub thresholds: Thresholds,
    pub ping_timeout_ms: u64,
}

impl Policy {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            thresholds: config.thresholds,
            ping_timeout_ms: config.engine.ping_timeout_ms,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrackedDevice {
    identifier: String,
    last_snapshot: Option<BatterySnapshot>,
    last_intent: Option<DeviceIntent>,
    known_state: PlugState,
    last_commanded_at: Option<DateTime<Utc>>,
    tracking_since_ms: u64,
    forced_off: bool,
    last_error: Option<String>,
    consecutive_failures: u32,
}

impl TrackedDevice {
    pub fn new(identifier: impl Into<String>, tracking_since_ms: u64) -> Self {
        Self {
            identifier: identifier.into(),
            last_snapshot: None,
            last_intent: None,
            known_state: PlugState::Unknown,
            last_commanded_at: None,
            tracking_since_ms,
            forced_off: false,
            last_error: None,
            consecutive_failures: 0,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn last_snapshot(&self) -> Option<&BatterySnapshot> {
        self.last_snapshot.as_ref()
    }

    pub fn last_intent(&self) -> Option<DeviceIntent> {
        self.last_intent
    }

    pub fn known_state(&self) -> PlugState {
        self.known_state
    }

    pub fn last_commanded_at(&self) -> Option<DateTime<Utc>> {
        self.last_commanded_at
    }

    pub fn is_forced_off(&self) -> bool {
        self.forced_off
    }

    pub fn is_command_failing(&self) -> bool {
        self.last_error.is_some()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Monotonic time of the last report, or of tracking start if none arrived.
    pub fn last_seen_ms(&self) -> u64 {
        self.last_snapshot
            .as_ref()
            .map(|snapshot| snapshot.observed_at_ms)
            .unwrap_or(self.tracking_since_ms)
    }

    pub fn is_silent(&self, now_ms: u64, ping_timeout_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_seen_ms()) > ping_timeout_ms
    }

    pub fn activity(&self, now_ms: u64, ping_timeout_ms: u64) -> Activity {
        if self.last_snapshot.is_none() {
            Activity::NeverReported
        } else if self.is_silent(now_ms, ping_timeout_ms) {
            Activity::Stale
        } else {
            Activity::Active
        }
    }

    pub fn apply(&mut self, event: DeviceEvent, policy: &Policy, now_ms: u64) -> Vec<EngineEvent> {
        let mut events = Vec::new();

        match event {
            DeviceEvent::ReportReceived(snapshot) => {
                let verdict = classify(&snapshot, &policy.thresholds);
                self.last_snapshot = Some(snapshot);
                self.forced_off = false;

                if let Verdict::Set(intent, reason) = verdict {
                    self.set_intent(intent, reason, &mut events);
                }
            }
            DeviceEvent::WatchdogTick => {
                if !self.is_silent(now_ms, policy.ping_timeout_ms) {
                    return events;
                }

                if !self.forced_off {
                    self.forced_off = true;
                    events.push(EngineEvent::DeviceStale {
                        identifier: self.identifier.clone(),
                        silent_ms: now_ms.saturating_sub(self.last_seen_ms()),
                    });
                }
                self.set_intent(DeviceIntent::Off, DecisionReason::Inactive, &mut events);
            }
        }

        events
    }

    pub fn reconcile_plan(&self) -> ReconcilePlan {
        let Some(intent) = self.last_intent else {
            return ReconcilePlan::Idle;
        };

        match self.known_state {
            PlugState::Unknown => ReconcilePlan::Query(intent),
            known if known.matches(intent) => ReconcilePlan::Idle,
            _ => ReconcilePlan::Command(intent),
        }
    }

    pub fn record_observed(&mut self, actual: DeviceIntent) {
        self.known_state = actual.into();
        self.clear_failures();
    }

    pub fn record_command_success(&mut self, commanded: DeviceIntent, at: DateTime<Utc>) {
        self.known_state = commanded.into();
        self.last_commanded_at = Some(at);
        self.clear_failures();
    }

    pub fn record_failure(&mut self, error: &DeviceError) {
        self.known_state = PlugState::Unknown;
        self.last_error = Some(error.to_string());
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    pub fn status(&self, device: &DeviceConfig, now_ms: u64, ping_timeout_ms: u64) -> DeviceStatus {
        DeviceStatus {
            device_id: device.device_id.clone(),
            device_ip: device.device_ip.clone(),
            intent: self.last_intent.map(DeviceIntent::as_str),
            known_state: self.known_state.as_str(),
            activity: self.activity(now_ms, ping_timeout_ms).as_str(),
            forced_off: self.forced_off,
            command_failing: self.is_command_failing(),
            last_error: self.last_error.clone(),
            consecutive_failures: self.consecutive_failures,
            last_ping: self
                .last_snapshot
                .as_ref()
                .map(|snapshot| snapshot.received_at.to_rfc3339()),
            last_commanded_at: self.last_commanded_at.map(|at| at.to_rfc3339()),
            battery: self.last_snapshot.as_ref().map(|snapshot| BatteryView {
                battery_percent: snapshot.percent,
                is_charging: snapshot.is_charging,
                is_gaming: snapshot.is_gaming,
                source: snapshot.source.clone(),
                last_updated: snapshot.received_at.to_rfc3339(),
            }),
        }
    }

    fn set_intent(
        &mut self,
        intent: DeviceIntent,
        reason: DecisionReason,
        events: &mut Vec<EngineEvent>,
    ) {
        if self.last_intent == Some(intent) {
            return;
        }

        events.push(EngineEvent::IntentChanged {
            identifier: self.identifier.clone(),
            from: self.last_intent,
            to: intent,
            reason,
        });
        self.last_intent = Some(intent);
    }

    fn clear_failures(&mut self) {
        self.last_error = None;
        self.consecutive_failures = 0;
    }
}
