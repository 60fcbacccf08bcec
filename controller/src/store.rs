use std::{collections::BTreeMap, sync::Arc};

use smartplug_common::{
    config::normalize_identifier, BatterySnapshot, DeviceConfig, DeviceEvent, DeviceStatus,
    EngineEvent, Policy, TrackedDevice, UnknownIdentifier,
};
use tokio::sync::{Mutex, MutexGuard};

/// One configured plug. `state` guards the decision fields and is never held
/// across device I/O; `command_gate` keeps a single device call in flight.
pub struct DeviceSlot {
    pub identifier: String,
    pub config: DeviceConfig,
    state: Mutex<TrackedDevice>,
    command_gate: Mutex<()>,
}

impl DeviceSlot {
    fn new(identifier: String, config: DeviceConfig, now_ms: u64) -> Self {
        Self {
            state: Mutex::new(TrackedDevice::new(identifier.clone(), now_ms)),
            identifier,
            config,
            command_gate: Mutex::new(()),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, TrackedDevice> {
        self.state.lock().await
    }

    pub async fn command_gate(&self) -> MutexGuard<'_, ()> {
        self.command_gate.lock().await
    }
}

/// Device table keyed by upper-cased identifier. Fixed after construction.
#[derive(Clone)]
pub struct StatusStore {
    slots: Arc<BTreeMap<String, Arc<DeviceSlot>>>,
    policy: Policy,
}

impl StatusStore {
    pub fn new(devices: &BTreeMap<String, DeviceConfig>, policy: Policy, now_ms: u64) -> Self {
        let slots = devices
            .iter()
            .map(|(name, config)| {
                let identifier = normalize_identifier(name);
                let slot = DeviceSlot::new(identifier.clone(), config.clone(), now_ms);
                (identifier, Arc::new(slot))
            })
            .collect();

        Self {
            slots: Arc::new(slots),
            policy,
        }
    }

    pub fn identifiers(&self) -> Vec<String> {
        self.slots.keys().cloned().collect()
    }

    pub fn slots(&self) -> impl Iterator<Item = &Arc<DeviceSlot>> {
        self.slots.values()
    }

    pub fn slot(&self, identifier: &str) -> Result<Arc<DeviceSlot>, UnknownIdentifier> {
        let key = normalize_identifier(identifier);
        self.slots
            .get(&key)
            .cloned()
            .ok_or(UnknownIdentifier(key))
    }

    /// Replaces the device's snapshot and re-runs the decision rules.
    pub async fn record(
        &self,
        identifier: &str,
        snapshot: BatterySnapshot,
        now_ms: u64,
    ) -> Result<(Arc<DeviceSlot>, Vec<EngineEvent>), UnknownIdentifier> {
        let slot = self.slot(identifier)?;
        let events = slot
            .lock()
            .await
            .apply(DeviceEvent::ReportReceived(snapshot), &self.policy, now_ms);
        Ok((slot, events))
    }

    pub async fn tick(&self, slot: &DeviceSlot, now_ms: u64) -> Vec<EngineEvent> {
        slot.lock()
            .await
            .apply(DeviceEvent::WatchdogTick, &self.policy, now_ms)
    }

    pub async fn get(&self, identifier: &str) -> Result<TrackedDevice, UnknownIdentifier> {
        let slot = self.slot(identifier)?;
        let device = slot.lock().await.clone();
        Ok(device)
    }

    pub async fn status(
        &self,
        identifier: &str,
        now_ms: u64,
    ) -> Result<DeviceStatus, UnknownIdentifier> {
        let slot = self.slot(identifier)?;
        let status = slot
            .lock()
            .await
            .status(&slot.config, now_ms, self.policy.ping_timeout_ms);
        Ok(status)
    }

    pub async fn statuses(&self, now_ms: u64) -> BTreeMap<String, DeviceStatus> {
        let mut statuses = BTreeMap::new();
        for (identifier, slot) in self.slots.iter() {
            let status = slot
                .lock()
                .await
                .status(&slot.config, now_ms, self.policy.ping_timeout_ms);
            statuses.insert(identifier.clone(), status);
        }
        statuses
    }
}
