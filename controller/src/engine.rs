use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use smartplug_common::{
    BatteryReport, BatterySnapshot, DeviceError, DeviceIntent, DeviceStatus, PlugState,
    ReportError, UnknownIdentifier,
};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::{
    dispatcher::{Dispatcher, ReconcileOutcome},
    events::emit,
    store::{DeviceSlot, StatusStore},
};

#[derive(Debug, Error)]
pub enum ReportRejection {
    #[error(transparent)]
    UnknownIdentifier(#[from] UnknownIdentifier),
    #[error(transparent)]
    Invalid(#[from] ReportError),
}

#[derive(Debug)]
pub struct ReportResult {
    pub identifier: String,
    pub intent: Option<DeviceIntent>,
    pub known_state: PlugState,
    pub command: Result<ReconcileOutcome, DeviceError>,
}

#[derive(Clone)]
pub struct Controller {
    store: StatusStore,
    dispatcher: Dispatcher,
}

impl Controller {
    pub fn new(store: StatusStore, dispatcher: Dispatcher) -> Self {
        Self { store, dispatcher }
    }

    pub fn store(&self) -> &StatusStore {
        &self.store
    }

    /// Records a report, re-evaluates the intent and reconciles the plug.
    /// Device failures are reported in the result, never as a rejection.
    pub async fn report_status(
        &self,
        identifier: &str,
        report: &BatteryReport,
        source: &str,
        now_ms: u64,
        now: DateTime<Utc>,
    ) -> Result<ReportResult, ReportRejection> {
        let slot = self.store.slot(identifier)?;
        let snapshot = BatterySnapshot::new(report, source, now_ms, now)?;

        let (slot, events) = self.store.record(&slot.identifier, snapshot, now_ms).await?;
        events.iter().for_each(emit);

        let command = self.dispatcher.reconcile(&slot).await;
        let device = self.store.get(&slot.identifier).await?;

        Ok(ReportResult {
            identifier: slot.identifier.clone(),
            intent: device.last_intent(),
            known_state: device.known_state(),
            command,
        })
    }

    /// One watchdog pass: force silent devices off, then reconcile every
    /// device concurrently so one slow plug cannot hold up the others.
    pub async fn sweep(&self, now_ms: u64) {
        let mut reconciles = JoinSet::new();

        for slot in self.store.slots() {
            let events = self.store.tick(slot, now_ms).await;
            events.iter().for_each(emit);

            let slot: Arc<DeviceSlot> = slot.clone();
            let dispatcher = self.dispatcher.clone();
            reconciles.spawn(async move {
                let result = dispatcher.reconcile(&slot).await;
                (slot.identifier.clone(), result)
            });
        }

        while let Some(joined) = reconciles.join_next().await {
            match joined {
                Ok((identifier, Ok(outcome))) => {
                    debug!(device = %identifier, ?outcome, "watchdog reconcile");
                }
                // Already emitted as a command failure; retried next tick.
                Ok((_, Err(_))) => {}
                Err(err) => warn!("watchdog reconcile task failed: {err}"),
            }
        }
    }

    pub async fn statuses(&self, now_ms: u64) -> BTreeMap<String, DeviceStatus> {
        self.store.statuses(now_ms).await
    }

    pub async fn status(
        &self,
        identifier: &str,
        now_ms: u64,
    ) -> Result<DeviceStatus, UnknownIdentifier> {
        self.store.status(identifier, now_ms).await
    }
}
