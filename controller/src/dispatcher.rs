use std::{future::Future, sync::Arc, time::Duration};

use chrono::Utc;
use smartplug_common::{DeviceError, DeviceIntent, EngineConfig, EngineEvent, ReconcilePlan};
use tracing::debug;

use crate::{events::emit, plug::PlugPort, store::DeviceSlot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Idle,
    AlreadyInState(DeviceIntent),
    Commanded(DeviceIntent),
}

#[derive(Clone)]
pub struct Dispatcher {
    port: Arc<dyn PlugPort>,
    command_timeout: Duration,
    max_rounds: u8,
}

impl Dispatcher {
    pub fn new(port: Arc<dyn PlugPort>, config: &EngineConfig) -> Self {
        Self {
            port,
            command_timeout: Duration::from_millis(config.command_timeout_ms),
            max_rounds: config.max_reconcile_rounds.max(1),
        }
    }

    /// Drives the plug toward the device's current intent.
    ///
    /// The plan is computed under the state lock, the lock is released for
    /// the device call, and the observed result is committed afterwards. If
    /// the intent moved while the call was in flight, the loop plans again.
    pub async fn reconcile(&self, slot: &DeviceSlot) -> Result<ReconcileOutcome, DeviceError> {
        let _gate = slot.command_gate().await;
        let mut outcome = ReconcileOutcome::Idle;

        for _ in 0..self.max_rounds {
            let plan = slot.lock().await.reconcile_plan();

            match plan {
                ReconcilePlan::Idle => return Ok(outcome),
                ReconcilePlan::Query(intent) => {
                    let observed = self
                        .bounded(slot, intent, self.port.get_state(&slot.config))
                        .await?;
                    slot.lock().await.record_observed(observed);

                    if observed == intent {
                        emit(&EngineEvent::CommandSkipped {
                            identifier: slot.identifier.clone(),
                            intent,
                        });
                        outcome = ReconcileOutcome::AlreadyInState(intent);
                    }
                }
                ReconcilePlan::Command(intent) => {
                    self.bounded(slot, intent, self.port.set_state(&slot.config, intent))
                        .await?;
                    slot.lock()
                        .await
                        .record_command_success(intent, Utc::now());

                    emit(&EngineEvent::CommandDispatched {
                        identifier: slot.identifier.clone(),
                        intent,
                    });
                    outcome = ReconcileOutcome::Commanded(intent);
                }
            }
        }

        debug!(
            device = %slot.identifier,
            rounds = self.max_rounds,
            "reconcile rounds exhausted, deferring to next event"
        );
        Ok(outcome)
    }

    async fn bounded<T>(
        &self,
        slot: &DeviceSlot,
        intent: DeviceIntent,
        call: impl Future<Output = Result<T, DeviceError>>,
    ) -> Result<T, DeviceError> {
        let result = match tokio::time::timeout(self.command_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(DeviceError::Timeout(self.command_timeout)),
        };

        if let Err(error) = &result {
            slot.lock().await.record_failure(error);
            emit(&EngineEvent::CommandFailed {
                identifier: slot.identifier.clone(),
                intent,
                error: error.clone(),
            });
        }
        result
    }
}
