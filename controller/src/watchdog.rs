use std::time::Duration;

use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{engine::Controller, host::monotonic_ms};

pub fn spawn(
    controller: Controller,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => controller.sweep(monotonic_ms()).await,
            }
        }
        info!("inactivity watchdog stopped");
    })
}
