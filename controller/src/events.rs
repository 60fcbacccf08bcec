use smartplug_common::EngineEvent;
use tracing::{info, warn};

pub fn emit(event: &EngineEvent) {
    match event {
        EngineEvent::IntentChanged {
            identifier,
            from,
            to,
            reason,
        } => info!(
            event = "intent_changed",
            device = %identifier,
            from = from.map(|intent| intent.as_str()).unwrap_or("UNKNOWN"),
            to = to.as_str(),
            reason = reason.as_str(),
            "plug intent changed"
        ),
        EngineEvent::DeviceStale {
            identifier,
            silent_ms,
        } => warn!(
            event = "device_stale",
            device = %identifier,
            silent_secs = silent_ms / 1_000,
            "no report within ping timeout, forcing plug off"
        ),
        EngineEvent::CommandDispatched { identifier, intent } => info!(
            event = "command_dispatched",
            device = %identifier,
            intent = intent.as_str(),
            "plug switched"
        ),
        EngineEvent::CommandSkipped { identifier, intent } => info!(
            event = "command_skipped",
            device = %identifier,
            intent = intent.as_str(),
            "plug already in desired state"
        ),
        EngineEvent::CommandFailed {
            identifier,
            intent,
            error,
        } => warn!(
            event = "command_failed",
            device = %identifier,
            intent = intent.as_str(),
            error = %error,
            "plug command failed, will retry on next report or watchdog tick"
        ),
    }
}
