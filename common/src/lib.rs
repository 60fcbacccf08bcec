pub mod config;
pub mod decision;
pub mod device;
pub mod error;
pub mod topics;
pub mod types;

pub use config::{DeviceConfig, EngineConfig, MqttConfig, PlugDriver, RuntimeConfig, Thresholds};
pub use decision::{classify, decide, DecisionReason, Verdict};
pub use device::{DeviceEvent, EngineEvent, Policy, ReconcilePlan, TrackedDevice};
pub use error::{ConfigError, DeviceError, ReportError, UnknownIdentifier};
pub use types::{Activity, BatteryReport, BatterySnapshot, DeviceIntent, DeviceStatus, PlugState};
