use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("battery thresholds must satisfy low < high (low={low}, high={high})")]
    InvertedThresholds { low: f32, high: f32 },
    #[error("battery threshold {0} is outside 0-100")]
    ThresholdRange(f32),
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("invalid device mapping entry '{entry}': {reason}")]
    InvalidMapping { entry: String, reason: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no device mapping for '{0}'")]
pub struct UnknownIdentifier(pub String);

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReportError {
    #[error("battery percent {0} is outside 0-100")]
    PercentOutOfRange(f32),
}

/// Failure talking to a plug. Always retryable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("device did not answer within {0:?}")]
    Timeout(Duration),
    #[error("device unreachable: {0}")]
    Unreachable(String),
    #[error("malformed device response: {0}")]
    MalformedResponse(String),
    #[error("device reported {reported} after being commanded {requested}")]
    Rejected {
        requested: &'static str,
        reported: &'static str,
    },
    #[error("transport error: {0}")]
    Transport(String),
}
