//! Device availability and error classification types.
//!
//! Shared between the control layer (which records device status after every
//! round-trip) and whatever outer surface reports it.

use serde::{Deserialize, Serialize};

/// Device availability status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Device is responding normally.
    Online,
    /// Device is not responding.
    Offline,
    /// Device accepts commands but its state cannot be confirmed.
    Degraded,
    /// Device status is unknown (never contacted).
    #[default]
    Unknown,
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceStatus::Online => write!(f, "online"),
            DeviceStatus::Offline => write!(f, "offline"),
            DeviceStatus::Degraded => write!(f, "degraded"),
            DeviceStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Error type classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// Connection timeout.
    Timeout,
    /// Connection refused or unreachable.
    ConnectionRefused,
    /// Malformed or unexpected response.
    ProtocolError,
    /// Input rejected before any I/O.
    ValidationError,
    /// Another operation is in flight.
    Busy,
    /// Unknown reference.
    NotFound,
    /// Other/unknown error.
    #[default]
    Other,
}

/// Error report suitable for surfacing to an operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Timestamp (millis since epoch).
    pub timestamp: i64,
    /// Device identifier (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    /// Error type classification.
    pub error_type: ErrorType,
    /// Error message.
    pub message: String,
    /// Whether the error is retryable.
    pub retryable: bool,
}

impl ErrorReport {
    /// Create a retryable report stamped with the current time.
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            timestamp: crate::time::current_timestamp_millis(),
            device: None,
            error_type,
            message: message.into(),
            retryable: true,
        }
    }

    /// Attach a device identifier.
    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    /// Mark the report as non-retryable.
    pub fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }
}
