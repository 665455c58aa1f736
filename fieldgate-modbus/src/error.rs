//! Error taxonomy for device communication and control.

use fieldgate_common::{ErrorReport, ErrorType};
use thiserror::Error;
use tokio_modbus::ExceptionCode;

/// Result type alias using [`ModbusError`].
pub type Result<T> = std::result::Result<T, ModbusError>;

/// Errors surfaced by the control layer.
#[derive(Debug, Clone, Error)]
pub enum ModbusError {
    /// Transport unreachable, refused or timed out.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The request was sent but no reply arrived in time.
    #[error("No response: {0}")]
    NoResponse(String),

    /// Malformed or unexpected response.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The device, or a gateway in front of it, answered with a Modbus exception.
    #[error("Device exception: {0}")]
    Exception(ExceptionCode),

    /// Bad register map, scan config or command arguments.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Another operation is in flight for this device.
    #[error("Device '{0}' is busy with another operation")]
    Busy(String),

    /// Unknown equipment or preset reference.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The equipment store failed.
    #[error("Equipment store error: {0}")]
    Store(String),
}

impl ModbusError {
    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Whether retrying the same request may succeed.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Connection(_)
            | Self::NoResponse(_)
            | Self::Protocol(_)
            | Self::Exception(_)
            | Self::Busy(_) => true,
            Self::Validation(_) | Self::NotFound(_) | Self::Store(_) => false,
        }
    }

    /// Whether a gateway answered on behalf of a unit it could not reach
    /// (exception 0x0A or 0x0B).
    pub fn gateway_unreachable_target(&self) -> bool {
        matches!(
            self,
            Self::Exception(ExceptionCode::GatewayPathUnavailable | ExceptionCode::GatewayTargetDevice)
        )
    }

    /// Whether the device itself answered (proving it is present on the bus).
    ///
    /// Gateway exceptions say the opposite: nothing answered at that unit id.
    pub fn device_answered(&self) -> bool {
        matches!(self, Self::Exception(_)) && !self.gateway_unreachable_target()
    }

    /// Whether a request reached the line without a reply from the device.
    ///
    /// True for a timeout, and for a gateway that forwarded the request but
    /// reports the target unit silent (0x0B).
    pub fn sent_without_reply(&self) -> bool {
        matches!(
            self,
            Self::NoResponse(_) | Self::Exception(ExceptionCode::GatewayTargetDevice)
        )
    }

    /// Classification for operator-facing error reports.
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::NoResponse(_) | Self::Exception(ExceptionCode::GatewayTargetDevice) => {
                ErrorType::Timeout
            }
            Self::Connection(msg) if msg.contains("timed out") => ErrorType::Timeout,
            Self::Connection(_) => ErrorType::ConnectionRefused,
            Self::Protocol(_) | Self::Exception(_) => ErrorType::ProtocolError,
            Self::Validation(_) => ErrorType::ValidationError,
            Self::Busy(_) => ErrorType::Busy,
            Self::NotFound(_) => ErrorType::NotFound,
            Self::Store(_) => ErrorType::Other,
        }
    }

    /// Operator-facing report of this error.
    pub fn report(&self, device: impl Into<String>) -> ErrorReport {
        let report = ErrorReport::new(self.error_type(), self.to_string()).with_device(device);
        if self.retryable() {
            report
        } else {
            report.non_retryable()
        }
    }
}
