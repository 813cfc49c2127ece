use aperture_device::{DeviceError, StreamId};

use super::status::PipelineStatus;

/// Errors surfaced by pipeline operations.
///
/// # Example
/// ```rust,ignore
/// use aperture::prelude::*;
///
/// match pipeline.configure_streams(OperatingMode::Normal, Settings::new()) {
///     Err(err) if err.retryable() => eprintln!("try another configuration: {}", err.code()),
///     Err(err) => return Err(err),
///     Ok(()) => {}
/// }
/// ```
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    #[error("configuration rejected: {0}")]
    ConfigurationRejected(String),
    #[error("timed out waiting for a buffer on {0}")]
    BufferTimeout(StreamId),
    #[error("device fault: {0}")]
    DeviceFault(String),
    #[error("consumer of {0} was abandoned")]
    Abandoned(StreamId),
    #[error("callback contract violated: {0}")]
    ContractViolation(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("operation not allowed while {0}")]
    InvalidState(PipelineStatus),
    #[error("busy: {0}")]
    Busy(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl PipelineError {
    /// Stable string code for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::ConfigurationRejected(_) => "configuration_rejected",
            PipelineError::BufferTimeout(_) => "buffer_timeout",
            PipelineError::DeviceFault(_) => "device_fault",
            PipelineError::Abandoned(_) => "abandoned",
            PipelineError::ContractViolation(_) => "contract_violation",
            PipelineError::InvalidArgument(_) => "invalid_argument",
            PipelineError::InvalidState(_) => "invalid_state",
            PipelineError::Busy(_) => "busy",
            PipelineError::Timeout(_) => "timeout",
            PipelineError::Unsupported(_) => "unsupported",
        }
    }

    /// Whether the error may succeed when retried.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::ConfigurationRejected(_)
                | PipelineError::BufferTimeout(_)
                | PipelineError::Abandoned(_)
                | PipelineError::Busy(_)
                | PipelineError::Timeout(_)
        )
    }
}

impl From<DeviceError> for PipelineError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::InvalidConfiguration(msg) => PipelineError::ConfigurationRejected(msg),
            DeviceError::Unsupported(msg) => PipelineError::Unsupported(msg),
            DeviceError::IllegalArgument(msg) => PipelineError::InvalidArgument(msg),
            other => PipelineError::DeviceFault(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_errors_map_onto_pipeline_classes() {
        let rejected: PipelineError = DeviceError::InvalidConfiguration("too many".into()).into();
        assert_eq!(rejected.code(), "configuration_rejected");
        assert!(rejected.retryable());
        let fault: PipelineError = DeviceError::Disconnected.into();
        assert_eq!(fault, PipelineError::DeviceFault("device disconnected".into()));
        assert!(!fault.retryable());
    }

    #[test]
    fn invalid_state_names_the_status() {
        let err = PipelineError::InvalidState(PipelineStatus::Error);
        assert_eq!(err.to_string(), "operation not allowed while error");
    }
}
