#![doc = include_str!("../README.md")]

use std::{
    fmt,
    sync::{Arc, Weak},
};

use aperture_core::prelude::*;

pub mod fake;

pub use fake::{FakeBehavior, FakeCamera, FakeOfflineSession, FakeSession, SubmittedFrame};

/// Frame numbers are assigned by the pipeline in submission order and never reused.
pub type FrameNumber = u64;

/// Identifier of a configured stream, unique per pipeline instance.
///
/// # Example
/// ```rust
/// use aperture_device::StreamId;
///
/// assert_eq!(StreamId(3).to_string(), "stream#3");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StreamId(pub i32);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// Failures reported by a device session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// The stream set or session parameters are unsupported.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("illegal argument: {0}")]
    IllegalArgument(String),
    #[error("device disconnected")]
    Disconnected,
    #[error("operation not supported: {0}")]
    Unsupported(String),
    #[error("device failure: {0}")]
    Internal(String),
}

impl DeviceError {
    /// Stable string code for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            DeviceError::InvalidConfiguration(_) => "invalid_configuration",
            DeviceError::IllegalArgument(_) => "illegal_argument",
            DeviceError::Disconnected => "disconnected",
            DeviceError::Unsupported(_) => "unsupported",
            DeviceError::Internal(_) => "internal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum OperatingMode {
    #[default]
    Normal,
    ConstrainedHighSpeed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StreamDirection {
    Output,
    Input,
}

/// Stream as presented to the device during configuration.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StreamDescriptor {
    pub id: StreamId,
    pub direction: StreamDirection,
    pub format: StreamFormat,
    /// Consumer usage flags requested by the client.
    pub usage: u64,
    pub physical_camera_id: Option<String>,
}

/// Per-stream parameters finalized by the device.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConfiguredStream {
    pub id: StreamId,
    pub max_buffers: usize,
    /// Producer usage flags added by the device.
    pub usage: u64,
    pub format: StreamFormat,
}

/// Static properties of an open session.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DeviceCapabilities {
    /// The device pulls output buffers itself instead of receiving them with requests.
    pub hal_buffer_management: bool,
    pub offline_processing: bool,
    /// Number of metadata parts a result is split into; 1 disables partials.
    pub partial_result_count: u32,
    /// Deliver partial metadata to the client as it arrives.
    pub early_partial_results: bool,
    /// Settings keys whose change may require reconfiguration.
    pub session_keys: Vec<Tag>,
    /// Device answers `is_reconfiguration_required` meaningfully.
    pub reconfiguration_query: bool,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            hal_buffer_management: false,
            offline_processing: false,
            partial_result_count: 1,
            early_partial_results: false,
            session_keys: Vec::new(),
            reconfiguration_query: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BufferStatus {
    Ok,
    Error,
}

/// A buffer moving between pipeline and device. `buffer` is `None` for request
/// entries under device-side buffer management and for errored returns.
#[derive(Debug)]
pub struct StreamBuffer {
    pub stream_id: StreamId,
    pub buffer: Option<BufferLease>,
    pub status: BufferStatus,
}

impl StreamBuffer {
    pub fn filled(stream_id: StreamId, buffer: BufferLease) -> Self {
        Self {
            stream_id,
            buffer: Some(buffer),
            status: BufferStatus::Ok,
        }
    }

    /// Request entry for a stream whose buffer the device pulls later.
    pub fn deferred(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            buffer: None,
            status: BufferStatus::Ok,
        }
    }

    pub fn with_status(mut self, status: BufferStatus) -> Self {
        self.status = status;
        self
    }

    pub fn buffer_id(&self) -> Option<BufferId> {
        self.buffer.as_ref().map(|b| b.id())
    }
}

/// One request as submitted to the device.
#[derive(Debug)]
pub struct DeviceRequest {
    pub frame_number: FrameNumber,
    /// `None` means "same settings as the previous request".
    pub settings: Option<Settings>,
    pub physical_settings: Vec<(String, Settings)>,
    pub input_buffer: Option<StreamBuffer>,
    pub output_buffers: Vec<StreamBuffer>,
}

/// Outcome of `submit_batch`: the first `accepted` requests were taken, the rest
/// come back untouched in `returned`.
#[derive(Debug)]
pub struct SubmitOutcome {
    pub accepted: usize,
    pub returned: Vec<DeviceRequest>,
    pub error: Option<DeviceError>,
}

impl SubmitOutcome {
    pub fn all(accepted: usize) -> Self {
        Self {
            accepted,
            returned: Vec::new(),
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorCode {
    /// The whole device is unusable.
    Device,
    /// The request failed; no metadata or buffers will complete normally.
    Request,
    /// Metadata for the frame is lost; buffers may still complete.
    Result,
    /// A single output buffer failed.
    Buffer,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NotifyMessage {
    Shutter {
        frame_number: FrameNumber,
        timestamp: i64,
    },
    Error {
        frame_number: Option<FrameNumber>,
        stream_id: Option<StreamId>,
        physical_camera_id: Option<String>,
        code: ErrorCode,
    },
}

/// Partial or final metadata plus any completed buffers for one frame.
#[derive(Debug, Default)]
pub struct DeviceCaptureResult {
    pub frame_number: FrameNumber,
    pub metadata: Option<Settings>,
    /// 1-based index of this metadata part; ignored when `metadata` is `None`.
    pub partial_result: u32,
    pub physical_metadata: Vec<(String, Settings)>,
    pub output_buffers: Vec<StreamBuffer>,
    pub input_buffer: Option<StreamBuffer>,
}

/// Tagged notify/result channel from the device.
#[derive(Debug)]
pub enum SessionEvent {
    Notify(NotifyMessage),
    Result(DeviceCaptureResult),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRequest {
    pub stream_id: StreamId,
    pub num_buffers: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferRequestStatus {
    Ok,
    FailedPartial,
    FailedConfiguring,
    FailedIllegalArgument,
    FailedUnknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamBufferError {
    NoBufferAvailable,
    MaxBufferExceeded,
    StreamDisconnected,
    Unknown,
}

#[derive(Debug)]
pub struct StreamBufferReturn {
    pub stream_id: StreamId,
    pub result: Result<Vec<StreamBuffer>, StreamBufferError>,
}

#[derive(Debug)]
pub struct BufferPullReply {
    pub status: BufferRequestStatus,
    pub returns: Vec<StreamBufferReturn>,
}

impl BufferPullReply {
    pub fn failed(status: BufferRequestStatus) -> Self {
        Self {
            status,
            returns: Vec::new(),
        }
    }
}

/// Callbacks a device session drives; implemented by the pipeline.
pub trait SessionCallbacks: Send + Sync {
    /// Shutter, error and result delivery. Calls must not overlap.
    fn deliver(&self, events: Vec<SessionEvent>);

    /// Device-initiated buffer pull under device-side buffer management.
    fn request_stream_buffers(&self, requests: &[BufferRequest]) -> BufferPullReply;

    /// Hand back pulled buffers that were never used.
    fn return_stream_buffers(&self, buffers: Vec<StreamBuffer>);
}

/// Kept stream as reported by the device on offline switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineStream {
    pub id: StreamId,
    pub num_outstanding_buffers: usize,
    pub circulating_buffer_ids: Vec<BufferId>,
}

/// Request that keeps running in the offline session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineRequest {
    pub frame_number: FrameNumber,
    pub pending_streams: Vec<StreamId>,
}

/// Inventory returned by `switch_to_offline`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OfflineSessionInfo {
    pub offline_streams: Vec<OfflineStream>,
    pub offline_requests: Vec<OfflineRequest>,
}

/// Device side of an offline session; results flow to whatever callbacks are attached.
pub trait OfflineDeviceSession: Send + Sync {
    fn attach(&self, callbacks: Weak<dyn SessionCallbacks>);
    fn close(&self);
}

/// An open device session.
///
/// # Example
/// ```rust,ignore
/// use aperture_device::*;
///
/// let outcome = session.submit_batch(requests);
/// if let Some(err) = outcome.error {
///     eprintln!("submit failed: {} ({})", err, err.code());
/// }
/// ```
pub trait DeviceSession: Send + Sync {
    fn capabilities(&self) -> DeviceCapabilities;

    fn configure_streams(
        &self,
        session_params: &Settings,
        streams: &[StreamDescriptor],
        mode: OperatingMode,
    ) -> Result<Vec<ConfiguredStream>, DeviceError>;

    /// Whether moving from `old` to `new` session parameters needs a full reconfigure.
    fn is_reconfiguration_required(
        &self,
        _old: &Settings,
        _new: &Settings,
    ) -> Result<bool, DeviceError> {
        Ok(true)
    }

    fn submit_batch(&self, requests: Vec<DeviceRequest>) -> SubmitOutcome;

    /// Abort submitted work as fast as possible; every request still completes
    /// through the callbacks, typically with errors.
    fn flush(&self) -> Result<(), DeviceError>;

    /// Hint that no new requests will follow until the pipeline resumes.
    fn signal_pipeline_drain(&self, _streams: &[StreamId]) {}

    fn switch_to_offline(
        &self,
        streams: &[StreamId],
    ) -> Result<(OfflineSessionInfo, Box<dyn OfflineDeviceSession>), DeviceError>;

    fn close(&self);
}

/// Entry point for opening sessions on a camera.
pub trait CameraDevice: Send + Sync {
    fn id(&self) -> &str;

    fn open(&self, callbacks: Weak<dyn SessionCallbacks>)
    -> Result<Arc<dyn DeviceSession>, DeviceError>;
}

pub mod prelude {
    pub use crate::{
        BufferPullReply, BufferRequest, BufferRequestStatus, BufferStatus, CameraDevice,
        ConfiguredStream, DeviceCapabilities, DeviceCaptureResult, DeviceError, DeviceRequest,
        DeviceSession, ErrorCode, FakeBehavior, FakeCamera, FakeOfflineSession, FakeSession,
        FrameNumber, NotifyMessage, OfflineDeviceSession, OfflineRequest, OfflineSessionInfo,
        OfflineStream, OperatingMode, SessionCallbacks, SessionEvent, StreamBuffer,
        StreamBufferError, StreamBufferReturn, StreamDescriptor, StreamDirection, StreamId,
        SubmitOutcome, SubmittedFrame,
    };
    pub use aperture_core::prelude::*;
}
