use std::time::Duration;

use aperture_core::prelude::*;
use aperture_device::{FrameNumber, StreamBuffer, StreamId};

use super::error::PipelineError;

/// Identifiers delivered with every notification and result of a frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ResultExtras {
    pub request_id: i32,
    /// Position of the request within the list it was submitted with.
    pub burst_id: i32,
    pub frame_number: FrameNumber,
    pub af_trigger_id: i32,
    pub precapture_trigger_id: i32,
    /// Highest metadata part delivered so far.
    pub partial_result_count: u32,
    pub error_stream_id: Option<StreamId>,
    pub error_physical_camera_id: Option<String>,
}

/// Final metadata for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureResult {
    pub extras: ResultExtras,
    pub metadata: Settings,
    pub physical_metadata: Vec<(String, Settings)>,
}

/// A capture request as built by the client.
///
/// The first settings entry belongs to the logical camera; further entries address
/// physical sub-cameras.
///
/// # Example
/// ```rust
/// use aperture::prelude::*;
///
/// let settings = Settings::new().with(tags::REQUEST_ID, MetadataValue::i32(1));
/// let request = CaptureRequest::new("0", settings)
///     .output(StreamId(0))
///     .physical("2", Settings::new());
/// assert_eq!(request.request_id().unwrap(), 1);
/// assert_eq!(request.outputs().len(), 1);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRequest {
    camera_id: String,
    settings: Settings,
    physical: Vec<(String, Settings)>,
    outputs: Vec<OutputTarget>,
    input: Option<StreamId>,
}

/// Output stream targeted by a request, with optional surface indices for shared streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputTarget {
    pub stream_id: StreamId,
    pub surfaces: Vec<usize>,
}

impl CaptureRequest {
    pub fn new(camera_id: &str, settings: Settings) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            settings,
            physical: Vec::new(),
            outputs: Vec::new(),
            input: None,
        }
    }

    /// Target an output stream.
    pub fn output(self, stream_id: StreamId) -> Self {
        self.output_surfaces(stream_id, &[])
    }

    /// Target selected surfaces of a shared output stream.
    pub fn output_surfaces(mut self, stream_id: StreamId, surfaces: &[usize]) -> Self {
        self.outputs.push(OutputTarget {
            stream_id,
            surfaces: surfaces.to_vec(),
        });
        self
    }

    /// Reprocess from the input stream.
    pub fn input(mut self, stream_id: StreamId) -> Self {
        self.input = Some(stream_id);
        self
    }

    /// Settings for one physical sub-camera.
    pub fn physical(mut self, camera_id: &str, settings: Settings) -> Self {
        self.physical.push((camera_id.to_string(), settings));
        self
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn outputs(&self) -> &[OutputTarget] {
        &self.outputs
    }

    pub fn input_stream(&self) -> Option<StreamId> {
        self.input
    }

    pub fn request_id(&self) -> Result<i32, MetadataError> {
        self.settings.i32(tags::REQUEST_ID)
    }

    pub(crate) fn into_parts(
        self,
    ) -> (Settings, Vec<(String, Settings)>, Vec<OutputTarget>, Option<StreamId>) {
        (self.settings, self.physical, self.outputs, self.input)
    }
}

/// A validated request owned by the dispatcher until it is submitted.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub settings: Settings,
    pub physical: Vec<(String, Settings)>,
    pub outputs: Vec<OutputTarget>,
    pub input: Option<StreamId>,
    pub input_buffer: Option<StreamBuffer>,
    pub extras: ResultExtras,
    pub batch_size: usize,
    pub repeating: bool,
    pub rotate_and_crop_auto: bool,
    pub zoom_ratio_is_1x: bool,
    /// Identity of the settings object; a change forces full settings to be sent.
    pub serial: u64,
}

impl PendingRequest {
    pub fn targets(&self, stream_id: StreamId) -> bool {
        self.outputs.iter().any(|o| o.stream_id == stream_id) || self.input == Some(stream_id)
    }

    /// Copy for the repeating set; input buffers are never shared.
    pub fn duplicate(&self) -> Self {
        Self {
            settings: self.settings.clone(),
            physical: self.physical.clone(),
            outputs: self.outputs.clone(),
            input: self.input,
            input_buffer: None,
            extras: self.extras.clone(),
            batch_size: self.batch_size,
            repeating: self.repeating,
            rotate_and_crop_auto: self.rotate_and_crop_auto,
            zoom_ratio_is_1x: self.zoom_ratio_is_1x,
            serial: self.serial,
        }
    }
}

/// Upper bound of how long a request with these settings should take to expose.
pub(crate) fn expected_duration(settings: &Settings, fallback: Duration) -> Duration {
    let ae_off = settings
        .get(tags::CONTROL_AE_MODE)
        .and_then(MetadataValue::as_u8)
        == Some(tags::ae_mode::OFF);
    if ae_off {
        let exposure = settings.i64(tags::SENSOR_EXPOSURE_TIME).unwrap_or(0);
        let frame = settings.i64(tags::SENSOR_FRAME_DURATION).unwrap_or(0);
        let nanos = exposure.max(frame);
        if nanos > 0 {
            return Duration::from_nanos(nanos as u64);
        }
        return fallback;
    }
    match settings
        .get(tags::CONTROL_AE_TARGET_FPS_RANGE)
        .and_then(MetadataValue::i32_slice)
    {
        Some([min_fps, ..]) if *min_fps > 0 => {
            Duration::from_nanos(1_000_000_000 / u64::from(min_fps.unsigned_abs()))
        }
        _ => fallback,
    }
}

/// Reject requests the pipeline cannot carry at all.
pub(crate) fn validate_shape(request: &CaptureRequest) -> Result<i32, PipelineError> {
    let request_id = request
        .request_id()
        .map_err(|err| PipelineError::InvalidArgument(err.to_string()))?;
    if request.outputs().is_empty() {
        return Err(PipelineError::InvalidArgument(format!(
            "request {request_id} has no output streams"
        )));
    }
    Ok(request_id)
}
