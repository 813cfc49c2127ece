//! Capture pipeline: client requests in, device submissions out, results back.
//!
//! [`Pipeline`] is the client handle. Internally a dispatcher thread drains the
//! request queue into the device session, a reconciler folds the session's
//! shutter/error/result callbacks back into per-frame records, and the controller
//! owns the lifecycle state machine that pauses, reconfigures and resumes the two.
use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use aperture_core::prelude::Settings;
use aperture_device::{CameraDevice, FrameNumber, OperatingMode, StreamId};

mod buffer_coordinator;
mod controller;
mod dispatcher;
mod error;
mod in_flight;
mod listener;
mod offline;
mod preparer;
mod reconciler;
mod records;
mod request;
#[cfg(test)]
mod scenarios;
mod status;
mod stream;
mod trigger;

pub use error::PipelineError;
pub use listener::{ClientError, NotificationListener};
pub use offline::OfflineSession;
pub use request::{CaptureRequest, CaptureResult, OutputTarget, ResultExtras};
pub use status::PipelineStatus;
pub use stream::{BufferInfo, StreamBufferListener, StreamConfig, StreamInfo, StreamKind, usage};
pub use trigger::Trigger;

use crate::{
    metrics::PipelineMetrics,
    tunables::{PipelineTunables, pipeline_tunables},
};
use controller::PipelineInner;

/// Client handle for one camera's capture pipeline.
///
/// # Example
/// ```rust,ignore
/// use aperture::prelude::*;
///
/// let camera = FakeCamera::new("0");
/// let pipeline = Pipeline::new("0");
/// pipeline.open(&camera)?;
/// let format = StreamFormat::new(FourCc::NV12, Resolution::new(640, 480).unwrap());
/// let preview = pipeline.create_stream(StreamConfig::output(format))?;
/// pipeline.configure_streams(OperatingMode::Normal, Settings::new())?;
///
/// let settings = Settings::new().with(tags::REQUEST_ID, MetadataValue::i32(1));
/// pipeline.set_repeating(CaptureRequest::new("0", settings).output(preview))?;
/// let result = pipeline.wait_for_next_result(Duration::from_secs(1))?;
/// println!("frame {}", result.extras.frame_number);
/// pipeline.disconnect();
/// ```
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl Pipeline {
    /// Pipeline using the process-wide tunables.
    pub fn new(id: &str) -> Self {
        Self::with_tunables(id, pipeline_tunables())
    }

    pub fn with_tunables(id: &str, tunables: PipelineTunables) -> Self {
        Self {
            inner: PipelineInner::new(id, tunables),
        }
    }

    pub fn id(&self) -> &str {
        self.inner.id()
    }

    /// Open a device session; the pipeline becomes `Unconfigured`.
    pub fn open(&self, camera: &dyn CameraDevice) -> Result<(), PipelineError> {
        self.inner.open(camera)
    }

    /// Listener is held weakly; keep the `Arc` alive for as long as callbacks are wanted.
    pub fn set_listener(&self, listener: &Arc<dyn NotificationListener>) {
        self.inner.set_listener(listener);
    }

    pub fn status(&self) -> PipelineStatus {
        self.inner.status()
    }

    /// First fatal error, kept until the next `open`.
    pub fn error_cause(&self) -> Option<PipelineError> {
        self.inner.error_cause()
    }

    /// Add a stream. While active the pipeline pauses, reconfigures and resumes.
    pub fn create_stream(&self, config: StreamConfig) -> Result<StreamId, PipelineError> {
        self.inner.create_stream(config)
    }

    /// Remove a stream. A repeating request targeting it is stopped and reported.
    pub fn delete_stream(&self, id: StreamId) -> Result<(), PipelineError> {
        self.inner.delete_stream(id)
    }

    pub fn configure_streams(
        &self,
        mode: OperatingMode,
        session_params: Settings,
    ) -> Result<(), PipelineError> {
        self.inner.configure_streams(mode, session_params)
    }

    pub fn stream_info(&self, id: StreamId) -> Result<StreamInfo, PipelineError> {
        self.inner.stream_info(id)
    }

    /// Queue one request; returns its frame number.
    pub fn capture(&self, request: CaptureRequest) -> Result<FrameNumber, PipelineError> {
        self.inner.capture(vec![request])
    }

    /// Queue a burst; returns the frame number of the last request.
    pub fn capture_list(
        &self,
        requests: Vec<CaptureRequest>,
    ) -> Result<FrameNumber, PipelineError> {
        self.inner.capture(requests)
    }

    /// Replace the repeating request; returns the last frame of the previous one.
    pub fn set_repeating(
        &self,
        request: CaptureRequest,
    ) -> Result<Option<FrameNumber>, PipelineError> {
        self.inner.set_repeating(vec![request])
    }

    pub fn set_repeating_list(
        &self,
        requests: Vec<CaptureRequest>,
    ) -> Result<Option<FrameNumber>, PipelineError> {
        self.inner.set_repeating(requests)
    }

    /// Stop repeating; returns the last frame the repeating set produced.
    pub fn clear_repeating(&self) -> Result<Option<FrameNumber>, PipelineError> {
        self.inner.clear_repeating()
    }

    pub fn trigger_autofocus(&self, id: i32) -> Result<(), PipelineError> {
        self.inner.trigger(Trigger::autofocus(id))
    }

    pub fn trigger_cancel_autofocus(&self, id: i32) -> Result<(), PipelineError> {
        self.inner.trigger(Trigger::cancel_autofocus(id))
    }

    pub fn trigger_precapture_metering(&self, id: i32) -> Result<(), PipelineError> {
        self.inner.trigger(Trigger::precapture_metering(id))
    }

    /// Rotation substituted into requests asking for automatic rotate-and-crop.
    pub fn set_rotate_and_crop_auto_behavior(&self, value: u8) -> Result<(), PipelineError> {
        self.inner.set_rotate_and_crop_auto_behavior(value)
    }

    /// Fail queued requests, stop repeating and flush the device.
    pub fn flush(&self) -> Result<Option<FrameNumber>, PipelineError> {
        self.inner.flush()
    }

    /// Wait for every submitted frame to finish. Timing out puts the pipeline in `Error`.
    pub fn wait_until_idle(&self, timeout: Duration) -> Result<(), PipelineError> {
        self.inner.wait_until_idle(timeout)
    }

    pub fn wait_until_request_received(
        &self,
        request_id: i32,
        timeout: Duration,
    ) -> Result<(), PipelineError> {
        self.inner.wait_until_request_received(request_id, timeout)
    }

    /// Allocate every buffer of an unused stream ahead of its first request.
    pub fn prepare(&self, id: StreamId) -> Result<(), PipelineError> {
        self.inner.prepare(None, id)
    }

    pub fn prepare_with_count(&self, max_count: usize, id: StreamId) -> Result<(), PipelineError> {
        self.inner.prepare(Some(max_count), id)
    }

    /// Free the idle buffers of a stream no request is using.
    pub fn tear_down(&self, id: StreamId) -> Result<usize, PipelineError> {
        self.inner.tear_down(id)
    }

    pub fn add_buffer_listener(
        &self,
        id: StreamId,
        listener: Weak<dyn StreamBufferListener>,
    ) -> Result<(), PipelineError> {
        self.inner.add_buffer_listener(id, listener)
    }

    pub fn get_next_result(&self) -> Option<CaptureResult> {
        self.inner.get_next_result()
    }

    pub fn wait_for_next_result(&self, timeout: Duration) -> Result<CaptureResult, PipelineError> {
        self.inner.wait_for_next_result(timeout)
    }

    /// Async variant of [`Pipeline::wait_for_next_result`].
    #[cfg(feature = "async")]
    pub async fn wait_for_next_result_async(
        &self,
        timeout: Duration,
    ) -> Result<CaptureResult, PipelineError> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.wait_for_next_result(timeout))
            .await
            .map_err(|err| PipelineError::DeviceFault(format!("result waiter failed: {err}")))?
    }

    /// Hand the given streams and their unfinished requests to an offline session.
    ///
    /// On success the pipeline is left `Unconfigured` with every other stream removed.
    pub fn switch_to_offline(&self, streams: &[StreamId]) -> Result<OfflineSession, PipelineError> {
        self.inner.switch_to_offline(streams)
    }

    /// Upper bound on how long the frames currently in flight should take.
    pub fn expected_in_flight_duration(&self) -> Duration {
        self.inner.expected_in_flight_duration()
    }

    /// Settings of the last request the device accepted.
    pub fn latest_request(&self) -> Option<Settings> {
        self.inner.latest_request()
    }

    pub fn metrics(&self) -> PipelineMetrics {
        self.inner.metrics()
    }

    /// Human-readable state snapshot for debugging.
    pub fn dump(&self) -> String {
        self.inner.dump()
    }

    /// Stop all work and close the device session.
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<PipelineInner> {
        &self.inner
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.inner.disconnect();
    }
}
