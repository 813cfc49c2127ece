//! Matches asynchronous shutter, result and error deliveries to in-flight frames.
//!
//! Deliveries are serialized by one lock; all side effects that reach outside the
//! in-flight table (buffer returns, client callbacks, fatal errors) are collected
//! while the table is locked and performed after it is released.
use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use aperture_core::prelude::*;
use aperture_device::{
    BufferStatus, DeviceCaptureResult, ErrorCode, FrameNumber, NotifyMessage, SessionEvent,
    StreamBuffer, StreamId,
};
use parking_lot::{Condvar, Mutex};
use tracing::{error, warn};

use super::{
    error::PipelineError,
    in_flight::{CategoryCursor, InFlightRequest, InFlightTable},
    listener::{ClientError, ListenerSlot, Notification},
    records::BufferRecords,
    request::{CaptureResult, ResultExtras},
    stream::Stream,
};
use crate::{metrics::PipelineMetrics, tunables::PipelineTunables};

/// Device properties the reconciler depends on, fixed per configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReconcileConfig {
    pub partial_result_count: u32,
    pub early_partials: bool,
    pub hal_buffer_management: bool,
    pub high_speed: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            partial_result_count: 1,
            early_partials: false,
            hal_buffer_management: false,
            high_speed: false,
        }
    }
}

impl ReconcileConfig {
    fn uses_partials(&self) -> bool {
        self.partial_result_count > 1
    }
}

/// State a reconciler works against. Implemented by the live pipeline and by
/// offline sessions, which inherit a subset of its bookkeeping.
pub(crate) trait ReconcileHost: Send + Sync {
    fn stream(&self, id: StreamId) -> Option<Arc<Stream>>;
    fn records(&self) -> &BufferRecords;
    fn in_flight(&self) -> &Mutex<InFlightTable>;
    fn results(&self) -> &ResultQueue;
    fn listener(&self) -> &ListenerSlot;
    fn tunables(&self) -> PipelineTunables;
    fn reconcile_config(&self) -> ReconcileConfig;
    fn metrics(&self) -> &PipelineMetrics;
    /// Escalate to the sticky error state. Called with no pipeline lock held.
    fn set_error(&self, cause: PipelineError);
    /// The in-flight table just became empty. Called with no pipeline lock held.
    fn on_in_flight_empty(&self);
    fn start_pull(&self) -> bool;
    fn end_pull(&self);
    /// How long a pull may wait for one buffer.
    fn buffer_wait(&self) -> Duration;
}

/// Completed results waiting to be collected by the client.
#[derive(Default)]
pub(crate) struct ResultQueue {
    queue: Mutex<VecDeque<CaptureResult>>,
    available: Condvar,
}

impl ResultQueue {
    pub fn push(&self, result: CaptureResult) {
        self.queue.lock().push_back(result);
        self.available.notify_all();
    }

    pub fn pop(&self) -> Option<CaptureResult> {
        self.queue.lock().pop_front()
    }

    /// Block until a result is queued; false on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut queue = self.queue.lock();
        while queue.is_empty() {
            if self.available.wait_until(&mut queue, deadline).timed_out() {
                return !queue.is_empty();
            }
        }
        true
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn clear(&self) -> usize {
        let mut queue = self.queue.lock();
        let dropped = queue.len();
        queue.clear();
        dropped
    }
}

/// Side effects gathered under the in-flight lock.
#[derive(Default)]
struct Outcome {
    notifications: Vec<Notification>,
    results: Vec<CaptureResult>,
    returns: Vec<(StreamBuffer, FrameNumber, i64, bool)>,
    fatal: Option<PipelineError>,
    latencies: Vec<Duration>,
    completed: usize,
    errored: usize,
    emptied: bool,
}

impl Outcome {
    fn fail(&mut self, message: String) {
        error!(%message, "result delivery failed");
        if self.fatal.is_none() {
            self.fatal = Some(PipelineError::DeviceFault(message));
        }
    }
}

/// Serializing front end for device deliveries.
#[derive(Default)]
pub(crate) struct ResultReconciler {
    delivery: Mutex<()>,
}

impl ResultReconciler {
    pub fn deliver(&self, host: &dyn ReconcileHost, events: Vec<SessionEvent>) {
        let guard = match self.delivery.try_lock() {
            Some(guard) => Some(guard),
            None => {
                error!("result delivery overlapped; waiting for the previous one");
                self.delivery.try_lock_for(host.tunables().result_overlap_wait())
            }
        };
        let mut contract = None;
        if guard.is_none() {
            error!("previous result delivery still running; processing concurrently");
            contract = Some(PipelineError::ContractViolation(
                "overlapping result deliveries".into(),
            ));
        }

        let config = host.reconcile_config();
        let tunables = host.tunables();
        let mut out = Outcome::default();
        {
            let mut table = host.in_flight().lock();
            for event in events {
                match event {
                    SessionEvent::Notify(NotifyMessage::Shutter {
                        frame_number,
                        timestamp,
                    }) => on_shutter(&mut table, host, config, frame_number, timestamp, &mut out),
                    SessionEvent::Notify(NotifyMessage::Error {
                        frame_number,
                        stream_id,
                        physical_camera_id,
                        code,
                    }) => on_error(
                        &mut table,
                        host,
                        config,
                        frame_number,
                        stream_id,
                        physical_camera_id,
                        code,
                        &mut out,
                    ),
                    SessionEvent::Result(result) => {
                        on_result(&mut table, host, config, result, &mut out)
                    }
                }
            }
            let limit = tunables.in_flight_warn_limit(config.high_speed);
            if table.len() > limit {
                warn!(in_flight = table.len(), limit, "in-flight table too large");
            }
        }
        drop(guard);

        for (buffer, frame, timestamp, failed) in out.returns {
            match host.stream(buffer.stream_id) {
                Some(stream) => stream.return_buffer(buffer, frame, timestamp, failed),
                None => drop(buffer),
            }
        }
        host.listener().fire(out.notifications);
        let metrics = host.metrics();
        for latency in out.latencies {
            metrics.result.record(latency);
        }
        for _ in 0..out.completed {
            metrics.completed();
        }
        for _ in 0..out.errored {
            metrics.errored();
        }
        for result in out.results {
            host.results().push(result);
        }
        if let Some(cause) = contract.or(out.fatal) {
            host.set_error(cause);
        }
        if out.emptied {
            host.on_in_flight_empty();
        }
    }
}

fn on_shutter(
    table: &mut InFlightTable,
    host: &dyn ReconcileHost,
    config: ReconcileConfig,
    frame: FrameNumber,
    timestamp: i64,
    out: &mut Outcome,
) {
    let Some((request, shutters, results)) = table.split_mut(frame) else {
        out.fail(format!("shutter for unknown frame {frame}"));
        return;
    };
    let category = request.category();
    if let Err(expected) = shutters.advance(category, frame) {
        out.fail(format!(
            "{} shutter out of order: expected frame {expected} or later, got {frame}",
            category.as_str()
        ));
        return;
    }
    request.shutter_timestamp = timestamp;
    if request.has_callback {
        out.notifications
            .push(Notification::Shutter(request.extras.clone(), timestamp));
        if let Some(metadata) = request.pending_metadata.take() {
            send_capture_result(request, results, config, frame, metadata, out);
        }
    }
    for buffer in std::mem::take(&mut request.pending_output_buffers) {
        return_output_buffer(request, host, config, frame, buffer, timestamp, out);
    }
    remove_if_ready(table, frame, out);
}

#[allow(clippy::too_many_arguments)]
fn on_error(
    table: &mut InFlightTable,
    host: &dyn ReconcileHost,
    config: ReconcileConfig,
    frame: Option<FrameNumber>,
    stream_id: Option<StreamId>,
    physical_camera_id: Option<String>,
    code: ErrorCode,
    out: &mut Outcome,
) {
    let client = match code {
        ErrorCode::Device => {
            out.fail("device reported a serious error".into());
            return;
        }
        ErrorCode::Request => ClientError::Request,
        ErrorCode::Result => ClientError::Result,
        ErrorCode::Buffer => ClientError::Buffer,
    };
    let Some(frame) = frame else {
        error!(?code, "frame error without a frame number");
        return;
    };
    let mut extras = match table.get_mut(frame) {
        Some(request) => {
            request.request_status = Some(client);
            let mut extras = request.extras.clone();
            let mut physical_only = false;
            if client == ClientError::Result
                && let Some(camera) = physical_camera_id
            {
                if !request.physical_camera_ids.remove(&camera) {
                    error!(
                        frame_number = frame,
                        physical_camera_id = %camera,
                        "result error for a physical camera the frame did not request"
                    );
                    return;
                }
                extras.error_physical_camera_id = Some(camera);
                physical_only = true;
            }
            if !physical_only && client != ClientError::Buffer {
                request.skip_result_metadata = true;
                request.notify_buffer_errors = client == ClientError::Result;
                // Nothing else is coming for this frame; release what is held back.
                if client == ClientError::Request {
                    for buffer in std::mem::take(&mut request.pending_output_buffers) {
                        let timestamp = request.shutter_timestamp;
                        return_output_buffer(request, host, config, frame, buffer, timestamp, out);
                    }
                }
                remove_if_ready(table, frame, out);
            }
            extras
        }
        None => {
            error!(frame_number = frame, ?code, "error for a frame that is not in flight");
            ResultExtras {
                frame_number: frame,
                ..ResultExtras::default()
            }
        }
    };
    extras.error_stream_id = stream_id;
    out.notifications.push(Notification::Error(client, extras));
}

fn on_result(
    table: &mut InFlightTable,
    host: &dyn ReconcileHost,
    config: ReconcileConfig,
    result: DeviceCaptureResult,
    out: &mut Outcome,
) {
    let DeviceCaptureResult {
        frame_number: frame,
        metadata,
        partial_result,
        physical_metadata,
        output_buffers,
        input_buffer,
    } = result;

    let output_buffers: Vec<_> = output_buffers
        .into_iter()
        .filter(|b| {
            let valid = b.buffer.is_some() || b.status == BufferStatus::Error;
            if !valid {
                error!(
                    frame_number = frame,
                    stream_id = b.stream_id.0,
                    "buffer without payload reported ok"
                );
            }
            valid
        })
        .collect();

    if metadata.is_some()
        && (partial_result < 1 || partial_result > config.partial_result_count.max(1))
    {
        out.fail(format!(
            "result for frame {frame} has partial index {partial_result} outside [1, {}]",
            config.partial_result_count.max(1)
        ));
        discard(frame, output_buffers, input_buffer, out);
        return;
    }
    let Some((request, _, results)) = table.split_mut(frame) else {
        out.fail(format!("result for unknown frame {frame}"));
        discard(frame, output_buffers, input_buffer, out);
        return;
    };

    if metadata.is_some() {
        request.extras.partial_result_count = partial_result;
    }
    let mut is_partial = false;
    if config.uses_partials()
        && let Some(metadata) = &metadata
    {
        is_partial = partial_result < config.partial_result_count;
        if is_partial && !physical_metadata.is_empty() {
            out.fail(format!("partial result for frame {frame} carries physical metadata"));
            discard(frame, output_buffers, input_buffer, out);
            return;
        }
        if is_partial {
            request.collected_partial.merge(metadata);
            if request.has_callback && config.early_partials {
                out.notifications.push(Notification::PartialResult(
                    metadata.clone(),
                    request.extras.clone(),
                ));
            }
        }
    }

    let shutter = request.shutter_timestamp;
    let mut final_metadata = None;
    if let Some(metadata) = metadata
        && !is_partial
    {
        if request.physical_camera_ids.len() != physical_metadata.len() {
            out.fail(format!(
                "frame {frame} expected {} physical results, got {}",
                request.physical_camera_ids.len(),
                physical_metadata.len()
            ));
            discard(frame, output_buffers, input_buffer, out);
            return;
        }
        if request.have_result_metadata {
            out.fail(format!("metadata for frame {frame} delivered twice"));
            discard(frame, output_buffers, input_buffer, out);
            return;
        }
        for (camera, _) in &physical_metadata {
            if !request.physical_camera_ids.remove(camera) {
                out.fail(format!(
                    "result for physical camera {camera} of frame {frame} already returned"
                ));
                discard(frame, output_buffers, input_buffer, out);
                return;
            }
        }
        request.have_result_metadata = true;
        request.notify_buffer_errors = true;
        final_metadata = Some(metadata);
    }

    let mut returned = output_buffers.len() as i32;
    let input_buffer = match input_buffer {
        Some(buffer) if request.has_input_buffer => {
            returned += 1;
            Some(buffer)
        }
        Some(buffer) => {
            warn!(frame_number = frame, "input buffer returned for a request without one");
            out.returns.push((buffer, frame, 0, true));
            None
        }
        None => None,
    };
    request.num_buffers_left -= returned;
    if request.num_buffers_left < 0 {
        out.fail(format!("too many buffers returned for frame {frame}"));
        discard(frame, output_buffers, input_buffer, out);
        return;
    }
    if let Some(metadata) = &final_metadata
        && let Ok(timestamp) = metadata.i64(tags::SENSOR_TIMESTAMP)
    {
        request.sensor_timestamp = timestamp;
    }

    request.pending_output_buffers.extend(output_buffers);
    if shutter != 0 {
        for buffer in std::mem::take(&mut request.pending_output_buffers) {
            return_output_buffer(request, host, config, frame, buffer, shutter, out);
        }
    }
    if let Some(metadata) = final_metadata {
        request.physical_metadata = physical_metadata;
        if shutter == 0 {
            request.pending_metadata = Some(metadata);
        } else if request.has_callback {
            send_capture_result(request, results, config, frame, metadata, out);
        }
    }
    if let Some(buffer) = input_buffer {
        let failed = buffer.status == BufferStatus::Error;
        if host.records().pop_in_flight(frame, buffer.stream_id).is_none() {
            error!(
                frame_number = frame,
                stream_id = buffer.stream_id.0,
                "input buffer missing from ledger"
            );
        }
        out.returns.push((buffer, frame, shutter, failed));
    }
    remove_if_ready(table, frame, out);
}

/// Hand buffers of a rejected delivery back to their streams so they are not lost.
fn discard(
    frame: FrameNumber,
    outputs: Vec<StreamBuffer>,
    input: Option<StreamBuffer>,
    out: &mut Outcome,
) {
    for buffer in outputs.into_iter().chain(input) {
        out.returns.push((buffer, frame, 0, true));
    }
}

fn return_output_buffer(
    request: &InFlightRequest,
    host: &dyn ReconcileHost,
    config: ReconcileConfig,
    frame: FrameNumber,
    buffer: StreamBuffer,
    timestamp: i64,
    out: &mut Outcome,
) {
    let failed = buffer.status == BufferStatus::Error;
    if failed && request.notify_buffer_errors {
        let mut extras = request.extras.clone();
        extras.error_stream_id = Some(buffer.stream_id);
        out.notifications
            .push(Notification::Error(ClientError::Buffer, extras));
    }
    if let Some(id) = buffer.buffer_id() {
        let known = if config.hal_buffer_management {
            host.records().pop_requested(id).is_some()
        } else {
            host.records().pop_in_flight(frame, buffer.stream_id).is_some()
        };
        if !known {
            error!(
                frame_number = frame,
                stream_id = buffer.stream_id.0,
                buffer = %id,
                "returned buffer missing from ledger"
            );
        }
    } else if !config.hal_buffer_management {
        host.records().pop_in_flight(frame, buffer.stream_id);
    }
    out.returns.push((buffer, frame, timestamp, failed));
}

fn send_capture_result(
    request: &mut InFlightRequest,
    cursor: &mut CategoryCursor,
    config: ReconcileConfig,
    frame: FrameNumber,
    metadata: Settings,
    out: &mut Outcome,
) {
    let category = request.category();
    if let Err(expected) = cursor.advance(category, frame) {
        out.fail(format!(
            "{} result out of order: expected frame {expected} or later, got {frame}",
            category.as_str()
        ));
        return;
    }
    let mut merged = if config.uses_partials() {
        std::mem::take(&mut request.collected_partial)
    } else {
        Settings::new()
    };
    merged.merge(&metadata);
    if !merged.contains(tags::SENSOR_TIMESTAMP) {
        out.fail(format!("no sensor timestamp in result for frame {frame}"));
        return;
    }
    if let Some((camera, _)) = request
        .physical_metadata
        .iter()
        .find(|(_, m)| !m.contains(tags::SENSOR_TIMESTAMP))
    {
        out.fail(format!(
            "no sensor timestamp in physical result of camera {camera} for frame {frame}"
        ));
        return;
    }
    merged.set(tags::REQUEST_FRAME_COUNT, MetadataValue::i64(frame as i64));
    if request.rotate_and_crop_auto {
        merged.set(
            tags::SCALER_ROTATE_AND_CROP,
            MetadataValue::u8(tags::rotate_and_crop::AUTO),
        );
    }
    out.results.push(CaptureResult {
        extras: request.extras.clone(),
        metadata: merged,
        physical_metadata: std::mem::take(&mut request.physical_metadata),
    });
}

fn remove_if_ready(table: &mut InFlightTable, frame: FrameNumber, out: &mut Outcome) {
    if !table.get(frame).is_some_and(InFlightRequest::is_ready_to_remove) {
        return;
    }
    let Some(mut request) = table.remove(frame) else {
        return;
    };
    if request.has_callback
        && request.request_status.is_none()
        && request.sensor_timestamp != request.shutter_timestamp
    {
        out.fail(format!(
            "sensor timestamp {} of frame {frame} does not match shutter {}",
            request.sensor_timestamp, request.shutter_timestamp
        ));
    }
    // Buffers of a failed request that never saw a shutter.
    for buffer in std::mem::take(&mut request.pending_output_buffers) {
        let failed = buffer.status == BufferStatus::Error;
        out.returns.push((buffer, frame, 0, failed));
    }
    table.record_completed(frame, request.category());
    if request.skip_result_metadata || request.request_status.is_some() {
        out.errored += 1;
    } else {
        out.completed += 1;
    }
    out.latencies.push(request.registered_at.elapsed());
    if table.is_empty() {
        out.emptied = true;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::pipeline::stream::{StreamConfig, StreamRegistry};
    use aperture_device::ConfiguredStream;

    /// Minimal host backed by plain collections.
    #[derive(Default)]
    pub(crate) struct TestHost {
        pub streams: StreamRegistry,
        pub records: BufferRecords,
        pub in_flight: Mutex<InFlightTable>,
        pub results: ResultQueue,
        pub listener: ListenerSlot,
        pub metrics: PipelineMetrics,
        pub config: Mutex<ReconcileConfig>,
        pub errors: Mutex<Vec<PipelineError>>,
        pub emptied: AtomicUsize,
        pub pulls_open: Mutex<bool>,
        pub reconfigures: Mutex<Vec<Settings>>,
        pub registered: AtomicUsize,
    }

    impl TestHost {
        pub fn with_stream(self, id: i32, max_buffers: usize) -> Self {
            let format = StreamFormat::new(FourCc::YUYV, Resolution::new(4, 2).expect("res"));
            let stream = Arc::new(Stream::new(StreamId(id), StreamConfig::output(format)));
            stream.start_configuration().expect("start");
            stream
                .finish_configuration(&ConfiguredStream {
                    id: StreamId(id),
                    max_buffers,
                    usage: 0,
                    format,
                })
                .expect("finish");
            self.streams.insert(stream);
            self
        }

        pub fn errors(&self) -> Vec<PipelineError> {
            self.errors.lock().clone()
        }
    }

    impl ReconcileHost for TestHost {
        fn stream(&self, id: StreamId) -> Option<Arc<Stream>> {
            self.streams.get(id)
        }

        fn records(&self) -> &BufferRecords {
            &self.records
        }

        fn in_flight(&self) -> &Mutex<InFlightTable> {
            &self.in_flight
        }

        fn results(&self) -> &ResultQueue {
            &self.results
        }

        fn listener(&self) -> &ListenerSlot {
            &self.listener
        }

        fn tunables(&self) -> PipelineTunables {
            PipelineTunables {
                result_overlap_wait_ms: 20,
                ..PipelineTunables::default()
            }
        }

        fn reconcile_config(&self) -> ReconcileConfig {
            *self.config.lock()
        }

        fn metrics(&self) -> &PipelineMetrics {
            &self.metrics
        }

        fn set_error(&self, cause: PipelineError) {
            self.errors.lock().push(cause);
        }

        fn on_in_flight_empty(&self) {
            self.emptied.fetch_add(1, Ordering::SeqCst);
        }

        fn start_pull(&self) -> bool {
            *self.pulls_open.lock()
        }

        fn end_pull(&self) {}

        fn buffer_wait(&self) -> Duration {
            Duration::from_millis(5)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::testing::TestHost;
    use super::*;
    use crate::pipeline::listener::testing::RecordingListener;
    use aperture_device::{BufferPullReply, BufferRequest, BufferRequestStatus, StreamBufferError};

    fn register(host: &TestHost, frame: FrameNumber, stream: i32) -> StreamBuffer {
        let lease = host
            .streams
            .get(StreamId(stream))
            .expect("stream")
            .get_buffer(Duration::from_millis(5))
            .expect("buffer");
        host.records
            .push_in_flight(frame, StreamId(stream), lease.id());
        let extras = ResultExtras {
            frame_number: frame,
            request_id: 7,
            ..ResultExtras::default()
        };
        host.in_flight.lock().insert(
            frame,
            InFlightRequest::new(extras, vec![StreamId(stream)], false),
        );
        StreamBuffer::filled(StreamId(stream), lease)
    }

    fn shutter(frame: FrameNumber, timestamp: i64) -> SessionEvent {
        SessionEvent::Notify(NotifyMessage::Shutter {
            frame_number: frame,
            timestamp,
        })
    }

    fn final_result(
        frame: FrameNumber,
        timestamp: i64,
        buffers: Vec<StreamBuffer>,
    ) -> SessionEvent {
        SessionEvent::Result(DeviceCaptureResult {
            frame_number: frame,
            metadata: Some(
                Settings::new().with(tags::SENSOR_TIMESTAMP, MetadataValue::i64(timestamp)),
            ),
            partial_result: 1,
            output_buffers: buffers,
            ..Default::default()
        })
    }

    #[test]
    fn frame_retires_only_after_shutter_metadata_and_buffers() {
        let host = TestHost::default().with_stream(0, 2);
        let reconciler = ResultReconciler::default();
        let buffer = register(&host, 1, 0);

        reconciler.deliver(&host, vec![final_result(1, 50, Vec::new())]);
        assert_eq!(host.in_flight.lock().len(), 1);
        assert_eq!(host.results.len(), 0, "held until the shutter");

        reconciler.deliver(&host, vec![shutter(1, 50)]);
        assert_eq!(host.results.len(), 1);
        assert_eq!(host.in_flight.lock().len(), 1, "buffer still out");

        reconciler.deliver(
            &host,
            vec![SessionEvent::Result(DeviceCaptureResult {
                frame_number: 1,
                output_buffers: vec![buffer],
                ..Default::default()
            })],
        );
        assert!(host.in_flight.lock().is_empty());
        assert_eq!(host.emptied.load(Ordering::SeqCst), 1);
        assert_eq!(host.streams.get(StreamId(0)).expect("stream").outstanding(), 0);
        assert_eq!(host.metrics.completed_frames(), 1);
        let result = host.results.pop().expect("result");
        assert_eq!(result.extras.request_id, 7);
        assert_eq!(result.metadata.i64(tags::REQUEST_FRAME_COUNT).expect("count"), 1);
        assert!(host.errors().is_empty());
    }

    #[test]
    fn repeated_completion_does_not_retire_twice() {
        let host = TestHost::default().with_stream(0, 2);
        let reconciler = ResultReconciler::default();
        let buffer = register(&host, 1, 0);
        reconciler.deliver(&host, vec![shutter(1, 9), final_result(1, 9, vec![buffer])]);
        assert_eq!(host.metrics.completed_frames(), 1);
        reconciler.deliver(&host, vec![final_result(1, 9, Vec::new())]);
        assert_eq!(host.metrics.completed_frames(), 1);
        assert_eq!(host.emptied.load(Ordering::SeqCst), 1);
        assert_eq!(host.errors().len(), 1, "unknown frame is reported");
    }

    #[test]
    fn out_of_order_shutter_is_fatal() {
        let host = TestHost::default().with_stream(0, 4);
        let reconciler = ResultReconciler::default();
        let _a = register(&host, 1, 0);
        let _b = register(&host, 2, 0);
        reconciler.deliver(&host, vec![shutter(2, 20), shutter(1, 10)]);
        let errors = host.errors();
        assert_eq!(errors.len(), 1);
        assert!(matches!(&errors[0], PipelineError::DeviceFault(m) if m.contains("out of order")));
    }

    #[test]
    fn partials_merge_unless_delivered_early() {
        let host = TestHost::default().with_stream(0, 2);
        *host.config.lock() = ReconcileConfig {
            partial_result_count: 2,
            ..ReconcileConfig::default()
        };
        let listener = RecordingListener::new();
        host.listener.set(&listener.as_dyn());
        let reconciler = ResultReconciler::default();
        let buffer = register(&host, 1, 0);
        let partial_tag = Tag::new(0x8000_0001);
        reconciler.deliver(
            &host,
            vec![
                shutter(1, 5),
                SessionEvent::Result(DeviceCaptureResult {
                    frame_number: 1,
                    metadata: Some(Settings::new().with(partial_tag, MetadataValue::i32(1))),
                    partial_result: 1,
                    ..Default::default()
                }),
            ],
        );
        assert_eq!(listener.count(|n| matches!(n, Notification::PartialResult(..))), 0);
        let mut last = final_result(1, 5, vec![buffer]);
        if let SessionEvent::Result(r) = &mut last {
            r.partial_result = 2;
        }
        reconciler.deliver(&host, vec![last]);
        let result = host.results.pop().expect("result");
        assert_eq!(result.metadata.i32(partial_tag).expect("merged"), 1);
        assert_eq!(result.extras.partial_result_count, 2);

        host.config.lock().early_partials = true;
        let _buffer = register(&host, 2, 0);
        reconciler.deliver(
            &host,
            vec![SessionEvent::Result(DeviceCaptureResult {
                frame_number: 2,
                metadata: Some(Settings::new().with(partial_tag, MetadataValue::i32(1))),
                partial_result: 1,
                ..Default::default()
            })],
        );
        assert_eq!(listener.count(|n| matches!(n, Notification::PartialResult(..))), 1);
    }

    #[test]
    fn request_error_returns_buffers_without_buffer_errors() {
        let host = TestHost::default().with_stream(0, 2);
        let listener = RecordingListener::new();
        host.listener.set(&listener.as_dyn());
        let reconciler = ResultReconciler::default();
        let buffer = register(&host, 3, 0);
        reconciler.deliver(
            &host,
            vec![
                SessionEvent::Notify(NotifyMessage::Error {
                    frame_number: Some(3),
                    stream_id: None,
                    physical_camera_id: None,
                    code: ErrorCode::Request,
                }),
                SessionEvent::Result(DeviceCaptureResult {
                    frame_number: 3,
                    output_buffers: vec![buffer.with_status(BufferStatus::Error)],
                    ..Default::default()
                }),
            ],
        );
        assert!(host.in_flight.lock().is_empty());
        assert_eq!(listener.errors(ClientError::Request).len(), 1);
        assert!(listener.errors(ClientError::Buffer).is_empty());
        assert_eq!(host.metrics.errored_frames(), 1);
        assert_eq!(host.streams.get(StreamId(0)).expect("stream").outstanding(), 0);
        assert!(host.errors().is_empty());
    }

    #[test]
    fn physical_result_error_shrinks_expected_set() {
        let host = TestHost::default().with_stream(0, 2);
        let listener = RecordingListener::new();
        host.listener.set(&listener.as_dyn());
        let reconciler = ResultReconciler::default();
        let buffer = register(&host, 1, 0);
        host.in_flight
            .lock()
            .get_mut(1)
            .expect("entry")
            .physical_camera_ids
            .extend(["2".to_string(), "3".to_string()]);
        reconciler.deliver(
            &host,
            vec![SessionEvent::Notify(NotifyMessage::Error {
                frame_number: Some(1),
                stream_id: None,
                physical_camera_id: Some("3".into()),
                code: ErrorCode::Result,
            })],
        );
        let errors = listener.errors(ClientError::Result);
        assert_eq!(errors[0].error_physical_camera_id.as_deref(), Some("3"));
        let mut result = final_result(1, 8, vec![buffer]);
        if let SessionEvent::Result(r) = &mut result {
            r.physical_metadata = vec![(
                "2".into(),
                Settings::new().with(tags::SENSOR_TIMESTAMP, MetadataValue::i64(8)),
            )];
        }
        reconciler.deliver(&host, vec![shutter(1, 8), result]);
        let result = host.results.pop().expect("logical result survives");
        assert_eq!(result.physical_metadata.len(), 1);
        assert!(host.in_flight.lock().is_empty());
    }

    #[test]
    fn device_error_escalates() {
        let host = TestHost::default();
        ResultReconciler::default().deliver(
            &host,
            vec![SessionEvent::Notify(NotifyMessage::Error {
                frame_number: None,
                stream_id: None,
                physical_camera_id: None,
                code: ErrorCode::Device,
            })],
        );
        assert_eq!(host.errors().len(), 1);
    }

    #[test]
    fn overlapping_delivery_waits_then_escalates() {
        let host = TestHost::default();
        let reconciler = ResultReconciler::default();
        let held = reconciler.delivery.lock();
        reconciler.deliver(&host, Vec::new());
        drop(held);
        assert_eq!(
            host.errors(),
            vec![PipelineError::ContractViolation("overlapping result deliveries".into())]
        );
    }

    #[test]
    fn pull_protocol_reports_per_stream_outcomes() {
        use crate::pipeline::buffer_coordinator::{request_stream_buffers, return_stream_buffers};

        let host = TestHost::default().with_stream(0, 2).with_stream(1, 1);
        let pull = [
            BufferRequest {
                stream_id: StreamId(0),
                num_buffers: 2,
            },
            BufferRequest {
                stream_id: StreamId(1),
                num_buffers: 2,
            },
        ];
        let reply: BufferPullReply = request_stream_buffers(&host, &pull);
        assert_eq!(
            reply.status,
            BufferRequestStatus::FailedIllegalArgument,
            "no device-side management"
        );

        host.config.lock().hal_buffer_management = true;
        let reply = request_stream_buffers(&host, &pull);
        assert_eq!(reply.status, BufferRequestStatus::FailedConfiguring);

        *host.pulls_open.lock() = true;
        let reply = request_stream_buffers(&host, &pull);
        assert_eq!(reply.status, BufferRequestStatus::FailedPartial);
        let mut returns = reply.returns.into_iter();
        let first = returns.next().expect("stream 0");
        let buffers = first.result.expect("two buffers");
        assert_eq!(buffers.len(), 2);
        let second = returns.next().expect("stream 1");
        assert_eq!(second.result.expect_err("over capacity"), StreamBufferError::MaxBufferExceeded);
        assert_eq!(host.records.outstanding(StreamId(0)), 2);

        return_stream_buffers(&host, buffers);
        assert_eq!(host.records.outstanding(StreamId(0)), 0);
        assert_eq!(host.streams.get(StreamId(0)).expect("stream").outstanding(), 0);

        let duplicate = [pull[0], pull[0]];
        assert_eq!(
            request_stream_buffers(&host, &duplicate).status,
            BufferRequestStatus::FailedIllegalArgument
        );
    }
}
