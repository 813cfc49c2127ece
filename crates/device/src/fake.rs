//! In-process device session that records submissions and completes them with
//! patterned buffers, either on a worker thread or on demand from tests.
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use aperture_core::prelude::*;
use parking_lot::Mutex;

use crate::{
    BufferRequest, BufferStatus, CameraDevice, ConfiguredStream, DeviceCapabilities,
    DeviceCaptureResult, DeviceError, DeviceRequest, DeviceSession, ErrorCode, FrameNumber,
    NotifyMessage, OfflineDeviceSession, OfflineRequest, OfflineSessionInfo, OfflineStream,
    OperatingMode, SessionCallbacks, SessionEvent, StreamBuffer, StreamDescriptor, StreamId,
    SubmitOutcome,
};

/// Producer usage bit the fake adds to every configured stream.
pub const FAKE_PRODUCER_USAGE: u64 = 1 << 32;
/// Tag section used for the synthetic metadata carried by non-final partials.
pub const PARTIAL_TAG_SECTION: u32 = 0x8000_0000;

const FEED_CAPACITY: usize = 256;
const CLOCK_STEP_NS: i64 = 33_333_333;

/// Knobs controlling how the fake behaves.
#[derive(Debug, Clone)]
pub struct FakeBehavior {
    pub capabilities: DeviceCapabilities,
    /// Complete accepted requests on a worker thread.
    pub auto_complete: bool,
    /// Delay between automatic completions.
    pub frame_interval: Duration,
    /// Accept at most this many requests per batch.
    pub accept_limit: Option<usize>,
    pub reject_configuration: bool,
    pub reconfiguration_required: bool,
    pub max_buffers: usize,
    /// Extra outstanding buffers reported per stream on offline switch.
    pub offline_inventory_skew: usize,
}

impl Default for FakeBehavior {
    fn default() -> Self {
        Self {
            capabilities: DeviceCapabilities::default(),
            auto_complete: true,
            frame_interval: Duration::from_millis(2),
            accept_limit: None,
            reject_configuration: false,
            reconfiguration_required: true,
            max_buffers: 4,
            offline_inventory_skew: 0,
        }
    }
}

impl FakeBehavior {
    /// Requests stay pending until the test completes them.
    pub fn manual() -> Self {
        Self {
            auto_complete: false,
            ..Self::default()
        }
    }

    pub fn capabilities(mut self, capabilities: DeviceCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn accept_limit(mut self, limit: usize) -> Self {
        self.accept_limit = Some(limit);
        self
    }
}

/// What the fake saw for one accepted request.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedFrame {
    pub frame_number: FrameNumber,
    pub settings: Option<Settings>,
    pub physical_settings: Vec<(String, Settings)>,
    pub output_streams: Vec<StreamId>,
    pub has_input: bool,
}

/// Camera whose sessions are [`FakeSession`]s.
///
/// # Example
/// ```rust,ignore
/// use aperture_device::prelude::*;
///
/// let camera = FakeCamera::with_behavior("0", FakeBehavior::manual());
/// pipeline.open(&camera)?;
/// let session = camera.session().expect("opened");
/// session.complete_all();
/// ```
pub struct FakeCamera {
    id: String,
    behavior: FakeBehavior,
    session: Mutex<Option<Arc<FakeSession>>>,
}

impl FakeCamera {
    pub fn new(id: &str) -> Self {
        Self::with_behavior(id, FakeBehavior::default())
    }

    pub fn with_behavior(id: &str, behavior: FakeBehavior) -> Self {
        Self {
            id: id.to_string(),
            behavior,
            session: Mutex::new(None),
        }
    }

    /// Most recently opened session.
    pub fn session(&self) -> Option<Arc<FakeSession>> {
        self.session.lock().clone()
    }
}

impl CameraDevice for FakeCamera {
    fn id(&self) -> &str {
        &self.id
    }

    fn open(
        &self,
        callbacks: Weak<dyn SessionCallbacks>,
    ) -> Result<Arc<dyn DeviceSession>, DeviceError> {
        let session = FakeSession::start(self.behavior.clone(), callbacks);
        *self.session.lock() = Some(session.clone());
        Ok(session)
    }
}

struct PendingFrame {
    request: DeviceRequest,
    effective: Settings,
    /// Shutter already sent for this frame, if any.
    shutter: Option<i64>,
}

#[derive(Default)]
struct FakeState {
    pending: BTreeMap<FrameNumber, PendingFrame>,
    submissions: Vec<SubmittedFrame>,
    configured: Vec<StreamDescriptor>,
    session_params: Settings,
    last_settings: Settings,
    seen_buffers: HashMap<StreamId, BTreeSet<BufferId>>,
    submit_faults: VecDeque<(DeviceError, bool)>,
    flushes: usize,
    drain_signals: usize,
    closed: bool,
}

/// Recording device session.
pub struct FakeSession {
    behavior: Mutex<FakeBehavior>,
    callbacks: Weak<dyn SessionCallbacks>,
    state: Mutex<FakeState>,
    clock: AtomicI64,
    feed: BoundedTx<FrameNumber>,
    feed_rx: BoundedRx<FrameNumber>,
    stop: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    offline: Mutex<Option<FakeOfflineSession>>,
}

impl FakeSession {
    fn start(behavior: FakeBehavior, callbacks: Weak<dyn SessionCallbacks>) -> Arc<Self> {
        let (feed, feed_rx) = bounded(FEED_CAPACITY);
        let auto = behavior.auto_complete;
        let interval = behavior.frame_interval;
        let session = Arc::new(Self {
            behavior: Mutex::new(behavior),
            callbacks,
            state: Mutex::new(FakeState::default()),
            clock: AtomicI64::new(1_000_000),
            feed,
            feed_rx,
            stop: AtomicBool::new(false),
            worker: Mutex::new(None),
            offline: Mutex::new(None),
        });
        if auto {
            let weak = Arc::downgrade(&session);
            let handle = thread::Builder::new()
                .name("fake-camera".into())
                .spawn(move || completion_loop(weak, interval));
            match handle {
                Ok(h) => *session.worker.lock() = Some(h),
                Err(err) => tracing::error!(error = %err, "fake camera worker failed to start"),
            }
        }
        session
    }

    /// Adjust behavior on the fly.
    pub fn update_behavior(&self, f: impl FnOnce(&mut FakeBehavior)) {
        f(&mut self.behavior.lock());
    }

    pub fn submissions(&self) -> Vec<SubmittedFrame> {
        self.state.lock().submissions.clone()
    }

    pub fn submitted_count(&self) -> usize {
        self.state.lock().submissions.len()
    }

    pub fn pending_frames(&self) -> Vec<FrameNumber> {
        self.state.lock().pending.keys().copied().collect()
    }

    pub fn configured_streams(&self) -> Vec<StreamDescriptor> {
        self.state.lock().configured.clone()
    }

    pub fn session_params(&self) -> Settings {
        self.state.lock().session_params.clone()
    }

    pub fn flush_count(&self) -> usize {
        self.state.lock().flushes
    }

    pub fn drain_signals(&self) -> usize {
        self.state.lock().drain_signals
    }

    pub fn offline_session(&self) -> Option<FakeOfflineSession> {
        self.offline.lock().clone()
    }

    /// Make the next submit fail with `error`; with `notify_device` a device error
    /// notification is also delivered before the call returns.
    pub fn inject_submit_fault(&self, error: DeviceError, notify_device: bool) {
        self.state
            .lock()
            .submit_faults
            .push_back((error, notify_device));
    }

    /// Complete one pending frame successfully. Returns false if it was not pending.
    pub fn complete(&self, frame_number: FrameNumber) -> bool {
        let Some(callbacks) = self.callbacks.upgrade() else {
            return false;
        };
        let Some(frame) = self.state.lock().pending.remove(&frame_number) else {
            return false;
        };
        let timestamp = self.tick();
        let partials = self.behavior.lock().capabilities.partial_result_count;
        let record_seen = |id: StreamId, buf: BufferId| {
            self.state
                .lock()
                .seen_buffers
                .entry(id)
                .or_default()
                .insert(buf);
        };
        let events =
            completion_events(callbacks.as_ref(), frame, timestamp, partials, true, record_seen);
        callbacks.deliver(events);
        true
    }

    /// Complete every pending frame in order; returns how many completed.
    pub fn complete_all(&self) -> usize {
        self.pending_frames()
            .into_iter()
            .filter(|frame| self.complete(*frame))
            .count()
    }

    /// Fail a pending frame with a request error.
    pub fn fail_request(&self, frame_number: FrameNumber) -> bool {
        let Some(callbacks) = self.callbacks.upgrade() else {
            return false;
        };
        let Some(frame) = self.state.lock().pending.remove(&frame_number) else {
            return false;
        };
        callbacks.deliver(request_error_events(frame.request));
        true
    }

    /// Report the whole device as failed.
    pub fn report_device_error(&self) {
        self.deliver(vec![SessionEvent::Notify(NotifyMessage::Error {
            frame_number: None,
            stream_id: None,
            physical_camera_id: None,
            code: ErrorCode::Device,
        })]);
    }

    /// Push raw events through the session callbacks.
    pub fn deliver(&self, events: Vec<SessionEvent>) {
        if let Some(callbacks) = self.callbacks.upgrade() {
            callbacks.deliver(events);
        }
    }

    fn tick(&self) -> i64 {
        self.clock.fetch_add(CLOCK_STEP_NS, Ordering::Relaxed) + CLOCK_STEP_NS
    }

    fn shutdown_worker(&self) {
        self.stop.store(true, Ordering::Release);
        self.feed.close();
        if let Some(handle) = self.worker.lock().take()
            && handle.thread().id() != thread::current().id()
        {
            let _ = handle.join();
        }
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.feed.close();
    }
}

fn completion_loop(session: Weak<FakeSession>, interval: Duration) {
    loop {
        let next = {
            let Some(session) = session.upgrade() else {
                return;
            };
            if session.stop.load(Ordering::Acquire) {
                return;
            }
            session.feed_rx.recv()
        };
        thread::sleep(interval);
        match next {
            RecvOutcome::Data(frame) => {
                let Some(session) = session.upgrade() else {
                    return;
                };
                session.complete(frame);
            }
            RecvOutcome::Empty => {}
            RecvOutcome::Closed => return,
        }
    }
}

impl DeviceSession for FakeSession {
    fn capabilities(&self) -> DeviceCapabilities {
        self.behavior.lock().capabilities.clone()
    }

    fn configure_streams(
        &self,
        session_params: &Settings,
        streams: &[StreamDescriptor],
        _mode: OperatingMode,
    ) -> Result<Vec<ConfiguredStream>, DeviceError> {
        let behavior = self.behavior.lock().clone();
        if behavior.reject_configuration {
            return Err(DeviceError::InvalidConfiguration(
                "stream combination rejected".into(),
            ));
        }
        let mut state = self.state.lock();
        if state.closed {
            return Err(DeviceError::Disconnected);
        }
        state.configured = streams.to_vec();
        state.session_params = session_params.clone();
        state
            .seen_buffers
            .retain(|id, _| streams.iter().any(|s| s.id == *id));
        Ok(streams
            .iter()
            .map(|s| ConfiguredStream {
                id: s.id,
                max_buffers: behavior.max_buffers,
                usage: s.usage | FAKE_PRODUCER_USAGE,
                format: s.format,
            })
            .collect())
    }

    fn is_reconfiguration_required(
        &self,
        _old: &Settings,
        _new: &Settings,
    ) -> Result<bool, DeviceError> {
        Ok(self.behavior.lock().reconfiguration_required)
    }

    fn submit_batch(&self, mut requests: Vec<DeviceRequest>) -> SubmitOutcome {
        let fault = self.state.lock().submit_faults.pop_front();
        if let Some((error, notify_device)) = fault {
            if notify_device {
                self.report_device_error();
            }
            return SubmitOutcome {
                accepted: 0,
                returned: requests,
                error: Some(error),
            };
        }
        let (limit, auto) = {
            let behavior = self.behavior.lock();
            (behavior.accept_limit, behavior.auto_complete)
        };
        let accepted = limit.map_or(requests.len(), |l| l.min(requests.len()));
        let returned = requests.split_off(accepted);
        let mut frames = Vec::with_capacity(accepted);
        {
            let mut state = self.state.lock();
            if state.closed {
                requests.extend(returned);
                return SubmitOutcome {
                    accepted: 0,
                    returned: requests,
                    error: Some(DeviceError::Disconnected),
                };
            }
            for request in requests {
                if let Some(settings) = &request.settings {
                    state.last_settings = settings.clone();
                }
                for out in &request.output_buffers {
                    if let Some(id) = out.buffer_id() {
                        state.seen_buffers.entry(out.stream_id).or_default().insert(id);
                    }
                }
                state.submissions.push(SubmittedFrame {
                    frame_number: request.frame_number,
                    settings: request.settings.clone(),
                    physical_settings: request.physical_settings.clone(),
                    output_streams: request.output_buffers.iter().map(|b| b.stream_id).collect(),
                    has_input: request.input_buffer.is_some(),
                });
                frames.push(request.frame_number);
                let effective = state.last_settings.clone();
                state
                    .pending
                    .insert(
                        request.frame_number,
                        PendingFrame {
                            request,
                            effective,
                            shutter: None,
                        },
                    );
            }
        }
        if auto {
            for frame in frames {
                match self.feed.send(frame) {
                    SendOutcome::Ok => {}
                    SendOutcome::Full(frame) | SendOutcome::Closed(frame) => {
                        self.complete(frame);
                    }
                }
            }
        }
        SubmitOutcome {
            accepted,
            returned,
            error: None,
        }
    }

    fn flush(&self) -> Result<(), DeviceError> {
        let frames = {
            let mut state = self.state.lock();
            state.flushes += 1;
            std::mem::take(&mut state.pending)
        };
        if let Some(callbacks) = self.callbacks.upgrade() {
            for (_, frame) in frames {
                callbacks.deliver(request_error_events(frame.request));
            }
        }
        Ok(())
    }

    fn signal_pipeline_drain(&self, _streams: &[StreamId]) {
        self.state.lock().drain_signals += 1;
    }

    fn switch_to_offline(
        &self,
        streams: &[StreamId],
    ) -> Result<(OfflineSessionInfo, Box<dyn OfflineDeviceSession>), DeviceError> {
        let behavior = self.behavior.lock().clone();
        if !behavior.capabilities.offline_processing {
            return Err(DeviceError::Unsupported("offline processing".into()));
        }
        let mut errored = Vec::new();
        let mut moved = BTreeMap::new();
        let mut handed_back = Vec::new();
        let info = {
            let mut state = self.state.lock();
            for (frame_number, mut frame) in std::mem::take(&mut state.pending) {
                let (kept, other): (Vec<_>, Vec<_>) = frame
                    .request
                    .output_buffers
                    .drain(..)
                    .partition(|b| streams.contains(&b.stream_id));
                if kept.is_empty() || frame.request.input_buffer.is_some() {
                    frame.request.output_buffers = kept.into_iter().chain(other).collect();
                    errored.push(frame.request);
                    continue;
                }
                let timestamp = self.tick();
                frame.shutter = Some(timestamp);
                handed_back.push((frame_number, timestamp, other));
                frame.request.output_buffers = kept;
                moved.insert(frame_number, frame);
            }
            let offline_streams = streams
                .iter()
                .map(|id| OfflineStream {
                    id: *id,
                    num_outstanding_buffers: moved
                        .values()
                        .flat_map(|f: &PendingFrame| f.request.output_buffers.iter())
                        .filter(|b| b.stream_id == *id)
                        .count()
                        + behavior.offline_inventory_skew,
                    circulating_buffer_ids: state
                        .seen_buffers
                        .get(id)
                        .map(|ids| ids.iter().copied().collect())
                        .unwrap_or_default(),
                })
                .collect();
            let offline_requests = moved
                .iter()
                .map(|(frame_number, f)| OfflineRequest {
                    frame_number: *frame_number,
                    pending_streams: f.request.output_buffers.iter().map(|b| b.stream_id).collect(),
                })
                .collect();
            OfflineSessionInfo {
                offline_streams,
                offline_requests,
            }
        };

        if let Some(callbacks) = self.callbacks.upgrade() {
            for request in errored {
                callbacks.deliver(request_error_events(request));
            }
            for (frame_number, timestamp, other) in handed_back {
                let mut events = vec![SessionEvent::Notify(NotifyMessage::Shutter {
                    frame_number,
                    timestamp,
                })];
                if !other.is_empty() {
                    events.push(SessionEvent::Result(DeviceCaptureResult {
                        frame_number,
                        output_buffers: other
                            .into_iter()
                            .map(|b| b.with_status(BufferStatus::Error))
                            .collect(),
                        ..Default::default()
                    }));
                }
                callbacks.deliver(events);
            }
        }

        let offline = FakeOfflineSession {
            inner: Arc::new(OfflineInner {
                pending: Mutex::new(moved),
                callbacks: Mutex::new(None),
                partial_result_count: behavior.capabilities.partial_result_count,
                clock: AtomicI64::new(self.clock.load(Ordering::Relaxed)),
            }),
        };
        *self.offline.lock() = Some(offline.clone());
        Ok((info, Box::new(offline)))
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.shutdown_worker();
    }
}

/// Device side of an offline session created by [`FakeSession`].
#[derive(Clone)]
pub struct FakeOfflineSession {
    inner: Arc<OfflineInner>,
}

struct OfflineInner {
    pending: Mutex<BTreeMap<FrameNumber, PendingFrame>>,
    callbacks: Mutex<Option<Weak<dyn SessionCallbacks>>>,
    partial_result_count: u32,
    clock: AtomicI64,
}

impl FakeOfflineSession {
    pub fn pending_frames(&self) -> Vec<FrameNumber> {
        self.inner.pending.lock().keys().copied().collect()
    }

    /// Finish every transferred request through the attached callbacks. Shutters
    /// were already sent before the switch.
    pub fn complete_all(&self) -> usize {
        let Some(callbacks) = self.inner.callbacks.lock().as_ref().and_then(Weak::upgrade) else {
            return 0;
        };
        let frames = std::mem::take(&mut *self.inner.pending.lock());
        let count = frames.len();
        for (_, frame) in frames {
            let timestamp = frame
                .shutter
                .unwrap_or_else(|| self.inner.clock.fetch_add(CLOCK_STEP_NS, Ordering::Relaxed));
            let events = completion_events(
                callbacks.as_ref(),
                frame,
                timestamp,
                self.inner.partial_result_count,
                false,
                |_, _| {},
            );
            callbacks.deliver(events);
        }
        count
    }
}

impl OfflineDeviceSession for FakeOfflineSession {
    fn attach(&self, callbacks: Weak<dyn SessionCallbacks>) {
        *self.inner.callbacks.lock() = Some(callbacks);
    }

    fn close(&self) {
        self.inner.callbacks.lock().take();
        let frames = std::mem::take(&mut *self.inner.pending.lock());
        if !frames.is_empty() {
            tracing::debug!(dropped = frames.len(), "offline fake closed with pending frames");
        }
    }
}

fn completion_events(
    callbacks: &dyn SessionCallbacks,
    frame: PendingFrame,
    timestamp: i64,
    partial_result_count: u32,
    with_shutter: bool,
    mut on_pulled: impl FnMut(StreamId, BufferId),
) -> Vec<SessionEvent> {
    let PendingFrame { request, effective, .. } = frame;
    let frame_number = request.frame_number;
    let pattern = (timestamp % 256) as u8;
    let output_buffers = request
        .output_buffers
        .into_iter()
        .map(|out| match out.buffer {
            Some(mut lease) => {
                lease.fill(pattern);
                StreamBuffer::filled(out.stream_id, lease)
            }
            None => pull_one(callbacks, out.stream_id, pattern, &mut on_pulled),
        })
        .collect();

    let mut events = Vec::new();
    if with_shutter {
        events.push(SessionEvent::Notify(NotifyMessage::Shutter {
            frame_number,
            timestamp,
        }));
    }
    let partials = partial_result_count.max(1);
    for part in 1..partials {
        events.push(SessionEvent::Result(DeviceCaptureResult {
            frame_number,
            metadata: Some(Settings::new().with(
                Tag::new(PARTIAL_TAG_SECTION | part),
                MetadataValue::i32(part as i32),
            )),
            partial_result: part,
            ..Default::default()
        }));
    }
    let metadata = effective.with(tags::SENSOR_TIMESTAMP, MetadataValue::i64(timestamp));
    let physical_metadata = request
        .physical_settings
        .into_iter()
        .map(|(id, settings)| {
            (
                id,
                settings.with(tags::SENSOR_TIMESTAMP, MetadataValue::i64(timestamp)),
            )
        })
        .collect();
    events.push(SessionEvent::Result(DeviceCaptureResult {
        frame_number,
        metadata: Some(metadata),
        partial_result: partials,
        physical_metadata,
        output_buffers,
        input_buffer: request
            .input_buffer
            .map(|b| b.with_status(BufferStatus::Ok)),
    }));
    events
}

fn pull_one(
    callbacks: &dyn SessionCallbacks,
    stream_id: StreamId,
    pattern: u8,
    on_pulled: &mut impl FnMut(StreamId, BufferId),
) -> StreamBuffer {
    let reply = callbacks.request_stream_buffers(&[BufferRequest {
        stream_id,
        num_buffers: 1,
    }]);
    let pulled = reply
        .returns
        .into_iter()
        .find(|r| r.stream_id == stream_id)
        .and_then(|r| r.result.ok())
        .and_then(|mut buffers| buffers.pop());
    match pulled {
        Some(mut buffer) => {
            if let Some(lease) = buffer.buffer.as_mut() {
                on_pulled(stream_id, lease.id());
                lease.fill(pattern);
            }
            buffer
        }
        None => StreamBuffer::deferred(stream_id).with_status(BufferStatus::Error),
    }
}

fn request_error_events(request: DeviceRequest) -> Vec<SessionEvent> {
    let frame_number = request.frame_number;
    vec![
        SessionEvent::Notify(NotifyMessage::Error {
            frame_number: Some(frame_number),
            stream_id: None,
            physical_camera_id: None,
            code: ErrorCode::Request,
        }),
        SessionEvent::Result(DeviceCaptureResult {
            frame_number,
            output_buffers: request
                .output_buffers
                .into_iter()
                .map(|b| b.with_status(BufferStatus::Error))
                .collect(),
            input_buffer: request
                .input_buffer
                .map(|b| b.with_status(BufferStatus::Error)),
            ..Default::default()
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BufferPullReply, BufferRequestStatus};

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<SessionEvent>>,
    }

    impl SessionCallbacks for Recorder {
        fn deliver(&self, events: Vec<SessionEvent>) {
            self.events.lock().extend(events);
        }

        fn request_stream_buffers(&self, _requests: &[BufferRequest]) -> BufferPullReply {
            BufferPullReply::failed(BufferRequestStatus::FailedUnknown)
        }

        fn return_stream_buffers(&self, _buffers: Vec<StreamBuffer>) {}
    }

    fn open(behavior: FakeBehavior) -> (Arc<Recorder>, Arc<FakeSession>) {
        let recorder = Arc::new(Recorder::default());
        let weak = Arc::downgrade(&recorder);
        let weak: Weak<dyn SessionCallbacks> = weak;
        let camera = FakeCamera::with_behavior("fake", behavior);
        camera.open(weak).expect("open");
        (recorder, camera.session().expect("session"))
    }

    fn request(
        frame_number: FrameNumber,
        pool: &BufferPool,
        settings: Option<Settings>,
    ) -> DeviceRequest {
        DeviceRequest {
            frame_number,
            settings,
            physical_settings: Vec::new(),
            input_buffer: None,
            output_buffers: vec![StreamBuffer::filled(
                StreamId(0),
                pool.try_lease().expect("buffer"),
            )],
        }
    }

    #[test]
    fn accept_limit_returns_the_remainder() {
        let (_rec, session) = open(FakeBehavior::manual().accept_limit(1));
        let pool = BufferPool::new(8, 4);
        let outcome = session.submit_batch(vec![
            request(0, &pool, Some(Settings::new())),
            request(1, &pool, None),
        ]);
        assert_eq!(outcome.accepted, 1);
        assert_eq!(outcome.returned.len(), 1);
        assert_eq!(outcome.returned[0].frame_number, 1);
        assert_eq!(session.pending_frames(), vec![0]);
    }

    #[test]
    fn reused_settings_echo_the_last_full_set() {
        let (rec, session) = open(FakeBehavior::manual());
        let pool = BufferPool::new(8, 4);
        let settings = Settings::new().with(tags::REQUEST_ID, MetadataValue::i32(9));
        session.submit_batch(vec![request(0, &pool, Some(settings)), request(1, &pool, None)]);
        assert_eq!(session.complete_all(), 2);
        let events = rec.events.lock();
        let ids: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Result(r) => {
                    r.metadata.as_ref().and_then(|m| m.i32(tags::REQUEST_ID).ok())
                }
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec![9, 9]);
    }

    #[test]
    fn flush_errors_every_pending_frame() {
        let (rec, session) = open(FakeBehavior::manual());
        let pool = BufferPool::new(8, 4);
        session.submit_batch(vec![
            request(0, &pool, Some(Settings::new())),
            request(1, &pool, None),
        ]);
        session.flush().expect("flush");
        assert!(session.pending_frames().is_empty());
        let errors = rec
            .events
            .lock()
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    SessionEvent::Notify(NotifyMessage::Error {
                        code: ErrorCode::Request,
                        ..
                    })
                )
            })
            .count();
        assert_eq!(errors, 2);
        drop(rec);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn injected_fault_can_notify_device_error() {
        let (rec, session) = open(FakeBehavior::manual());
        let pool = BufferPool::new(8, 4);
        session.inject_submit_fault(DeviceError::Internal("boom".into()), true);
        let outcome = session.submit_batch(vec![request(0, &pool, Some(Settings::new()))]);
        assert_eq!(outcome.accepted, 0);
        assert_eq!(outcome.error, Some(DeviceError::Internal("boom".into())));
        assert!(matches!(
            rec.events.lock().as_slice(),
            [SessionEvent::Notify(NotifyMessage::Error { code: ErrorCode::Device, .. })]
        ));
    }

    #[test]
    fn offline_switch_requires_capability() {
        let (_rec, session) = open(FakeBehavior::manual());
        let err = session.switch_to_offline(&[StreamId(0)]).err().expect("unsupported");
        assert_eq!(err.code(), "unsupported");
    }

    #[test]
    fn offline_switch_reports_outstanding_buffers() {
        let caps = DeviceCapabilities {
            offline_processing: true,
            ..DeviceCapabilities::default()
        };
        let (rec, session) = open(FakeBehavior::manual().capabilities(caps));
        let pool_a = BufferPool::new(8, 4);
        let pool_b = BufferPool::new(8, 4);
        let mut mixed = request(1, &pool_a, None);
        mixed
            .output_buffers
            .push(StreamBuffer::filled(StreamId(1), pool_b.try_lease().expect("b")));
        session.submit_batch(vec![request(0, &pool_a, Some(Settings::new())), mixed]);
        let (info, _offline) = session.switch_to_offline(&[StreamId(0)]).expect("switch");
        assert_eq!(info.offline_streams[0].num_outstanding_buffers, 2);
        assert_eq!(info.offline_streams[0].circulating_buffer_ids.len(), 2);
        assert_eq!(info.offline_requests.len(), 2);
        assert_eq!(info.offline_requests[1].pending_streams, vec![StreamId(0)]);
        drop(rec);
        assert_eq!(pool_b.outstanding(), 0);
        assert_eq!(pool_a.outstanding(), 2);
    }
}
