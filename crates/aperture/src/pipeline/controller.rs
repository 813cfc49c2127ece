//! State machine tying the device session, dispatcher, reconciler and preparer together.
//!
//! Lock order: interface, configuration, controller state, then the leaf locks
//! (dispatcher request state, in-flight table, stream registry). Listener
//! callbacks only fire once the controller state lock is released; a device
//! error raised under the lock is parked in `error_notify_pending` and fired by
//! whoever releases it.
use std::{
    fmt::Write as _,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use aperture_core::prelude::*;
use aperture_device::{
    BufferPullReply, BufferRequest, CameraDevice, DeviceCapabilities, DeviceSession, FrameNumber,
    OfflineSessionInfo, OperatingMode, SessionCallbacks, SessionEvent, StreamBuffer, StreamId,
};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use tracing::{debug, error, info, warn};

use super::{
    buffer_coordinator::{self, BufferRequestCoordinator},
    dispatcher::{DispatchHost, Reconfigure, RequestDispatcher},
    error::PipelineError,
    in_flight::InFlightTable,
    listener::{ClientError, ListenerSlot, Notification, NotificationListener},
    offline::{Handoff, OfflineSession},
    preparer::StreamPreparer,
    reconciler::{ReconcileConfig, ReconcileHost, ResultQueue, ResultReconciler},
    records::BufferRecords,
    request::{CaptureRequest, CaptureResult, PendingRequest, ResultExtras, validate_shape},
    status::PipelineStatus,
    stream::{
        Stream, StreamBufferListener, StreamConfig, StreamInfo, StreamKind, StreamRegistry,
        ensure_mutable,
    },
    trigger::Trigger,
};
use crate::{metrics::PipelineMetrics, tunables::PipelineTunables};

struct ControllerState {
    status: PipelineStatus,
    error_cause: Option<PipelineError>,
    need_config: bool,
    operating_mode: OperatingMode,
    session_params: Settings,
    /// Idle/active transitions caused by an internal pause are not reported.
    pause_state_notify: bool,
    status_waiters: usize,
    /// Statuses entered while someone waits, so short-lived ones are not missed.
    recent_status: Vec<PipelineStatus>,
    input_stream: Option<StreamId>,
    output_streams: Vec<StreamId>,
    /// Deleted streams still holding buffers; dropped at the next configuration.
    deleted_streams: Vec<StreamId>,
    placeholder: Option<StreamId>,
}

impl Default for ControllerState {
    fn default() -> Self {
        Self {
            status: PipelineStatus::Uninitialized,
            error_cause: None,
            need_config: true,
            operating_mode: OperatingMode::Normal,
            session_params: Settings::new(),
            pause_state_notify: false,
            status_waiters: 0,
            recent_status: Vec::new(),
            input_stream: None,
            output_streams: Vec::new(),
            deleted_streams: Vec::new(),
            placeholder: None,
        }
    }
}

/// Everything that only exists while a device session is open.
struct SessionParts {
    device: Arc<dyn DeviceSession>,
    capabilities: DeviceCapabilities,
    tracker: Arc<StatusTracker>,
    in_flight_status: ComponentId,
    dispatcher_status: ComponentId,
    dispatcher: RequestDispatcher,
    preparer: StreamPreparer,
    coordinator: Arc<BufferRequestCoordinator>,
}

pub(crate) struct PipelineInner {
    id: String,
    tunables: PipelineTunables,
    /// Serializes public calls.
    interface: Mutex<()>,
    /// Held by client calls that may configure; the dispatcher only tries it.
    config: Mutex<()>,
    state: Mutex<ControllerState>,
    status_changed: Condvar,
    streams: StreamRegistry,
    in_flight: Mutex<InFlightTable>,
    records: BufferRecords,
    results: ResultQueue,
    reconciler: ResultReconciler,
    listener: ListenerSlot,
    metrics: PipelineMetrics,
    reconcile_config: Mutex<ReconcileConfig>,
    parts: RwLock<Option<Arc<SessionParts>>>,
    /// Orders in-flight registration against the table draining.
    tracker_lock: Mutex<()>,
    error_notify_pending: AtomicBool,
    next_stream_id: AtomicI32,
    next_serial: AtomicU64,
    this: Weak<PipelineInner>,
}

impl PipelineInner {
    pub fn new(id: &str, tunables: PipelineTunables) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id: id.to_string(),
            tunables: tunables.sanitized(),
            interface: Mutex::new(()),
            config: Mutex::new(()),
            state: Mutex::new(ControllerState::default()),
            status_changed: Condvar::new(),
            streams: StreamRegistry::default(),
            in_flight: Mutex::new(InFlightTable::default()),
            records: BufferRecords::default(),
            results: ResultQueue::default(),
            reconciler: ResultReconciler::default(),
            listener: ListenerSlot::default(),
            metrics: PipelineMetrics::default(),
            reconcile_config: Mutex::new(ReconcileConfig::default()),
            parts: RwLock::new(None),
            tracker_lock: Mutex::new(()),
            error_notify_pending: AtomicBool::new(false),
            next_stream_id: AtomicI32::new(0),
            next_serial: AtomicU64::new(0),
            this: this.clone(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_listener(&self, listener: &Arc<dyn NotificationListener>) {
        self.listener.set(listener);
    }

    pub fn status(&self) -> PipelineStatus {
        self.state.lock().status
    }

    pub fn error_cause(&self) -> Option<PipelineError> {
        self.state.lock().error_cause.clone()
    }

    pub fn metrics(&self) -> PipelineMetrics {
        self.metrics.clone()
    }

    // ---- lifecycle ----

    pub fn open(&self, camera: &dyn CameraDevice) -> Result<(), PipelineError> {
        let _interface = self.interface.lock();
        let _config = self.config.lock();
        let mut state = self.state.lock();
        if state.status != PipelineStatus::Uninitialized {
            return Err(PipelineError::InvalidState(state.status));
        }
        let callbacks: Weak<dyn SessionCallbacks> = self.this.clone();
        let device = camera.open(callbacks)?;
        let capabilities = device.capabilities();

        let weak = self.this.clone();
        let tracker = Arc::new(StatusTracker::start(&format!("aperture-{}", self.id), move |idle| {
            if let Some(inner) = weak.upgrade() {
                inner.on_tracker_status(idle);
            }
        }));
        let in_flight_status = tracker.add_component("in-flight");
        let dispatcher_status = tracker.add_component("dispatcher");
        let pull_status = tracker.add_component("buffer-pull");
        let coordinator = Arc::new(BufferRequestCoordinator::new(Some((
            tracker.clone(),
            pull_status,
        ))));
        let host: Weak<dyn DispatchHost> = self.this.clone();
        let dispatcher = RequestDispatcher::new(
            host,
            device.clone(),
            tracker.clone(),
            dispatcher_status,
            coordinator.clone(),
            &capabilities,
            self.tunables,
        );
        if let Err(err) = dispatcher.start() {
            tracker.stop();
            device.close();
            return Err(err);
        }
        let weak = self.this.clone();
        let preparer = StreamPreparer::new(move |stream| {
            if let Some(inner) = weak.upgrade() {
                inner.listener.fire_one(Notification::Prepared(stream));
            }
        });

        *self.reconcile_config.lock() = ReconcileConfig {
            partial_result_count: capabilities.partial_result_count.max(1),
            early_partials: capabilities.early_partial_results,
            hal_buffer_management: capabilities.hal_buffer_management,
            high_speed: false,
        };
        info!(
            camera = %self.id,
            device = camera.id(),
            partial_results = capabilities.partial_result_count,
            hal_buffers = capabilities.hal_buffer_management,
            "pipeline opened"
        );
        *self.parts.write() = Some(Arc::new(SessionParts {
            device,
            capabilities,
            tracker,
            in_flight_status,
            dispatcher_status,
            dispatcher,
            preparer,
            coordinator,
        }));
        let stale = self.results.clear();
        if stale > 0 {
            debug!(stale, "dropped results left from the previous session");
        }
        state.error_cause = None;
        state.need_config = true;
        state.operating_mode = OperatingMode::Normal;
        self.set_status_locked(&mut state, PipelineStatus::Unconfigured);
        Ok(())
    }

    /// Tear everything down. Safe to call more than once.
    pub fn disconnect(&self) {
        let _interface = self.interface.lock();
        let Some(parts) = self.parts() else {
            return;
        };
        info!(camera = %self.id, "disconnecting pipeline");
        parts.dispatcher.clear();
        {
            let mut state = self.state.lock();
            if matches!(state.status, PipelineStatus::Active | PipelineStatus::Error) {
                parts.dispatcher.clear_repeating();
                if let Err(err) =
                    self.wait_for_state_locked(&mut state, false, self.tunables.shutdown_timeout())
                {
                    warn!(error = %err, "pipeline did not idle before disconnect");
                }
            }
            parts.dispatcher.request_exit();
        }
        self.fire_pending_error();

        parts.dispatcher.stop();
        parts.preparer.stop(self.tunables.shutdown_timeout());
        parts.device.close();

        let drained = self.in_flight.lock().drain();
        let notes: Vec<_> = drained
            .into_iter()
            .filter(|(_, request)| request.has_callback && request.request_status.is_none())
            .map(|(frame, request)| {
                let mut extras = request.extras;
                extras.frame_number = frame;
                Notification::Error(ClientError::Request, extras)
            })
            .collect();
        if !notes.is_empty() {
            debug!(count = notes.len(), "failing frames still in flight");
            self.metrics.dropped(notes.len() as u64);
        }
        self.listener.fire(notes);
        parts.tracker.stop();

        for stream in self.streams.clear() {
            stream.disconnect();
        }
        self.records.clear();
        {
            let mut state = self.state.lock();
            let error_cause = state.error_cause.take();
            *state = ControllerState {
                error_cause,
                ..ControllerState::default()
            };
            *self.parts.write() = None;
        }
        self.status_changed.notify_all();
        info!(camera = %self.id, "pipeline disconnected");
    }

    // ---- streams ----

    pub fn create_stream(&self, config: StreamConfig) -> Result<StreamId, PipelineError> {
        let result = self.create_stream_locked(config);
        self.fire_pending_error();
        result
    }

    fn create_stream_locked(&self, config: StreamConfig) -> Result<StreamId, PipelineError> {
        let _interface = self.interface.lock();
        let _config = self.config.lock();
        let mut state = self.state.lock();
        ensure_mutable(state.status)?;
        let parts = self.require_parts()?;
        match config.kind {
            StreamKind::Input if state.input_stream.is_some() => {
                return Err(PipelineError::InvalidArgument(
                    "an input stream already exists".into(),
                ));
            }
            StreamKind::Placeholder => {
                return Err(PipelineError::InvalidArgument(
                    "placeholder streams are managed internally".into(),
                ));
            }
            _ => {}
        }

        let was_active = state.status == PipelineStatus::Active;
        if was_active {
            self.pause_and_wait_locked(&mut state, &parts)?;
        }
        let id = StreamId(self.next_stream_id.fetch_add(1, Ordering::Relaxed));
        let is_input = config.kind == StreamKind::Input;
        self.streams.insert(Arc::new(Stream::new(id, config)));
        if is_input {
            state.input_stream = Some(id);
        } else {
            state.output_streams.push(id);
        }
        state.need_config = true;
        debug!(stream_id = id.0, input = is_input, "stream created");

        if was_active {
            let mode = state.operating_mode;
            let params = state.session_params.clone();
            self.configure_locked(&mut state, &parts, mode, &params, true)?;
            self.resume_locked(&mut state, &parts);
        }
        Ok(id)
    }

    pub fn delete_stream(&self, id: StreamId) -> Result<(), PipelineError> {
        let result = self.delete_stream_locked(id);
        self.fire_pending_error();
        result
    }

    fn delete_stream_locked(&self, id: StreamId) -> Result<(), PipelineError> {
        let _interface = self.interface.lock();
        let _config = self.config.lock();
        let mut notes = Vec::new();
        let result = {
            let mut state = self.state.lock();
            ensure_mutable(state.status)?;
            let parts = self.require_parts()?;
            let is_input = state.input_stream == Some(id);
            if !is_input && !state.output_streams.contains(&id) {
                return Err(PipelineError::InvalidArgument(format!("unknown stream {id}")));
            }

            let pause =
                state.status == PipelineStatus::Active || parts.dispatcher.is_stream_pending(id);
            if pause {
                self.pause_and_wait_locked(&mut state, &parts)?;
            }
            if let Some(last) = parts.dispatcher.stop_repeating_targeting(id) {
                warn!(stream_id = id.0, "repeating request targeted a deleted stream");
                notes.push(Notification::RepeatingRequestError(last));
            }
            if is_input {
                state.input_stream = None;
            } else {
                state.output_streams.retain(|s| *s != id);
            }
            match self.streams.get(id) {
                Some(stream) if !stream.is_deletable() => {
                    debug!(
                        stream_id = id.0,
                        outstanding = stream.outstanding(),
                        "stream deletion deferred"
                    );
                    state.deleted_streams.push(id);
                }
                Some(stream) => {
                    self.streams.remove(id);
                    stream.disconnect();
                }
                None => {}
            }
            state.need_config = true;
            debug!(stream_id = id.0, "stream deleted");

            if pause {
                let mode = state.operating_mode;
                let params = state.session_params.clone();
                self.configure_locked(&mut state, &parts, mode, &params, true)
                    .map(|()| self.resume_locked(&mut state, &parts))
            } else {
                Ok(())
            }
        };
        self.listener.fire(notes);
        result
    }

    pub fn configure_streams(
        &self,
        mode: OperatingMode,
        session_params: Settings,
    ) -> Result<(), PipelineError> {
        let result = {
            let _interface = self.interface.lock();
            let _config = self.config.lock();
            let mut state = self.state.lock();
            match self.require_parts() {
                Ok(_) if state.status == PipelineStatus::Active => {
                    Err(PipelineError::InvalidState(PipelineStatus::Active))
                }
                Ok(parts) => {
                    let filtered = session_params.filtered(&parts.capabilities.session_keys);
                    if filtered != state.session_params || mode != state.operating_mode {
                        state.need_config = true;
                    }
                    self.configure_locked(&mut state, &parts, mode, &session_params, true)
                }
                Err(err) => Err(err),
            }
        };
        self.fire_pending_error();
        result
    }

    pub fn prepare(&self, max_count: Option<usize>, id: StreamId) -> Result<(), PipelineError> {
        let _interface = self.interface.lock();
        let state = self.state.lock();
        ensure_mutable(state.status)?;
        let parts = self.require_parts()?;
        if state.input_stream == Some(id) {
            return Err(PipelineError::InvalidArgument(format!(
                "input stream {id} cannot be prepared"
            )));
        }
        let stream = self.output_stream(&state, id)?;
        if stream.is_unpreparable() || stream.outstanding() > 0 {
            return Err(PipelineError::InvalidArgument(format!("{id} has already been used")));
        }
        if parts.dispatcher.is_stream_pending(id) {
            return Err(PipelineError::Busy(format!("{id} has pending requests")));
        }
        drop(state);
        parts.preparer.prepare(max_count, stream)
    }

    /// Release a stream's unused buffers; returns how many were freed.
    pub fn tear_down(&self, id: StreamId) -> Result<usize, PipelineError> {
        let _interface = self.interface.lock();
        let state = self.state.lock();
        ensure_mutable(state.status)?;
        let parts = self.require_parts()?;
        let stream = self.output_stream(&state, id)?;
        if parts.dispatcher.is_stream_pending(id) {
            return Err(PipelineError::Busy(format!("{id} has pending requests")));
        }
        stream.tear_down()
    }

    pub fn add_buffer_listener(
        &self,
        id: StreamId,
        listener: Weak<dyn StreamBufferListener>,
    ) -> Result<(), PipelineError> {
        let stream = self
            .streams
            .get(id)
            .ok_or_else(|| PipelineError::InvalidArgument(format!("unknown stream {id}")))?;
        stream.add_listener(listener);
        Ok(())
    }

    pub fn stream_info(&self, id: StreamId) -> Result<StreamInfo, PipelineError> {
        self.streams
            .get(id)
            .map(|s| s.info())
            .ok_or_else(|| PipelineError::InvalidArgument(format!("unknown stream {id}")))
    }

    // ---- requests ----

    pub fn capture(&self, requests: Vec<CaptureRequest>) -> Result<FrameNumber, PipelineError> {
        let result = self
            .submit(requests, false)
            .map(|last| last.unwrap_or_default());
        self.fire_pending_error();
        result
    }

    pub fn set_repeating(
        &self,
        requests: Vec<CaptureRequest>,
    ) -> Result<Option<FrameNumber>, PipelineError> {
        let result = self.submit(requests, true);
        self.fire_pending_error();
        result
    }

    fn submit(
        &self,
        requests: Vec<CaptureRequest>,
        repeating: bool,
    ) -> Result<Option<FrameNumber>, PipelineError> {
        if requests.is_empty() {
            return Err(PipelineError::InvalidArgument("empty request list".into()));
        }
        let request_ids = requests
            .iter()
            .map(validate_shape)
            .collect::<Result<Vec<_>, _>>()?;
        let _interface = self.interface.lock();
        let config = self.config.lock();
        let mut state = self.state.lock();
        if !state.status.accepts_requests() {
            return Err(PipelineError::InvalidState(state.status));
        }
        let parts = self.require_parts()?;

        if state.status == PipelineStatus::Unconfigured || state.need_config {
            let params = requests[0].settings().clone();
            self.configure_locked(&mut state, &parts, OperatingMode::Normal, &params, true)?;
            if state.status == PipelineStatus::Unconfigured {
                return Err(PipelineError::InvalidArgument("no streams configured".into()));
            }
        }

        let high_speed = state.operating_mode == OperatingMode::ConstrainedHighSpeed;
        let batch_size = if high_speed
            && requests[0].outputs().iter().any(|t| {
                self.streams
                    .get(t.stream_id)
                    .is_some_and(|s| s.is_video())
            }) {
            requests.len()
        } else {
            1
        };

        let mut pending = Vec::with_capacity(requests.len());
        for (burst_id, (request, request_id)) in requests.into_iter().zip(request_ids).enumerate() {
            self.validate_targets(&state, &request)?;
            let rotate_and_crop_auto = request
                .settings()
                .get(tags::SCALER_ROTATE_AND_CROP)
                .and_then(MetadataValue::as_u8)
                == Some(tags::rotate_and_crop::AUTO);
            let zoom_ratio_is_1x = match request.settings().get(tags::CONTROL_ZOOM_RATIO) {
                Some(MetadataValue::F32(v)) => v.first().is_none_or(|z| *z == 1.0),
                _ => true,
            };
            let (settings, physical, outputs, input) = request.into_parts();
            pending.push(PendingRequest {
                settings,
                physical,
                outputs,
                input,
                input_buffer: None,
                extras: ResultExtras {
                    request_id,
                    burst_id: burst_id as i32,
                    ..ResultExtras::default()
                },
                batch_size,
                repeating,
                rotate_and_crop_auto,
                zoom_ratio_is_1x,
                serial: self.next_serial.fetch_add(1, Ordering::Relaxed),
            });
        }
        debug!(count = pending.len(), repeating, batch_size, "requests accepted");

        let last = if repeating {
            parts.dispatcher.set_repeating(pending)
        } else {
            Some(parts.dispatcher.queue_requests(pending))
        };
        // The dispatcher may need the configuration lock to apply new session parameters.
        drop(config);
        if let Err(err) =
            self.wait_for_state_locked(&mut state, true, self.tunables.active_timeout())
        {
            warn!(error = %err, "pipeline not active after submission");
        }
        Ok(last)
    }

    fn validate_targets(
        &self,
        state: &ControllerState,
        request: &CaptureRequest,
    ) -> Result<(), PipelineError> {
        for target in request.outputs() {
            let id = target.stream_id;
            let stream = self.output_stream(state, id)?;
            if stream.is_abandoned() {
                return Err(PipelineError::Abandoned(id));
            }
            if stream.is_configuring() {
                return Err(PipelineError::InvalidArgument(format!("{id} is being configured")));
            }
            if stream.is_blocked_by_prepare() {
                return Err(PipelineError::InvalidArgument(format!("{id} is being prepared")));
            }
            if let Some(surface) = target.surfaces.iter().find(|s| **s >= stream.surface_count()) {
                return Err(PipelineError::InvalidArgument(format!(
                    "{id} has no surface {surface}"
                )));
            }
        }
        if let Some(input) = request.input_stream()
            && state.input_stream != Some(input)
        {
            return Err(PipelineError::InvalidArgument(format!(
                "{input} is not the configured input stream"
            )));
        }
        Ok(())
    }

    pub fn clear_repeating(&self) -> Result<Option<FrameNumber>, PipelineError> {
        let _interface = self.interface.lock();
        let state = self.state.lock();
        if state.status == PipelineStatus::Uninitialized {
            return Err(PipelineError::InvalidState(state.status));
        }
        drop(state);
        Ok(self.require_parts()?.dispatcher.clear_repeating())
    }

    /// Discard queued work and flush the device; returns the last repeating frame.
    pub fn flush(&self) -> Result<Option<FrameNumber>, PipelineError> {
        let _interface = self.interface.lock();
        let Some(parts) = self.parts() else {
            return Ok(None);
        };
        info!(camera = %self.id, "flushing pipeline");
        let last = parts.dispatcher.clear();
        parts.dispatcher.flush_device()?;
        Ok(last)
    }

    pub fn wait_until_idle(&self, timeout: Duration) -> Result<(), PipelineError> {
        let result = {
            let _interface = self.interface.lock();
            let mut state = self.state.lock();
            if matches!(
                state.status,
                PipelineStatus::Uninitialized | PipelineStatus::Unconfigured
            ) {
                return Ok(());
            }
            self.wait_for_state_locked(&mut state, false, timeout)
                .inspect_err(|err| {
                    if let Some(parts) = self.parts() {
                        error!(
                            active = ?parts.tracker.active_components(),
                            "pipeline did not go idle"
                        );
                    }
                    self.enter_error(&mut state, err.clone());
                })
        };
        self.fire_pending_error();
        result
    }

    pub fn trigger(
        &self,
        triggers: impl IntoIterator<Item = Trigger>,
    ) -> Result<(), PipelineError> {
        let state = self.state.lock();
        if !state.status.accepts_requests() {
            return Err(PipelineError::InvalidState(state.status));
        }
        drop(state);
        self.require_parts()?.dispatcher.queue_triggers(triggers);
        Ok(())
    }

    pub fn set_rotate_and_crop_auto_behavior(&self, value: u8) -> Result<(), PipelineError> {
        self.require_parts()?
            .dispatcher
            .set_rotate_and_crop_override(value)
    }

    pub fn wait_until_request_received(
        &self,
        request_id: i32,
        timeout: Duration,
    ) -> Result<(), PipelineError> {
        self.require_parts()?
            .dispatcher
            .wait_until_request_processed(request_id, timeout)
    }

    pub fn latest_request(&self) -> Option<Settings> {
        self.parts().and_then(|p| p.dispatcher.latest_request())
    }

    pub fn get_next_result(&self) -> Option<CaptureResult> {
        self.results.pop()
    }

    pub fn wait_for_next_result(&self, timeout: Duration) -> Result<CaptureResult, PipelineError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(result) = self.results.pop() {
                return Ok(result);
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() || !self.results.wait(left) {
                return self
                    .results
                    .pop()
                    .ok_or_else(|| PipelineError::Timeout("no capture result available".into()));
            }
        }
    }

    pub fn expected_in_flight_duration(&self) -> Duration {
        self.tunables
            .min_in_flight_duration()
            .max(self.in_flight.lock().expected_duration())
    }

    pub fn dump(&self) -> String {
        let mut out = String::new();
        let state = self.state.lock();
        let _ = writeln!(out, "pipeline {}: {}", self.id, state.status);
        if let Some(cause) = &state.error_cause {
            let _ = writeln!(out, "  error: {cause}");
        }
        let _ = writeln!(
            out,
            "  mode: {:?}, session keys: {}",
            state.operating_mode,
            state.session_params.len()
        );
        drop(state);
        for stream in self.streams.all() {
            let info = stream.info();
            let _ = writeln!(
                out,
                "  {}: {:?} max {} outstanding {} allocated {}",
                info.id,
                info.kind,
                info.max_buffers,
                info.outstanding_buffers,
                info.allocated_buffers
            );
        }
        let table = self.in_flight.lock();
        let _ = writeln!(
            out,
            "  in flight: {} frames, expected {:?}",
            table.len(),
            table.expected_duration()
        );
        for (frame, request) in table.iter() {
            let _ = writeln!(
                out,
                "    frame {frame}: buffers left {}, shutter {}, metadata {}",
                request.num_buffers_left, request.shutter_timestamp, request.have_result_metadata
            );
        }
        drop(table);
        if let Some(latest) = self.latest_request() {
            let _ = writeln!(out, "  latest request:");
            for (tag, value) in latest.iter() {
                let _ = writeln!(out, "    {tag} = {value:?}");
            }
        }
        let _ = writeln!(
            out,
            "  frames: submitted {} completed {} errored {} dropped {}",
            self.metrics.submitted_frames(),
            self.metrics.completed_frames(),
            self.metrics.errored_frames(),
            self.metrics.dropped_frames()
        );
        out
    }

    // ---- offline ----

    pub fn switch_to_offline(&self, keep: &[StreamId]) -> Result<OfflineSession, PipelineError> {
        let result = self.switch_to_offline_locked(keep);
        self.fire_pending_error();
        result
    }

    fn switch_to_offline_locked(&self, keep: &[StreamId]) -> Result<OfflineSession, PipelineError> {
        let _interface = self.interface.lock();
        let _config = self.config.lock();
        let parts = {
            let state = self.state.lock();
            ensure_mutable(state.status)?;
            let parts = self.require_parts()?;
            if !parts.capabilities.offline_processing {
                return Err(PipelineError::Unsupported(
                    "device cannot process requests offline".into(),
                ));
            }
            if keep.is_empty() {
                return Err(PipelineError::InvalidArgument("no streams to keep".into()));
            }
            for id in keep {
                if state.input_stream == Some(*id) {
                    return Err(PipelineError::InvalidArgument(format!(
                        "input stream {id} cannot go offline"
                    )));
                }
                if !self.output_stream(&state, *id)?.supports_offline() {
                    return Err(PipelineError::InvalidArgument(format!(
                        "{id} does not support offline processing"
                    )));
                }
            }
            parts
        };

        info!(camera = %self.id, streams = ?keep, "switching to offline processing");
        if let Err(err) = parts.dispatcher.drain_for_offline() {
            self.fail(err.clone());
            return Err(err);
        }
        let (info, device) = match parts.device.switch_to_offline(keep) {
            Ok(switched) => switched,
            Err(err) => {
                let err = PipelineError::from(err);
                error!(error = %err, "device could not switch to offline");
                self.fail(err.clone());
                return Err(err);
            }
        };
        let checked = if parts.coordinator.on_switch_to_offline_success() {
            self.verify_offline_inventory(keep, &info)
        } else {
            Err(PipelineError::ContractViolation(
                "buffer pull still running after the offline switch".into(),
            ))
        };
        if let Err(err) = checked {
            error!(error = %err, "offline hand-off rejected");
            device.close();
            self.fail(err.clone());
            return Err(err);
        }

        let session = {
            let mut state = self.state.lock();
            let kept: Vec<_> = info
                .offline_streams
                .iter()
                .filter_map(|s| self.streams.remove(s.id))
                .collect();
            let kept_ids: Vec<_> = kept.iter().map(|s| s.id()).collect();
            let moved: Vec<_> = {
                let mut table = self.in_flight.lock();
                info.offline_requests
                    .iter()
                    .filter_map(|r| table.remove(r.frame_number).map(|e| (r.frame_number, e)))
                    .collect()
            };
            let records = self.records.take(&kept_ids);
            let session = OfflineSession::new(
                &self.id,
                Handoff {
                    streams: kept,
                    records,
                    requests: moved,
                    config: *self.reconcile_config.lock(),
                    tunables: self.tunables,
                },
                device,
                self.listener.get(),
            );

            let s = &mut *state;
            let leftover: Vec<_> = s
                .input_stream
                .take()
                .into_iter()
                .chain(s.output_streams.drain(..))
                .chain(s.placeholder.take())
                .chain(s.deleted_streams.drain(..))
                .collect();
            for id in leftover {
                if let Some(stream) = self.streams.remove(id) {
                    stream.disconnect();
                }
            }
            state.need_config = true;
            state.operating_mode = OperatingMode::Normal;
            self.set_status_locked(&mut state, PipelineStatus::Unconfigured);
            parts.dispatcher.clear_previous_request();
            info!(
                streams = kept_ids.len(),
                requests = info.offline_requests.len(),
                "offline session created"
            );
            session
        };
        if self.in_flight.lock().is_empty() {
            self.on_in_flight_empty();
        }
        Ok(session)
    }

    /// Cross-check the device's offline inventory against local bookkeeping.
    fn verify_offline_inventory(
        &self,
        keep: &[StreamId],
        info: &OfflineSessionInfo,
    ) -> Result<(), PipelineError> {
        let mismatch = |what: String| {
            PipelineError::ContractViolation(format!("offline inventory mismatch: {what}"))
        };
        for stream in &info.offline_streams {
            let id = stream.id;
            if !keep.contains(&id) {
                return Err(mismatch(format!("{id} was not asked to stay")));
            }
            if !self.records.verify_buffer_ids(id, &stream.circulating_buffer_ids) {
                return Err(mismatch(format!("{id} lists unknown buffers")));
            }
            let outstanding = self.records.outstanding(id);
            if stream.num_outstanding_buffers != outstanding {
                return Err(mismatch(format!(
                    "{id} reports {} outstanding buffers, {outstanding} recorded",
                    stream.num_outstanding_buffers
                )));
            }
        }
        for stream in self.streams.all() {
            let id = stream.id();
            if !keep.contains(&id) && self.records.outstanding(id) > 0 {
                return Err(mismatch(format!("{id} still holds buffers")));
            }
        }
        let table = self.in_flight.lock();
        for request in &info.offline_requests {
            let frame = request.frame_number;
            let Some(entry) = table.get(frame) else {
                return Err(mismatch(format!("frame {frame} is not in flight")));
            };
            if entry.num_buffers_left != request.pending_streams.len() as i32 {
                return Err(mismatch(format!(
                    "frame {frame} owes {} buffers, device lists {}",
                    entry.num_buffers_left,
                    request.pending_streams.len()
                )));
            }
            if let Some(id) = request.pending_streams.iter().find(|s| !keep.contains(s)) {
                return Err(mismatch(format!("frame {frame} waits on dropped {id}")));
            }
        }
        if let Some(frame) = table
            .frames()
            .into_iter()
            .find(|f| !info.offline_requests.iter().any(|r| r.frame_number == *f))
        {
            return Err(mismatch(format!("frame {frame} was neither finished nor handed off")));
        }
        Ok(())
    }

    // ---- internals ----

    fn parts(&self) -> Option<Arc<SessionParts>> {
        self.parts.read().clone()
    }

    fn require_parts(&self) -> Result<Arc<SessionParts>, PipelineError> {
        self.parts()
            .ok_or(PipelineError::InvalidState(PipelineStatus::Uninitialized))
    }

    fn output_stream(
        &self,
        state: &ControllerState,
        id: StreamId,
    ) -> Result<Arc<Stream>, PipelineError> {
        if !state.output_streams.contains(&id) {
            return Err(PipelineError::InvalidArgument(format!("unknown output stream {id}")));
        }
        self.streams
            .get(id)
            .ok_or_else(|| PipelineError::InvalidArgument(format!("unknown output stream {id}")))
    }

    /// Returns false when the status did not change.
    fn set_status_locked(&self, state: &mut ControllerState, status: PipelineStatus) -> bool {
        if state.status == status {
            return false;
        }
        debug!(from = %state.status, to = %status, "pipeline status changed");
        state.status = status;
        if state.status_waiters > 0 {
            state.recent_status.push(status);
        }
        self.status_changed.notify_all();
        true
    }

    /// Enter `Error`; the device error callback fires once the lock is released.
    fn enter_error(&self, state: &mut ControllerState, cause: PipelineError) {
        if matches!(
            state.status,
            PipelineStatus::Error | PipelineStatus::Uninitialized
        ) {
            debug!(cause = %cause, "error while already stopped");
            return;
        }
        error!(
            camera = %self.id,
            cause = %cause,
            code = cause.code(),
            "pipeline entered the error state"
        );
        state.error_cause = Some(cause);
        if let Some(parts) = self.parts() {
            parts.dispatcher.set_paused(true);
        }
        self.set_status_locked(state, PipelineStatus::Error);
        self.error_notify_pending.store(true, Ordering::SeqCst);
    }

    fn fail(&self, cause: PipelineError) {
        {
            let mut state = self.state.lock();
            self.enter_error(&mut state, cause);
        }
        self.fire_pending_error();
    }

    fn fire_pending_error(&self) {
        if self.error_notify_pending.swap(false, Ordering::SeqCst) {
            self.listener
                .fire_one(Notification::Error(ClientError::Device, ResultExtras::default()));
        }
    }

    fn on_tracker_status(&self, idle: bool) {
        let notify = {
            let mut state = self.state.lock();
            if !matches!(
                state.status,
                PipelineStatus::Active | PipelineStatus::Configured
            ) {
                return;
            }
            let next = if idle {
                PipelineStatus::Configured
            } else {
                PipelineStatus::Active
            };
            self.set_status_locked(&mut state, next) && !state.pause_state_notify
        };
        if notify {
            self.listener
                .fire_one(if idle { Notification::Idle } else { Notification::Active });
        }
    }

    /// Wait until the pipeline is (or briefly was) active, or not active.
    fn wait_for_state_locked(
        &self,
        state: &mut MutexGuard<'_, ControllerState>,
        active: bool,
        timeout: Duration,
    ) -> Result<(), PipelineError> {
        let drain_parts = self
            .parts()
            .filter(|p| !active && p.capabilities.hal_buffer_management);
        if let Some(parts) = &drain_parts {
            if state.status == PipelineStatus::Active {
                parts.dispatcher.signal_pipeline_drain(state.output_streams.clone());
            }
            parts.coordinator.on_wait_until_idle();
        }
        let matches = |s: PipelineStatus| (s == PipelineStatus::Active) == active;
        if state.status_waiters == 0 {
            state.recent_status.clear();
        }
        let start = state.recent_status.len();
        state.status_waiters += 1;
        let deadline = Instant::now() + timeout;
        let mut seen = matches(state.status);
        while !seen {
            let timed_out = self.status_changed.wait_until(state, deadline).timed_out();
            seen = matches(state.status)
                || state
                    .recent_status
                    .get(start..)
                    .is_some_and(|history| history.iter().any(|s| matches(*s)));
            if timed_out {
                break;
            }
        }
        state.status_waiters -= 1;
        if let Some(parts) = drain_parts {
            parts.dispatcher.reset_pipeline_drain();
        }
        if seen {
            Ok(())
        } else {
            Err(PipelineError::Timeout(format!(
                "pipeline did not become {} within {timeout:?}",
                if active { "active" } else { "idle" }
            )))
        }
    }

    fn pause_budget(&self) -> Duration {
        let expected = self.in_flight.lock().expected_duration();
        self.tunables
            .min_in_flight_duration()
            .max(expected.mul_f64(1.5))
    }

    /// Pause dispatch and wait for in-flight work to finish. Timing out is fatal.
    fn pause_and_wait_locked(
        &self,
        state: &mut MutexGuard<'_, ControllerState>,
        parts: &SessionParts,
    ) -> Result<(), PipelineError> {
        parts.dispatcher.set_paused(true);
        state.pause_state_notify = true;
        let budget = self.pause_budget();
        debug!(budget_ms = budget.as_millis() as u64, "pausing dispatch");
        self.wait_for_state_locked(state, false, budget)
            .inspect_err(|err| {
                error!(active = ?parts.tracker.active_components(), "cannot idle the pipeline");
                self.enter_error(state, err.clone());
            })
    }

    fn resume_locked(&self, state: &mut MutexGuard<'_, ControllerState>, parts: &SessionParts) {
        parts.dispatcher.set_paused(false);
        if parts.dispatcher.has_pending_work()
            && let Err(err) =
                self.wait_for_state_locked(state, true, self.tunables.active_timeout())
        {
            warn!(error = %err, "pipeline did not resume");
        }
        state.pause_state_notify = false;
    }

    /// Configure the device with the current stream set when anything changed.
    fn configure_locked(
        &self,
        state: &mut ControllerState,
        parts: &SessionParts,
        mode: OperatingMode,
        session_params: &Settings,
        notify_dispatcher: bool,
    ) -> Result<(), PipelineError> {
        match state.status {
            PipelineStatus::Unconfigured | PipelineStatus::Configured => {}
            status => return Err(PipelineError::InvalidState(status)),
        }
        if state.operating_mode != mode {
            state.need_config = true;
            state.operating_mode = mode;
        }
        if !state.need_config {
            debug!("stream configuration unchanged");
            return Ok(());
        }

        if state.output_streams.is_empty() {
            if state.placeholder.is_none() {
                let id = StreamId(self.next_stream_id.fetch_add(1, Ordering::Relaxed));
                self.streams.insert(Arc::new(Stream::placeholder(id)));
                state.placeholder = Some(id);
                debug!(stream_id = id.0, "configuring placeholder stream");
            }
        } else if let Some(id) = state.placeholder.take()
            && let Some(stream) = self.streams.remove(id)
        {
            stream.disconnect();
        }

        parts.preparer.pause(self.tunables.shutdown_timeout());
        let ids: Vec<StreamId> = state
            .input_stream
            .into_iter()
            .chain(state.output_streams.iter().copied())
            .chain(state.placeholder)
            .collect();
        let streams: Vec<_> = ids.iter().filter_map(|id| self.streams.get(*id)).collect();
        let cancel = |streams: &[Arc<Stream>]| {
            for stream in streams {
                stream.cancel_configuration();
            }
        };
        for stream in &streams {
            if let Err(err) = stream.start_configuration() {
                cancel(&streams);
                self.resume_preparer(parts);
                return Err(err);
            }
        }

        let filtered = session_params.filtered(&parts.capabilities.session_keys);
        let descriptors: Vec<_> = streams.iter().map(|s| s.descriptor()).collect();
        info!(streams = descriptors.len(), mode = ?mode, "configuring streams");
        let configured = match parts.device.configure_streams(&filtered, &descriptors, mode) {
            Ok(configured) => configured,
            Err(err) => {
                cancel(&streams);
                let err = PipelineError::from(err);
                if matches!(err, PipelineError::ConfigurationRejected(_)) {
                    warn!(error = %err, "device rejected the stream configuration");
                    state.need_config = true;
                    self.set_status_locked(state, PipelineStatus::Unconfigured);
                    self.resume_preparer(parts);
                } else {
                    self.enter_error(state, err.clone());
                }
                return Err(err);
            }
        };

        for stream in &streams {
            let id = stream.id();
            let outcome = match configured.iter().find(|c| c.id == id) {
                Some(c) => stream.finish_configuration(c),
                None => Err(PipelineError::DeviceFault(format!("device did not configure {id}"))),
            };
            if let Err(err) = outcome {
                error!(stream_id = id.0, error = %err, "cannot finish configuring stream");
                cancel(&streams);
                state.need_config = true;
                if matches!(err, PipelineError::DeviceFault(_)) {
                    self.enter_error(state, err.clone());
                } else {
                    self.set_status_locked(state, PipelineStatus::Unconfigured);
                    self.resume_preparer(parts);
                }
                return Err(err);
            }
        }

        self.records.remove_inactive_caches(&ids);
        for id in std::mem::take(&mut state.deleted_streams) {
            if let Some(stream) = self.streams.remove(id) {
                stream.disconnect();
            }
        }
        let high_speed = mode == OperatingMode::ConstrainedHighSpeed;
        self.reconcile_config.lock().high_speed = high_speed;
        if notify_dispatcher {
            parts.dispatcher.configuration_complete(high_speed, filtered.clone());
        }
        parts.coordinator.on_streams_configured();
        self.resume_preparer(parts);

        state.session_params = filtered;
        state.need_config = false;
        let status = if state.placeholder.is_some() {
            PipelineStatus::Unconfigured
        } else {
            PipelineStatus::Configured
        };
        self.set_status_locked(state, status);
        info!(status = %status, "streams configured");
        Ok(())
    }

    fn resume_preparer(&self, parts: &SessionParts) {
        if let Err(err) = parts.preparer.resume() {
            warn!(error = %err, "stream preparer did not resume");
        }
    }

    #[cfg(test)]
    pub(crate) fn abandon_stream(&self, id: StreamId) {
        if let Some(stream) = self.streams.get(id) {
            stream.abandon();
        }
    }

    #[cfg(test)]
    pub(crate) fn in_flight_frames(&self) -> Vec<FrameNumber> {
        self.in_flight.lock().frames()
    }
}

impl ReconcileHost for PipelineInner {
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
        self.tunables
    }

    fn reconcile_config(&self) -> ReconcileConfig {
        *self.reconcile_config.lock()
    }

    fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    fn set_error(&self, cause: PipelineError) {
        self.fail(cause);
    }

    fn on_in_flight_empty(&self) {
        let Some(parts) = self.parts() else {
            return;
        };
        let _guard = self.tracker_lock.lock();
        if self.in_flight.lock().is_empty() {
            parts.coordinator.on_in_flight_map_empty();
            parts.tracker.mark_idle(parts.in_flight_status);
        }
    }

    fn start_pull(&self) -> bool {
        self.parts().is_some_and(|p| p.coordinator.start_pull())
    }

    fn end_pull(&self) {
        if let Some(parts) = self.parts() {
            parts.coordinator.end_pull();
        }
    }

    fn buffer_wait(&self) -> Duration {
        self.tunables.base_buffer_wait() + self.in_flight.lock().expected_duration()
    }
}

impl DispatchHost for PipelineInner {
    fn reconfigure(&self, session_params: &Settings) -> Reconfigure {
        let Some(_config) = self.config.try_lock_for(self.tunables.request_timeout()) else {
            return Reconfigure::Busy;
        };
        let Some(parts) = self.parts() else {
            return Reconfigure::NotApplied;
        };
        let outcome = {
            let mut state = self.state.lock();
            self.reconfigure_locked(&mut state, &parts, session_params)
        };
        self.fire_pending_error();
        outcome
    }

    fn on_in_flight_registered(&self) {
        let Some(parts) = self.parts() else {
            return;
        };
        let _guard = self.tracker_lock.lock();
        if !self.in_flight.lock().is_empty() {
            parts.tracker.mark_active(parts.in_flight_status);
        }
    }
}

impl PipelineInner {
    fn reconfigure_locked(
        &self,
        state: &mut MutexGuard<'_, ControllerState>,
        parts: &SessionParts,
        session_params: &Settings,
    ) -> Reconfigure {
        let was_active = match state.status {
            PipelineStatus::Active => true,
            PipelineStatus::Configured => false,
            _ => return Reconfigure::NotApplied,
        };
        if state
            .output_streams
            .iter()
            .filter_map(|id| self.streams.get(*id))
            .any(|s| s.is_abandoned())
        {
            warn!("skipping reconfiguration with an abandoned stream");
            return Reconfigure::NotApplied;
        }
        if was_active {
            state.pause_state_notify = true;
            parts.tracker.mark_idle(parts.dispatcher_status);
            if self.pause_and_wait_locked(state, parts).is_err() {
                return Reconfigure::Failed;
            }
        }
        state.need_config = true;
        let mode = state.operating_mode;
        let outcome = match self.configure_locked(state, parts, mode, session_params, false) {
            Ok(()) => {
                if was_active {
                    state.pause_state_notify = false;
                    self.set_status_locked(state, PipelineStatus::Active);
                }
                info!("reconfigured for new session parameters");
                Reconfigure::Applied
            }
            Err(PipelineError::Abandoned(id)) => {
                warn!(stream_id = id.0, "reconfiguration hit an abandoned stream");
                Reconfigure::NotApplied
            }
            Err(err) => {
                self.enter_error(state, err);
                Reconfigure::Failed
            }
        };
        if was_active {
            parts.tracker.mark_active(parts.dispatcher_status);
        }
        outcome
    }
}

impl SessionCallbacks for PipelineInner {
    fn deliver(&self, events: Vec<SessionEvent>) {
        self.reconciler.deliver(self, events);
    }

    fn request_stream_buffers(&self, requests: &[BufferRequest]) -> BufferPullReply {
        buffer_coordinator::request_stream_buffers(self, requests)
    }

    fn return_stream_buffers(&self, buffers: Vec<StreamBuffer>) {
        buffer_coordinator::return_stream_buffers(self, buffers);
    }
}
