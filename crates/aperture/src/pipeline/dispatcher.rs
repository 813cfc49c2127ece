//! Worker that turns queued client requests into device submissions.
//!
//! The dispatcher owns frame numbering, trigger mixing and per-request buffer
//! acquisition. It never takes the pipeline's interface lock: session parameter
//! changes are handed back to the controller through [`DispatchHost::reconfigure`],
//! which declines while a client call holds the configuration.
//!
//! Lock order inside the dispatcher is request state, then triggers.
use std::{
    collections::{BTreeSet, VecDeque},
    sync::{Arc, Weak},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use aperture_core::prelude::*;
use aperture_device::{
    BufferStatus, DeviceCapabilities, DeviceRequest, DeviceSession, FrameNumber, StreamBuffer,
    StreamId,
};
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, trace, warn};

use super::{
    buffer_coordinator::BufferRequestCoordinator,
    error::PipelineError,
    in_flight::InFlightRequest,
    listener::{ClientError, Notification},
    reconciler::ReconcileHost,
    request::{PendingRequest, expected_duration},
    stream::{PrepareStart, Stream},
    trigger::{Trigger, TriggerIds, TriggerMap, add_placeholder_trigger_ids},
};
use crate::tunables::PipelineTunables;

const ZSL_ENABLED: u8 = 1;

/// Outcome of a reconfiguration requested by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reconfigure {
    /// The device now runs with the new session parameters.
    Applied,
    /// The old configuration stays.
    NotApplied,
    /// A client call holds the configuration; retry with a later request.
    Busy,
    /// The pipeline entered the error state; dispatch stays paused.
    Failed,
}

/// Controller services the dispatcher calls back into.
pub(crate) trait DispatchHost: ReconcileHost {
    /// Reconfigure with `session_params`. Runs on the dispatcher thread.
    fn reconfigure(&self, session_params: &Settings) -> Reconfigure;
    /// The in-flight table went from empty to non-empty.
    fn on_in_flight_registered(&self);
}

struct RequestState {
    queue: VecDeque<PendingRequest>,
    repeating: Vec<PendingRequest>,
    frame_number: FrameNumber,
    repeating_last_frame: Option<FrameNumber>,
    reconfigured: bool,
    prepare_video_stream: bool,
    constrained_mode: bool,
    session_params: Settings,
    do_pause: bool,
    paused: bool,
    exit: bool,
    /// Streams targeted by the batch being prepared; `None` when nothing is in hand.
    in_hand: Option<Vec<StreamId>>,
    prev_serial: Option<u64>,
    prev_rotate: Option<u8>,
    prev_triggers: usize,
    pending_drain: Option<Vec<StreamId>>,
}

impl Default for RequestState {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            repeating: Vec::new(),
            frame_number: 0,
            repeating_last_frame: None,
            reconfigured: false,
            prepare_video_stream: false,
            constrained_mode: false,
            session_params: Settings::new(),
            do_pause: false,
            paused: true,
            exit: false,
            in_hand: None,
            prev_serial: None,
            prev_rotate: None,
            prev_triggers: 0,
            pending_drain: None,
        }
    }
}

struct TriggerState {
    map: TriggerMap,
    ids: TriggerIds,
    rotate_override: u8,
}

/// A request taken off the queue, on its way to the device.
struct NextRequest {
    request: PendingRequest,
    /// Request settings with triggers and overrides applied.
    mixed: Settings,
    send_settings: bool,
    outputs: Vec<StreamBuffer>,
    physical_cameras: BTreeSet<String>,
    /// Buffer identities first cached for this request.
    new_ids: Vec<(StreamId, BufferId)>,
}

impl NextRequest {
    fn new(request: PendingRequest) -> Self {
        Self {
            mixed: Settings::new(),
            send_settings: false,
            outputs: Vec::with_capacity(request.outputs.len()),
            physical_cameras: BTreeSet::new(),
            new_ids: Vec::new(),
            request,
        }
    }
}

enum PrepareFailure {
    /// The batch is dropped with request errors; the pipeline carries on.
    Skipped(PipelineError),
    Fatal(PipelineError),
}

struct DispatchShared {
    host: Weak<dyn DispatchHost>,
    device: Arc<dyn DeviceSession>,
    tracker: Arc<StatusTracker>,
    status_id: ComponentId,
    coordinator: Arc<BufferRequestCoordinator>,
    hal_buffer_management: bool,
    session_keys: Vec<Tag>,
    tunables: PipelineTunables,
    request: Mutex<RequestState>,
    request_signal: Condvar,
    pause_signal: Condvar,
    submitted_signal: Condvar,
    triggers: Mutex<TriggerState>,
    latest_id: Mutex<Option<i32>>,
    latest_signal: Condvar,
    latest_tx: NewestTx<Settings>,
    latest_rx: NewestRx<Settings>,
    /// Serializes device flushes with multi-request submissions.
    flush_lock: Mutex<()>,
}

/// Request queue plus the worker thread draining it into the device.
pub(crate) struct RequestDispatcher {
    shared: Arc<DispatchShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RequestDispatcher {
    pub fn new(
        host: Weak<dyn DispatchHost>,
        device: Arc<dyn DeviceSession>,
        tracker: Arc<StatusTracker>,
        status_id: ComponentId,
        coordinator: Arc<BufferRequestCoordinator>,
        capabilities: &DeviceCapabilities,
        tunables: PipelineTunables,
    ) -> Self {
        let (latest_tx, latest_rx) = newest();
        Self {
            shared: Arc::new(DispatchShared {
                host,
                device,
                tracker,
                status_id,
                coordinator,
                hal_buffer_management: capabilities.hal_buffer_management,
                session_keys: capabilities.session_keys.clone(),
                tunables,
                request: Mutex::new(RequestState::default()),
                request_signal: Condvar::new(),
                pause_signal: Condvar::new(),
                submitted_signal: Condvar::new(),
                triggers: Mutex::new(TriggerState {
                    map: TriggerMap::default(),
                    ids: TriggerIds::default(),
                    rotate_override: tags::rotate_and_crop::NONE,
                }),
                latest_id: Mutex::new(None),
                latest_signal: Condvar::new(),
                latest_tx,
                latest_rx,
                flush_lock: Mutex::new(()),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn start(&self) -> Result<(), PipelineError> {
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("aperture-dispatch".into())
            .spawn(move || shared.run())
            .map_err(|err| {
                error!(error = %err, "failed to spawn request dispatcher");
                PipelineError::DeviceFault(format!("cannot start request dispatcher: {err}"))
            })?;
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    /// Ask the worker to exit at its next loop.
    pub fn request_exit(&self) {
        let mut state = self.shared.request.lock();
        state.exit = true;
        self.shared.request_signal.notify_all();
        self.shared.pause_signal.notify_all();
        self.shared.submitted_signal.notify_all();
    }

    /// Exit and join the worker, unless called from the worker itself.
    pub fn stop(&self) {
        self.request_exit();
        if let Some(handle) = self.worker.lock().take()
            && handle.thread().id() != thread::current().id()
        {
            let _ = handle.join();
        }
    }

    pub fn configuration_complete(&self, high_speed: bool, session_params: Settings) {
        let mut state = self.shared.request.lock();
        state.reconfigured = true;
        state.prepare_video_stream = high_speed;
        state.constrained_mode = high_speed;
        state.session_params = session_params;
    }

    /// Append requests; returns the frame number the last of them will get.
    pub fn queue_requests(&self, requests: Vec<PendingRequest>) -> FrameNumber {
        let mut state = self.shared.request.lock();
        state.queue.extend(requests);
        let last = (state.frame_number + state.queue.len() as u64).saturating_sub(1);
        self.shared.unpause_for_new_requests(&mut state);
        last
    }

    pub fn queue_triggers(&self, triggers: impl IntoIterator<Item = Trigger>) {
        self.shared.triggers.lock().map.queue(triggers);
    }

    /// Replace the repeating set; returns the last frame of the previous one.
    pub fn set_repeating(&self, requests: Vec<PendingRequest>) -> Option<FrameNumber> {
        let mut state = self.shared.request.lock();
        let previous = state.repeating_last_frame.take();
        state.repeating = requests;
        self.shared.unpause_for_new_requests(&mut state);
        previous
    }

    pub fn clear_repeating(&self) -> Option<FrameNumber> {
        let mut state = self.shared.request.lock();
        state.repeating.clear();
        state.repeating_last_frame.take()
    }

    /// Drop the repeating set if it targets `stream_id`; yields its last frame when dropped.
    pub fn stop_repeating_targeting(&self, stream_id: StreamId) -> Option<Option<FrameNumber>> {
        let mut state = self.shared.request.lock();
        if !state.repeating.iter().any(|r| r.targets(stream_id)) {
            return None;
        }
        state.repeating.clear();
        Some(state.repeating_last_frame.take())
    }

    /// Fail every queued request and forget the repeating set and queued triggers.
    ///
    /// Each failed request is reported with the frame number it would have had.
    /// Returns the last frame of the repeating set.
    pub fn clear(&self) -> Option<FrameNumber> {
        let (notes, last) = {
            let mut state = self.shared.request.lock();
            state.repeating.clear();
            let queued: Vec<_> = state.queue.drain(..).collect();
            let mut notes = Vec::with_capacity(queued.len());
            for mut request in queued {
                request.extras.frame_number = state.frame_number;
                state.frame_number += 1;
                notes.push(Notification::Error(ClientError::Request, request.extras));
            }
            self.shared.triggers.lock().map.clear();
            let last = state.repeating_last_frame.take();
            self.shared.request_signal.notify_all();
            (notes, last)
        };
        if !notes.is_empty() {
            debug!(count = notes.len(), "cleared queued requests");
        }
        if let Some(host) = self.shared.host.upgrade() {
            host.metrics().dropped(notes.len() as u64);
            host.listener().fire(notes);
        }
        last
    }

    pub fn set_paused(&self, paused: bool) {
        self.shared.set_paused(paused);
    }

    /// Queued, repeating or in-hand work remains.
    pub fn has_pending_work(&self) -> bool {
        let state = self.shared.request.lock();
        !state.queue.is_empty() || !state.repeating.is_empty() || state.in_hand.is_some()
    }

    /// Block until the request with `request_id` has been handed to the device.
    pub fn wait_until_request_processed(
        &self,
        request_id: i32,
        timeout: Duration,
    ) -> Result<(), PipelineError> {
        let deadline = Instant::now() + timeout;
        let mut latest = self.shared.latest_id.lock();
        while *latest != Some(request_id) {
            if self
                .shared
                .latest_signal
                .wait_until(&mut latest, deadline)
                .timed_out()
                && *latest != Some(request_id)
            {
                return Err(PipelineError::Timeout(format!(
                    "request {request_id} was not submitted in time"
                )));
            }
        }
        Ok(())
    }

    /// Settings of the most recent request the device accepted.
    pub fn latest_request(&self) -> Option<Settings> {
        self.shared.latest_rx.latest()
    }

    pub fn is_stream_pending(&self, stream_id: StreamId) -> bool {
        let state = self.shared.request.lock();
        state
            .in_hand
            .as_ref()
            .is_some_and(|streams| streams.contains(&stream_id))
            || state.queue.iter().any(|r| r.targets(stream_id))
            || state.repeating.iter().any(|r| r.targets(stream_id))
    }

    /// Tell the device no more buffers will be needed for `streams`, now if
    /// paused or as soon as the worker pauses.
    pub fn signal_pipeline_drain(&self, streams: Vec<StreamId>) {
        if !self.shared.hal_buffer_management {
            error!("pipeline drain hint without device-side buffer management");
            return;
        }
        let mut state = self.shared.request.lock();
        if state.paused {
            self.shared.device.signal_pipeline_drain(&streams);
            return;
        }
        state.pending_drain = Some(streams);
    }

    pub fn reset_pipeline_drain(&self) {
        self.shared.request.lock().pending_drain = None;
    }

    /// Force full settings on the next submission.
    pub fn clear_previous_request(&self) {
        self.shared.request.lock().prev_serial = None;
    }

    /// Value substituted for `AUTO` rotate-and-crop in requests that ask for it.
    pub fn set_rotate_and_crop_override(&self, value: u8) -> Result<(), PipelineError> {
        if value > tags::rotate_and_crop::ROTATE_270 {
            return Err(PipelineError::InvalidArgument(format!(
                "rotate-and-crop override {value} must be a concrete rotation"
            )));
        }
        self.shared.triggers.lock().rotate_override = value;
        Ok(())
    }

    /// Stop repeating and wait until every queued request reached the device.
    pub fn drain_for_offline(&self) -> Result<(), PipelineError> {
        let wait = self.shared.tunables.submit_drain_wait();
        let mut state = self.shared.request.lock();
        state.repeating.clear();
        state.repeating_last_frame = None;
        while state.in_hand.is_some() || !state.queue.is_empty() {
            if self
                .shared
                .submitted_signal
                .wait_for(&mut state, wait)
                .timed_out()
                && (state.in_hand.is_some() || !state.queue.is_empty())
            {
                error!(
                    wait_ms = wait.as_millis() as u64,
                    "no request submitted within the drain wait"
                );
                return Err(PipelineError::Timeout(
                    "queued requests were not submitted in time".into(),
                ));
            }
        }
        Ok(())
    }

    /// Flush the device; waits out a multi-request submission in progress.
    pub fn flush_device(&self) -> Result<(), PipelineError> {
        let _guard = self.shared.flush_lock.lock();
        self.shared.device.flush().map_err(PipelineError::from)
    }
}

impl Drop for RequestDispatcher {
    fn drop(&mut self) {
        self.request_exit();
    }
}

impl DispatchShared {
    fn run(self: Arc<Self>) {
        debug!("request dispatcher started");
        loop {
            if self.request.lock().exit {
                break;
            }
            let Some(host) = self.host.upgrade() else {
                break;
            };
            if !self.thread_loop(host.as_ref()) {
                warn!("request dispatcher stopping after a fatal error");
                break;
            }
        }
        self.tracker.mark_idle(self.status_id);
        debug!("request dispatcher exited");
    }

    /// One dispatch round; false ends the worker.
    fn thread_loop(&self, host: &dyn DispatchHost) -> bool {
        if self.wait_if_paused() {
            return true;
        }
        let Some(mut batch) = self.next_batch(host) else {
            return true;
        };

        let latest_id = batch
            .last()
            .and_then(|next| next.request.settings.i32(tags::REQUEST_ID).ok());
        if latest_id.is_none() {
            warn!("request carries no request id");
        }

        if let Some(updated) = self.session_params_update(&batch[0].request.settings) {
            self.apply_session_params(host, updated);
        }

        match self.prepare_batch(host, &mut batch) {
            Ok(()) => {}
            Err(PrepareFailure::Skipped(err)) => {
                debug!(error = %err, "skipping request batch");
                self.cleanup_failed(host, batch, true);
                self.check_and_stop_repeating(host);
                return true;
            }
            Err(PrepareFailure::Fatal(err)) => {
                error!(error = %err, "cannot prepare request batch");
                host.set_error(err);
                self.cleanup_failed(host, batch, false);
                return false;
            }
        }

        {
            let mut latest = self.latest_id.lock();
            *latest = latest_id;
            self.latest_signal.notify_all();
        }

        let submitted = {
            let _flush = (batch.len() > 1).then(|| self.flush_lock.lock());
            self.coordinator.on_submitting_request();
            self.send_batch(host, batch)
        };
        self.finish_batch();
        submitted
    }

    fn set_paused(&self, paused: bool) {
        let mut state = self.request.lock();
        state.do_pause = paused;
        self.pause_signal.notify_all();
    }

    /// Park while a pause is requested; true if the round should start over.
    fn wait_if_paused(&self) -> bool {
        let mut state = self.request.lock();
        if !state.do_pause {
            return false;
        }
        if !state.paused {
            self.enter_paused(&mut state);
        }
        let _ = self
            .pause_signal
            .wait_for(&mut state, self.tunables.request_timeout());
        true
    }

    fn enter_paused(&self, state: &mut RequestState) {
        state.paused = true;
        if let Some(streams) = state.pending_drain.take() {
            self.device.signal_pipeline_drain(&streams);
        }
        self.tracker.mark_idle(self.status_id);
        self.coordinator.on_request_thread_paused();
        trace!("request dispatcher idle");
    }

    fn unpause_for_new_requests(&self, state: &mut RequestState) {
        self.request_signal.notify_all();
        if !state.do_pause {
            if state.paused {
                self.tracker.mark_active(self.status_id);
            }
            state.paused = false;
        }
    }

    fn next_batch(&self, host: &dyn DispatchHost) -> Option<Vec<NextRequest>> {
        let Some(first) = self.next_request(host) else {
            self.finish_batch();
            return None;
        };
        let batch_size = first.batch_size.max(1);
        let mut batch = Vec::with_capacity(batch_size);
        batch.push(NextRequest::new(first));
        while batch.len() < batch_size {
            match self.next_request(host) {
                Some(request) => batch.push(NextRequest::new(request)),
                None => {
                    warn!(expected = batch_size, got = batch.len(), "high-speed batch incomplete");
                    self.cleanup_failed(host, batch, true);
                    return None;
                }
            }
        }
        Some(batch)
    }

    /// Next request with its frame number assigned, or `None` after idling on an empty queue.
    fn next_request(&self, host: &dyn DispatchHost) -> Option<PendingRequest> {
        let (mut request, queue_emptied) = {
            let mut state = self.request.lock();
            let (mut request, emptied) = self.take_request_locked(&mut state)?;
            if state.paused {
                self.tracker.mark_active(self.status_id);
            }
            state.paused = false;
            if std::mem::take(&mut state.reconfigured) {
                state.prev_serial = None;
            }
            request.extras.frame_number = state.frame_number;
            state.frame_number += 1;
            state
                .in_hand
                .get_or_insert_with(Vec::new)
                .extend(request.outputs.iter().map(|o| o.stream_id).chain(request.input));
            (request, emptied)
        };
        if queue_emptied {
            host.listener().fire_one(Notification::RequestQueueEmpty);
        }

        if let Some(input) = request.input {
            let lease = host
                .stream(input)
                .ok_or_else(|| PipelineError::InvalidArgument(format!("{input} is not configured")))
                .and_then(|stream| stream.get_buffer(host.buffer_wait()));
            match lease {
                Ok(lease) => request.input_buffer = Some(StreamBuffer::filled(input, lease)),
                Err(err) => {
                    warn!(
                        frame = request.extras.frame_number,
                        error = %err,
                        "no input buffer for reprocess request"
                    );
                    host.metrics().dropped(1);
                    host.listener()
                        .fire_one(Notification::Error(ClientError::Request, request.extras));
                    return None;
                }
            }
        }
        Some(request)
    }

    fn take_request_locked(
        &self,
        state: &mut MutexGuard<'_, RequestState>,
    ) -> Option<(PendingRequest, bool)> {
        loop {
            if state.queue.is_empty() && !state.repeating.is_empty() {
                let mut copies: VecDeque<PendingRequest> =
                    state.repeating.iter().map(PendingRequest::duplicate).collect();
                let first = copies.pop_front()?;
                state.repeating_last_frame = Some(state.frame_number + copies.len() as u64);
                state.queue.extend(copies);
                return Some((first, false));
            }
            if let Some(request) = state.queue.pop_front() {
                let emptied = state.queue.is_empty() && !request.repeating;
                return Some((request, emptied));
            }
            if state.exit {
                return None;
            }
            let _ = self
                .request_signal
                .wait_for(state, self.tunables.request_timeout());
            if (state.queue.is_empty() && state.repeating.is_empty()) || state.exit {
                if !state.paused {
                    self.enter_paused(state);
                }
                return None;
            }
        }
    }

    /// Session parameters implied by `settings`, if any session key changed.
    fn session_params_update(&self, settings: &Settings) -> Option<Settings> {
        if self.session_keys.is_empty() {
            return None;
        }
        let state = self.request.lock();
        let current = &state.session_params;
        let mut updated = current.clone();
        let mut changed = false;
        for &tag in &self.session_keys {
            match (settings.get(tag), current.get(tag)) {
                (Some(new), old) if old != Some(new) => {
                    if !(state.constrained_mode && same_max_fps(tag, new, old)) {
                        changed = true;
                    }
                    updated.set(tag, new.clone());
                }
                (None, Some(_)) => {
                    updated.remove(tag);
                    changed = true;
                }
                _ => {}
            }
        }
        changed.then_some(updated)
    }

    fn apply_session_params(&self, host: &dyn DispatchHost, updated: Settings) {
        let current = self.request.lock().session_params.clone();
        let required = self
            .device
            .is_reconfiguration_required(&current, &updated)
            .unwrap_or_else(|err| {
                warn!(error = %err, "reconfiguration query failed; assuming it is required");
                true
            });
        if !required {
            self.request.lock().session_params = updated;
            return;
        }
        debug!(
            keys = ?updated.changed_keys(&current, &self.session_keys),
            "session parameters changed"
        );
        let outcome = host.reconfigure(&updated);
        match outcome {
            Reconfigure::Busy => {
                debug!("reconfiguration deferred while the pipeline is being configured");
                return;
            }
            Reconfigure::Failed => return,
            Reconfigure::Applied | Reconfigure::NotApplied => {}
        }
        {
            let mut state = self.request.lock();
            state.session_params = updated;
            if outcome == Reconfigure::Applied {
                state.reconfigured = false;
                state.prev_serial = None;
            }
        }
        self.set_paused(false);
    }

    fn prepare_batch(
        &self,
        host: &dyn DispatchHost,
        batch: &mut [NextRequest],
    ) -> Result<(), PrepareFailure> {
        let batched = batch.len() > 1;
        let last = batch.len().saturating_sub(1);
        for (i, next) in batch.iter_mut().enumerate() {
            self.mix_settings(next, batched && i > 0);
            self.acquire_outputs(host, next)?;
            self.register(host, next, !batched || i == last);
        }
        Ok(())
    }

    /// Apply queued triggers and overrides; decide whether full settings are sent.
    fn mix_settings(&self, next: &mut NextRequest, batch_follower: bool) {
        let mut settings = next.request.settings.clone();
        let mut state = self.request.lock();
        let (count, rotate) = {
            let mut guard = self.triggers.lock();
            let triggers = &mut *guard;
            let count = triggers.map.mix_into(&mut settings, &mut triggers.ids);
            triggers.ids.stamp(&mut next.request.extras);
            let rotate = next
                .request
                .rotate_and_crop_auto
                .then_some(triggers.rotate_override);
            (count, rotate)
        };
        let mixed = count > 0 || state.prev_triggers > 0;
        state.prev_triggers = count;

        let mut rotate_changed = false;
        if let Some(value) = rotate {
            settings.set(tags::SCALER_ROTATE_AND_CROP, MetadataValue::u8(value));
            rotate_changed = state.prev_rotate != Some(value);
            state.prev_rotate = Some(value);
        }

        let fresh = state.prev_serial != Some(next.request.serial) || mixed || rotate_changed;
        if fresh && !batch_follower {
            add_placeholder_trigger_ids(&mut settings);
            state.prev_serial = Some(next.request.serial);
            next.send_settings = true;
        }
        next.mixed = settings;
    }

    fn acquire_outputs(
        &self,
        host: &dyn DispatchHost,
        next: &mut NextRequest,
    ) -> Result<(), PrepareFailure> {
        let frame = next.request.extras.frame_number;
        let wait = host.buffer_wait();
        let targets: Vec<StreamId> = next.request.outputs.iter().map(|o| o.stream_id).collect();
        for stream_id in targets {
            let Some(stream) = host.stream(stream_id) else {
                return Err(PrepareFailure::Skipped(PipelineError::InvalidArgument(
                    format!("{stream_id} is no longer configured"),
                )));
            };
            if stream.is_video() && self.take_video_prepare() {
                prepare_now(&stream);
            }
            let buffer = if self.hal_buffer_management {
                if stream.is_abandoned() {
                    return Err(PrepareFailure::Skipped(PipelineError::Abandoned(stream_id)));
                }
                stream.mark_unpreparable();
                StreamBuffer::deferred(stream_id)
            } else {
                let lease = stream.get_buffer(wait).map_err(PrepareFailure::Skipped)?;
                StreamBuffer::filled(stream_id, lease)
            };
            stream.notify_acquired(frame, buffer.buffer_id());
            next.outputs.push(buffer);

            if let Some(camera) = stream.physical_camera_id() {
                if next.request.input_buffer.is_some() {
                    return Err(PrepareFailure::Fatal(PipelineError::InvalidArgument(format!(
                        "physical camera {stream_id} cannot take part in a reprocess request"
                    ))));
                }
                next.physical_cameras.insert(camera.to_string());
            }
        }
        Ok(())
    }

    fn take_video_prepare(&self) -> bool {
        std::mem::take(&mut self.request.lock().prepare_video_stream)
    }

    fn register(&self, host: &dyn DispatchHost, next: &mut NextRequest, has_callback: bool) {
        let request = &next.request;
        let frame = request.extras.frame_number;
        let still = next
            .mixed
            .get(tags::CONTROL_CAPTURE_INTENT)
            .and_then(MetadataValue::as_u8)
            == Some(tags::capture_intent::STILL_CAPTURE);
        let zsl = next
            .mixed
            .get(tags::CONTROL_ENABLE_ZSL)
            .and_then(MetadataValue::as_u8)
            == Some(ZSL_ENABLED);

        let mut entry = InFlightRequest::new(
            request.extras.clone(),
            next.outputs.iter().map(|b| b.stream_id).collect(),
            request.input_buffer.is_some(),
        );
        entry.has_callback = has_callback;
        entry.max_expected_duration =
            expected_duration(&next.mixed, self.tunables.default_expected_duration());
        entry.still_capture = still;
        entry.zsl_capture = zsl;
        entry.rotate_and_crop_auto = request.rotate_and_crop_auto;
        entry.physical_camera_ids = std::mem::take(&mut next.physical_cameras);

        let was_empty = host.in_flight().lock().insert(frame, entry);
        if was_empty {
            host.on_in_flight_registered();
        }
    }

    fn send_batch(&self, host: &dyn DispatchHost, batch: Vec<NextRequest>) -> bool {
        let records = host.records();
        let mut pending = Vec::with_capacity(batch.len());
        let mut requests = Vec::with_capacity(batch.len());
        for mut next in batch {
            let frame = next.request.extras.frame_number;
            for buffer in next.outputs.iter().chain(next.request.input_buffer.iter()) {
                if let Some(id) = buffer.buffer_id() {
                    if records.cache(buffer.stream_id, id) {
                        next.new_ids.push((buffer.stream_id, id));
                    }
                    records.push_in_flight(frame, buffer.stream_id, id);
                }
            }
            requests.push(DeviceRequest {
                frame_number: frame,
                settings: next.send_settings.then(|| next.mixed.clone()),
                physical_settings: next.request.physical.clone(),
                input_buffer: next.request.input_buffer.take(),
                output_buffers: std::mem::take(&mut next.outputs),
            });
            pending.push(next);
        }

        let started = Instant::now();
        let outcome = self.device.submit_batch(requests);
        host.metrics().submission.record(started.elapsed());

        let accepted = outcome.accepted.min(pending.len());
        for next in &pending[..accepted] {
            self.latest_tx.send(next.mixed.clone());
        }
        host.metrics().submitted(accepted as u64);
        trace!(accepted, total = pending.len(), "submitted request batch");
        if accepted == pending.len() && outcome.error.is_none() {
            return true;
        }

        let notify = outcome.error.is_none();
        if notify {
            warn!(accepted, total = pending.len(), "device accepted part of a batch");
        }
        let mut returned = outcome.returned;
        let mut notes = Vec::new();
        let mut emptied = false;
        for next in &pending[accepted..] {
            let frame = next.request.extras.frame_number;
            let buffers = match returned.iter().position(|r| r.frame_number == frame) {
                Some(pos) => {
                    let request = returned.swap_remove(pos);
                    request
                        .output_buffers
                        .into_iter()
                        .chain(request.input_buffer)
                        .collect()
                }
                None => Vec::new(),
            };
            for (stream_id, id) in &next.new_ids {
                records.uncache(*stream_id, *id);
            }
            emptied |= self.discard(host, &next.request, buffers, notify, &mut notes);
        }
        if !returned.is_empty() {
            error!(count = returned.len(), "device returned requests it was never given");
        }
        host.listener().fire(notes);
        if emptied {
            host.on_in_flight_empty();
        }

        match outcome.error {
            Some(err) => {
                error!(error = %err, "device failed to take a request batch");
                host.set_error(PipelineError::from(err));
                false
            }
            None => true,
        }
    }

    /// Undo the bookkeeping of a request the device never took. Returns true
    /// if this emptied the in-flight table.
    fn discard(
        &self,
        host: &dyn DispatchHost,
        request: &PendingRequest,
        buffers: Vec<StreamBuffer>,
        notify: bool,
        notes: &mut Vec<Notification>,
    ) -> bool {
        let frame = request.extras.frame_number;
        let records = host.records();
        for target in &request.outputs {
            records.pop_in_flight(frame, target.stream_id);
        }
        if let Some(input) = request.input {
            records.pop_in_flight(frame, input);
        }
        for buffer in buffers {
            if buffer.buffer.is_none() {
                continue;
            }
            match host.stream(buffer.stream_id) {
                Some(stream) => {
                    stream.return_buffer(buffer.with_status(BufferStatus::Error), frame, 0, true)
                }
                None => drop(buffer),
            }
        }
        if notify {
            notes.push(Notification::Error(ClientError::Request, request.extras.clone()));
        }
        host.metrics().dropped(1);
        let mut table = host.in_flight().lock();
        table.remove(frame).is_some() && table.is_empty()
    }

    fn cleanup_failed(&self, host: &dyn DispatchHost, batch: Vec<NextRequest>, send_error: bool) {
        let mut notes = Vec::new();
        let mut emptied = false;
        for mut next in batch {
            let mut buffers: Vec<StreamBuffer> =
                next.request.input_buffer.take().into_iter().collect();
            buffers.append(&mut next.outputs);
            emptied |= self.discard(host, &next.request, buffers, send_error, &mut notes);
        }
        host.listener().fire(notes);
        if emptied {
            host.on_in_flight_empty();
        }
        self.finish_batch();
    }

    fn finish_batch(&self) {
        self.request.lock().in_hand = None;
        self.submitted_signal.notify_all();
    }

    /// Stop a repeating set that can no longer make progress.
    fn check_and_stop_repeating(&self, host: &dyn DispatchHost) {
        let last = {
            let mut state = self.request.lock();
            let abandoned = state
                .repeating
                .iter()
                .flat_map(|r| r.outputs.iter())
                .any(|t| host.stream(t.stream_id).is_some_and(|s| s.is_abandoned()));
            if !abandoned {
                return;
            }
            state.repeating.clear();
            state.repeating_last_frame.take()
        };
        warn!(last_frame = ?last, "repeating request targets an abandoned stream; stopped");
        host.listener()
            .fire_one(Notification::RepeatingRequestError(last));
    }
}

/// Only the maximum of an fps range matters to a constrained high-speed session.
fn same_max_fps(tag: Tag, new: &MetadataValue, old: Option<&MetadataValue>) -> bool {
    if tag != tags::CONTROL_AE_TARGET_FPS_RANGE {
        return false;
    }
    match (new.i32_slice(), old.and_then(MetadataValue::i32_slice)) {
        (Some([_, new_max]), Some([_, old_max])) => new_max == old_max,
        _ => false,
    }
}

/// Fill a video stream's pool inline before its first high-speed request.
fn prepare_now(stream: &Stream) {
    let result = match stream.start_prepare(None) {
        Ok(PrepareStart::Prepared) => Ok(()),
        Ok(PrepareStart::NeedsWork) => loop {
            match stream.prepare_next_buffer() {
                Ok(true) => break Ok(()),
                Ok(false) => {}
                Err(err) => break Err(err),
            }
        },
        Err(err) => Err(err),
    };
    if let Err(err) = result {
        warn!(stream_id = stream.id().0, error = %err, "cannot prepare video stream");
        stream.cancel_prepare();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use aperture_device::{
        BufferPullReply, BufferRequest, BufferRequestStatus, CameraDevice, FakeBehavior,
        FakeCamera, FakeSession, SessionCallbacks, SessionEvent,
    };

    use super::*;
    use crate::pipeline::{
        listener::testing::RecordingListener,
        reconciler::testing::TestHost,
        request::{OutputTarget, ResultExtras},
    };

    impl DispatchHost for TestHost {
        fn reconfigure(&self, session_params: &Settings) -> Reconfigure {
            self.reconfigures.lock().push(session_params.clone());
            Reconfigure::Applied
        }

        fn on_in_flight_registered(&self) {
            self.registered.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Sink;

    impl SessionCallbacks for Sink {
        fn deliver(&self, _events: Vec<SessionEvent>) {}

        fn request_stream_buffers(&self, _requests: &[BufferRequest]) -> BufferPullReply {
            BufferPullReply::failed(BufferRequestStatus::FailedUnknown)
        }

        fn return_stream_buffers(&self, _buffers: Vec<StreamBuffer>) {}
    }

    struct Rig {
        host: Arc<TestHost>,
        session: Arc<FakeSession>,
        listener: Arc<RecordingListener>,
        tracker: Arc<StatusTracker>,
        dispatcher: RequestDispatcher,
        _camera: FakeCamera,
        _sink: Arc<Sink>,
    }

    impl Rig {
        fn new(capabilities: DeviceCapabilities, max_buffers: usize) -> Self {
            let host = Arc::new(TestHost::default().with_stream(0, max_buffers));
            let listener = RecordingListener::new();
            host.listener.set(&listener.as_dyn());
            let camera = FakeCamera::with_behavior(
                "0",
                FakeBehavior::manual().capabilities(capabilities.clone()),
            );
            let sink = Arc::new(Sink);
            let sink_weak = Arc::downgrade(&sink);
            let callbacks: Weak<dyn SessionCallbacks> = sink_weak;
            let device = camera.open(callbacks).expect("open");
            let session = camera.session().expect("session");
            let tracker = Arc::new(StatusTracker::start("dispatch-test", |_| {}));
            let status_id = tracker.add_component("dispatcher");
            let host_weak = Arc::downgrade(&host);
            let weak: Weak<dyn DispatchHost> = host_weak;
            let dispatcher = RequestDispatcher::new(
                weak,
                device,
                tracker.clone(),
                status_id,
                Arc::new(BufferRequestCoordinator::new(None)),
                &capabilities,
                PipelineTunables::default(),
            );
            Self {
                host,
                session,
                listener,
                tracker,
                dispatcher,
                _camera: camera,
                _sink: sink,
            }
        }

        fn shutdown(self) {
            self.dispatcher.stop();
            self.tracker.stop();
        }
    }

    fn pending(serial: u64, request_id: i32, settings: Settings) -> PendingRequest {
        PendingRequest {
            settings: settings.with(tags::REQUEST_ID, MetadataValue::i32(request_id)),
            physical: Vec::new(),
            outputs: vec![OutputTarget {
                stream_id: StreamId(0),
                surfaces: Vec::new(),
            }],
            input: None,
            input_buffer: None,
            extras: ResultExtras {
                request_id,
                ..ResultExtras::default()
            },
            batch_size: 1,
            repeating: false,
            rotate_and_crop_auto: false,
            zoom_ratio_is_1x: true,
            serial,
        }
    }

    fn repeating(serial: u64, request_id: i32) -> PendingRequest {
        PendingRequest {
            repeating: true,
            ..pending(serial, request_id, Settings::new())
        }
    }

    fn wait_until(f: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !f() {
            if Instant::now() > deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }

    #[test]
    fn repeating_request_sends_settings_once() {
        let rig = Rig::new(DeviceCapabilities::default(), 8);
        rig.dispatcher.start().expect("start");
        assert_eq!(rig.dispatcher.set_repeating(vec![repeating(7, 1)]), None);
        assert!(wait_until(|| rig.session.submitted_count() >= 3));
        rig.dispatcher.clear_repeating();

        let frames = rig.session.submissions();
        assert_eq!(
            frames.iter().take(3).map(|f| f.frame_number).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert!(frames[0].settings.is_some());
        assert!(frames[1].settings.is_none());
        assert!(frames[2].settings.is_none());
        assert_eq!(rig.host.registered.load(Ordering::SeqCst), 1);
        assert!(rig.dispatcher.latest_request().is_some());
        rig.shutdown();
    }

    #[test]
    fn trigger_is_mixed_into_exactly_one_request() {
        let rig = Rig::new(DeviceCapabilities::default(), 64);
        rig.dispatcher.start().expect("start");
        rig.dispatcher.set_repeating(vec![repeating(3, 1)]);
        assert!(wait_until(|| rig.session.submitted_count() >= 2));
        rig.dispatcher.queue_triggers(Trigger::autofocus(5));

        let has_trigger = |f: &aperture_device::SubmittedFrame| {
            f.settings
                .as_ref()
                .is_some_and(|s| s.contains(tags::CONTROL_AF_TRIGGER))
        };
        assert!(wait_until(|| {
            let frames = rig.session.submissions();
            frames
                .iter()
                .position(has_trigger)
                .is_some_and(|k| frames.len() >= k + 3)
        }));
        rig.dispatcher.clear_repeating();

        let frames = rig.session.submissions();
        let k = frames.iter().position(has_trigger).expect("trigger frame");
        let with_trigger = frames[k].settings.as_ref().expect("settings");
        assert_eq!(
            with_trigger.get(tags::CONTROL_AF_TRIGGER_ID),
            Some(&MetadataValue::i32(1)),
            "placeholder id accompanies the trigger"
        );
        let after = frames[k + 1].settings.as_ref().expect("settings resent after a trigger");
        assert!(!after.contains(tags::CONTROL_AF_TRIGGER));
        assert!(frames[k + 2].settings.is_none());
        assert_eq!(frames.iter().filter(|f| has_trigger(f)).count(), 1);
        rig.shutdown();
    }

    #[test]
    fn clear_fails_queued_requests_with_fresh_frame_numbers() {
        let rig = Rig::new(DeviceCapabilities::default(), 4);
        let last = rig.dispatcher.queue_requests(vec![
            pending(1, 1, Settings::new()),
            pending(2, 2, Settings::new()),
            pending(3, 3, Settings::new()),
        ]);
        assert_eq!(last, 2);
        rig.dispatcher.queue_triggers(Trigger::precapture_metering(4));
        assert_eq!(rig.dispatcher.clear(), None);

        let errors = rig.listener.errors(ClientError::Request);
        assert_eq!(errors.iter().map(|e| e.frame_number).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(errors.iter().map(|e| e.request_id).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(rig.host.metrics.dropped_frames(), 3);
        assert_eq!(rig.dispatcher.queue_requests(vec![pending(4, 4, Settings::new())]), 3);
        assert!(rig.dispatcher.is_stream_pending(StreamId(0)));
        rig.shutdown();
    }

    #[test]
    fn buffer_timeout_skips_only_the_starved_request() {
        let rig = Rig::new(DeviceCapabilities::default(), 1);
        rig.dispatcher.start().expect("start");
        rig.dispatcher.queue_requests(vec![
            pending(1, 1, Settings::new()),
            pending(2, 2, Settings::new()),
        ]);
        assert!(rig.listener.wait_for(1, Duration::from_secs(5), |n| {
            matches!(n, Notification::Error(ClientError::Request, _))
        }));
        let errors = rig.listener.errors(ClientError::Request);
        assert_eq!(errors[0].frame_number, 1);
        assert_eq!(rig.session.submitted_count(), 1);
        assert_eq!(rig.host.in_flight.lock().frames(), vec![0]);
        assert!(rig.host.errors().is_empty(), "buffer starvation is not fatal");
        rig.shutdown();
    }

    #[test]
    fn session_key_change_reconfigures_before_submission() {
        let capabilities = DeviceCapabilities {
            session_keys: vec![tags::CONTROL_AE_TARGET_FPS_RANGE],
            ..DeviceCapabilities::default()
        };
        let rig = Rig::new(capabilities, 4);
        let initial =
            Settings::new().with(tags::CONTROL_AE_TARGET_FPS_RANGE, MetadataValue::i32s(&[15, 30]));
        rig.dispatcher.configuration_complete(false, initial.clone());
        rig.dispatcher.start().expect("start");

        rig.dispatcher.queue_requests(vec![pending(1, 1, initial)]);
        assert!(wait_until(|| rig.session.submitted_count() == 1));
        assert!(rig.host.reconfigures.lock().is_empty());

        let faster =
            Settings::new().with(tags::CONTROL_AE_TARGET_FPS_RANGE, MetadataValue::i32s(&[30, 30]));
        rig.dispatcher.queue_requests(vec![pending(2, 2, faster)]);
        assert!(wait_until(|| rig.session.submitted_count() == 2));
        let reconfigures = rig.host.reconfigures.lock().clone();
        assert_eq!(reconfigures.len(), 1);
        assert_eq!(
            reconfigures[0].get(tags::CONTROL_AE_TARGET_FPS_RANGE),
            Some(&MetadataValue::i32s(&[30, 30]))
        );
        assert!(rig.session.submissions()[1].settings.is_some());
        rig.shutdown();
    }

    #[test]
    fn high_speed_ignores_fps_changes_with_the_same_maximum() {
        let capabilities = DeviceCapabilities {
            session_keys: vec![tags::CONTROL_AE_TARGET_FPS_RANGE],
            ..DeviceCapabilities::default()
        };
        let rig = Rig::new(capabilities, 4);
        let fps = |min| {
            Settings::new().with(
                tags::CONTROL_AE_TARGET_FPS_RANGE,
                MetadataValue::i32s(&[min, 120]),
            )
        };
        rig.dispatcher.configuration_complete(true, fps(30));
        rig.dispatcher.start().expect("start");
        rig.dispatcher.queue_requests(vec![pending(1, 1, fps(120))]);
        assert!(wait_until(|| rig.session.submitted_count() == 1));
        assert!(rig.host.reconfigures.lock().is_empty());
        rig.shutdown();
    }

    #[test]
    fn waits_for_submission_and_drains() {
        let rig = Rig::new(DeviceCapabilities::default(), 4);
        rig.dispatcher.start().expect("start");
        rig.dispatcher.queue_requests(vec![
            pending(1, 8, Settings::new()),
            pending(2, 9, Settings::new()),
        ]);
        rig.dispatcher
            .wait_until_request_processed(9, Duration::from_secs(5))
            .expect("submitted");
        rig.dispatcher.drain_for_offline().expect("drained");
        assert_eq!(rig.session.submitted_count(), 2);
        assert!(rig.listener.wait_for(1, Duration::from_secs(1), |n| {
            matches!(n, Notification::RequestQueueEmpty)
        }));
        assert!(
            rig.dispatcher
                .wait_until_request_processed(42, Duration::from_millis(20))
                .is_err()
        );
        rig.shutdown();
    }

    #[test]
    fn rotate_override_must_be_concrete() {
        let rig = Rig::new(DeviceCapabilities::default(), 4);
        assert!(
            rig.dispatcher
                .set_rotate_and_crop_override(tags::rotate_and_crop::AUTO)
                .is_err()
        );
        rig.dispatcher
            .set_rotate_and_crop_override(tags::rotate_and_crop::ROTATE_90)
            .expect("concrete");
        rig.shutdown();
    }

    #[test]
    fn auto_rotate_requests_carry_the_override() {
        let rig = Rig::new(DeviceCapabilities::default(), 8);
        rig.dispatcher
            .set_rotate_and_crop_override(tags::rotate_and_crop::ROTATE_180)
            .expect("override");
        rig.dispatcher.start().expect("start");
        let mut request = pending(1, 1, Settings::new());
        request.rotate_and_crop_auto = true;
        rig.dispatcher.queue_requests(vec![request]);
        assert!(wait_until(|| rig.session.submitted_count() == 1));
        let sent = rig.session.submissions()[0].settings.clone().expect("settings");
        assert_eq!(
            sent.get(tags::SCALER_ROTATE_AND_CROP),
            Some(&MetadataValue::u8(tags::rotate_and_crop::ROTATE_180))
        );
        rig.shutdown();
    }
}
