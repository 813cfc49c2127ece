use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use aperture_device::{
    BufferPullReply, BufferRequest, FrameNumber, OfflineDeviceSession, SessionCallbacks,
    SessionEvent, StreamBuffer, StreamId,
};
use parking_lot::Mutex;
use tracing::{debug, error, info};

use super::{
    buffer_coordinator,
    error::PipelineError,
    in_flight::{InFlightRequest, InFlightTable},
    listener::{ClientError, ListenerSlot, Notification, NotificationListener},
    reconciler::{ReconcileConfig, ReconcileHost, ResultQueue, ResultReconciler},
    records::BufferRecords,
    request::{CaptureResult, ResultExtras},
    stream::{Stream, StreamRegistry},
};
use crate::{metrics::PipelineMetrics, tunables::PipelineTunables};

/// State carried over from the live pipeline.
pub(crate) struct Handoff {
    pub streams: Vec<Arc<Stream>>,
    pub records: BufferRecords,
    pub requests: Vec<(FrameNumber, InFlightRequest)>,
    pub config: ReconcileConfig,
    pub tunables: PipelineTunables,
}

struct OfflineInner {
    camera_id: String,
    streams: StreamRegistry,
    stream_ids: Vec<StreamId>,
    records: BufferRecords,
    in_flight: Mutex<InFlightTable>,
    results: ResultQueue,
    listener: ListenerSlot,
    reconciler: ResultReconciler,
    metrics: PipelineMetrics,
    config: ReconcileConfig,
    tunables: PipelineTunables,
    error_cause: Mutex<Option<PipelineError>>,
    closed: AtomicBool,
    device: Mutex<Option<Box<dyn OfflineDeviceSession>>>,
}

/// Requests that keep running on the device after the pipeline moved on.
///
/// Created by `Pipeline::switch_to_offline`. Results arrive through the same
/// listener and result queue model as the live pipeline; the kept streams stay
/// alive until every transferred request has finished or the session is
/// disconnected.
pub struct OfflineSession {
    inner: Arc<OfflineInner>,
}

impl OfflineSession {
    pub(crate) fn new(
        camera_id: &str,
        handoff: Handoff,
        device: Box<dyn OfflineDeviceSession>,
        listener: Option<Arc<dyn NotificationListener>>,
    ) -> Self {
        let Handoff {
            streams,
            records,
            requests,
            config,
            tunables,
        } = handoff;
        let registry = StreamRegistry::default();
        let stream_ids = streams.iter().map(|s| s.id()).collect();
        for stream in streams {
            registry.insert(stream);
        }
        let mut table = InFlightTable::default();
        for (frame, request) in requests {
            table.insert(frame, request);
        }
        let slot = ListenerSlot::default();
        if let Some(listener) = &listener {
            slot.set(listener);
        }
        let inner = Arc::new(OfflineInner {
            camera_id: camera_id.to_string(),
            streams: registry,
            stream_ids,
            records,
            in_flight: Mutex::new(table),
            results: ResultQueue::default(),
            listener: slot,
            reconciler: ResultReconciler::default(),
            metrics: PipelineMetrics::default(),
            config,
            tunables,
            error_cause: Mutex::new(None),
            closed: AtomicBool::new(false),
            device: Mutex::new(None),
        });
        let weak = Arc::downgrade(&inner);
        let callbacks: Weak<dyn SessionCallbacks> = weak;
        device.attach(callbacks);
        *inner.device.lock() = Some(device);
        debug!(
            camera = %inner.camera_id,
            requests = inner.in_flight.lock().len(),
            "offline session attached"
        );
        Self { inner }
    }

    pub fn set_listener(&self, listener: &Arc<dyn NotificationListener>) {
        self.inner.listener.set(listener);
    }

    /// Streams owned by this session.
    pub fn stream_ids(&self) -> &[StreamId] {
        &self.inner.stream_ids
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.lock().len()
    }

    /// Every transferred request has completed.
    pub fn is_finished(&self) -> bool {
        self.inner.in_flight.lock().is_empty()
    }

    pub fn get_next_result(&self) -> Option<CaptureResult> {
        self.inner.results.pop()
    }

    pub fn wait_for_next_result(&self, timeout: Duration) -> Result<CaptureResult, PipelineError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(result) = self.inner.results.pop() {
                return Ok(result);
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() || !self.inner.results.wait(left) {
                return self.inner.results.pop().ok_or_else(|| {
                    PipelineError::Timeout("no offline capture result available".into())
                });
            }
        }
    }

    pub fn error_cause(&self) -> Option<PipelineError> {
        self.inner.error_cause.lock().clone()
    }

    pub fn metrics(&self) -> PipelineMetrics {
        self.inner.metrics.clone()
    }

    /// Close the device side and fail whatever has not completed.
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }
}

impl Drop for OfflineSession {
    fn drop(&mut self) {
        self.inner.disconnect();
    }
}

impl OfflineInner {
    fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(device) = self.device.lock().take() {
            device.close();
        }
        let notes: Vec<_> = self
            .in_flight
            .lock()
            .drain()
            .into_iter()
            .filter(|(_, request)| request.has_callback && request.request_status.is_none())
            .map(|(frame, request)| {
                let mut extras = request.extras;
                extras.frame_number = frame;
                Notification::Error(ClientError::Request, extras)
            })
            .collect();
        if !notes.is_empty() {
            self.metrics.dropped(notes.len() as u64);
        }
        self.listener.fire(notes);
        for stream in self.streams.clear() {
            stream.disconnect();
        }
        self.records.clear();
        info!(camera = %self.camera_id, "offline session closed");
    }
}

impl ReconcileHost for OfflineInner {
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
        self.config
    }

    fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    fn set_error(&self, cause: PipelineError) {
        {
            let mut slot = self.error_cause.lock();
            if slot.is_some() {
                return;
            }
            error!(camera = %self.camera_id, cause = %cause, "offline session failed");
            *slot = Some(cause);
        }
        self.listener
            .fire_one(Notification::Error(ClientError::Device, ResultExtras::default()));
    }

    fn on_in_flight_empty(&self) {
        debug!(camera = %self.camera_id, "offline requests finished");
    }

    fn start_pull(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn end_pull(&self) {}

    fn buffer_wait(&self) -> Duration {
        self.tunables.base_buffer_wait()
    }
}

impl SessionCallbacks for OfflineInner {
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
