//! Gate for device-initiated buffer pulls.
//!
//! Under device-side buffer management the device asks for output buffers on its
//! own thread while requests are being dispatched. Pulls must stop before the
//! pipeline is considered idle, but an idle wait must not deadlock against a pull
//! that is already running, so the machine only reaches `Stopped` once the
//! in-flight table is empty, the dispatcher is paused and no pull is active.
use std::{collections::BTreeSet, sync::Arc};

use aperture_core::prelude::{ComponentId, StatusTracker};
use aperture_device::{
    BufferPullReply, BufferRequest, BufferRequestStatus, BufferStatus, StreamBuffer,
    StreamBufferError, StreamBufferReturn,
};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use super::{error::PipelineError, reconciler::ReconcileHost};

/// Phase of the pull gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PullState {
    Ready,
    PendingStop,
    Stopped,
}

#[derive(Debug)]
struct MachineState {
    status: PullState,
    /// Pulls run on device threads and may overlap.
    pulls_ongoing: usize,
    in_flight_empty: bool,
    dispatcher_paused: bool,
    switched_to_offline: bool,
}

impl MachineState {
    fn try_stop(&mut self) -> bool {
        if self.in_flight_empty && self.dispatcher_paused && self.pulls_ongoing == 0 {
            self.status = PullState::Stopped;
            return true;
        }
        false
    }
}

pub(crate) struct BufferRequestCoordinator {
    state: Mutex<MachineState>,
    tracker: Option<(Arc<StatusTracker>, ComponentId)>,
}

impl BufferRequestCoordinator {
    pub fn new(tracker: Option<(Arc<StatusTracker>, ComponentId)>) -> Self {
        Self {
            state: Mutex::new(MachineState {
                status: PullState::Stopped,
                pulls_ongoing: 0,
                in_flight_empty: true,
                dispatcher_paused: true,
                switched_to_offline: false,
            }),
            tracker,
        }
    }

    #[cfg(test)]
    pub fn status(&self) -> PullState {
        self.state.lock().status
    }

    /// Begin a pull; refused while stopped.
    pub fn start_pull(&self) -> bool {
        let mut state = self.state.lock();
        if matches!(state.status, PullState::Ready | PullState::PendingStop) {
            state.pulls_ongoing += 1;
            if state.pulls_ongoing == 1 {
                self.mark(true);
            }
            return true;
        }
        false
    }

    /// Finish a pull; the gate goes idle once the last overlapping pull ends.
    pub fn end_pull(&self) {
        let mut state = self.state.lock();
        state.pulls_ongoing = state.pulls_ongoing.saturating_sub(1);
        if state.pulls_ongoing > 0 {
            return;
        }
        if state.status == PullState::PendingStop {
            state.try_stop();
        }
        self.mark(false);
    }

    pub fn on_streams_configured(&self) {
        let mut state = self.state.lock();
        state.status = PullState::Ready;
        state.switched_to_offline = false;
    }

    pub fn on_submitting_request(&self) {
        let mut state = self.state.lock();
        state.dispatcher_paused = false;
        state.in_flight_empty = false;
        if state.status == PullState::Stopped && !state.switched_to_offline {
            state.status = PullState::Ready;
        }
    }

    pub fn on_request_thread_paused(&self) {
        let mut state = self.state.lock();
        state.dispatcher_paused = true;
        if state.status == PullState::PendingStop {
            state.try_stop();
        }
    }

    pub fn on_in_flight_map_empty(&self) {
        let mut state = self.state.lock();
        state.in_flight_empty = true;
        if state.status == PullState::PendingStop {
            state.try_stop();
        }
    }

    pub fn on_wait_until_idle(&self) {
        let mut state = self.state.lock();
        if !state.try_stop() {
            state.status = PullState::PendingStop;
        }
    }

    /// Stop pulls for good after an offline switch; fails if a pull is still running.
    pub fn on_switch_to_offline_success(&self) -> bool {
        let mut state = self.state.lock();
        if state.pulls_ongoing > 0 {
            error!(
                pulls = state.pulls_ongoing,
                "device is still pulling buffers after switching to offline"
            );
            return false;
        }
        state.switched_to_offline = true;
        state.in_flight_empty = true;
        state.dispatcher_paused = true;
        state.status = PullState::Stopped;
        true
    }

    fn mark(&self, active: bool) {
        if let Some((tracker, id)) = &self.tracker {
            if active {
                tracker.mark_active(*id);
            } else {
                tracker.mark_idle(*id);
            }
        }
    }
}

/// Serve a device pull for output buffers.
pub(crate) fn request_stream_buffers(
    host: &dyn ReconcileHost,
    requests: &[BufferRequest],
) -> BufferPullReply {
    if !host.reconcile_config().hal_buffer_management {
        error!("buffer pull from a device without device-side buffer management");
        return BufferPullReply::failed(BufferRequestStatus::FailedIllegalArgument);
    }
    let mut seen = BTreeSet::new();
    for request in requests {
        if !seen.insert(request.stream_id) {
            error!(stream_id = request.stream_id.0, "stream appears multiple times in buffer pull");
            return BufferPullReply::failed(BufferRequestStatus::FailedIllegalArgument);
        }
    }
    if !host.start_pull() {
        debug!("buffer pull refused while stopped");
        return BufferPullReply::failed(BufferRequestStatus::FailedConfiguring);
    }

    let mut returns = Vec::with_capacity(requests.len());
    let mut all_ok = true;
    let mut any_ok = false;
    for request in requests {
        let Some(stream) = host.stream(request.stream_id).filter(|s| !s.is_input()) else {
            error!(stream_id = request.stream_id.0, "buffer pull for unknown output stream");
            host.end_pull();
            return BufferPullReply::failed(BufferRequestStatus::FailedIllegalArgument);
        };
        if stream.is_abandoned() {
            returns.push(StreamBufferReturn {
                stream_id: request.stream_id,
                result: Err(StreamBufferError::StreamDisconnected),
            });
            all_ok = false;
            continue;
        }
        if stream.outstanding() + request.num_buffers > stream.max_buffers() {
            error!(
                stream_id = request.stream_id.0,
                outstanding = stream.outstanding(),
                requested = request.num_buffers,
                max_buffers = stream.max_buffers(),
                "buffer pull exceeds stream capacity"
            );
            returns.push(StreamBufferReturn {
                stream_id: request.stream_id,
                result: Err(StreamBufferError::MaxBufferExceeded),
            });
            all_ok = false;
            continue;
        }

        let mut buffers = Vec::with_capacity(request.num_buffers);
        let mut new_ids = Vec::new();
        let mut failure = None;
        for _ in 0..request.num_buffers {
            match stream.get_buffer(host.buffer_wait()) {
                Ok(lease) => {
                    let id = lease.id();
                    if host.records().cache(request.stream_id, id) {
                        new_ids.push(id);
                    }
                    host.records().push_requested(id, request.stream_id);
                    buffers.push(StreamBuffer::filled(request.stream_id, lease));
                }
                Err(err) => {
                    failure = Some(match err {
                        PipelineError::BufferTimeout(_) => StreamBufferError::NoBufferAvailable,
                        PipelineError::Abandoned(_) => StreamBufferError::StreamDisconnected,
                        _ => StreamBufferError::Unknown,
                    });
                    warn!(
                        stream_id = request.stream_id.0,
                        error = %err,
                        "buffer pull could not get a buffer"
                    );
                    break;
                }
            }
        }
        match failure {
            None => {
                any_ok = true;
                returns.push(StreamBufferReturn {
                    stream_id: request.stream_id,
                    result: Ok(buffers),
                });
            }
            Some(reason) => {
                all_ok = false;
                for buffer in buffers {
                    if let Some(id) = buffer.buffer_id() {
                        host.records().pop_requested(id);
                    }
                    stream.return_buffer(buffer.with_status(BufferStatus::Error), 0, 0, true);
                }
                for id in new_ids {
                    host.records().uncache(request.stream_id, id);
                }
                returns.push(StreamBufferReturn {
                    stream_id: request.stream_id,
                    result: Err(reason),
                });
            }
        }
    }
    host.end_pull();

    let status = if all_ok {
        BufferRequestStatus::Ok
    } else if any_ok {
        BufferRequestStatus::FailedPartial
    } else {
        BufferRequestStatus::FailedUnknown
    };
    BufferPullReply { status, returns }
}

/// Take back pulled buffers the device never used.
pub(crate) fn return_stream_buffers(host: &dyn ReconcileHost, buffers: Vec<StreamBuffer>) {
    if !host.reconcile_config().hal_buffer_management {
        error!("buffer return from a device without device-side buffer management");
        return;
    }
    for buffer in buffers {
        let Some(id) = buffer.buffer_id() else {
            error!(stream_id = buffer.stream_id.0, "cannot return a buffer without an id");
            continue;
        };
        if host.records().pop_requested(id).is_none() {
            error!(
                stream_id = buffer.stream_id.0,
                buffer = %id,
                "returned buffer was never pulled"
            );
            continue;
        }
        match host.stream(buffer.stream_id) {
            Some(stream) => {
                stream.return_buffer(buffer.with_status(BufferStatus::Error), 0, 0, true)
            }
            None => drop(buffer),
        }
    }
}
