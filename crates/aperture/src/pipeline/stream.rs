use std::{
    collections::HashMap,
    num::NonZeroU32,
    sync::{Arc, Weak},
    time::Duration,
};

use aperture_core::prelude::*;
use aperture_device::{
    ConfiguredStream, FrameNumber, StreamBuffer, StreamDescriptor, StreamDirection, StreamId,
};
use parking_lot::{Mutex, RwLock};

use super::{error::PipelineError, status::PipelineStatus};

/// Consumer usage flags understood by the pipeline.
pub mod usage {
    pub const CPU_READ: u64 = 1 << 0;
    pub const CPU_WRITE: u64 = 1 << 1;
    pub const COMPOSER: u64 = 1 << 8;
    /// Marks a stream as a video recording target.
    pub const VIDEO_ENCODER: u64 = 1 << 16;
}

/// Flavor of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StreamKind {
    Output,
    /// One producer fanned out to several consumer surfaces.
    SharedOutput { surfaces: usize },
    Input,
    /// Stand-in configured when the client has no streams.
    Placeholder,
}

/// Client-side description of a stream to create.
///
/// # Example
/// ```rust
/// use aperture::prelude::*;
///
/// let format = StreamFormat::new(FourCc::NV12, Resolution::new(64, 48).unwrap());
/// let config = StreamConfig::output(format).usage(usage::VIDEO_ENCODER);
/// assert!(config.is_video());
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StreamConfig {
    pub kind: StreamKind,
    pub format: StreamFormat,
    pub usage: u64,
    pub physical_camera_id: Option<String>,
    /// The stream may be handed to an offline session.
    pub offline_processing: bool,
}

impl StreamConfig {
    pub fn output(format: StreamFormat) -> Self {
        Self::with_kind(StreamKind::Output, format)
    }

    pub fn shared(format: StreamFormat, surfaces: usize) -> Self {
        Self::with_kind(
            StreamKind::SharedOutput {
                surfaces: surfaces.max(1),
            },
            format,
        )
    }

    pub fn input(format: StreamFormat) -> Self {
        Self::with_kind(StreamKind::Input, format)
    }

    fn with_kind(kind: StreamKind, format: StreamFormat) -> Self {
        Self {
            kind,
            format,
            usage: 0,
            physical_camera_id: None,
            offline_processing: false,
        }
    }

    pub fn usage(mut self, usage: u64) -> Self {
        self.usage |= usage;
        self
    }

    pub fn physical_camera(mut self, id: &str) -> Self {
        self.physical_camera_id = Some(id.to_string());
        self
    }

    pub fn offline_processing(mut self, enabled: bool) -> Self {
        self.offline_processing = enabled;
        self
    }

    pub fn is_video(&self) -> bool {
        self.usage & usage::VIDEO_ENCODER != 0
    }
}

/// Snapshot of a stream's state.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StreamInfo {
    pub id: StreamId,
    pub kind: StreamKind,
    pub format: StreamFormat,
    /// Buffers the device may hold at once; zero before configuration.
    pub max_buffers: usize,
    /// Client usage combined with device producer usage.
    pub usage: u64,
    pub outstanding_buffers: usize,
    pub allocated_buffers: usize,
    pub prepared: bool,
    pub abandoned: bool,
}

/// Buffer movement reported to a [`StreamBufferListener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub stream_id: StreamId,
    pub frame_number: FrameNumber,
    pub buffer_id: Option<BufferId>,
    /// Shutter time of the frame, zero when unknown.
    pub timestamp: i64,
    pub error: bool,
}

/// Observer of buffers leaving and re-entering a stream.
pub trait StreamBufferListener: Send + Sync {
    fn on_buffer_acquired(&self, _info: &BufferInfo) {}
    fn on_buffer_released(&self, _info: &BufferInfo) {}
}

/// Outcome of [`Stream::start_prepare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PrepareStart {
    /// Enough buffers already exist.
    Prepared,
    /// Call `prepare_next_buffer` until it reports completion.
    NeedsWork,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Constructed,
    Configuring,
    Configured,
    Preparing,
    Abandoned,
    Disconnected,
}

struct StreamState {
    phase: Phase,
    phase_before_config: Phase,
    max_buffers: usize,
    producer_usage: u64,
    prepare_target: usize,
    prepared: bool,
    unpreparable: bool,
}

/// One stream of the pipeline. The variant is carried in `kind`; behavior
/// differences are capability checks rather than separate types.
pub(crate) struct Stream {
    id: StreamId,
    config: StreamConfig,
    pool: BufferPool,
    state: Mutex<StreamState>,
    listeners: Mutex<Vec<Weak<dyn StreamBufferListener>>>,
}

impl Stream {
    pub fn new(id: StreamId, config: StreamConfig) -> Self {
        let chunk = match config.kind {
            StreamKind::Placeholder => 0,
            _ => config.format.frame_bytes(),
        };
        Self {
            id,
            pool: BufferPool::new(chunk, 0),
            config,
            state: Mutex::new(StreamState {
                phase: Phase::Constructed,
                phase_before_config: Phase::Constructed,
                max_buffers: 0,
                producer_usage: 0,
                prepare_target: 0,
                prepared: false,
                unpreparable: false,
            }),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn placeholder(id: StreamId) -> Self {
        let one = NonZeroU32::MIN;
        let format = StreamFormat::new(
            FourCc::YUYV,
            Resolution {
                width: one,
                height: one,
            },
        );
        Self::new(id, StreamConfig::with_kind(StreamKind::Placeholder, format))
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn kind(&self) -> StreamKind {
        self.config.kind
    }

    pub fn is_input(&self) -> bool {
        self.config.kind == StreamKind::Input
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.config.kind, StreamKind::SharedOutput { .. })
    }

    pub fn is_placeholder(&self) -> bool {
        self.config.kind == StreamKind::Placeholder
    }

    pub fn is_video(&self) -> bool {
        self.config.is_video()
    }

    pub fn supports_offline(&self) -> bool {
        self.config.offline_processing
    }

    /// Number of consumer surfaces; one for non-shared streams.
    pub fn surface_count(&self) -> usize {
        match self.config.kind {
            StreamKind::SharedOutput { surfaces } => surfaces,
            _ => 1,
        }
    }

    pub fn physical_camera_id(&self) -> Option<&str> {
        self.config.physical_camera_id.as_deref()
    }

    pub fn descriptor(&self) -> StreamDescriptor {
        StreamDescriptor {
            id: self.id,
            direction: if self.is_input() {
                StreamDirection::Input
            } else {
                StreamDirection::Output
            },
            format: self.config.format,
            usage: self.config.usage,
            physical_camera_id: self.config.physical_camera_id.clone(),
        }
    }

    pub fn start_configuration(&self) -> Result<(), PipelineError> {
        let mut state = self.state.lock();
        match state.phase {
            Phase::Abandoned => Err(PipelineError::Abandoned(self.id)),
            Phase::Disconnected => Err(PipelineError::InvalidArgument(format!(
                "{} is disconnected",
                self.id
            ))),
            Phase::Configuring => Ok(()),
            phase => {
                state.phase_before_config = phase;
                state.phase = Phase::Configuring;
                Ok(())
            }
        }
    }

    pub fn is_configuring(&self) -> bool {
        self.state.lock().phase == Phase::Configuring
    }

    pub fn finish_configuration(&self, configured: &ConfiguredStream) -> Result<(), PipelineError> {
        let mut state = self.state.lock();
        if state.phase == Phase::Abandoned {
            return Err(PipelineError::Abandoned(self.id));
        }
        state.max_buffers = configured.max_buffers;
        state.producer_usage = configured.usage & !self.config.usage;
        state.phase = Phase::Configured;
        state.prepared = state.prepared && self.pool.allocated() >= configured.max_buffers;
        drop(state);
        self.pool.set_limit(configured.max_buffers);
        Ok(())
    }

    pub fn cancel_configuration(&self) {
        let mut state = self.state.lock();
        if state.phase == Phase::Configuring {
            state.phase = state.phase_before_config;
        }
    }

    /// Take a buffer for a request, waiting up to `wait` for one to be recycled.
    pub fn get_buffer(&self, wait: Duration) -> Result<BufferLease, PipelineError> {
        {
            let mut state = self.state.lock();
            match state.phase {
                Phase::Abandoned => return Err(PipelineError::Abandoned(self.id)),
                Phase::Configured => {}
                phase => {
                    return Err(PipelineError::InvalidArgument(format!(
                        "{} cannot hand out buffers while {phase:?}",
                        self.id
                    )));
                }
            }
            state.unpreparable = true;
        }
        self.pool
            .lease_timeout(wait)
            .ok_or(PipelineError::BufferTimeout(self.id))
    }

    pub fn notify_acquired(&self, frame_number: FrameNumber, buffer_id: Option<BufferId>) {
        self.fire(
            |l, info| l.on_buffer_acquired(info),
            BufferInfo {
                stream_id: self.id,
                frame_number,
                buffer_id,
                timestamp: 0,
                error: false,
            },
        );
    }

    /// Take back a buffer from the device. The lease recycles into the pool.
    pub fn return_buffer(
        &self,
        buffer: StreamBuffer,
        frame_number: FrameNumber,
        timestamp: i64,
        error: bool,
    ) {
        let info = BufferInfo {
            stream_id: self.id,
            frame_number,
            buffer_id: buffer.buffer_id(),
            timestamp,
            error,
        };
        drop(buffer);
        self.fire(|l, info| l.on_buffer_released(info), info);
    }

    pub fn add_listener(&self, listener: Weak<dyn StreamBufferListener>) {
        let mut listeners = self.listeners.lock();
        listeners.retain(|l| l.strong_count() > 0);
        listeners.push(listener);
    }

    fn fire(&self, f: impl Fn(&dyn StreamBufferListener, &BufferInfo), info: BufferInfo) {
        let listeners: Vec<_> = self
            .listeners
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for listener in listeners {
            f(listener.as_ref(), &info);
        }
    }

    /// Buffers currently held outside the pool.
    pub fn outstanding(&self) -> usize {
        self.pool.outstanding()
    }

    pub fn max_buffers(&self) -> usize {
        self.state.lock().max_buffers
    }

    pub fn start_prepare(&self, max_count: Option<usize>) -> Result<PrepareStart, PipelineError> {
        let mut state = self.state.lock();
        if state.phase != Phase::Configured {
            return Err(PipelineError::InvalidArgument(format!(
                "{} is not ready for preparation ({:?})",
                self.id, state.phase
            )));
        }
        if state.unpreparable || self.pool.outstanding() > 0 {
            return Err(PipelineError::InvalidArgument(format!(
                "{} has already been used by requests",
                self.id
            )));
        }
        let target = max_count.map_or(state.max_buffers, |m| m.min(state.max_buffers));
        if self.pool.allocated() >= target {
            state.prepared = true;
            return Ok(PrepareStart::Prepared);
        }
        state.prepare_target = target;
        state.phase = Phase::Preparing;
        Ok(PrepareStart::NeedsWork)
    }

    /// Allocate one buffer; returns true once the target is reached.
    pub fn prepare_next_buffer(&self) -> Result<bool, PipelineError> {
        let mut state = self.state.lock();
        if state.phase != Phase::Preparing {
            return Err(PipelineError::InvalidArgument(format!("{} is not preparing", self.id)));
        }
        if self.pool.allocated() < state.prepare_target && !self.pool.allocate_one() {
            return Err(PipelineError::InvalidArgument(format!(
                "{} cannot allocate beyond {} buffers",
                self.id,
                self.pool.limit()
            )));
        }
        if self.pool.allocated() >= state.prepare_target {
            state.phase = Phase::Configured;
            state.prepared = true;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn cancel_prepare(&self) {
        let mut state = self.state.lock();
        if state.phase == Phase::Preparing {
            state.phase = Phase::Configured;
        }
    }

    /// Requests targeting a preparing stream are refused.
    pub fn is_blocked_by_prepare(&self) -> bool {
        self.state.lock().phase == Phase::Preparing
    }

    pub fn mark_unpreparable(&self) {
        self.state.lock().unpreparable = true;
    }

    pub fn is_unpreparable(&self) -> bool {
        self.state.lock().unpreparable
    }

    /// Release every free buffer of an idle stream.
    pub fn tear_down(&self) -> Result<usize, PipelineError> {
        let mut state = self.state.lock();
        if state.phase != Phase::Configured {
            return Err(PipelineError::InvalidArgument(format!(
                "{} cannot be torn down while {:?}",
                self.id, state.phase
            )));
        }
        if self.pool.outstanding() > 0 {
            return Err(PipelineError::Busy(format!("{} has outstanding buffers", self.id)));
        }
        state.prepared = false;
        state.unpreparable = false;
        Ok(self.pool.release_free())
    }

    /// Stop handing out buffers; leases still out recycle into a pool nobody reads.
    pub fn disconnect(&self) {
        self.state.lock().phase = Phase::Disconnected;
        self.pool.release_free();
    }

    /// The consumer side went away.
    pub fn abandon(&self) {
        self.state.lock().phase = Phase::Abandoned;
    }

    pub fn is_abandoned(&self) -> bool {
        self.state.lock().phase == Phase::Abandoned
    }

    pub fn info(&self) -> StreamInfo {
        let state = self.state.lock();
        StreamInfo {
            id: self.id,
            kind: self.config.kind,
            format: self.config.format,
            max_buffers: state.max_buffers,
            usage: self.config.usage | state.producer_usage,
            outstanding_buffers: self.pool.outstanding(),
            allocated_buffers: self.pool.allocated(),
            prepared: state.prepared,
            abandoned: state.phase == Phase::Abandoned,
        }
    }

    pub fn is_deletable(&self) -> bool {
        self.pool.outstanding() == 0
    }
}

/// Id lookup for every stream the pipeline still references, including input and
/// streams pending deletion. A leaf lock: nothing else is acquired while it is held.
#[derive(Default)]
pub(crate) struct StreamRegistry {
    streams: RwLock<HashMap<StreamId, Arc<Stream>>>,
}

impl StreamRegistry {
    pub fn get(&self, id: StreamId) -> Option<Arc<Stream>> {
        self.streams.read().get(&id).cloned()
    }

    pub fn insert(&self, stream: Arc<Stream>) {
        self.streams.write().insert(stream.id(), stream);
    }

    pub fn remove(&self, id: StreamId) -> Option<Arc<Stream>> {
        self.streams.write().remove(&id)
    }

    pub fn all(&self) -> Vec<Arc<Stream>> {
        let mut streams: Vec<_> = self.streams.read().values().cloned().collect();
        streams.sort_by_key(|s| s.id());
        streams
    }

    pub fn clear(&self) -> Vec<Arc<Stream>> {
        self.streams.write().drain().map(|(_, s)| s).collect()
    }
}

/// Stream mutation is only allowed outside of `Active` unless wrapped in a pause.
pub(crate) fn ensure_mutable(status: PipelineStatus) -> Result<(), PipelineError> {
    match status {
        PipelineStatus::Error | PipelineStatus::Uninitialized => {
            Err(PipelineError::InvalidState(status))
        }
        _ => Ok(()),
    }
}
