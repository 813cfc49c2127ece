#![doc = include_str!("../README.md")]

pub use aperture_core as core;
pub use aperture_device as device;

pub mod logging;
mod metrics;
pub mod pipeline;
pub mod tunables;

pub use metrics::{PipelineMetrics, StageMetrics};
pub use pipeline::{
    BufferInfo, CaptureRequest, CaptureResult, ClientError, NotificationListener,
    OfflineSession, OutputTarget, Pipeline, PipelineError, PipelineStatus, ResultExtras,
    StreamBufferListener, StreamConfig, StreamInfo, StreamKind, Trigger, usage,
};
pub use tunables::{ApertureConfig, PipelineTunables, pipeline_tunables, set_pipeline_tunables};

pub mod prelude {
    pub use crate::metrics::{PipelineMetrics, StageMetrics};
    pub use crate::pipeline::{
        BufferInfo, CaptureRequest, CaptureResult, ClientError, NotificationListener,
        OfflineSession, OutputTarget, Pipeline, PipelineError, PipelineStatus, ResultExtras,
        StreamBufferListener, StreamConfig, StreamInfo, StreamKind, Trigger, usage,
    };
    pub use crate::tunables::{
        ApertureConfig, PipelineTunables, pipeline_tunables, set_pipeline_tunables,
    };
    #[allow(unused_imports)]
    pub use aperture_device::prelude::*;
}
