#![doc = include_str!("../README.md")]

pub mod buffer;
pub mod format;
pub mod metadata;
pub mod metrics;
pub mod queue;
pub mod status;

pub mod prelude {
    pub use crate::{
        buffer::{BufferId, BufferLease, BufferPool, BufferPoolMetrics, BufferPoolStats},
        format::{FourCc, Resolution, StreamFormat},
        metadata::{MetadataError, MetadataValue, Settings, Tag, tags},
        metrics::Metrics,
        queue::{
            BoundedRx, BoundedTx, NewestRx, NewestTx, RecvOutcome, SendOutcome, bounded, newest,
        },
        status::{ComponentId, ComponentState, StatusTracker},
    };
}
