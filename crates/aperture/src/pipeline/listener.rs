use std::sync::{Arc, Weak};

use aperture_core::prelude::Settings;
use aperture_device::{FrameNumber, StreamId};
use parking_lot::RwLock;

use super::request::ResultExtras;

/// Error classes reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ClientError {
    /// The pipeline is unusable until reopened.
    Device,
    /// The request failed; no result or buffers will arrive.
    Request,
    /// Result metadata for the frame is lost.
    Result,
    /// One output buffer failed.
    Buffer,
}

/// Client callbacks. Invoked from pipeline worker threads with no pipeline lock held.
///
/// # Example
/// ```rust,ignore
/// use aperture::prelude::*;
///
/// struct Log;
///
/// impl NotificationListener for Log {
///     fn notify_error(&self, code: ClientError, extras: &ResultExtras) {
///         eprintln!("frame {} failed: {code:?}", extras.frame_number);
///     }
/// }
///
/// let listener: Arc<dyn NotificationListener> = Arc::new(Log);
/// pipeline.set_listener(&listener);
/// ```
pub trait NotificationListener: Send + Sync {
    fn notify_error(&self, code: ClientError, extras: &ResultExtras);

    fn notify_shutter(&self, _extras: &ResultExtras, _timestamp: i64) {}

    /// Every queued request completed and the dispatcher is paused.
    fn notify_idle(&self) {}

    fn notify_active(&self) {}

    /// Buffer preparation for `stream` finished or was cancelled.
    fn notify_prepared(&self, _stream: StreamId) {}

    fn notify_request_queue_empty(&self) {}

    /// The repeating set was stopped because a target became unusable.
    fn notify_repeating_request_error(&self, _last_frame_number: Option<FrameNumber>) {}

    /// Early partial metadata, only when the device enables early partials.
    fn notify_partial_result(&self, _metadata: &Settings, _extras: &ResultExtras) {}
}

/// Callback deferred until the producing lock is released.
#[derive(Debug, Clone)]
pub(crate) enum Notification {
    Error(ClientError, ResultExtras),
    Shutter(ResultExtras, i64),
    Idle,
    Active,
    Prepared(StreamId),
    RequestQueueEmpty,
    RepeatingRequestError(Option<FrameNumber>),
    PartialResult(Settings, ResultExtras),
}

impl Notification {
    fn deliver(&self, listener: &dyn NotificationListener) {
        match self {
            Notification::Error(code, extras) => listener.notify_error(*code, extras),
            Notification::Shutter(extras, timestamp) => listener.notify_shutter(extras, *timestamp),
            Notification::Idle => listener.notify_idle(),
            Notification::Active => listener.notify_active(),
            Notification::Prepared(stream) => listener.notify_prepared(*stream),
            Notification::RequestQueueEmpty => listener.notify_request_queue_empty(),
            Notification::RepeatingRequestError(last) => {
                listener.notify_repeating_request_error(*last)
            }
            Notification::PartialResult(metadata, extras) => {
                listener.notify_partial_result(metadata, extras)
            }
        }
    }
}

/// Weakly held listener; a dropped client simply stops receiving callbacks.
#[derive(Default)]
pub(crate) struct ListenerSlot {
    inner: RwLock<Option<Weak<dyn NotificationListener>>>,
}

impl ListenerSlot {
    pub fn set(&self, listener: &Arc<dyn NotificationListener>) {
        *self.inner.write() = Some(Arc::downgrade(listener));
    }

    pub fn clear(&self) {
        self.inner.write().take();
    }

    pub fn get(&self) -> Option<Arc<dyn NotificationListener>> {
        self.inner.read().as_ref().and_then(Weak::upgrade)
    }

    pub fn fire(&self, notifications: impl IntoIterator<Item = Notification>) {
        let Some(listener) = self.get() else {
            return;
        };
        for notification in notifications {
            notification.deliver(listener.as_ref());
        }
    }

    pub fn fire_one(&self, notification: Notification) {
        self.fire([notification]);
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingListener;
    use super::*;

    #[test]
    fn slot_holds_listener_weakly() {
        let slot = ListenerSlot::default();
        let listener = RecordingListener::new();
        slot.set(&listener.as_dyn());
        slot.fire_one(Notification::Idle);
        assert_eq!(listener.count(|n| matches!(n, Notification::Idle)), 1);
        drop(listener);
        assert!(slot.get().is_none());
        slot.fire_one(Notification::Active);
    }
}
