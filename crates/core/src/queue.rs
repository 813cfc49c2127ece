use crossbeam_queue::ArrayQueue;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// Result of attempting to enqueue.
#[derive(Debug, PartialEq, Eq)]
pub enum SendOutcome<T> {
    /// Value was accepted.
    Ok,
    /// Queue is full; the value is handed back.
    Full(T),
    /// Queue is closed; the value is handed back.
    Closed(T),
}

/// Result of attempting to dequeue.
///
/// # Example
/// ```rust
/// use aperture_core::prelude::{bounded, RecvOutcome};
///
/// let (_tx, rx) = bounded::<u8>(1);
/// assert!(matches!(rx.recv(), RecvOutcome::Empty));
/// rx.close();
/// assert!(matches!(rx.recv(), RecvOutcome::Closed));
/// ```
#[derive(Debug)]
pub enum RecvOutcome<T> {
    Data(T),
    /// Queue has been closed and drained.
    Closed,
    Empty,
}

/// Bounded sender handle.
///
/// # Example
/// ```rust
/// use aperture_core::prelude::{bounded, SendOutcome};
///
/// let (tx, _rx) = bounded::<u8>(1);
/// assert_eq!(tx.send(1), SendOutcome::Ok);
/// assert_eq!(tx.send(2), SendOutcome::Full(2));
/// ```
#[derive(Clone)]
pub struct BoundedTx<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> BoundedTx<T> {
    /// Attempt to send without blocking.
    pub fn send(&self, value: T) -> SendOutcome<T> {
        if self.inner.closed.load(Ordering::Acquire) {
            return SendOutcome::Closed(value);
        }
        match self.inner.queue.push(value) {
            Ok(()) => SendOutcome::Ok,
            Err(value) => SendOutcome::Full(value),
        }
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }
}

/// Bounded receiver handle.
#[derive(Clone)]
pub struct BoundedRx<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> BoundedRx<T> {
    /// Attempt to receive without blocking.
    pub fn recv(&self) -> RecvOutcome<T> {
        match self.inner.queue.pop() {
            Some(value) => RecvOutcome::Data(value),
            None => {
                if self.inner.closed.load(Ordering::Acquire) {
                    RecvOutcome::Closed
                } else {
                    RecvOutcome::Empty
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.queue.is_empty()
    }

    /// Mark the queue as closed; senders see `Closed` from now on.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }
}

#[cfg(feature = "async")]
impl<T> BoundedRx<T> {
    /// Async helper that yields until data or closure.
    pub async fn recv_async(&self) -> RecvOutcome<T> {
        loop {
            match self.recv() {
                RecvOutcome::Empty => tokio::task::yield_now().await,
                other => return other,
            }
        }
    }
}

struct QueueInner<T> {
    queue: ArrayQueue<T>,
    closed: AtomicBool,
}

/// Create a bounded lock-free queue with the given capacity.
pub fn bounded<T>(capacity: usize) -> (BoundedTx<T>, BoundedRx<T>) {
    let inner = Arc::new(QueueInner {
        queue: ArrayQueue::new(capacity.max(1)),
        closed: AtomicBool::new(false),
    });
    (
        BoundedTx {
            inner: inner.clone(),
        },
        BoundedRx { inner },
    )
}

/// Newest-value slot: readers always observe the latest published value.
///
/// # Example
/// ```rust
/// use aperture_core::prelude::{newest, RecvOutcome};
///
/// let (tx, rx) = newest::<u8>();
/// tx.send(5);
/// tx.send(6);
/// assert!(matches!(rx.recv(), RecvOutcome::Data(6)));
/// ```
pub fn newest<T>() -> (NewestTx<T>, NewestRx<T>)
where
    T: Clone,
{
    let shared = Arc::new(NewestInner {
        slot: parking_lot::RwLock::new(None),
        closed: AtomicBool::new(false),
    });
    (
        NewestTx {
            inner: shared.clone(),
        },
        NewestRx { inner: shared },
    )
}

/// Publisher side of a newest-value slot.
#[derive(Clone)]
pub struct NewestTx<T> {
    inner: Arc<NewestInner<T>>,
}

impl<T: Clone> NewestTx<T> {
    /// Overwrite with the latest value; ignored once closed.
    pub fn send(&self, value: T) {
        if !self.inner.closed.load(Ordering::Acquire) {
            *self.inner.slot.write() = Some(value);
        }
    }

    /// Forget the published value.
    pub fn clear(&self) {
        *self.inner.slot.write() = None;
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }
}

/// Reader side of a newest-value slot.
#[derive(Clone)]
pub struct NewestRx<T> {
    inner: Arc<NewestInner<T>>,
}

impl<T: Clone> NewestRx<T> {
    /// Get the latest value if present.
    pub fn recv(&self) -> RecvOutcome<T> {
        let read = self.inner.slot.read();
        if let Some(value) = read.as_ref() {
            RecvOutcome::Data(value.clone())
        } else if self.inner.closed.load(Ordering::Acquire) {
            RecvOutcome::Closed
        } else {
            RecvOutcome::Empty
        }
    }

    /// Latest value, if any, ignoring closure.
    pub fn latest(&self) -> Option<T> {
        self.inner.slot.read().clone()
    }
}

struct NewestInner<T> {
    slot: parking_lot::RwLock<Option<T>>,
    closed: AtomicBool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_queue_hands_value_back() {
        let (tx, rx) = bounded::<String>(1);
        assert_eq!(tx.send("a".into()), SendOutcome::Ok);
        assert_eq!(tx.send("b".into()), SendOutcome::Full("b".to_string()));
        assert_eq!(rx.len(), 1);
        rx.close();
        assert_eq!(tx.send("c".into()), SendOutcome::Closed("c".to_string()));
        assert!(matches!(rx.recv(), RecvOutcome::Data(ref s) if s == "a"));
        assert!(matches!(rx.recv(), RecvOutcome::Closed));
    }

    #[test]
    fn newest_clear_forgets_value() {
        let (tx, rx) = newest::<u32>();
        tx.send(1);
        assert_eq!(rx.latest(), Some(1));
        tx.clear();
        assert!(matches!(rx.recv(), RecvOutcome::Empty));
    }

    #[cfg(feature = "async")]
    #[tokio::test]
    async fn async_recv_waits_for_closure() {
        let (tx, rx) = bounded::<u8>(2);
        assert_eq!(tx.send(9), SendOutcome::Ok);
        assert!(matches!(rx.recv_async().await, RecvOutcome::Data(9)));
        let closer = tx.clone();
        tokio::spawn(async move { closer.close() });
        assert!(matches!(rx.recv_async().await, RecvOutcome::Closed));
    }
}
