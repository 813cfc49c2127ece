use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::metrics::Metrics;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a pooled buffer, stable across recycling.
///
/// Devices cache buffers by this id, so a recycled buffer keeps it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BufferId(pub u64);

impl BufferId {
    fn next() -> Self {
        Self(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// Handle to a pooled buffer.
///
/// When dropped, the buffer goes back to the originating pool and wakes any
/// waiter blocked in [`BufferPool::lease_timeout`].
///
/// # Example
/// ```rust
/// use aperture_core::prelude::BufferPool;
///
/// let pool = BufferPool::with_capacity(1, 64);
/// let mut lease = pool.try_lease().unwrap();
/// lease.fill(7);
/// assert_eq!(lease.as_slice()[0], 7);
/// assert_eq!(pool.outstanding(), 1);
/// drop(lease);
/// assert_eq!(pool.outstanding(), 0);
/// ```
pub struct BufferLease {
    pool: Arc<PoolInner>,
    id: BufferId,
    buf: Option<Vec<u8>>,
}

impl BufferLease {
    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }

    pub fn len(&self) -> usize {
        self.buf.as_ref().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite every byte with `value`.
    pub fn fill(&mut self, value: u8) {
        self.as_mut_slice().fill(value);
    }
}

impl fmt::Debug for BufferLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferLease")
            .field("id", &self.id)
            .field("len", &self.len())
            .finish()
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.recycle(self.id, buf);
        }
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BufferPoolStats {
    pub allocated: usize,
    pub free: usize,
    pub outstanding: usize,
    pub limit: usize,
}

/// Bounded pool of reusable buffers backing one stream.
///
/// Buffers are allocated lazily up to `limit`; leases beyond that wait for a
/// recycled buffer.
///
/// # Example
/// ```rust
/// use aperture_core::prelude::BufferPool;
///
/// let pool = BufferPool::new(128, 2);
/// assert!(pool.allocate_one());
/// assert_eq!(pool.stats().free, 1);
/// let a = pool.try_lease().unwrap();
/// let b = pool.try_lease().unwrap();
/// assert!(pool.try_lease().is_none());
/// assert_ne!(a.id(), b.id());
/// ```
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
    metrics: Arc<Metrics>,
}

impl BufferPool {
    /// Empty pool handing out `chunk_size`-byte buffers, at most `limit` at a time.
    pub fn new(chunk_size: usize, limit: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    free: Vec::new(),
                    allocated: 0,
                    outstanding: 0,
                    limit,
                }),
                returned: Condvar::new(),
                chunk_size,
            }),
            metrics: Arc::new(Metrics::default()),
        }
    }

    /// Pool with `capacity` preallocated buffers and an equal limit.
    pub fn with_capacity(capacity: usize, chunk_size: usize) -> Self {
        let pool = Self::new(chunk_size, capacity);
        while pool.allocate_one() {}
        pool
    }

    pub fn chunk_size(&self) -> usize {
        self.inner.chunk_size
    }

    pub fn limit(&self) -> usize {
        self.inner.state.lock().limit
    }

    /// Change the limit; surplus free buffers are dropped.
    pub fn set_limit(&self, limit: usize) {
        let mut state = self.inner.state.lock();
        state.limit = limit;
        while state.allocated > limit && state.free.pop().is_some() {
            state.allocated -= 1;
            self.metrics.release(1);
        }
        self.inner.returned.notify_all();
    }

    pub fn allocated(&self) -> usize {
        self.inner.state.lock().allocated
    }

    /// Buffers currently leased out.
    pub fn outstanding(&self) -> usize {
        self.inner.state.lock().outstanding
    }

    pub fn stats(&self) -> BufferPoolStats {
        let state = self.inner.state.lock();
        BufferPoolStats {
            allocated: state.allocated,
            free: state.free.len(),
            outstanding: state.outstanding,
            limit: state.limit,
        }
    }

    /// Allocate one more free buffer if below the limit.
    pub fn allocate_one(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.allocated >= state.limit {
            return false;
        }
        state.allocated += 1;
        state
            .free
            .push((BufferId::next(), vec![0; self.inner.chunk_size]));
        self.metrics.alloc();
        true
    }

    /// Lease without blocking; `None` when every allowed buffer is out.
    pub fn try_lease(&self) -> Option<BufferLease> {
        let mut state = self.inner.state.lock();
        self.lease_locked(&mut state)
    }

    /// Lease, waiting up to `wait` for a buffer to be recycled.
    pub fn lease_timeout(&self, wait: Duration) -> Option<BufferLease> {
        let deadline = Instant::now() + wait;
        let mut state = self.inner.state.lock();
        loop {
            if let Some(lease) = self.lease_locked(&mut state) {
                return Some(lease);
            }
            if self
                .inner
                .returned
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                let last = self.lease_locked(&mut state);
                if last.is_none() {
                    self.metrics.timeout();
                }
                return last;
            }
        }
    }

    /// Drop every free buffer, keeping leased ones. Returns how many were released.
    pub fn release_free(&self) -> usize {
        let mut state = self.inner.state.lock();
        let released = state.free.len();
        state.free.clear();
        state.allocated -= released;
        self.metrics.release(released as u64);
        released
    }

    pub fn metrics(&self) -> BufferPoolMetrics {
        BufferPoolMetrics(self.metrics.clone())
    }

    fn lease_locked(&self, state: &mut PoolState) -> Option<BufferLease> {
        let (id, buf) = match state.free.pop() {
            Some(entry) => {
                self.metrics.hit();
                entry
            }
            None if state.allocated < state.limit => {
                self.metrics.miss();
                self.metrics.alloc();
                state.allocated += 1;
                (BufferId::next(), vec![0; self.inner.chunk_size])
            }
            None => {
                self.metrics.backpressure();
                return None;
            }
        };
        state.outstanding += 1;
        Some(BufferLease {
            pool: self.inner.clone(),
            id,
            buf: Some(buf),
        })
    }
}

struct PoolInner {
    state: Mutex<PoolState>,
    returned: Condvar,
    chunk_size: usize,
}

struct PoolState {
    free: Vec<(BufferId, Vec<u8>)>,
    allocated: usize,
    outstanding: usize,
    limit: usize,
}

impl PoolInner {
    fn recycle(&self, id: BufferId, mut buf: Vec<u8>) {
        let mut state = self.state.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
        if state.allocated > state.limit {
            state.allocated -= 1;
        } else {
            buf.fill(0);
            state.free.push((id, buf));
        }
        self.returned.notify_all();
    }
}

/// Observability for buffer pool behavior.
#[derive(Clone)]
pub struct BufferPoolMetrics(Arc<Metrics>);

impl BufferPoolMetrics {
    pub fn hits(&self) -> u64 {
        self.0.hits()
    }

    pub fn misses(&self) -> u64 {
        self.0.misses()
    }

    pub fn allocations(&self) -> u64 {
        self.0.allocations()
    }

    pub fn releases(&self) -> u64 {
        self.0.releases()
    }

    pub fn backpressure(&self) -> u64 {
        self.0.backpressure_count()
    }

    pub fn timeouts(&self) -> u64 {
        self.0.timeouts()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn recycled_buffers_keep_their_identity() {
        let pool = BufferPool::new(16, 1);
        let first = pool.try_lease().expect("lease");
        let id = first.id();
        drop(first);
        let second = pool.try_lease().expect("lease again");
        assert_eq!(second.id(), id);
        assert_eq!(pool.metrics().hits(), 1);
        assert_eq!(pool.metrics().allocations(), 1);
    }

    #[test]
    fn lease_timeout_wakes_on_recycle() {
        let pool = BufferPool::new(16, 1);
        let held = pool.try_lease().expect("lease");
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.lease_timeout(Duration::from_secs(5)).map(|l| l.id()))
        };
        thread::sleep(Duration::from_millis(20));
        let id = held.id();
        drop(held);
        assert_eq!(waiter.join().expect("join"), Some(id));
    }

    #[test]
    fn lease_timeout_gives_up() {
        let pool = BufferPool::new(16, 0);
        assert!(pool.lease_timeout(Duration::from_millis(10)).is_none());
        assert_eq!(pool.metrics().timeouts(), 1);
    }

    #[test]
    fn release_free_keeps_outstanding() {
        let pool = BufferPool::with_capacity(3, 8);
        let held = pool.try_lease().expect("lease");
        assert_eq!(pool.release_free(), 2);
        assert_eq!(pool.stats().allocated, 1);
        drop(held);
        assert_eq!(
            pool.stats(),
            BufferPoolStats {
                allocated: 1,
                free: 1,
                outstanding: 0,
                limit: 3
            }
        );
    }

    #[test]
    fn lowering_limit_drops_returning_buffers() {
        let pool = BufferPool::with_capacity(2, 8);
        let a = pool.try_lease().expect("a");
        let b = pool.try_lease().expect("b");
        pool.set_limit(1);
        drop(a);
        drop(b);
        assert_eq!(pool.stats().allocated, 1);
        assert_eq!(pool.stats().free, 1);
    }
}
