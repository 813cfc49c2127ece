use std::sync::atomic::{AtomicU64, Ordering};

/// Counters describing buffer pool pressure.
///
/// `backpressure` counts lease attempts refused because the pool sat at its limit,
/// `timeouts` counts waits that gave up.
///
/// # Example
/// ```rust
/// use aperture_core::metrics::Metrics;
///
/// let metrics = Metrics::default();
/// metrics.hit();
/// metrics.backpressure();
/// assert_eq!(metrics.hits(), 1);
/// assert_eq!(metrics.backpressure_count(), 1);
/// ```
#[derive(Debug, Default)]
pub struct Metrics {
    hits: AtomicU64,
    misses: AtomicU64,
    allocations: AtomicU64,
    releases: AtomicU64,
    backpressure: AtomicU64,
    timeouts: AtomicU64,
}

impl Metrics {
    /// Lease served from the free list.
    pub fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Lease found the free list empty.
    pub fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn alloc(&self) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    /// Free buffers dropped by a teardown.
    pub fn release(&self, count: u64) {
        self.releases.fetch_add(count, Ordering::Relaxed);
    }

    pub fn backpressure(&self) {
        self.backpressure.fetch_add(1, Ordering::Relaxed);
    }

    pub fn timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    pub fn releases(&self) -> u64 {
        self.releases.load(Ordering::Relaxed)
    }

    pub fn backpressure_count(&self) -> u64 {
        self.backpressure.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }
}
