use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;

const DEFAULT_WINDOW: usize = 120;

/// Rolling timing metrics for a pipeline stage.
///
/// # Example
/// ```rust
/// use aperture::prelude::StageMetrics;
///
/// let metrics = StageMetrics::default();
/// metrics.record(std::time::Duration::from_millis(5));
/// assert!(metrics.total_samples() >= 1);
/// ```
#[derive(Default, Clone)]
pub struct StageMetrics {
    inner: Arc<StageState>,
}

#[derive(Default)]
struct StageState {
    count: AtomicU64,
    last_nanos: AtomicU64,
    window: Mutex<WindowState>,
}

struct WindowState {
    samples: VecDeque<(Instant, u64)>,
    max: usize,
}

impl Default for WindowState {
    fn default() -> Self {
        Self {
            samples: VecDeque::new(),
            max: DEFAULT_WINDOW,
        }
    }
}

impl StageMetrics {
    /// Record a single duration sample.
    pub fn record(&self, dur: Duration) {
        let nanos = dur.as_nanos().min(u64::MAX as u128) as u64;
        self.inner.count.fetch_add(1, Ordering::Relaxed);
        self.inner.last_nanos.store(nanos, Ordering::Relaxed);
        let mut win = self.inner.window.lock();
        win.samples.push_back((Instant::now(), nanos));
        while win.samples.len() > win.max {
            win.samples.pop_front();
        }
    }

    /// Change the window size used for rolling averages. Minimum of 1.
    pub fn set_window_size(&self, window: usize) {
        let mut win = self.inner.window.lock();
        win.max = window.max(1);
        while win.samples.len() > win.max {
            win.samples.pop_front();
        }
    }

    /// Samples within the current window.
    pub fn samples(&self) -> u64 {
        self.inner.window.lock().samples.len() as u64
    }

    /// Total samples recorded over the lifetime.
    pub fn total_samples(&self) -> u64 {
        self.inner.count.load(Ordering::Relaxed)
    }

    /// Rolling average of samples in milliseconds.
    pub fn avg_millis(&self) -> Option<f64> {
        let win = self.inner.window.lock();
        let count = win.samples.len();
        if count == 0 {
            return None;
        }
        let total: u128 = win.samples.iter().map(|(_, n)| *n as u128).sum();
        Some(total as f64 / 1_000_000.0 / count as f64)
    }

    /// Most recent sample in milliseconds.
    pub fn last_millis(&self) -> Option<f64> {
        let last = self.inner.last_nanos.load(Ordering::Relaxed);
        if last == 0 {
            None
        } else {
            Some(last as f64 / 1_000_000.0)
        }
    }

    /// Rolling rate based on sample timestamps.
    pub fn fps(&self) -> Option<f64> {
        let win = self.inner.window.lock();
        if win.samples.len() < 2 {
            return None;
        }
        let first = win.samples.front()?.0;
        let last = win.samples.back()?.0;
        let span = last.saturating_duration_since(first).as_secs_f64();
        (span > 0.0).then(|| win.samples.len() as f64 / span)
    }
}

#[derive(Default)]
struct FrameCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    errored: AtomicU64,
    dropped: AtomicU64,
}

/// Metrics for one pipeline.
#[derive(Clone, Default)]
pub struct PipelineMetrics {
    /// Time spent in a single device submission call.
    pub submission: StageMetrics,
    /// Time from submission to final result delivery.
    pub result: StageMetrics,
    counters: Arc<FrameCounters>,
}

impl PipelineMetrics {
    pub(crate) fn submitted(&self, n: u64) {
        self.counters.submitted.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn completed(&self) {
        self.counters.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn errored(&self) {
        self.counters.errored.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dropped(&self, n: u64) {
        self.counters.dropped.fetch_add(n, Ordering::Relaxed);
    }

    /// Requests accepted by the device.
    pub fn submitted_frames(&self) -> u64 {
        self.counters.submitted.load(Ordering::Relaxed)
    }

    /// Frames retired with a final result delivered.
    pub fn completed_frames(&self) -> u64 {
        self.counters.completed.load(Ordering::Relaxed)
    }

    /// Frames that reported a request or result error.
    pub fn errored_frames(&self) -> u64 {
        self.counters.errored.load(Ordering::Relaxed)
    }

    /// Requests discarded before reaching the device.
    pub fn dropped_frames(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_is_bounded() {
        let metrics = StageMetrics::default();
        metrics.set_window_size(2);
        for ms in [1, 2, 3] {
            metrics.record(Duration::from_millis(ms));
        }
        assert_eq!(metrics.samples(), 2);
        assert_eq!(metrics.total_samples(), 3);
        let avg = metrics.avg_millis().expect("avg");
        assert!((avg - 2.5).abs() < 1e-6);
        assert_eq!(metrics.last_millis(), Some(3.0));
    }

    #[test]
    fn counters_are_shared_between_clones() {
        let metrics = PipelineMetrics::default();
        let clone = metrics.clone();
        clone.submitted(3);
        clone.dropped(1);
        metrics.errored();
        assert_eq!(metrics.submitted_frames(), 3);
        assert_eq!(metrics.dropped_frames(), 1);
        assert_eq!(clone.errored_frames(), 1);
        assert_eq!(clone.completed_frames(), 0);
    }
}
