//! Busy/idle aggregation across independently reporting components.
use std::{
    collections::VecDeque,
    sync::Arc,
    thread::{self, JoinHandle},
};

use parking_lot::{Condvar, Mutex};

/// Handle returned by [`StatusTracker::add_component`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComponentId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Idle,
    Active,
}

type Callback = Box<dyn Fn(bool) + Send + Sync>;

/// Aggregates component states on a worker thread and invokes a callback whenever
/// the aggregate flips between idle (every component idle) and active.
///
/// Marking is non-blocking for the caller apart from a short queue lock, so it is
/// safe to call while holding other locks; the callback runs on the tracker thread
/// with no tracker lock held.
///
/// # Example
/// ```rust
/// use std::sync::mpsc;
/// use aperture_core::prelude::StatusTracker;
///
/// let (tx, rx) = mpsc::channel();
/// let tracker = StatusTracker::start("doc", move |idle| {
///     let _ = tx.send(idle);
/// });
/// let id = tracker.add_component("worker");
/// tracker.mark_active(id);
/// assert_eq!(rx.recv().unwrap(), false);
/// tracker.mark_idle(id);
/// assert_eq!(rx.recv().unwrap(), true);
/// tracker.stop();
/// ```
pub struct StatusTracker {
    inner: Arc<TrackerInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct TrackerInner {
    state: Mutex<TrackerState>,
    wake: Condvar,
    on_change: Callback,
}

struct TrackerState {
    components: Vec<Option<(String, ComponentState)>>,
    pending: VecDeque<(ComponentId, Option<ComponentState>)>,
    reported_idle: bool,
    stop: bool,
}

impl StatusTracker {
    /// Spawn the aggregation thread. The aggregate starts idle.
    pub fn start<F>(name: &str, on_change: F) -> Self
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let inner = Arc::new(TrackerInner {
            state: Mutex::new(TrackerState {
                components: Vec::new(),
                pending: VecDeque::new(),
                reported_idle: true,
                stop: false,
            }),
            wake: Condvar::new(),
            on_change: Box::new(on_change),
        });
        let worker = {
            let inner = inner.clone();
            thread::Builder::new()
                .name(format!("{name}-status"))
                .spawn(move || inner.run())
        };
        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::error!(error = %err, "failed to spawn status tracker thread");
                None
            }
        };
        Self {
            inner,
            worker: Mutex::new(worker),
        }
    }

    /// Register a component; it starts idle.
    pub fn add_component(&self, name: &str) -> ComponentId {
        let mut state = self.inner.state.lock();
        let id = ComponentId(state.components.len());
        state
            .components
            .push(Some((name.to_string(), ComponentState::Idle)));
        id
    }

    /// Forget a component; pending marks for it are dropped.
    pub fn remove_component(&self, id: ComponentId) {
        self.push(id, None);
    }

    pub fn mark_idle(&self, id: ComponentId) {
        self.push(id, Some(ComponentState::Idle));
    }

    pub fn mark_active(&self, id: ComponentId) {
        self.push(id, Some(ComponentState::Active));
    }

    /// Last aggregate reported to the callback.
    pub fn is_idle(&self) -> bool {
        self.inner.state.lock().reported_idle
    }

    /// Names of components currently marked active.
    pub fn active_components(&self) -> Vec<String> {
        self.inner
            .state
            .lock()
            .components
            .iter()
            .flatten()
            .filter(|(_, s)| *s == ComponentState::Active)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Stop the worker and join it. Idempotent.
    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            state.stop = true;
            self.inner.wake.notify_all();
        }
        if let Some(handle) = self.worker.lock().take()
            && handle.thread().id() != thread::current().id()
        {
            let _ = handle.join();
        }
    }

    fn push(&self, id: ComponentId, change: Option<ComponentState>) {
        let mut state = self.inner.state.lock();
        state.pending.push_back((id, change));
        self.inner.wake.notify_all();
    }
}

impl Drop for StatusTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl TrackerInner {
    fn run(&self) {
        loop {
            let flipped = {
                let mut state = self.state.lock();
                while state.pending.is_empty() && !state.stop {
                    self.wake.wait(&mut state);
                }
                if state.stop {
                    return;
                }
                while let Some((ComponentId(idx), change)) = state.pending.pop_front() {
                    let Some(slot) = state.components.get_mut(idx) else {
                        continue;
                    };
                    match change {
                        Some(next) => {
                            if let Some((_, current)) = slot.as_mut() {
                                *current = next;
                            }
                        }
                        None => *slot = None,
                    }
                }
                let idle = state
                    .components
                    .iter()
                    .flatten()
                    .all(|(_, s)| *s == ComponentState::Idle);
                if idle != state.reported_idle {
                    state.reported_idle = idle;
                    Some(idle)
                } else {
                    None
                }
            };
            if let Some(idle) = flipped {
                (self.on_change)(idle);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::mpsc, time::Duration};

    fn tracker() -> (StatusTracker, mpsc::Receiver<bool>) {
        let (tx, rx) = mpsc::channel();
        let tracker = StatusTracker::start("test", move |idle| {
            let _ = tx.send(idle);
        });
        (tracker, rx)
    }

    #[test]
    fn aggregate_is_idle_only_when_all_idle() {
        let (tracker, rx) = tracker();
        let a = tracker.add_component("a");
        let b = tracker.add_component("b");
        tracker.mark_active(a);
        assert!(!rx.recv_timeout(Duration::from_secs(1)).expect("active"));
        tracker.mark_active(b);
        tracker.mark_idle(a);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(tracker.active_components(), vec!["b".to_string()]);
        tracker.mark_idle(b);
        assert!(rx.recv_timeout(Duration::from_secs(1)).expect("idle"));
        tracker.stop();
    }

    #[test]
    fn removing_an_active_component_reports_idle() {
        let (tracker, rx) = tracker();
        let a = tracker.add_component("a");
        tracker.mark_active(a);
        assert!(!rx.recv_timeout(Duration::from_secs(1)).expect("active"));
        tracker.remove_component(a);
        assert!(rx.recv_timeout(Duration::from_secs(1)).expect("idle"));
    }

    #[test]
    fn stop_is_idempotent() {
        let (tracker, _rx) = tracker();
        tracker.stop();
        tracker.stop();
    }
}
