use std::{
    collections::VecDeque,
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use aperture_device::StreamId;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use super::{
    error::PipelineError,
    stream::{PrepareStart, Stream},
};

type PreparedCallback = Box<dyn Fn(StreamId) + Send + Sync>;

type Item = (Option<usize>, Arc<Stream>);

#[derive(Default)]
struct PreparerState {
    pending: VecDeque<Item>,
    current: Option<Item>,
    current_complete: bool,
    cancel_now: bool,
    /// The cancelled current item is dropped rather than requeued.
    discard_current: bool,
    active: bool,
}

struct PreparerInner {
    state: Mutex<PreparerState>,
    idle: Condvar,
    on_prepared: PreparedCallback,
}

/// Background worker filling stream pools ahead of their first use.
///
/// Every stream handed to [`StreamPreparer::prepare`] is reported exactly once
/// through the callback, whether preparation finished, failed or was cleared.
pub(crate) struct StreamPreparer {
    inner: Arc<PreparerInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StreamPreparer {
    pub fn new<F>(on_prepared: F) -> Self
    where
        F: Fn(StreamId) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(PreparerInner {
                state: Mutex::new(PreparerState::default()),
                idle: Condvar::new(),
                on_prepared: Box::new(on_prepared),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Queue `stream`; reports immediately if it already has enough buffers.
    pub fn prepare(
        &self,
        max_count: Option<usize>,
        stream: Arc<Stream>,
    ) -> Result<(), PipelineError> {
        if stream.start_prepare(max_count)? == PrepareStart::Prepared {
            debug!(stream_id = stream.id().0, "stream already prepared");
            (self.inner.on_prepared)(stream.id());
            return Ok(());
        }
        let mut state = self.inner.state.lock();
        if !state.active {
            if let Err(err) = self.spawn() {
                drop(state);
                stream.cancel_prepare();
                (self.inner.on_prepared)(stream.id());
                return Err(err);
            }
            state.cancel_now = false;
            state.discard_current = false;
            state.active = true;
        }
        debug!(stream_id = stream.id().0, "stream queued for preparation");
        state.pending.push_back((max_count, stream));
        Ok(())
    }

    /// Stop work so requests can flow; the interrupted stream goes back on the queue.
    pub fn pause(&self, timeout: Duration) {
        let mut state = self.inner.state.lock();
        let mut saved: VecDeque<Item> = state.pending.drain(..).collect();
        let current = state.current.clone();
        state.cancel_now = true;
        let deadline = Instant::now() + timeout;
        while state.active {
            if self.inner.idle.wait_until(&mut state, deadline).timed_out() && state.active {
                error!("timed out pausing the stream preparer");
                saved.extend(state.pending.drain(..));
                state.pending = saved;
                return;
            }
        }
        if let Some(item) = current
            && !state.current_complete
        {
            saved.push_back(item);
        }
        saved.extend(state.pending.drain(..));
        for (_, stream) in &saved {
            stream.cancel_prepare();
        }
        state.pending = saved;
    }

    /// Restart queued work after a pause.
    pub fn resume(&self) -> Result<(), PipelineError> {
        let mut finished = Vec::new();
        {
            let mut state = self.inner.state.lock();
            if state.active {
                error!("resuming a stream preparer that is still running");
                return Err(PipelineError::Busy("stream preparer is running".into()));
            }
            state.pending.retain(|(max_count, stream)| match stream.start_prepare(*max_count) {
                Ok(PrepareStart::NeedsWork) => true,
                Ok(PrepareStart::Prepared) => {
                    finished.push(stream.id());
                    false
                }
                Err(err) => {
                    warn!(
                        stream_id = stream.id().0,
                        error = %err,
                        "cannot resume stream preparation"
                    );
                    finished.push(stream.id());
                    false
                }
            });
            if !state.pending.is_empty() {
                if let Err(err) = self.spawn() {
                    for (_, stream) in state.pending.drain(..) {
                        stream.cancel_prepare();
                        finished.push(stream.id());
                    }
                    drop(state);
                    self.report(finished);
                    return Err(err);
                }
                state.cancel_now = false;
                state.discard_current = false;
                state.active = true;
            }
        }
        self.report(finished);
        Ok(())
    }

    /// Drop every queued stream and cancel the current one; each is still reported.
    pub fn clear(&self) {
        let dropped: Vec<_> = {
            let mut state = self.inner.state.lock();
            if state.active && state.current.is_some() {
                state.discard_current = true;
            }
            state.cancel_now = true;
            state.pending.drain(..).map(|(_, stream)| stream).collect()
        };
        for stream in &dropped {
            stream.cancel_prepare();
        }
        self.report(dropped.iter().map(|s| s.id()).collect());
    }

    /// Clear and wait for the worker to exit.
    pub fn stop(&self, timeout: Duration) {
        self.clear();
        {
            let mut state = self.inner.state.lock();
            let deadline = Instant::now() + timeout;
            while state.active {
                if self.inner.idle.wait_until(&mut state, deadline).timed_out() {
                    warn!("stream preparer did not stop in time");
                    return;
                }
            }
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    #[cfg(test)]
    pub fn is_active(&self) -> bool {
        self.inner.state.lock().active
    }

    #[cfg(test)]
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    fn report(&self, streams: Vec<StreamId>) {
        for id in streams {
            (self.inner.on_prepared)(id);
        }
    }

    fn spawn(&self) -> Result<(), PipelineError> {
        let mut worker = self.worker.lock();
        if let Some(old) = worker.take() {
            let _ = old.join();
        }
        let inner = self.inner.clone();
        let handle = thread::Builder::new()
            .name("aperture-prepare".into())
            .spawn(move || inner.run())
            .map_err(|err| {
                error!(error = %err, "failed to spawn stream preparer");
                PipelineError::DeviceFault(format!("cannot start preparer: {err}"))
            })?;
        *worker = Some(handle);
        Ok(())
    }
}

impl PreparerInner {
    fn run(&self) {
        loop {
            let stream = {
                let mut state = self.state.lock();
                match state.current.clone() {
                    None => match state.pending.pop_front() {
                        None => {
                            debug!("stream preparer out of work");
                            state.active = false;
                            self.idle.notify_all();
                            return;
                        }
                        Some(item) => {
                            let stream = item.1.clone();
                            state.current = Some(item);
                            state.current_complete = false;
                            state.discard_current = false;
                            debug!(stream_id = stream.id().0, "preparing stream");
                            stream
                        }
                    },
                    Some((_, stream)) if state.cancel_now => {
                        stream.cancel_prepare();
                        state.current = None;
                        state.cancel_now = false;
                        let discard = std::mem::take(&mut state.discard_current);
                        drop(state);
                        debug!(stream_id = stream.id().0, "stream preparation cancelled");
                        if discard {
                            (self.on_prepared)(stream.id());
                        }
                        continue;
                    }
                    Some((_, stream)) => stream,
                }
            };

            match stream.prepare_next_buffer() {
                Ok(false) => continue,
                Ok(true) => debug!(stream_id = stream.id().0, "stream prepared"),
                Err(err) => {
                    error!(stream_id = stream.id().0, error = %err, "stream preparation failed");
                    stream.cancel_prepare();
                }
            }
            {
                let mut state = self.state.lock();
                state.current = None;
                state.current_complete = true;
            }
            (self.on_prepared)(stream.id());
        }
    }
}

impl Drop for StreamPreparer {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.cancel_now = true;
        for (_, stream) in state.pending.drain(..) {
            stream.cancel_prepare();
        }
    }
}
