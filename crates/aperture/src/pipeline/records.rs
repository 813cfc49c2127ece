use std::collections::{BTreeMap, BTreeSet, HashMap};

use aperture_core::prelude::BufferId;
use aperture_device::{FrameNumber, StreamId};
use parking_lot::Mutex;

#[derive(Debug, Default)]
struct Ledger {
    /// Buffer identities the device has seen, per stream.
    caches: HashMap<StreamId, BTreeSet<BufferId>>,
    /// Buffers handed out with a request, keyed by the request's frame.
    in_flight: BTreeMap<(FrameNumber, StreamId), BufferId>,
    /// Buffers handed out through a device pull.
    requested: HashMap<BufferId, StreamId>,
}

/// Outstanding per-buffer ledger shared by the dispatcher, reconciler and pull handler.
#[derive(Debug, Default)]
pub(crate) struct BufferRecords {
    ledger: Mutex<Ledger>,
}

impl BufferRecords {
    /// Remember that the device now knows `buffer`; returns true on first sight.
    pub fn cache(&self, stream_id: StreamId, buffer: BufferId) -> bool {
        self.ledger
            .lock()
            .caches
            .entry(stream_id)
            .or_default()
            .insert(buffer)
    }

    /// Forget a cached identity that never reached the device.
    pub fn uncache(&self, stream_id: StreamId, buffer: BufferId) {
        if let Some(cache) = self.ledger.lock().caches.get_mut(&stream_id) {
            cache.remove(&buffer);
        }
    }

    pub fn push_in_flight(&self, frame: FrameNumber, stream_id: StreamId, buffer: BufferId) {
        self.ledger.lock().in_flight.insert((frame, stream_id), buffer);
    }

    pub fn pop_in_flight(&self, frame: FrameNumber, stream_id: StreamId) -> Option<BufferId> {
        self.ledger.lock().in_flight.remove(&(frame, stream_id))
    }

    pub fn push_requested(&self, buffer: BufferId, stream_id: StreamId) {
        self.ledger.lock().requested.insert(buffer, stream_id);
    }

    pub fn pop_requested(&self, buffer: BufferId) -> Option<StreamId> {
        self.ledger.lock().requested.remove(&buffer)
    }

    /// Drop identity caches of streams that are no longer configured.
    pub fn remove_inactive_caches(&self, active: &[StreamId]) {
        self.ledger
            .lock()
            .caches
            .retain(|stream_id, _| active.contains(stream_id));
    }

    /// Every id in `ids` is one this pipeline handed to the device for `stream_id`.
    pub fn verify_buffer_ids(&self, stream_id: StreamId, ids: &[BufferId]) -> bool {
        let ledger = self.ledger.lock();
        let Some(cache) = ledger.caches.get(&stream_id) else {
            return ids.is_empty();
        };
        ids.iter().all(|id| cache.contains(id))
    }

    /// Buffers of `stream_id` the device currently holds according to the ledger.
    pub fn outstanding(&self, stream_id: StreamId) -> usize {
        let ledger = self.ledger.lock();
        ledger.in_flight.keys().filter(|(_, s)| *s == stream_id).count()
            + ledger.requested.values().filter(|s| **s == stream_id).count()
    }

    #[cfg(test)]
    pub fn in_flight_keys(&self) -> Vec<(FrameNumber, StreamId)> {
        self.ledger.lock().in_flight.keys().copied().collect()
    }

    #[cfg(test)]
    pub fn requested_count(&self) -> usize {
        self.ledger.lock().requested.len()
    }

    /// Move every record belonging to `streams` into a fresh ledger.
    pub fn take(&self, streams: &[StreamId]) -> BufferRecords {
        let mut ledger = self.ledger.lock();
        let caches = streams
            .iter()
            .filter_map(|id| ledger.caches.remove(id).map(|cache| (*id, cache)))
            .collect();
        let (moved, kept): (BTreeMap<_, _>, BTreeMap<_, _>) = std::mem::take(&mut ledger.in_flight)
            .into_iter()
            .partition(|((_, stream_id), _)| streams.contains(stream_id));
        ledger.in_flight = kept;
        let (requested, rest): (HashMap<_, _>, HashMap<_, _>) =
            std::mem::take(&mut ledger.requested)
                .into_iter()
                .partition(|(_, stream_id)| streams.contains(stream_id));
        ledger.requested = rest;
        BufferRecords {
            ledger: Mutex::new(Ledger {
                caches,
                in_flight: moved,
                requested,
            }),
        }
    }

    pub fn clear(&self) {
        *self.ledger.lock() = Ledger::default();
    }
}
