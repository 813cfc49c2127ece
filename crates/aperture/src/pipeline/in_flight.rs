use std::{
    collections::{BTreeMap, BTreeSet},
    time::{Duration, Instant},
};

use aperture_core::prelude::Settings;
use aperture_device::{FrameNumber, StreamBuffer, StreamId};

use super::{listener::ClientError, request::ResultExtras};

/// Independent ordering domains for shutters and results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResultCategory {
    Regular,
    Reprocess,
    ZslStill,
}

impl ResultCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ResultCategory::Regular => "regular",
            ResultCategory::Reprocess => "reprocess",
            ResultCategory::ZslStill => "zsl-still",
        }
    }
}

/// Next expected frame number per category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct CategoryCursor {
    regular: FrameNumber,
    reprocess: FrameNumber,
    zsl_still: FrameNumber,
}

impl CategoryCursor {
    /// Accept `frame` if it does not go backwards; returns the expected minimum otherwise.
    pub fn advance(
        &mut self,
        category: ResultCategory,
        frame: FrameNumber,
    ) -> Result<(), FrameNumber> {
        let next = match category {
            ResultCategory::Regular => &mut self.regular,
            ResultCategory::Reprocess => &mut self.reprocess,
            ResultCategory::ZslStill => &mut self.zsl_still,
        };
        if frame < *next {
            return Err(*next);
        }
        *next = frame + 1;
        Ok(())
    }
}

/// Bookkeeping for one submitted frame.
#[derive(Debug)]
pub(crate) struct InFlightRequest {
    pub extras: ResultExtras,
    /// Shutter time; zero until the shutter arrives.
    pub shutter_timestamp: i64,
    pub sensor_timestamp: i64,
    pub request_status: Option<ClientError>,
    /// Input plus output buffers still owed by the device.
    pub num_buffers_left: i32,
    pub has_input_buffer: bool,
    pub have_result_metadata: bool,
    /// No result metadata will be delivered for this frame.
    pub skip_result_metadata: bool,
    pub notify_buffer_errors: bool,
    /// Final metadata held back until the shutter arrives.
    pub pending_metadata: Option<Settings>,
    pub collected_partial: Settings,
    pub physical_metadata: Vec<(String, Settings)>,
    /// Buffers held back until the shutter arrives.
    pub pending_output_buffers: Vec<StreamBuffer>,
    /// Physical cameras whose metadata is still expected.
    pub physical_camera_ids: BTreeSet<String>,
    pub output_streams: Vec<StreamId>,
    /// False for all but the last request of a high-speed batch.
    pub has_callback: bool,
    pub max_expected_duration: Duration,
    pub still_capture: bool,
    pub zsl_capture: bool,
    pub rotate_and_crop_auto: bool,
    pub registered_at: Instant,
}

impl InFlightRequest {
    pub fn new(
        extras: ResultExtras,
        output_streams: Vec<StreamId>,
        has_input_buffer: bool,
    ) -> Self {
        let num_buffers_left = output_streams.len() as i32 + i32::from(has_input_buffer);
        Self {
            extras,
            shutter_timestamp: 0,
            sensor_timestamp: 0,
            request_status: None,
            num_buffers_left,
            has_input_buffer,
            have_result_metadata: false,
            skip_result_metadata: false,
            notify_buffer_errors: true,
            pending_metadata: None,
            collected_partial: Settings::new(),
            physical_metadata: Vec::new(),
            pending_output_buffers: Vec::new(),
            physical_camera_ids: BTreeSet::new(),
            output_streams,
            has_callback: true,
            max_expected_duration: Duration::ZERO,
            still_capture: false,
            zsl_capture: false,
            rotate_and_crop_auto: false,
            registered_at: Instant::now(),
        }
    }

    pub fn category(&self) -> ResultCategory {
        if self.has_input_buffer {
            ResultCategory::Reprocess
        } else if self.zsl_capture && self.still_capture {
            ResultCategory::ZslStill
        } else {
            ResultCategory::Regular
        }
    }

    /// Every buffer is back and the metadata question is settled one way or the other.
    pub fn is_ready_to_remove(&self) -> bool {
        self.num_buffers_left == 0
            && (self.skip_result_metadata
                || (self.have_result_metadata && self.shutter_timestamp != 0))
    }
}

/// Frame-number keyed table of submitted requests.
#[derive(Debug, Default)]
pub(crate) struct InFlightTable {
    entries: BTreeMap<FrameNumber, InFlightRequest>,
    expected_duration: Duration,
    shutter_cursor: CategoryCursor,
    result_cursor: CategoryCursor,
    last_completed: BTreeMap<&'static str, FrameNumber>,
}

impl InFlightTable {
    /// Register a frame; returns true if the table was empty before.
    pub fn insert(&mut self, frame: FrameNumber, request: InFlightRequest) -> bool {
        let was_empty = self.entries.is_empty();
        self.expected_duration += request.max_expected_duration;
        if let Some(old) = self.entries.insert(frame, request) {
            self.expected_duration = self
                .expected_duration
                .saturating_sub(old.max_expected_duration);
        }
        was_empty
    }

    pub fn get_mut(&mut self, frame: FrameNumber) -> Option<&mut InFlightRequest> {
        self.entries.get_mut(&frame)
    }

    /// Entry together with the shutter and result ordering cursors.
    pub fn split_mut(
        &mut self,
        frame: FrameNumber,
    ) -> Option<(&mut InFlightRequest, &mut CategoryCursor, &mut CategoryCursor)> {
        let entry = self.entries.get_mut(&frame)?;
        Some((entry, &mut self.shutter_cursor, &mut self.result_cursor))
    }

    pub fn get(&self, frame: FrameNumber) -> Option<&InFlightRequest> {
        self.entries.get(&frame)
    }

    pub fn remove(&mut self, frame: FrameNumber) -> Option<InFlightRequest> {
        let removed = self.entries.remove(&frame)?;
        self.expected_duration = self
            .expected_duration
            .saturating_sub(removed.max_expected_duration);
        Some(removed)
    }

    /// Note the frame as the latest completed one of its category.
    pub fn record_completed(&mut self, frame: FrameNumber, category: ResultCategory) {
        self.last_completed.insert(category.as_str(), frame);
    }

    pub fn last_completed(&self, category: ResultCategory) -> Option<FrameNumber> {
        self.last_completed.get(category.as_str()).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn frames(&self) -> Vec<FrameNumber> {
        self.entries.keys().copied().collect()
    }

    /// Sum of the expected durations of every registered frame.
    pub fn expected_duration(&self) -> Duration {
        self.expected_duration
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FrameNumber, &InFlightRequest)> {
        self.entries.iter()
    }

    /// Take every entry, leaving an empty table with cursors intact.
    pub fn drain(&mut self) -> Vec<(FrameNumber, InFlightRequest)> {
        self.expected_duration = Duration::ZERO;
        std::mem::take(&mut self.entries).into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(outputs: usize) -> InFlightRequest {
        InFlightRequest::new(
            ResultExtras::default(),
            (0..outputs as i32).map(StreamId).collect(),
            false,
        )
    }

    #[test]
    fn removal_needs_buffers_and_settled_metadata() {
        let mut r = entry(1);
        r.have_result_metadata = true;
        assert!(!r.is_ready_to_remove());
        r.num_buffers_left = 0;
        assert!(!r.is_ready_to_remove(), "shutter still missing");
        r.shutter_timestamp = 10;
        assert!(r.is_ready_to_remove());

        let mut failed = entry(2);
        failed.skip_result_metadata = true;
        failed.num_buffers_left = 1;
        assert!(!failed.is_ready_to_remove());
        failed.num_buffers_left = 0;
        assert!(failed.is_ready_to_remove());
    }

    #[test]
    fn input_buffer_counts_towards_buffers_left() {
        let r = InFlightRequest::new(ResultExtras::default(), vec![StreamId(0)], true);
        assert_eq!(r.num_buffers_left, 2);
        assert_eq!(r.category(), ResultCategory::Reprocess);
    }

    #[test]
    fn categories_order_independently() {
        let mut cursor = CategoryCursor::default();
        cursor.advance(ResultCategory::Regular, 5).expect("regular");
        cursor.advance(ResultCategory::Reprocess, 3).expect("reprocess is independent");
        assert_eq!(cursor.advance(ResultCategory::Regular, 4), Err(6));
        cursor.advance(ResultCategory::Regular, 8).expect("gaps are allowed");
    }

    #[test]
    fn table_tracks_expected_duration() {
        let mut table = InFlightTable::default();
        let mut a = entry(1);
        a.max_expected_duration = Duration::from_millis(30);
        let mut b = entry(1);
        b.max_expected_duration = Duration::from_millis(50);
        assert!(table.insert(1, a));
        assert!(!table.insert(2, b));
        assert_eq!(table.expected_duration(), Duration::from_millis(80));
        table.remove(1).expect("present");
        assert_eq!(table.expected_duration(), Duration::from_millis(50));
        assert!(table.remove(1).is_none());
        table.record_completed(2, ResultCategory::Regular);
        assert_eq!(table.last_completed(ResultCategory::Regular), Some(2));
        assert_eq!(table.drain().len(), 1);
        assert!(table.is_empty());
    }
}
