//! End-to-end runs of the pipeline against the fake device.

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use aperture_device::{
    DeviceCapabilities, DeviceError, FakeBehavior, FakeCamera, FakeSession, OperatingMode,
    StreamId,
};

use super::{
    CaptureRequest, ClientError, Pipeline, PipelineError, PipelineStatus, StreamConfig,
    listener::{Notification, testing::RecordingListener},
    usage,
};
use crate::{
    core::prelude::{FourCc, MetadataValue, Resolution, Settings, StreamFormat, tags},
    logging,
    tunables::PipelineTunables,
};

const WAIT: Duration = Duration::from_secs(3);

struct Rig {
    pipeline: Pipeline,
    camera: FakeCamera,
    listener: Arc<RecordingListener>,
}

impl Rig {
    fn open(behavior: FakeBehavior) -> Self {
        logging::init_for_tests();
        let camera = FakeCamera::with_behavior("0", behavior);
        let pipeline = Pipeline::with_tunables(
            "0",
            PipelineTunables {
                active_timeout_ms: 500,
                shutdown_timeout_ms: 200,
                base_buffer_wait_ms: 200,
                min_in_flight_duration_ms: 50,
                result_overlap_wait_ms: 20,
                ..Default::default()
            },
        );
        let listener = RecordingListener::new();
        pipeline.set_listener(&listener.as_dyn());
        pipeline.open(&camera).expect("open");
        Self {
            pipeline,
            camera,
            listener,
        }
    }

    fn session(&self) -> Arc<FakeSession> {
        self.camera.session().expect("session")
    }

    fn stream(&self, config: StreamConfig) -> StreamId {
        self.pipeline.create_stream(config).expect("create stream")
    }

    fn configure(&self) {
        self.pipeline
            .configure_streams(OperatingMode::Normal, Settings::new())
            .expect("configure");
    }

    fn request_errors(&self) -> Vec<u64> {
        let mut frames: Vec<_> = self
            .listener
            .errors(ClientError::Request)
            .into_iter()
            .map(|extras| extras.frame_number)
            .collect();
        frames.sort_unstable();
        frames
    }

    fn device_errors(&self) -> usize {
        self.listener
            .count(|n| matches!(n, Notification::Error(ClientError::Device, _)))
    }
}

fn format() -> StreamFormat {
    StreamFormat::new(FourCc::NV12, Resolution::new(8, 8).expect("resolution"))
}

fn settings(request_id: i32) -> Settings {
    Settings::new().with(tags::REQUEST_ID, MetadataValue::i32(request_id))
}

fn request(request_id: i32, stream: StreamId) -> CaptureRequest {
    CaptureRequest::new("0", settings(request_id)).output(stream)
}

fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    pred()
}

#[test]
fn frame_numbers_stay_monotonic_across_flush() {
    let rig = Rig::open(FakeBehavior::manual());
    let stream = rig.stream(StreamConfig::output(format()));
    rig.configure();
    let session = rig.session();

    for (i, expected) in (0..3).zip(0u64..) {
        let frame = rig.pipeline.capture(request(i, stream)).expect("capture");
        assert_eq!(frame, expected);
    }
    assert!(wait_until(WAIT, || session.submitted_count() == 3));

    rig.pipeline.flush().expect("flush");
    assert!(wait_until(WAIT, || rig.request_errors().len() == 3));
    assert_eq!(rig.request_errors(), vec![0, 1, 2]);

    let next = rig.pipeline.capture(request(10, stream)).expect("capture");
    assert_eq!(next, 3);
    assert_eq!(session.flush_count(), 1);
}

#[test]
fn flush_accounts_for_queued_and_submitted_requests() {
    let rig = Rig::open(FakeBehavior {
        max_buffers: 2,
        ..FakeBehavior::manual()
    });
    let stream = rig.stream(StreamConfig::output(format()));
    rig.configure();
    let session = rig.session();

    assert_eq!(rig.pipeline.capture(request(1, stream)).expect("capture"), 0);
    assert_eq!(rig.pipeline.capture(request(2, stream)).expect("capture"), 1);
    assert!(wait_until(WAIT, || session.submitted_count() == 2));

    // Both buffers are held by the device; the next request waits for one and
    // the two behind it stay queued.
    let last = rig
        .pipeline
        .capture_list((3..6).map(|id| request(id, stream)).collect())
        .expect("burst");
    assert_eq!(last, 4);
    rig.pipeline.flush().expect("flush");

    let mut completed = Vec::new();
    let accounted = wait_until(WAIT, || {
        session.complete_all();
        while let Some(result) = rig.pipeline.get_next_result() {
            completed.push(result.extras.frame_number);
        }
        rig.request_errors().len() + completed.len() == 5
    });
    assert!(accounted, "errors {:?} results {:?}", rig.request_errors(), completed);

    let mut frames: Vec<_> = rig.request_errors().into_iter().chain(completed).collect();
    frames.sort_unstable();
    assert_eq!(frames, vec![0, 1, 2, 3, 4]);
    assert!(session.submitted_count() <= 3);
    assert_ne!(rig.pipeline.status(), PipelineStatus::Error);
}

#[test]
fn high_speed_batch_sends_settings_once() {
    let rig = Rig::open(FakeBehavior::manual());
    let stream = rig.stream(StreamConfig::output(format()).usage(usage::VIDEO_ENCODER));
    rig.pipeline
        .configure_streams(OperatingMode::ConstrainedHighSpeed, Settings::new())
        .expect("configure");
    let session = rig.session();

    let last = rig
        .pipeline
        .capture_list((0..4).map(|id| request(id, stream)).collect())
        .expect("batch");
    assert_eq!(last, 3);
    assert!(wait_until(WAIT, || session.submitted_count() == 4));

    let submissions = session.submissions();
    let first = submissions[0].settings.as_ref().expect("leader settings");
    assert_eq!(first.i32(tags::REQUEST_ID).expect("request id"), 0);
    assert!(submissions[1..].iter().all(|s| s.settings.is_none()));

    session.complete_all();
    rig.pipeline.wait_until_idle(WAIT).expect("idle");
    assert_eq!(rig.pipeline.metrics().completed_frames(), 4);
}

#[test]
fn partially_accepted_batch_fails_the_remainder() {
    let rig = Rig::open(FakeBehavior::manual().accept_limit(1));
    let stream = rig.stream(StreamConfig::output(format()).usage(usage::VIDEO_ENCODER));
    rig.pipeline
        .configure_streams(OperatingMode::ConstrainedHighSpeed, Settings::new())
        .expect("configure");
    let session = rig.session();

    let last = rig
        .pipeline
        .capture_list((0..3).map(|id| request(id, stream)).collect())
        .expect("batch");
    assert_eq!(last, 2);
    assert!(wait_until(WAIT, || rig.request_errors().len() == 2));
    assert_eq!(rig.request_errors(), vec![1, 2]);
    assert_eq!(session.submitted_count(), 1);
    assert_eq!(rig.pipeline.inner().in_flight_frames(), vec![0]);
    assert_eq!(rig.pipeline.status(), PipelineStatus::Active);

    session.complete_all();
    rig.pipeline.wait_until_idle(WAIT).expect("idle");
    let info = rig.pipeline.stream_info(stream).expect("stream info");
    assert_eq!(info.outstanding_buffers, 0);
    assert_eq!(rig.pipeline.metrics().completed_frames(), 1);
    assert!(rig.pipeline.inner().in_flight_frames().is_empty());
    assert!(rig.pipeline.error_cause().is_none());
}

#[test]
fn completion_retires_once() {
    let rig = Rig::open(FakeBehavior::manual());
    let stream = rig.stream(StreamConfig::output(format()));
    rig.configure();
    let session = rig.session();

    rig.pipeline.capture(request(7, stream)).expect("capture");
    assert!(wait_until(WAIT, || session.submitted_count() == 1));
    assert!(session.complete(0));
    assert!(!session.complete(0));

    let result = rig.pipeline.wait_for_next_result(WAIT).expect("result");
    assert_eq!(result.extras.frame_number, 0);
    assert_eq!(result.extras.request_id, 7);
    rig.pipeline.wait_until_idle(WAIT).expect("idle");
    assert_eq!(rig.pipeline.metrics().completed_frames(), 1);
    assert!(rig.pipeline.get_next_result().is_none());
    assert_eq!(rig.listener.shutters(), vec![0]);
}

#[test]
fn status_follows_device_activity() {
    let rig = Rig::open(FakeBehavior::default());
    let stream = rig.stream(StreamConfig::output(format()));
    rig.configure();
    assert_eq!(rig.pipeline.status(), PipelineStatus::Configured);

    rig.pipeline.capture(request(1, stream)).expect("capture");
    rig.pipeline.wait_for_next_result(WAIT).expect("result");
    rig.pipeline.wait_until_idle(WAIT).expect("idle");

    assert_eq!(rig.pipeline.status(), PipelineStatus::Configured);
    assert!(rig.listener.count(|n| matches!(n, Notification::Active)) >= 1);
    assert!(rig.listener.wait_for(1, WAIT, |n| matches!(n, Notification::Idle)));
    assert!(rig.pipeline.latest_request().is_some());
    rig.pipeline
        .wait_until_request_received(1, WAIT)
        .expect("request seen");
}

#[test]
fn first_capture_configures_implicitly() {
    let rig = Rig::open(FakeBehavior::default());
    assert_eq!(rig.pipeline.status(), PipelineStatus::Unconfigured);
    let stream = rig.stream(StreamConfig::output(format()));

    rig.pipeline.capture(request(1, stream)).expect("capture");
    rig.pipeline.wait_for_next_result(WAIT).expect("result");
    assert_eq!(rig.session().configured_streams().len(), 1);
}

#[test]
fn capture_without_streams_is_rejected() {
    let rig = Rig::open(FakeBehavior::default());
    let err = rig
        .pipeline
        .capture(CaptureRequest::new("0", settings(1)))
        .expect_err("no targets");
    assert!(matches!(err, PipelineError::InvalidArgument(_)));
    assert_eq!(rig.pipeline.status(), PipelineStatus::Unconfigured);
}

#[test]
fn rejected_configuration_is_recoverable() {
    let rig = Rig::open(FakeBehavior {
        reject_configuration: true,
        ..FakeBehavior::manual()
    });
    rig.stream(StreamConfig::output(format()));

    let err = rig
        .pipeline
        .configure_streams(OperatingMode::Normal, Settings::new())
        .expect_err("rejected");
    assert!(matches!(err, PipelineError::ConfigurationRejected(_)));
    assert!(err.retryable());
    assert_eq!(rig.pipeline.status(), PipelineStatus::Unconfigured);
    assert_eq!(rig.device_errors(), 0);

    rig.session().update_behavior(|b| b.reject_configuration = false);
    rig.configure();
    assert_eq!(rig.pipeline.status(), PipelineStatus::Configured);
}

#[test]
fn delete_stream_while_active_resumes_configured() {
    let rig = Rig::open(FakeBehavior::default());
    let doomed = rig.stream(StreamConfig::output(format()));
    let kept = rig.stream(StreamConfig::output(format()));
    rig.configure();

    rig.pipeline
        .set_repeating(request(1, doomed))
        .expect("repeating");
    rig.pipeline.wait_for_next_result(WAIT).expect("first frame");

    rig.pipeline.delete_stream(doomed).expect("delete");
    assert!(rig.listener.wait_for(1, WAIT, |n| {
        matches!(n, Notification::RepeatingRequestError(_))
    }));
    assert!(wait_until(WAIT, || {
        rig.pipeline.status() == PipelineStatus::Configured
    }));
    assert!(rig.pipeline.error_cause().is_none());
    assert!(rig.pipeline.stream_info(doomed).is_err());
    let configured = rig.session().configured_streams();
    assert_eq!(configured.len(), 1);
    assert_eq!(configured[0].id, kept);

    rig.pipeline.capture(request(2, kept)).expect("capture on survivor");
    rig.pipeline.wait_until_idle(WAIT).expect("idle");
}

#[test]
fn session_parameter_change_reconfigures_live_pipeline() {
    let rig = Rig::open(FakeBehavior::default().capabilities(DeviceCapabilities {
        session_keys: vec![tags::CONTROL_AE_TARGET_FPS_RANGE],
        ..DeviceCapabilities::default()
    }));
    let stream = rig.stream(StreamConfig::output(format()));
    let session = rig.session();
    let fps = |lo, hi| {
        CaptureRequest::new(
            "0",
            settings(1).with(
                tags::CONTROL_AE_TARGET_FPS_RANGE,
                MetadataValue::i32s(&[lo, hi]),
            ),
        )
        .output(stream)
    };

    rig.pipeline.capture(fps(15, 30)).expect("first");
    rig.pipeline.capture(fps(30, 30)).expect("second");

    let applied = wait_until(WAIT, || {
        session
            .session_params()
            .get(tags::CONTROL_AE_TARGET_FPS_RANGE)
            .and_then(MetadataValue::i32_slice)
            == Some(&[30, 30][..])
    });
    assert!(applied, "{}", rig.pipeline.dump());
    rig.pipeline.wait_until_idle(WAIT).expect("idle");
    assert!(rig.pipeline.error_cause().is_none());
}

#[test]
fn autofocus_trigger_rides_on_next_request() {
    let rig = Rig::open(FakeBehavior::manual());
    let stream = rig.stream(StreamConfig::output(format()));
    rig.configure();
    let session = rig.session();

    rig.pipeline.trigger_autofocus(7).expect("trigger");
    rig.pipeline.capture(request(1, stream)).expect("capture");
    rig.pipeline.capture(request(2, stream)).expect("capture");
    assert!(wait_until(WAIT, || session.submitted_count() == 2));

    let submissions = session.submissions();
    let first = submissions[0].settings.as_ref().expect("settings");
    assert_eq!(
        first.get(tags::CONTROL_AF_TRIGGER).and_then(MetadataValue::as_u8),
        Some(tags::af_trigger::START)
    );
    assert_eq!(
        first.i32(tags::CONTROL_AF_TRIGGER_ID).expect("trigger id"),
        1,
        "client ids stay out of the device settings"
    );
    let second = submissions[1].settings.as_ref().expect("settings");
    assert!(!second.contains(tags::CONTROL_AF_TRIGGER));
    assert!(!second.contains(tags::CONTROL_AF_TRIGGER_ID));

    session.complete_all();
    let result = rig.pipeline.wait_for_next_result(WAIT).expect("result");
    assert_eq!(result.extras.frame_number, 0);
    assert_eq!(result.extras.af_trigger_id, 7);
    rig.pipeline.wait_until_idle(WAIT).expect("idle");
}

#[test]
fn prepare_allocates_and_tear_down_releases() {
    let rig = Rig::open(FakeBehavior::manual());
    let stream = rig.stream(StreamConfig::output(format()));
    rig.configure();

    rig.pipeline.prepare(stream).expect("prepare");
    assert!(rig.listener.wait_for(1, WAIT, |n| {
        matches!(n, Notification::Prepared(id) if *id == stream)
    }));
    let info = rig.pipeline.stream_info(stream).expect("info");
    assert!(info.prepared);
    assert_eq!(info.allocated_buffers, info.max_buffers);

    assert_eq!(rig.pipeline.tear_down(stream).expect("tear down"), info.max_buffers);
    assert!(!rig.pipeline.stream_info(stream).expect("info").prepared);
}

#[test]
fn idle_timeout_is_fatal() {
    let rig = Rig::open(FakeBehavior::manual());
    let stream = rig.stream(StreamConfig::output(format()));
    rig.configure();
    let session = rig.session();

    rig.pipeline.capture(request(1, stream)).expect("capture");
    assert!(wait_until(WAIT, || session.submitted_count() == 1));
    let err = rig
        .pipeline
        .wait_until_idle(Duration::from_millis(50))
        .expect_err("device never finishes");
    assert!(matches!(err, PipelineError::Timeout(_)));
    assert_eq!(rig.pipeline.status(), PipelineStatus::Error);
    assert_eq!(rig.device_errors(), 1);
    assert!(matches!(
        rig.pipeline.capture(request(2, stream)),
        Err(PipelineError::InvalidState(PipelineStatus::Error))
    ));
}

#[test]
fn submit_fault_reports_device_error_once() {
    let rig = Rig::open(FakeBehavior::manual());
    let stream = rig.stream(StreamConfig::output(format()));
    rig.configure();
    rig.session()
        .inject_submit_fault(DeviceError::Internal("bus reset".into()), true);

    rig.pipeline.capture(request(1, stream)).expect("queued");
    assert!(wait_until(WAIT, || {
        rig.pipeline.status() == PipelineStatus::Error
    }));
    assert!(rig.listener.wait_for(1, WAIT, |n| {
        matches!(n, Notification::Error(ClientError::Device, _))
    }));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(rig.device_errors(), 1);
    assert!(rig.pipeline.error_cause().is_some());
}

#[test]
fn abandoned_stream_rejects_new_requests() {
    let rig = Rig::open(FakeBehavior::manual());
    let stream = rig.stream(StreamConfig::output(format()));
    rig.configure();

    rig.pipeline.inner().abandon_stream(stream);
    let err = rig
        .pipeline
        .capture(request(1, stream))
        .expect_err("abandoned target");
    assert!(matches!(err, PipelineError::Abandoned(id) if id == stream));
    assert!(err.retryable());
    assert!(rig.pipeline.stream_info(stream).expect("info").abandoned);
    assert_ne!(rig.pipeline.status(), PipelineStatus::Error);
}

#[test]
fn disconnect_fails_in_flight_requests() {
    let rig = Rig::open(FakeBehavior::manual());
    let stream = rig.stream(StreamConfig::output(format()));
    rig.configure();
    let session = rig.session();

    rig.pipeline.capture(request(1, stream)).expect("capture");
    rig.pipeline.capture(request(2, stream)).expect("capture");
    assert!(wait_until(WAIT, || session.submitted_count() == 2));

    rig.pipeline.disconnect();
    assert_eq!(rig.pipeline.status(), PipelineStatus::Uninitialized);
    assert_eq!(rig.request_errors(), vec![0, 1]);
    assert_eq!(rig.pipeline.metrics().dropped_frames(), 2);
    // Second disconnect is a no-op.
    rig.pipeline.disconnect();
    assert_eq!(rig.request_errors().len(), 2);
}

fn offline_rig(skew: usize) -> (Rig, StreamId, StreamId) {
    let rig = Rig::open(FakeBehavior {
        offline_inventory_skew: skew,
        ..FakeBehavior::manual().capabilities(DeviceCapabilities {
            offline_processing: true,
            ..DeviceCapabilities::default()
        })
    });
    let still = rig.stream(StreamConfig::output(format()).offline_processing(true));
    let preview = rig.stream(StreamConfig::output(format()));
    rig.configure();
    let session = rig.session();
    rig.pipeline.capture(request(1, still)).expect("capture");
    rig.pipeline.capture(request(2, still)).expect("capture");
    assert!(wait_until(WAIT, || session.submitted_count() == 2));
    (rig, still, preview)
}

#[test]
fn switch_to_offline_hands_over_outstanding_buffers() {
    let (rig, still, preview) = offline_rig(0);

    let offline = rig.pipeline.switch_to_offline(&[still]).expect("switch");
    assert_eq!(offline.stream_ids(), &[still]);
    assert_eq!(offline.in_flight_count(), 2);
    assert_eq!(rig.pipeline.status(), PipelineStatus::Unconfigured);
    assert!(rig.pipeline.stream_info(still).is_err());
    assert!(rig.pipeline.stream_info(preview).is_err());
    assert_eq!(rig.listener.shutters(), vec![0, 1]);

    let device_side = rig.session().offline_session().expect("offline device");
    assert_eq!(device_side.pending_frames(), vec![0, 1]);
    assert_eq!(device_side.complete_all(), 2);

    let first = offline.wait_for_next_result(WAIT).expect("first result");
    let second = offline.wait_for_next_result(WAIT).expect("second result");
    assert_eq!(
        (first.extras.frame_number, second.extras.frame_number),
        (0, 1)
    );
    assert!(offline.is_finished());
    assert!(offline.error_cause().is_none());
    assert_eq!(rig.device_errors(), 0);
}

#[test]
fn offline_inventory_mismatch_enters_error() {
    let (rig, still, _) = offline_rig(1);

    let err = rig
        .pipeline
        .switch_to_offline(&[still])
        .err()
        .expect("inventory mismatch");
    assert!(!err.retryable(), "{err}");
    assert_eq!(rig.pipeline.status(), PipelineStatus::Error);
    assert_eq!(rig.device_errors(), 1);
    assert!(rig.pipeline.stream_info(still).is_ok());
}

#[test]
fn offline_switch_requires_capable_streams() {
    let (rig, _, preview) = offline_rig(0);
    let err = rig
        .pipeline
        .switch_to_offline(&[preview])
        .err()
        .expect("preview cannot go offline");
    assert!(matches!(err, PipelineError::InvalidArgument(_)));
    assert_ne!(rig.pipeline.status(), PipelineStatus::Error);
    rig.session().complete_all();
}

#[cfg(feature = "async")]
#[tokio::test]
async fn async_result_wait() {
    let rig = Rig::open(FakeBehavior::default());
    let stream = rig.stream(StreamConfig::output(format()));
    rig.pipeline.capture(request(3, stream)).expect("capture");
    let result = rig
        .pipeline
        .wait_for_next_result_async(WAIT)
        .await
        .expect("result");
    assert_eq!(result.extras.request_id, 3);
}
