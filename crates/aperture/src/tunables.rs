use std::{sync::OnceLock, time::Duration};

use parking_lot::Mutex;

/// Default bounded wait for new requests in the dispatch loop (milliseconds).
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 50;
/// Default wait for the pipeline to turn active after a submission (milliseconds).
pub const DEFAULT_ACTIVE_TIMEOUT_MS: u64 = 500;
/// Default wait for workers to stop on disconnect (milliseconds).
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;
/// Expected frame duration assumed when settings carry no hint (milliseconds).
pub const DEFAULT_EXPECTED_DURATION_MS: u64 = 100;
/// Floor of the idle wait used by pause and reconfiguration (milliseconds).
pub const DEFAULT_MIN_IN_FLIGHT_DURATION_MS: u64 = 5_000;
/// Base wait for an output buffer before in-flight work is added (milliseconds).
pub const DEFAULT_BASE_BUFFER_WAIT_MS: u64 = 3_000;
/// Per-attempt wait while draining queued work before an offline switch (milliseconds).
pub const DEFAULT_SUBMIT_DRAIN_WAIT_MS: u64 = 200;
/// In-flight table size above which a warning is logged.
pub const DEFAULT_IN_FLIGHT_WARN_LIMIT: usize = 30;
/// Warning limit used in constrained high-speed mode.
pub const DEFAULT_IN_FLIGHT_WARN_LIMIT_HIGH_SPEED: usize = 256;
/// Bounded wait applied to overlapping result deliveries (milliseconds).
pub const DEFAULT_RESULT_OVERLAP_WAIT_MS: u64 = 1_000;

/// Timing and sizing knobs for a pipeline.
///
/// # Example
/// ```rust
/// use aperture::prelude::*;
///
/// let tunables = PipelineTunables {
///     request_timeout_ms: 20,
///     ..PipelineTunables::default()
/// };
/// assert_eq!(tunables.request_timeout(), std::time::Duration::from_millis(20));
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PipelineTunables {
    pub request_timeout_ms: u64,
    pub active_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub default_expected_duration_ms: u64,
    pub min_in_flight_duration_ms: u64,
    pub base_buffer_wait_ms: u64,
    pub submit_drain_wait_ms: u64,
    pub in_flight_warn_limit: usize,
    pub in_flight_warn_limit_high_speed: usize,
    pub result_overlap_wait_ms: u64,
}

impl Default for PipelineTunables {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            active_timeout_ms: DEFAULT_ACTIVE_TIMEOUT_MS,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            default_expected_duration_ms: DEFAULT_EXPECTED_DURATION_MS,
            min_in_flight_duration_ms: DEFAULT_MIN_IN_FLIGHT_DURATION_MS,
            base_buffer_wait_ms: DEFAULT_BASE_BUFFER_WAIT_MS,
            submit_drain_wait_ms: DEFAULT_SUBMIT_DRAIN_WAIT_MS,
            in_flight_warn_limit: DEFAULT_IN_FLIGHT_WARN_LIMIT,
            in_flight_warn_limit_high_speed: DEFAULT_IN_FLIGHT_WARN_LIMIT_HIGH_SPEED,
            result_overlap_wait_ms: DEFAULT_RESULT_OVERLAP_WAIT_MS,
        }
    }
}

impl PipelineTunables {
    /// Clamp values into ranges the pipeline can work with.
    pub fn sanitized(self) -> Self {
        let warn = self.in_flight_warn_limit.max(1);
        Self {
            request_timeout_ms: self.request_timeout_ms.max(1),
            active_timeout_ms: self.active_timeout_ms.max(1),
            shutdown_timeout_ms: self.shutdown_timeout_ms.max(1),
            default_expected_duration_ms: self.default_expected_duration_ms.max(1),
            min_in_flight_duration_ms: self.min_in_flight_duration_ms.max(1),
            base_buffer_wait_ms: self.base_buffer_wait_ms,
            submit_drain_wait_ms: self.submit_drain_wait_ms.max(1),
            in_flight_warn_limit: warn,
            in_flight_warn_limit_high_speed: self.in_flight_warn_limit_high_speed.max(warn),
            result_overlap_wait_ms: self.result_overlap_wait_ms.max(1),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn active_timeout(&self) -> Duration {
        Duration::from_millis(self.active_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn default_expected_duration(&self) -> Duration {
        Duration::from_millis(self.default_expected_duration_ms)
    }

    pub fn min_in_flight_duration(&self) -> Duration {
        Duration::from_millis(self.min_in_flight_duration_ms)
    }

    pub fn base_buffer_wait(&self) -> Duration {
        Duration::from_millis(self.base_buffer_wait_ms)
    }

    pub fn submit_drain_wait(&self) -> Duration {
        Duration::from_millis(self.submit_drain_wait_ms)
    }

    pub fn result_overlap_wait(&self) -> Duration {
        Duration::from_millis(self.result_overlap_wait_ms)
    }

    /// Warning threshold for the in-flight table in the given mode.
    pub fn in_flight_warn_limit(&self, high_speed: bool) -> usize {
        if high_speed {
            self.in_flight_warn_limit_high_speed
        } else {
            self.in_flight_warn_limit
        }
    }
}

static PIPELINE_TUNABLES: OnceLock<Mutex<PipelineTunables>> = OnceLock::new();

/// Override pipeline tunables process-wide. Pipelines created afterwards pick them up.
pub fn set_pipeline_tunables(tunables: PipelineTunables) {
    let lock = PIPELINE_TUNABLES.get_or_init(|| Mutex::new(PipelineTunables::default()));
    *lock.lock() = tunables.sanitized();
}

/// Current process-wide tunables.
pub fn pipeline_tunables() -> PipelineTunables {
    PIPELINE_TUNABLES
        .get()
        .map(|t| *t.lock())
        .unwrap_or_default()
}

/// Builder for process-wide pipeline tunables.
///
/// # Example
/// ```rust,ignore
/// use aperture::prelude::*;
///
/// ApertureConfig::new()
///     .request_timeout_ms(20)
///     .buffer_wait_ms(1_000)
///     .in_flight_warn_limits(16, 128)
///     .apply();
/// ```
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ApertureConfig {
    pipeline: PipelineTunables,
}

impl ApertureConfig {
    /// Start from defaults.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_timeout_ms(mut self, ms: u64) -> Self {
        self.pipeline.request_timeout_ms = ms;
        self
    }

    pub fn active_timeout_ms(mut self, ms: u64) -> Self {
        self.pipeline.active_timeout_ms = ms;
        self
    }

    pub fn shutdown_timeout_ms(mut self, ms: u64) -> Self {
        self.pipeline.shutdown_timeout_ms = ms;
        self
    }

    /// Override the idle-wait floor and the fallback per-frame duration.
    pub fn in_flight_durations_ms(mut self, min_wait: u64, default_frame: u64) -> Self {
        self.pipeline.min_in_flight_duration_ms = min_wait;
        self.pipeline.default_expected_duration_ms = default_frame;
        self
    }

    pub fn buffer_wait_ms(mut self, ms: u64) -> Self {
        self.pipeline.base_buffer_wait_ms = ms;
        self
    }

    pub fn submit_drain_wait_ms(mut self, ms: u64) -> Self {
        self.pipeline.submit_drain_wait_ms = ms;
        self
    }

    pub fn in_flight_warn_limits(mut self, normal: usize, high_speed: usize) -> Self {
        self.pipeline.in_flight_warn_limit = normal;
        self.pipeline.in_flight_warn_limit_high_speed = high_speed;
        self
    }

    pub fn result_overlap_wait_ms(mut self, ms: u64) -> Self {
        self.pipeline.result_overlap_wait_ms = ms;
        self
    }

    /// Tunables as they would be applied.
    pub fn tunables(&self) -> PipelineTunables {
        self.pipeline.sanitized()
    }

    /// Apply the configuration to global tunables.
    pub fn apply(self) {
        set_pipeline_tunables(self.pipeline);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitized_clamps_zeroes() {
        let t = PipelineTunables {
            request_timeout_ms: 0,
            in_flight_warn_limit: 0,
            in_flight_warn_limit_high_speed: 0,
            ..PipelineTunables::default()
        }
        .sanitized();
        assert_eq!(t.request_timeout_ms, 1);
        assert_eq!(t.in_flight_warn_limit(false), 1);
        assert_eq!(t.in_flight_warn_limit(true), 1);
    }

    #[test]
    fn builder_collects_overrides() {
        let t = ApertureConfig::new()
            .request_timeout_ms(10)
            .in_flight_durations_ms(250, 40)
            .in_flight_warn_limits(8, 64)
            .tunables();
        assert_eq!(t.request_timeout(), Duration::from_millis(10));
        assert_eq!(t.min_in_flight_duration(), Duration::from_millis(250));
        assert_eq!(t.default_expected_duration(), Duration::from_millis(40));
        assert_eq!(t.in_flight_warn_limit(true), 64);
        assert_eq!(t.base_buffer_wait(), Duration::from_millis(DEFAULT_BASE_BUFFER_WAIT_MS));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn config_deserializes_with_defaults() {
        let config: ApertureConfig =
            serde_json::from_str(r#"{"pipeline":{"request_timeout_ms":75}}"#).expect("json");
        let t = config.tunables();
        assert_eq!(t.request_timeout_ms, 75);
        assert_eq!(t.active_timeout_ms, DEFAULT_ACTIVE_TIMEOUT_MS);
    }
}
