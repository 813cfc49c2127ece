use std::fmt;

/// Lifecycle state of a pipeline.
///
/// Requests may only be queued in `Unconfigured`, `Configured` or `Active`; `Error`
/// is terminal until the pipeline is disconnected and reopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PipelineStatus {
    #[default]
    Uninitialized,
    Unconfigured,
    Configured,
    Active,
    Error,
}

impl PipelineStatus {
    pub fn accepts_requests(self) -> bool {
        matches!(
            self,
            PipelineStatus::Unconfigured | PipelineStatus::Configured | PipelineStatus::Active
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStatus::Uninitialized => "uninitialized",
            PipelineStatus::Unconfigured => "unconfigured",
            PipelineStatus::Configured => "configured",
            PipelineStatus::Active => "active",
            PipelineStatus::Error => "error",
        }
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
