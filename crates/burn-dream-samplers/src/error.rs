//! Scheduler error types

use thiserror::Error;

/// Errors raised while configuring or driving a scheduler
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulerError {
    #[error("beta schedule `{0}` is not implemented")]
    UnsupportedBetaSchedule(String),

    #[error("timestep spacing `{0}` is not supported")]
    UnsupportedSpacing(String),

    #[error("prediction type `{0}` is not supported")]
    UnsupportedPredictionType(String),

    #[error("sampler `{0}` is not supported")]
    UnsupportedSampler(String),

    #[error("invalid scheduler configuration: {0}")]
    InvalidConfig(String),

    #[error("set_timesteps must be called before stepping")]
    TimestepsNotSet,

    #[error("step index {index} is past the end of a {len}-step schedule")]
    ScheduleExhausted { index: usize, len: usize },

    #[error("shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}

impl SchedulerError {
    /// Bad names or parameters supplied at construction time
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedBetaSchedule(_)
                | Self::UnsupportedSpacing(_)
                | Self::UnsupportedPredictionType(_)
                | Self::UnsupportedSampler(_)
                | Self::InvalidConfig(_)
        )
    }

    /// Operations invoked in the wrong order (a caller bug)
    pub fn is_sequencing(&self) -> bool {
        matches!(self, Self::TimestepsNotSet | Self::ScheduleExhausted { .. })
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
