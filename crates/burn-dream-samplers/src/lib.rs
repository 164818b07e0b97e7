pub mod dpm_multistep;
pub mod error;
pub mod euler_ancestral;
pub mod noise;
pub mod schedule;
pub mod scheduler;

pub use dpm_multistep::{DpmSolverConfig, DpmSolverMultistepScheduler};
pub use error::SchedulerError;
pub use euler_ancestral::EulerAncestralScheduler;
pub use noise::{gaussian_like, gaussian_noise};
pub use schedule::{
    BetaSchedule, NoiseSchedule, PredictionType, ScheduleConfig, TimestepSpacing, ancestral_step,
    betas_for_alpha_bar, interpolate_sigmas, rescale_zero_terminal_snr,
};
pub use scheduler::{DiffusionScheduler, SamplerType, Scheduler, SchedulerOutput};
