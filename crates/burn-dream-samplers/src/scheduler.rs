//! Scheduler capability shared by every solver
//!
//! Callers pick a solver once per request through [`SamplerType`] and then
//! drive it through the [`Scheduler`] trait, never branching on the concrete
//! type.

use std::fmt;
use std::str::FromStr;

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::dpm_multistep::{DpmSolverConfig, DpmSolverMultistepScheduler};
use crate::error::{Result, SchedulerError};
use crate::euler_ancestral::EulerAncestralScheduler;
use crate::schedule::{PredictionType, ScheduleConfig};

/// Result of one scheduler step
#[derive(Debug, Clone)]
pub struct SchedulerOutput<B: Backend> {
    /// Latent for the next timestep
    pub prev_sample: Tensor<B, 4>,
    /// Estimate of the fully denoised latent at this step
    pub pred_original_sample: Tensor<B, 4>,
}

/// Discrete-time diffusion sampler
///
/// Timesteps are training-timestep values (possibly fractional for linspace
/// spacing); integer comparisons truncate them.
pub trait Scheduler<B: Backend> {
    /// Plans `num_inference_steps` timesteps and resets the cursor and history
    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()>;

    /// Scales a latent before it is fed to the denoiser
    fn scale_model_input(&mut self, sample: Tensor<B, 4>, timestep: f32) -> Result<Tensor<B, 4>>;

    /// Advances `sample` by one step given the denoiser output
    fn step(
        &mut self,
        model_output: Tensor<B, 4>,
        timestep: f32,
        sample: Tensor<B, 4>,
    ) -> Result<SchedulerOutput<B>>;

    /// Forward-noises `original` to the noise level of each timestep
    ///
    /// `timesteps` holds one entry per batch item, or a single entry that
    /// applies to the whole batch.
    fn add_noise(
        &self,
        original: Tensor<B, 4>,
        noise: Tensor<B, 4>,
        timesteps: &[f32],
    ) -> Result<Tensor<B, 4>>;

    /// Starts the trajectory at `begin_index` (img2img)
    fn set_begin_index(&mut self, begin_index: usize);

    fn set_prediction_type(&mut self, prediction_type: PredictionType);

    fn prediction_type(&self) -> PredictionType;

    fn timesteps(&self) -> &[f32];

    /// Per-step sigmas, one longer than [`Scheduler::timesteps`]
    fn sigmas(&self) -> &[f32];

    fn step_index(&self) -> Option<usize>;

    fn begin_index(&self) -> Option<usize>;

    fn current_sigma(&self) -> f32;

    /// Standard deviation of the initial pure-noise latent
    fn init_noise_sigma(&self) -> f32;
}

/// Solver selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SamplerType {
    /// Euler ancestral (stochastic)
    EulerAncestral,
    /// DPM-Solver++ multistep (deterministic)
    DpmSolverMultistep { order: usize },
}

impl Default for SamplerType {
    fn default() -> Self {
        Self::DpmSolverMultistep { order: 2 }
    }
}

impl FromStr for SamplerType {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "euler_a" | "euler_ancestral" => Ok(Self::EulerAncestral),
            "dpm++" | "dpm++2m" | "dpmsolver++" => Ok(Self::DpmSolverMultistep { order: 2 }),
            "dpm++1" => Ok(Self::DpmSolverMultistep { order: 1 }),
            "dpm++3m" => Ok(Self::DpmSolverMultistep { order: 3 }),
            other => Err(SchedulerError::UnsupportedSampler(other.to_string())),
        }
    }
}

impl fmt::Display for SamplerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EulerAncestral => f.write_str("euler_a"),
            Self::DpmSolverMultistep { order: 1 } => f.write_str("dpm++1"),
            Self::DpmSolverMultistep { order: 3 } => f.write_str("dpm++3m"),
            Self::DpmSolverMultistep { .. } => f.write_str("dpm++"),
        }
    }
}

/// A scheduler chosen at runtime
pub enum DiffusionScheduler<B: Backend> {
    EulerAncestral(EulerAncestralScheduler<B>),
    DpmSolverMultistep(DpmSolverMultistepScheduler<B>),
}

impl<B: Backend> DiffusionScheduler<B> {
    /// Builds the solver named by `sampler`
    ///
    /// `seed` feeds the ancestral noise stream; deterministic solvers ignore it.
    pub fn new(sampler: SamplerType, schedule: ScheduleConfig, seed: u64) -> Result<Self> {
        match sampler {
            SamplerType::EulerAncestral => Ok(Self::EulerAncestral(EulerAncestralScheduler::new(
                schedule, seed,
            )?)),
            SamplerType::DpmSolverMultistep { order } => {
                let config = DpmSolverConfig {
                    schedule,
                    solver_order: order,
                    ..Default::default()
                };
                Ok(Self::DpmSolverMultistep(DpmSolverMultistepScheduler::new(
                    config,
                )?))
            }
        }
    }

    pub fn sampler_type(&self) -> SamplerType {
        match self {
            Self::EulerAncestral(_) => SamplerType::EulerAncestral,
            Self::DpmSolverMultistep(s) => SamplerType::DpmSolverMultistep {
                order: s.solver_order(),
            },
        }
    }

    fn inner(&self) -> &dyn Scheduler<B> {
        match self {
            Self::EulerAncestral(s) => s,
            Self::DpmSolverMultistep(s) => s,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Scheduler<B> {
        match self {
            Self::EulerAncestral(s) => s,
            Self::DpmSolverMultistep(s) => s,
        }
    }
}

impl<B: Backend> Scheduler<B> for DiffusionScheduler<B> {
    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        self.inner_mut().set_timesteps(num_inference_steps)
    }

    fn scale_model_input(&mut self, sample: Tensor<B, 4>, timestep: f32) -> Result<Tensor<B, 4>> {
        self.inner_mut().scale_model_input(sample, timestep)
    }

    fn step(
        &mut self,
        model_output: Tensor<B, 4>,
        timestep: f32,
        sample: Tensor<B, 4>,
    ) -> Result<SchedulerOutput<B>> {
        self.inner_mut().step(model_output, timestep, sample)
    }

    fn add_noise(
        &self,
        original: Tensor<B, 4>,
        noise: Tensor<B, 4>,
        timesteps: &[f32],
    ) -> Result<Tensor<B, 4>> {
        self.inner().add_noise(original, noise, timesteps)
    }

    fn set_begin_index(&mut self, begin_index: usize) {
        self.inner_mut().set_begin_index(begin_index)
    }

    fn set_prediction_type(&mut self, prediction_type: PredictionType) {
        self.inner_mut().set_prediction_type(prediction_type)
    }

    fn prediction_type(&self) -> PredictionType {
        self.inner().prediction_type()
    }

    fn timesteps(&self) -> &[f32] {
        self.inner().timesteps()
    }

    fn sigmas(&self) -> &[f32] {
        self.inner().sigmas()
    }

    fn step_index(&self) -> Option<usize> {
        self.inner().step_index()
    }

    fn begin_index(&self) -> Option<usize> {
        self.inner().begin_index()
    }

    fn current_sigma(&self) -> f32 {
        self.inner().current_sigma()
    }

    fn init_noise_sigma(&self) -> f32 {
        self.inner().init_noise_sigma()
    }
}
