//! DPM-Solver++ multistep scheduler
//!
//! Deterministic multistep solver in data-prediction form (DPM-Solver++).
//! Every step converts the network output into a denoised estimate, keeps
//! the last `solver_order` estimates, and extrapolates with first, second
//! (midpoint) or third order updates in log-SNR time.
//!
//! Unlike the k-diffusion samplers, latents stay in variance-preserving
//! scale: `x_t = alpha_t * x0 + sigma_t * noise` with `alpha_t = 1 / sqrt(σ² + 1)`
//! and `sigma_t = σ * alpha_t`. Inputs need no scaling and the initial noise
//! has unit variance.

use std::collections::VecDeque;

use burn::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SchedulerError};
use crate::euler_ancestral::check_batch;
use crate::schedule::{
    NoiseSchedule, PredictionType, ScheduleConfig, Trajectory, check_same_dims, per_sample,
};
use crate::scheduler::{Scheduler, SchedulerOutput};

/// Step counts below this use lower order updates near the end
const LOWER_ORDER_FINAL_THRESHOLD: usize = 15;

/// DPM-Solver++ configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DpmSolverConfig {
    pub schedule: ScheduleConfig,
    /// Solver order (1 = DDIM-like, 2 = midpoint, 3 = third order)
    pub solver_order: usize,
    /// Drop to lower orders for the last steps of short schedules
    pub lower_order_final: bool,
}

impl Default for DpmSolverConfig {
    fn default() -> Self {
        Self {
            schedule: ScheduleConfig::sd15(),
            solver_order: 2,
            lower_order_final: true,
        }
    }
}

/// DPM-Solver++ multistep scheduler
pub struct DpmSolverMultistepScheduler<B: Backend> {
    config: DpmSolverConfig,
    /// Base sigma per training timestep
    base_sigmas: Vec<f64>,
    trajectory: Trajectory,
    /// Denoised estimates of recent steps, newest last
    model_outputs: VecDeque<Tensor<B, 4>>,
    /// Number of history entries usable for higher order updates
    lower_order_nums: usize,
}

impl<B: Backend> DpmSolverMultistepScheduler<B> {
    pub fn new(config: DpmSolverConfig) -> Result<Self> {
        if !(1..=3).contains(&config.solver_order) {
            return Err(SchedulerError::InvalidConfig(format!(
                "solver_order must be 1, 2 or 3, got {}",
                config.solver_order
            )));
        }
        let schedule = NoiseSchedule::new(&config.schedule)?;
        let base_sigmas = schedule.sigmas();
        let trajectory = Trajectory::full_range(&base_sigmas);

        Ok(Self {
            config,
            base_sigmas,
            trajectory,
            model_outputs: VecDeque::new(),
            lower_order_nums: 0,
        })
    }

    pub fn config(&self) -> &DpmSolverConfig {
        &self.config
    }

    pub fn solver_order(&self) -> usize {
        self.config.solver_order
    }

    /// Clears the solver history without touching the timesteps
    pub fn reset(&mut self) {
        self.model_outputs.clear();
        self.lower_order_nums = 0;
        self.trajectory.step_index = None;
    }

    /// Denoised estimate from the raw network output
    fn convert_model_output(
        &self,
        model_output: Tensor<B, 4>,
        sample: Tensor<B, 4>,
        sigma: f32,
    ) -> Tensor<B, 4> {
        let (alpha_t, sigma_t) = alpha_sigma(sigma);
        match self.config.schedule.prediction_type {
            PredictionType::Epsilon => (sample - model_output * sigma_t) / alpha_t,
            PredictionType::VPrediction => sample * alpha_t - model_output * sigma_t,
            PredictionType::Sample => model_output,
        }
    }

    fn order_for_step(&self, index: usize, sigma_next: f32) -> usize {
        let len = self.trajectory.timesteps.len();
        let short = self.config.lower_order_final && len < LOWER_ORDER_FINAL_THRESHOLD;
        let lower_order_final = sigma_next == 0.0 || (index + 1 == len && short);
        let lower_order_second = index + 2 == len && short;

        if self.config.solver_order == 1 || self.lower_order_nums < 1 || lower_order_final {
            1
        } else if self.config.solver_order == 2 || self.lower_order_nums < 2 || lower_order_second
        {
            2
        } else {
            3
        }
    }

    fn first_order_update(&self, sample: Tensor<B, 4>, sigma: f32, sigma_next: f32) -> Tensor<B, 4> {
        let x0 = self.newest();
        if sigma_next == 0.0 {
            return x0;
        }
        let (alpha_t, sigma_t) = alpha_sigma(sigma_next);
        let (_, sigma_s) = alpha_sigma(sigma);
        let h = lambda(sigma_next) - lambda(sigma);
        let phi = ((-h).exp() - 1.0) as f32;

        sample * (sigma_t / sigma_s) - x0 * (alpha_t * phi)
    }

    fn second_order_update(&self, sample: Tensor<B, 4>, index: usize) -> Result<Tensor<B, 4>> {
        let (sigma_s0, sigma_t) = self.trajectory.step_sigmas(index)?;
        let sigma_s1 = self.past_sigma(index, 1)?;
        let (m0, m1) = (self.history(0), self.history(1));

        let (alpha_t, vp_sigma_t) = alpha_sigma(sigma_t);
        let (_, vp_sigma_s0) = alpha_sigma(sigma_s0);
        let (lambda_t, lambda_s0, lambda_s1) =
            (lambda(sigma_t), lambda(sigma_s0), lambda(sigma_s1));

        let h = lambda_t - lambda_s0;
        let h_0 = lambda_s0 - lambda_s1;
        let r0 = h_0 / h;
        let phi = ((-h).exp() - 1.0) as f32;

        let d1 = (m0.clone() - m1) * (1.0 / r0) as f32;
        Ok(sample * (vp_sigma_t / vp_sigma_s0) - m0 * (alpha_t * phi) - d1 * (0.5 * alpha_t * phi))
    }

    fn third_order_update(&self, sample: Tensor<B, 4>, index: usize) -> Result<Tensor<B, 4>> {
        let (sigma_s0, sigma_t) = self.trajectory.step_sigmas(index)?;
        let sigma_s1 = self.past_sigma(index, 1)?;
        let sigma_s2 = self.past_sigma(index, 2)?;
        let (m0, m1, m2) = (self.history(0), self.history(1), self.history(2));

        let (alpha_t, vp_sigma_t) = alpha_sigma(sigma_t);
        let (_, vp_sigma_s0) = alpha_sigma(sigma_s0);
        let lambda_t = lambda(sigma_t);
        let lambda_s0 = lambda(sigma_s0);
        let lambda_s1 = lambda(sigma_s1);
        let lambda_s2 = lambda(sigma_s2);

        let h = lambda_t - lambda_s0;
        let h_0 = lambda_s0 - lambda_s1;
        let h_1 = lambda_s1 - lambda_s2;
        let r0 = h_0 / h;
        let r1 = h_1 / h;

        let d1_0 = (m0.clone() - m1.clone()) * (1.0 / r0) as f32;
        let d1_1 = (m1 - m2) * (1.0 / r1) as f32;
        let d1 = d1_0.clone() + (d1_0.clone() - d1_1.clone()) * (r0 / (r0 + r1)) as f32;
        let d2 = (d1_0 - d1_1) * (1.0 / (r0 + r1)) as f32;

        let phi = (-h).exp() - 1.0;
        let c0 = alpha_t * phi as f32;
        let c1 = alpha_t * (phi / h + 1.0) as f32;
        let c2 = alpha_t * ((phi + h) / (h * h) - 0.5) as f32;

        Ok(sample * (vp_sigma_t / vp_sigma_s0) - m0 * c0 + d1 * c1 - d2 * c2)
    }

    fn past_sigma(&self, index: usize, back: usize) -> Result<f32> {
        let past = index
            .checked_sub(back)
            .ok_or(SchedulerError::ScheduleExhausted {
                index,
                len: self.trajectory.timesteps.len(),
            })?;
        self.trajectory.sigma_at(past)
    }

    fn newest(&self) -> Tensor<B, 4> {
        self.history(0)
    }

    /// `back` steps into the past; 0 is the current estimate
    fn history(&self, back: usize) -> Tensor<B, 4> {
        self.model_outputs[self.model_outputs.len() - 1 - back].clone()
    }
}

/// VP-scale `(alpha_t, sigma_t)` for a k-diffusion sigma
fn alpha_sigma(sigma: f32) -> (f32, f32) {
    let alpha_t = 1.0 / (sigma * sigma + 1.0).sqrt();
    (alpha_t, sigma * alpha_t)
}

/// Half log-SNR, computed in f64 to keep small step sizes accurate
fn lambda(sigma: f32) -> f64 {
    -(sigma as f64).ln()
}

impl<B: Backend> Scheduler<B> for DpmSolverMultistepScheduler<B> {
    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        let schedule = &self.config.schedule;
        let timesteps = schedule.timestep_spacing.multistep_timesteps(
            num_inference_steps,
            schedule.num_train_timesteps,
            schedule.steps_offset,
        )?;
        self.trajectory = Trajectory::planned(timesteps, &self.base_sigmas);
        self.model_outputs.clear();
        self.lower_order_nums = 0;
        Ok(())
    }

    fn scale_model_input(&mut self, sample: Tensor<B, 4>, _timestep: f32) -> Result<Tensor<B, 4>> {
        Ok(sample)
    }

    fn step(
        &mut self,
        model_output: Tensor<B, 4>,
        timestep: f32,
        sample: Tensor<B, 4>,
    ) -> Result<SchedulerOutput<B>> {
        if self.trajectory.num_inference_steps.is_none() {
            return Err(SchedulerError::TimestepsNotSet);
        }
        check_same_dims("model_output", sample.dims(), model_output.dims())?;

        let index = self.trajectory.ensure_step_index(timestep);
        let (sigma, sigma_next) = self.trajectory.step_sigmas(index)?;
        let order = self.order_for_step(index, sigma_next);

        let pred_original_sample = self.convert_model_output(model_output, sample.clone(), sigma);
        self.model_outputs.push_back(pred_original_sample.clone());
        while self.model_outputs.len() > self.config.solver_order {
            self.model_outputs.pop_front();
        }

        debug!(step = index, sigma, sigma_next, order, "dpm++ step");

        let prev_sample = match order {
            1 => self.first_order_update(sample, sigma, sigma_next),
            2 => self.second_order_update(sample, index)?,
            _ => self.third_order_update(sample, index)?,
        };

        if self.lower_order_nums < self.config.solver_order {
            self.lower_order_nums += 1;
        }
        self.trajectory.advance();

        Ok(SchedulerOutput {
            prev_sample,
            pred_original_sample,
        })
    }

    fn add_noise(
        &self,
        original: Tensor<B, 4>,
        noise: Tensor<B, 4>,
        timesteps: &[f32],
    ) -> Result<Tensor<B, 4>> {
        check_same_dims("noise", original.dims(), noise.dims())?;
        let mut alphas = Vec::with_capacity(timesteps.len());
        let mut sigmas = Vec::with_capacity(timesteps.len());
        for index in self.trajectory.noise_indices(timesteps) {
            let (alpha_t, sigma_t) = alpha_sigma(self.trajectory.sigma_at(index)?);
            alphas.push(alpha_t);
            sigmas.push(sigma_t);
        }
        check_batch(original.dims()[0], sigmas.len())?;

        let device = original.device();
        Ok(original * per_sample::<B>(alphas, &device) + noise * per_sample::<B>(sigmas, &device))
    }

    fn set_begin_index(&mut self, begin_index: usize) {
        self.trajectory.begin_index = Some(begin_index);
    }

    fn set_prediction_type(&mut self, prediction_type: PredictionType) {
        self.config.schedule.prediction_type = prediction_type;
    }

    fn prediction_type(&self) -> PredictionType {
        self.config.schedule.prediction_type
    }

    fn timesteps(&self) -> &[f32] {
        &self.trajectory.timesteps
    }

    fn sigmas(&self) -> &[f32] {
        &self.trajectory.sigmas
    }

    fn step_index(&self) -> Option<usize> {
        self.trajectory.step_index
    }

    fn begin_index(&self) -> Option<usize> {
        self.trajectory.begin_index
    }

    fn current_sigma(&self) -> f32 {
        self.trajectory.current_sigma()
    }

    fn init_noise_sigma(&self) -> f32 {
        1.0
    }
}
