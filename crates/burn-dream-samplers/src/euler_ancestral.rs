//! Euler ancestral scheduler
//!
//! Single-step Euler integration of the diffusion ODE with fresh Gaussian
//! noise injected after every step. Sigmas follow the discrete training
//! schedule (no Karras remapping), matching the diffusers scheduler of the
//! same name.

use std::marker::PhantomData;

use burn::prelude::*;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use crate::error::{Result, SchedulerError};
use crate::noise::gaussian_noise;
use crate::schedule::{
    NoiseSchedule, PredictionType, ScheduleConfig, TimestepSpacing, Trajectory, ancestral_step,
    check_same_dims, per_sample,
};
use crate::scheduler::{Scheduler, SchedulerOutput};

/// Euler Ancestral scheduler
///
/// Owns a seeded noise stream so `step` is reproducible for a given seed.
/// Use [`EulerAncestralScheduler::step_with_noise`] to supply the noise
/// yourself.
pub struct EulerAncestralScheduler<B: Backend> {
    config: ScheduleConfig,
    /// Base sigma per training timestep
    base_sigmas: Vec<f64>,
    trajectory: Trajectory,
    rng: ChaCha8Rng,
    _marker: PhantomData<B>,
}

impl<B: Backend> EulerAncestralScheduler<B> {
    /// Creates a scheduler whose ancestral noise is drawn from `seed`
    pub fn new(config: ScheduleConfig, seed: u64) -> Result<Self> {
        let schedule = NoiseSchedule::new(&config)?;
        let base_sigmas = schedule.sigmas();
        let trajectory = Trajectory::full_range(&base_sigmas);

        Ok(Self {
            config,
            base_sigmas,
            trajectory,
            rng: ChaCha8Rng::seed_from_u64(seed),
            _marker: PhantomData,
        })
    }

    pub fn config(&self) -> &ScheduleConfig {
        &self.config
    }

    /// Performs one step using caller-supplied noise
    ///
    /// `noise` must have the same shape as `sample`.
    pub fn step_with_noise(
        &mut self,
        model_output: Tensor<B, 4>,
        timestep: f32,
        sample: Tensor<B, 4>,
        noise: Tensor<B, 4>,
    ) -> Result<SchedulerOutput<B>> {
        if self.trajectory.num_inference_steps.is_none() {
            return Err(SchedulerError::TimestepsNotSet);
        }
        check_same_dims("model_output", sample.dims(), model_output.dims())?;
        check_same_dims("noise", sample.dims(), noise.dims())?;

        let index = self.trajectory.ensure_step_index(timestep);
        let (sigma, sigma_next) = self.trajectory.step_sigmas(index)?;

        let pred_original_sample = match self.config.prediction_type {
            PredictionType::Epsilon => sample.clone() - model_output * sigma,
            PredictionType::VPrediction => {
                let sigma2 = sigma * sigma + 1.0;
                model_output * (-sigma / sigma2.sqrt()) + sample.clone() / sigma2
            }
            PredictionType::Sample => model_output,
        };

        let (sigma_down, sigma_up) = ancestral_step(sigma, sigma_next);

        debug!(
            step = index,
            sigma, sigma_next, sigma_down, sigma_up, "euler ancestral step"
        );

        // d = (x - x0) / sigma, then an Euler move to sigma_down
        let derivative = (sample.clone() - pred_original_sample.clone()) / sigma;
        let prev_sample = sample + derivative * (sigma_down - sigma) + noise * sigma_up;

        self.trajectory.advance();

        Ok(SchedulerOutput {
            prev_sample,
            pred_original_sample,
        })
    }
}

impl<B: Backend> Scheduler<B> for EulerAncestralScheduler<B> {
    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        let timesteps = self.config.timestep_spacing.timesteps(
            num_inference_steps,
            self.config.num_train_timesteps,
            self.config.steps_offset,
        )?;
        self.trajectory = Trajectory::planned(timesteps, &self.base_sigmas);
        Ok(())
    }

    fn scale_model_input(&mut self, sample: Tensor<B, 4>, timestep: f32) -> Result<Tensor<B, 4>> {
        let index = self.trajectory.ensure_step_index(timestep);
        let sigma = self.trajectory.sigma_at(index)?;
        Ok(sample / (sigma * sigma + 1.0).sqrt())
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
        let noise = gaussian_noise(&mut self.rng, sample.dims(), &sample.device());
        self.step_with_noise(model_output, timestep, sample, noise)
    }

    fn add_noise(
        &self,
        original: Tensor<B, 4>,
        noise: Tensor<B, 4>,
        timesteps: &[f32],
    ) -> Result<Tensor<B, 4>> {
        check_same_dims("noise", original.dims(), noise.dims())?;
        let sigmas = self
            .trajectory
            .noise_indices(timesteps)
            .into_iter()
            .map(|index| self.trajectory.sigma_at(index))
            .collect::<Result<Vec<_>>>()?;
        check_batch(original.dims()[0], sigmas.len())?;

        let sigma = per_sample::<B>(sigmas, &original.device());
        Ok(original + noise * sigma)
    }

    fn set_begin_index(&mut self, begin_index: usize) {
        self.trajectory.begin_index = Some(begin_index);
    }

    fn set_prediction_type(&mut self, prediction_type: PredictionType) {
        self.config.prediction_type = prediction_type;
    }

    fn prediction_type(&self) -> PredictionType {
        self.config.prediction_type
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
        let max_sigma = self.trajectory.max_sigma();
        match self.config.timestep_spacing {
            TimestepSpacing::Linspace | TimestepSpacing::Trailing => max_sigma,
            TimestepSpacing::Leading => (max_sigma * max_sigma + 1.0).sqrt(),
        }
    }
}

/// One sigma per batch entry, or a single sigma broadcast to all of them
pub(crate) fn check_batch(batch: usize, num_sigmas: usize) -> Result<()> {
    if num_sigmas == batch || num_sigmas == 1 {
        Ok(())
    } else {
        Err(SchedulerError::ShapeMismatch {
            what: "timesteps",
            expected: vec![batch],
            actual: vec![num_sigmas],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn filled(value: f32) -> Tensor<TestBackend, 4> {
        Tensor::full([1, 4, 8, 8], value, &Default::default())
    }

    fn values(t: Tensor<TestBackend, 4>) -> Vec<f32> {
        t.into_data().to_vec::<f32>().unwrap()
    }

    fn scheduler() -> EulerAncestralScheduler<TestBackend> {
        let mut s = EulerAncestralScheduler::new(ScheduleConfig::sd15(), 0).unwrap();
        s.set_timesteps(20).unwrap();
        s
    }

    #[test]
    fn test_sd15_leading_schedule() {
        let s = scheduler();
        assert_eq!(s.timesteps().len(), 20);
        assert!(s.timesteps()[0] > s.timesteps()[19]);
        assert_eq!(s.sigmas().len(), 21);
        assert_eq!(*s.sigmas().last().unwrap(), 0.0);
        assert!(s.sigmas().iter().all(|x| *x >= 0.0));
    }

    #[test]
    fn test_step_before_set_timesteps_is_sequencing_error() {
        let mut s = EulerAncestralScheduler::<TestBackend>::new(ScheduleConfig::sd15(), 0).unwrap();
        let err = s.step(filled(0.1), 999.0, filled(1.0)).unwrap_err();
        assert_eq!(err, SchedulerError::TimestepsNotSet);
        assert!(err.is_sequencing());
    }

    #[test]
    fn test_epsilon_pred_original_matches_closed_form() {
        let mut s = scheduler();
        let t = s.timesteps()[0];
        let sigma = s.sigmas()[0];
        let out = s
            .step_with_noise(filled(0.25), t, filled(2.0), filled(0.0))
            .unwrap();
        let expected = 2.0 - sigma * 0.25;
        for v in values(out.pred_original_sample) {
            assert_eq!(v, expected);
        }
        assert_eq!(s.step_index(), Some(1));
    }

    #[test]
    fn test_sample_prediction_passes_through() {
        let mut s = scheduler();
        s.set_prediction_type(PredictionType::Sample);
        let t = s.timesteps()[0];
        let out = s
            .step_with_noise(filled(0.5), t, filled(3.0), filled(0.0))
            .unwrap();
        assert!(values(out.pred_original_sample).iter().all(|v| *v == 0.5));
    }

    #[test]
    fn test_v_prediction_pred_original() {
        let mut s = scheduler();
        s.set_prediction_type(PredictionType::VPrediction);
        let t = s.timesteps()[0];
        let sigma = s.sigmas()[0];
        let out = s
            .step_with_noise(filled(1.0), t, filled(2.0), filled(0.0))
            .unwrap();
        let s2 = sigma * sigma + 1.0;
        let expected = -sigma / s2.sqrt() + 2.0 / s2;
        for v in values(out.pred_original_sample) {
            assert!((v - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn test_final_step_lands_on_prediction() {
        let mut s = scheduler();
        let timesteps = s.timesteps().to_vec();
        let mut sample = filled(1.0);
        for &t in &timesteps {
            let out = s
                .step_with_noise(filled(0.0), t, sample, filled(0.3))
                .unwrap();
            sample = out.prev_sample;
        }
        // Zero noise prediction keeps x0 = x; the final step has sigma_up = 0
        assert_eq!(s.step_index(), Some(20));
        let last = values(sample);
        assert!(last.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_stepping_past_the_end_fails() {
        let mut s = scheduler();
        for &t in s.timesteps().to_vec().iter() {
            s.step(filled(0.0), t, filled(1.0)).unwrap();
        }
        let err = s.step(filled(0.0), 0.0, filled(1.0)).unwrap_err();
        assert!(matches!(err, SchedulerError::ScheduleExhausted { .. }));
    }

    #[test]
    fn test_same_seed_is_bit_identical() {
        let run = || {
            let mut s = scheduler();
            let mut sample = filled(1.0);
            let mut trace = Vec::new();
            for &t in s.timesteps().to_vec().iter().take(5) {
                sample = s.step(filled(0.1), t, sample).unwrap().prev_sample;
                trace.push(values(sample.clone()));
            }
            trace
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_scale_model_input_sets_cursor() {
        let mut s = scheduler();
        let t = s.timesteps()[3];
        let sigma = s.sigmas()[3];
        let scaled = s.scale_model_input(filled(2.0), t).unwrap();
        assert_eq!(s.step_index(), Some(3));
        let expected = 2.0 / (sigma * sigma + 1.0).sqrt();
        assert!(values(scaled).iter().all(|v| (v - expected).abs() < 1e-6));
    }

    #[test]
    fn test_add_noise_uses_begin_index() {
        let mut s = scheduler();
        s.set_begin_index(8);
        let sigma = s.sigmas()[8];
        let noisy = s.add_noise(filled(1.0), filled(1.0), &[123.0]).unwrap();
        assert!(values(noisy).iter().all(|v| (v - (1.0 + sigma)).abs() < 1e-6));
    }

    #[test]
    fn test_add_noise_rejects_bad_batch() {
        let s = scheduler();
        let err = s
            .add_noise(filled(1.0), filled(1.0), &[950.0, 900.0])
            .unwrap_err();
        assert!(matches!(err, SchedulerError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_init_noise_sigma_by_spacing() {
        let s = scheduler();
        let max = s.sigmas()[0];
        assert!((s.init_noise_sigma() - (max * max + 1.0).sqrt()).abs() < 1e-6);

        let config = ScheduleConfig {
            timestep_spacing: TimestepSpacing::Trailing,
            ..ScheduleConfig::sd15()
        };
        let mut s = EulerAncestralScheduler::<TestBackend>::new(config, 0).unwrap();
        s.set_timesteps(10).unwrap();
        assert_eq!(s.init_noise_sigma(), s.sigmas()[0]);
    }
}
