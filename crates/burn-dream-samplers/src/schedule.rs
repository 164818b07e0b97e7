//! Noise schedules and timestep spacing
//!
//! This module holds the pieces shared by every scheduler: beta schedules,
//! the base sigma curve, timestep spacing policies, sigma interpolation and
//! the step cursor bookkeeping.

use std::fmt;
use std::str::FromStr;

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

// ============================================================================
// Named options
// ============================================================================

/// Shape of the beta curve used during training
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    /// Betas evenly spaced between `beta_start` and `beta_end`
    Linear,
    /// Square roots evenly spaced, then squared (SD 1.x)
    #[default]
    ScaledLinear,
    /// Capped cosine alpha-bar schedule
    SquaredcosCapV2,
}

impl BetaSchedule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Linear => "linear",
            Self::ScaledLinear => "scaled_linear",
            Self::SquaredcosCapV2 => "squaredcos_cap_v2",
        }
    }
}

impl FromStr for BetaSchedule {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "linear" => Ok(Self::Linear),
            "scaled_linear" => Ok(Self::ScaledLinear),
            "squaredcos_cap_v2" => Ok(Self::SquaredcosCapV2),
            other => Err(SchedulerError::UnsupportedBetaSchedule(other.to_string())),
        }
    }
}

impl fmt::Display for BetaSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How inference timesteps are picked from the training range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestepSpacing {
    /// Evenly divides `[0, T-1]`
    Linspace,
    /// Integer stride grid counted from zero, reversed
    #[default]
    Leading,
    /// Fractional stride grid counted from the end, rounded
    Trailing,
}

impl TimestepSpacing {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Linspace => "linspace",
            Self::Leading => "leading",
            Self::Trailing => "trailing",
        }
    }

    /// Timesteps for single-step samplers (Euler family)
    ///
    /// Returned in descending order. `steps_offset` only shifts the leading grid.
    pub fn timesteps(
        self,
        num_inference_steps: usize,
        num_train_timesteps: usize,
        steps_offset: usize,
    ) -> Result<Vec<f32>> {
        check_step_count(num_inference_steps, num_train_timesteps)?;
        let n = num_inference_steps;
        let t = num_train_timesteps;

        let timesteps = match self {
            Self::Linspace => {
                if n == 1 {
                    vec![(t - 1) as f32]
                } else {
                    let last = (t - 1) as f64;
                    (0..n)
                        .map(|i| (last - i as f64 * last / (n - 1) as f64) as f32)
                        .collect()
                }
            }
            Self::Leading => {
                let step_ratio = t / n;
                (0..n)
                    .map(|i| ((n - 1 - i) * step_ratio + steps_offset) as f32)
                    .collect()
            }
            Self::Trailing => trailing_grid(n, t),
        };
        Ok(timesteps)
    }

    /// Timesteps for multistep solvers
    ///
    /// Multistep solvers lay an `n + 1` point grid over the training range and
    /// drop the final (zero) point, so the first step starts slightly below the
    /// top of the range.
    pub fn multistep_timesteps(
        self,
        num_inference_steps: usize,
        num_train_timesteps: usize,
        steps_offset: usize,
    ) -> Result<Vec<f32>> {
        check_step_count(num_inference_steps, num_train_timesteps)?;
        let n = num_inference_steps;
        let t = num_train_timesteps;

        let timesteps = match self {
            Self::Linspace => {
                let last = (t - 1) as f64;
                (1..=n)
                    .rev()
                    .map(|k| (last * k as f64 / n as f64).round_ties_even() as f32)
                    .collect()
            }
            Self::Leading => {
                let step_ratio = t / (n + 1);
                if step_ratio == 0 {
                    return Err(SchedulerError::InvalidConfig(format!(
                        "{n} leading steps do not fit in {t} training timesteps"
                    )));
                }
                (1..=n)
                    .rev()
                    .map(|k| (k * step_ratio + steps_offset) as f32)
                    .collect()
            }
            Self::Trailing => trailing_grid(n, t),
        };
        Ok(timesteps)
    }
}

impl FromStr for TimestepSpacing {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "linspace" => Ok(Self::Linspace),
            "leading" => Ok(Self::Leading),
            "trailing" => Ok(Self::Trailing),
            other => Err(SchedulerError::UnsupportedSpacing(other.to_string())),
        }
    }
}

impl fmt::Display for TimestepSpacing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the denoiser network predicts
///
/// - Epsilon (noise): SD 1.x, SDXL
/// - V-prediction (velocity): SD 2.x and some fine-tunes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PredictionType {
    /// Model predicts the noise added to the sample
    #[default]
    #[serde(rename = "epsilon")]
    Epsilon,
    /// Model predicts the velocity v = alpha_t * epsilon - sigma_t * x0
    #[serde(rename = "v_prediction")]
    VPrediction,
    /// Model predicts the clean sample directly
    #[serde(rename = "sample")]
    Sample,
}

impl PredictionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Epsilon => "epsilon",
            Self::VPrediction => "v_prediction",
            Self::Sample => "sample",
        }
    }
}

impl FromStr for PredictionType {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "epsilon" => Ok(Self::Epsilon),
            "v_prediction" => Ok(Self::VPrediction),
            "sample" => Ok(Self::Sample),
            other => Err(SchedulerError::UnsupportedPredictionType(other.to_string())),
        }
    }
}

impl fmt::Display for PredictionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Schedule Configuration
// ============================================================================

/// Training-time noise schedule plus inference options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Number of training timesteps (T)
    pub num_train_timesteps: usize,
    pub beta_start: f64,
    pub beta_end: f64,
    pub beta_schedule: BetaSchedule,
    pub prediction_type: PredictionType,
    pub timestep_spacing: TimestepSpacing,
    /// Added to every timestep of the leading grid
    pub steps_offset: usize,
    /// Rescale betas so the final timestep has zero SNR
    pub rescale_betas_zero_snr: bool,
}

impl ScheduleConfig {
    /// Stable Diffusion 1.5 training schedule
    pub fn sd15() -> Self {
        Self {
            num_train_timesteps: 1000,
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
            prediction_type: PredictionType::Epsilon,
            timestep_spacing: TimestepSpacing::Leading,
            steps_offset: 0,
            rescale_betas_zero_snr: false,
        }
    }

    /// SD 1.5 schedule for v-prediction fine-tunes
    pub fn sd15_v_prediction() -> Self {
        Self {
            prediction_type: PredictionType::VPrediction,
            ..Self::sd15()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_train_timesteps < 2 {
            return Err(SchedulerError::InvalidConfig(format!(
                "num_train_timesteps must be at least 2, got {}",
                self.num_train_timesteps
            )));
        }
        if self.beta_schedule != BetaSchedule::SquaredcosCapV2 {
            let valid = self.beta_start.is_finite()
                && self.beta_end.is_finite()
                && self.beta_start >= 0.0
                && self.beta_start <= self.beta_end
                && self.beta_end < 1.0;
            if !valid {
                return Err(SchedulerError::InvalidConfig(format!(
                    "beta range [{}, {}] must satisfy 0 <= start <= end < 1",
                    self.beta_start, self.beta_end
                )));
            }
        }
        Ok(())
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self::sd15()
    }
}

/// Precomputed training schedule
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    /// Per-timestep betas after any rescaling
    pub betas: Vec<f64>,
    /// Cumulative product of alphas: ᾱₜ
    pub alphas_cumprod: Vec<f64>,
}

impl NoiseSchedule {
    pub fn new(config: &ScheduleConfig) -> Result<Self> {
        config.validate()?;
        let n = config.num_train_timesteps;

        let mut betas: Vec<f64> = match config.beta_schedule {
            BetaSchedule::Linear => linspace(config.beta_start, config.beta_end, n),
            BetaSchedule::ScaledLinear => {
                linspace(config.beta_start.sqrt(), config.beta_end.sqrt(), n)
                    .into_iter()
                    .map(|b| b * b)
                    .collect()
            }
            BetaSchedule::SquaredcosCapV2 => betas_for_alpha_bar(n, 0.999),
        };

        if config.rescale_betas_zero_snr {
            betas = rescale_zero_terminal_snr(&betas);
        }

        let mut alphas_cumprod = Vec::with_capacity(n);
        let mut cumprod = 1.0f64;
        for beta in &betas {
            cumprod *= 1.0 - beta;
            alphas_cumprod.push(cumprod);
        }

        if config.rescale_betas_zero_snr {
            // Exactly zero would make the terminal sigma infinite
            alphas_cumprod[n - 1] = 2f64.powi(-24);
        }

        Ok(Self {
            betas,
            alphas_cumprod,
        })
    }

    pub fn num_train_timesteps(&self) -> usize {
        self.alphas_cumprod.len()
    }

    /// sigma = sqrt((1 - ᾱ) / ᾱ), indexed by training timestep
    pub fn sigmas(&self) -> Vec<f64> {
        self.alphas_cumprod
            .iter()
            .map(|ac| ((1.0 - ac) / ac).sqrt())
            .collect()
    }
}

fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![start];
    }
    (0..n)
        .map(|i| start + (end - start) * i as f64 / (n - 1) as f64)
        .collect()
}

/// Betas from the capped cosine alpha-bar curve
pub fn betas_for_alpha_bar(num_diffusion_timesteps: usize, max_beta: f64) -> Vec<f64> {
    let alpha_bar = |t: f64| {
        let c = ((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).cos();
        c * c
    };
    let n = num_diffusion_timesteps as f64;
    (0..num_diffusion_timesteps)
        .map(|i| {
            let t1 = i as f64 / n;
            let t2 = (i + 1) as f64 / n;
            (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(max_beta)
        })
        .collect()
}

/// Shift and scale sqrt(ᾱ) so the last timestep carries no signal
pub fn rescale_zero_terminal_snr(betas: &[f64]) -> Vec<f64> {
    if betas.is_empty() {
        return Vec::new();
    }

    let mut cumprod = 1.0f64;
    let mut sqrt_bar: Vec<f64> = betas
        .iter()
        .map(|b| {
            cumprod *= 1.0 - b;
            cumprod.sqrt()
        })
        .collect();

    let first = sqrt_bar[0];
    let last = sqrt_bar[sqrt_bar.len() - 1];
    for v in sqrt_bar.iter_mut() {
        *v = (*v - last) * first / (first - last);
    }

    let alphas_bar: Vec<f64> = sqrt_bar.iter().map(|v| v * v).collect();
    let mut rescaled = Vec::with_capacity(alphas_bar.len());
    rescaled.push(1.0 - alphas_bar[0]);
    for w in alphas_bar.windows(2) {
        rescaled.push(1.0 - w[1] / w[0]);
    }
    rescaled
}

fn check_step_count(num_inference_steps: usize, num_train_timesteps: usize) -> Result<()> {
    if num_inference_steps == 0 {
        return Err(SchedulerError::InvalidConfig(
            "num_inference_steps must be at least 1".to_string(),
        ));
    }
    if num_inference_steps > num_train_timesteps {
        return Err(SchedulerError::InvalidConfig(format!(
            "num_inference_steps ({num_inference_steps}) cannot exceed \
             num_train_timesteps ({num_train_timesteps})"
        )));
    }
    Ok(())
}

fn trailing_grid(n: usize, t: usize) -> Vec<f32> {
    let step_ratio = t as f64 / n as f64;
    (0..n)
        .map(|i| ((t as f64 - i as f64 * step_ratio).round_ties_even() - 1.0) as f32)
        .collect()
}

// ============================================================================
// Sigma Utilities (shared across schedulers)
// ============================================================================

/// Sample the base sigma curve at (possibly fractional) timesteps
///
/// Values outside the training range clamp to the end points. A terminal
/// sigma of 0 is appended.
pub fn interpolate_sigmas(base_sigmas: &[f64], timesteps: &[f32]) -> Vec<f32> {
    let last = base_sigmas.len().saturating_sub(1);
    let mut sigmas: Vec<f32> = timesteps
        .iter()
        .map(|&t| {
            let t = t as f64;
            if t <= 0.0 {
                base_sigmas[0] as f32
            } else if t >= last as f64 {
                base_sigmas[last] as f32
            } else {
                let lo = t.floor() as usize;
                let hi = t.ceil() as usize;
                let w = t - lo as f64;
                (base_sigmas[lo] * (1.0 - w) + base_sigmas[hi] * w) as f32
            }
        })
        .collect();
    sigmas.push(0.0);
    sigmas
}

/// Split a sigma transition into a deterministic target and a noise level
///
/// Returns `(sigma_down, sigma_up)` with `sigma_down² + sigma_up² = sigma_to²`.
pub fn ancestral_step(sigma_from: f32, sigma_to: f32) -> (f32, f32) {
    if sigma_to == 0.0 {
        return (0.0, 0.0);
    }
    let from2 = sigma_from * sigma_from;
    let to2 = sigma_to * sigma_to;
    let sigma_up = (to2 * (from2 - to2) / from2).sqrt();
    let sigma_down = (to2 - sigma_up * sigma_up).sqrt();
    (sigma_down, sigma_up)
}

/// Broadcastable `[n, 1, 1, 1]` tensor of per-sample scalars
pub(crate) fn per_sample<B: Backend>(values: Vec<f32>, device: &B::Device) -> Tensor<B, 4> {
    let n = values.len();
    Tensor::from_data(TensorData::new(values, [n, 1, 1, 1]), device)
}

pub(crate) fn check_same_dims(
    what: &'static str,
    expected: [usize; 4],
    actual: [usize; 4],
) -> Result<()> {
    if expected != actual {
        return Err(SchedulerError::ShapeMismatch {
            what,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        });
    }
    Ok(())
}

// ============================================================================
// Step cursor
// ============================================================================

/// Timesteps, sigmas and the step cursor of one scheduler
#[derive(Debug, Clone)]
pub(crate) struct Trajectory {
    pub timesteps: Vec<f32>,
    /// One entry per timestep plus a trailing 0
    pub sigmas: Vec<f32>,
    pub num_inference_steps: Option<usize>,
    pub step_index: Option<usize>,
    pub begin_index: Option<usize>,
}

impl Trajectory {
    /// Whole training range in descending order, before `set_timesteps`
    pub fn full_range(base_sigmas: &[f64]) -> Self {
        let n = base_sigmas.len();
        let timesteps = (0..n).rev().map(|t| t as f32).collect();
        let mut sigmas: Vec<f32> = base_sigmas.iter().rev().map(|&s| s as f32).collect();
        sigmas.push(0.0);
        Self {
            timesteps,
            sigmas,
            num_inference_steps: None,
            step_index: None,
            begin_index: None,
        }
    }

    pub fn planned(timesteps: Vec<f32>, base_sigmas: &[f64]) -> Self {
        let sigmas = interpolate_sigmas(base_sigmas, &timesteps);
        Self {
            num_inference_steps: Some(timesteps.len()),
            timesteps,
            sigmas,
            step_index: None,
            begin_index: None,
        }
    }

    /// Position of `timestep` in the schedule
    ///
    /// A timestep that appears twice resolves to its second occurrence so a
    /// trajectory started mid-way does not skip a sigma. Unknown timesteps
    /// resolve to the last index.
    pub fn index_for_timestep(&self, timestep: f32) -> usize {
        let wanted = timestep as i64;
        let mut matches = self
            .timesteps
            .iter()
            .enumerate()
            .filter(|(_, t)| **t as i64 == wanted)
            .map(|(i, _)| i);
        match (matches.next(), matches.next()) {
            (_, Some(second)) => second,
            (Some(first), None) => first,
            (None, _) => self.timesteps.len().saturating_sub(1),
        }
    }

    /// Current step index, resolving it from `timestep` on first use
    pub fn ensure_step_index(&mut self, timestep: f32) -> usize {
        match self.step_index {
            Some(index) => index,
            None => {
                let index = self
                    .begin_index
                    .unwrap_or_else(|| self.index_for_timestep(timestep));
                self.step_index = Some(index);
                index
            }
        }
    }

    /// `(sigma, sigma_next)` for a step starting at `index`
    pub fn step_sigmas(&self, index: usize) -> Result<(f32, f32)> {
        match (self.sigmas.get(index), self.sigmas.get(index + 1)) {
            (Some(&from), Some(&to)) => Ok((from, to)),
            _ => Err(SchedulerError::ScheduleExhausted {
                index,
                len: self.timesteps.len(),
            }),
        }
    }

    pub fn sigma_at(&self, index: usize) -> Result<f32> {
        self.sigmas
            .get(index)
            .copied()
            .ok_or(SchedulerError::ScheduleExhausted {
                index,
                len: self.timesteps.len(),
            })
    }

    /// Step indices used by `add_noise` for each requested timestep
    ///
    /// Without a begin index every timestep is looked up. Once a begin index
    /// is set the live cursor wins, falling back to the begin index itself.
    pub fn noise_indices(&self, timesteps: &[f32]) -> Vec<usize> {
        match (self.begin_index, self.step_index) {
            (None, _) => timesteps
                .iter()
                .map(|&t| self.index_for_timestep(t))
                .collect(),
            (Some(_), Some(step)) => vec![step; timesteps.len()],
            (Some(begin), None) => vec![begin; timesteps.len()],
        }
    }

    pub fn current_sigma(&self) -> f32 {
        match self.step_index {
            None => self.sigmas[0],
            Some(index) => self.sigmas[index.min(self.sigmas.len() - 1)],
        }
    }

    pub fn max_sigma(&self) -> f32 {
        self.sigmas.iter().copied().fold(0.0, f32::max)
    }

    pub fn advance(&mut self) {
        self.step_index = Some(self.step_index.map_or(1, |i| i + 1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip_through_from_str() {
        for name in ["linear", "scaled_linear", "squaredcos_cap_v2"] {
            assert_eq!(name.parse::<BetaSchedule>().unwrap().as_str(), name);
        }
        for name in ["linspace", "leading", "trailing"] {
            assert_eq!(name.parse::<TimestepSpacing>().unwrap().as_str(), name);
        }
        for name in ["epsilon", "v_prediction", "sample"] {
            assert_eq!(name.parse::<PredictionType>().unwrap().as_str(), name);
        }
    }

    #[test]
    fn test_unknown_names_are_configuration_errors() {
        let err = "karras".parse::<BetaSchedule>().unwrap_err();
        assert_eq!(err, SchedulerError::UnsupportedBetaSchedule("karras".into()));
        assert!(err.is_configuration());

        let err = "uniform".parse::<TimestepSpacing>().unwrap_err();
        assert!(matches!(err, SchedulerError::UnsupportedSpacing(_)));

        let err = "flow".parse::<PredictionType>().unwrap_err();
        assert!(matches!(err, SchedulerError::UnsupportedPredictionType(_)));
    }

    #[test]
    fn test_serde_uses_source_names() {
        let json = serde_json::to_string(&PredictionType::VPrediction).unwrap();
        assert_eq!(json, "\"v_prediction\"");

        let config: ScheduleConfig = serde_json::from_str(
            r#"{"beta_schedule": "squaredcos_cap_v2", "timestep_spacing": "trailing"}"#,
        )
        .unwrap();
        assert_eq!(config.beta_schedule, BetaSchedule::SquaredcosCapV2);
        assert_eq!(config.timestep_spacing, TimestepSpacing::Trailing);
        assert_eq!(config.num_train_timesteps, 1000);
    }

    #[test]
    fn test_scaled_linear_schedule_matches_sd15() {
        let schedule = NoiseSchedule::new(&ScheduleConfig::sd15()).unwrap();
        assert_eq!(schedule.num_train_timesteps(), 1000);
        assert!((schedule.betas[0] - 0.00085).abs() < 1e-9);
        assert!((schedule.betas[999] - 0.012).abs() < 1e-9);

        let sigmas = schedule.sigmas();
        assert!((sigmas[0] - 0.029168).abs() < 1e-4);
        assert!((sigmas[999] - 14.6146).abs() < 1e-3);
    }

    #[test]
    fn test_cosine_betas_are_capped() {
        let betas = betas_for_alpha_bar(1000, 0.999);
        assert_eq!(betas.len(), 1000);
        assert!(betas.iter().all(|b| *b > 0.0 && *b <= 0.999));
        assert!((betas[999] - 0.999).abs() < 1e-12);
    }

    #[test]
    fn test_zero_snr_rescale_reaches_zero_signal() {
        let config = ScheduleConfig {
            rescale_betas_zero_snr: true,
            ..ScheduleConfig::sd15()
        };
        let schedule = NoiseSchedule::new(&config).unwrap();
        let last = *schedule.alphas_cumprod.last().unwrap();
        assert_eq!(last, 2f64.powi(-24));
        // First alpha_bar is preserved by the rescale
        let plain = NoiseSchedule::new(&ScheduleConfig::sd15()).unwrap();
        assert!((schedule.alphas_cumprod[0] - plain.alphas_cumprod[0]).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_beta_range_rejected() {
        let config = ScheduleConfig {
            beta_start: 0.02,
            beta_end: 0.01,
            ..ScheduleConfig::sd15()
        };
        assert!(NoiseSchedule::new(&config).unwrap_err().is_configuration());
    }

    #[test]
    fn test_leading_timesteps() {
        let ts = TimestepSpacing::Leading.timesteps(20, 1000, 0).unwrap();
        assert_eq!(ts.len(), 20);
        assert_eq!(ts[0], 950.0);
        assert_eq!(ts[19], 0.0);

        let ts = TimestepSpacing::Leading.timesteps(20, 1000, 1).unwrap();
        assert_eq!(ts[0], 951.0);
        assert_eq!(ts[19], 1.0);
    }

    #[test]
    fn test_linspace_timesteps() {
        let ts = TimestepSpacing::Linspace.timesteps(4, 1000, 0).unwrap();
        assert_eq!(ts, vec![999.0, 666.0, 333.0, 0.0]);

        let single = TimestepSpacing::Linspace.timesteps(1, 1000, 0).unwrap();
        assert_eq!(single, vec![999.0]);
    }

    #[test]
    fn test_trailing_timesteps_stay_in_range() {
        let ts = TimestepSpacing::Trailing.timesteps(10, 1000, 0).unwrap();
        assert_eq!(ts[0], 999.0);
        assert_eq!(ts[9], 99.0);
        assert!(ts.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn test_multistep_leading_timesteps() {
        let ts = TimestepSpacing::Leading
            .multistep_timesteps(20, 1000, 1)
            .unwrap();
        // step ratio 1000 / 21 = 47
        assert_eq!(ts[0], 941.0);
        assert_eq!(ts[19], 48.0);
    }

    #[test]
    fn test_step_count_bounds() {
        let err = TimestepSpacing::Leading.timesteps(0, 1000, 0).unwrap_err();
        assert!(err.is_configuration());
        let err = TimestepSpacing::Leading.timesteps(1001, 1000, 0).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_interpolate_sigmas_clamps_and_appends_zero() {
        let base = vec![1.0, 2.0, 3.0, 4.0];
        let sigmas = interpolate_sigmas(&base, &[5.0, 1.5, -1.0]);
        assert_eq!(sigmas, vec![4.0, 2.5, 1.0, 0.0]);
    }

    #[test]
    fn test_ancestral_step_preserves_variance() {
        let (down, up) = ancestral_step(10.0, 5.0);
        assert!((down * down + up * up - 25.0).abs() < 1e-4);
        assert_eq!(ancestral_step(3.0, 0.0), (0.0, 0.0));
    }

    #[test]
    fn test_index_lookup_prefers_second_occurrence() {
        let mut traj = Trajectory::full_range(&[0.1, 0.2, 0.3]);
        traj.timesteps = vec![5.0, 5.0, 3.0];
        assert_eq!(traj.index_for_timestep(5.0), 1);
        assert_eq!(traj.index_for_timestep(3.0), 2);
        assert_eq!(traj.index_for_timestep(42.0), 2);
    }

    #[test]
    fn test_noise_indices_follow_cursor_once_begin_is_set() {
        let base = vec![0.1, 0.2, 0.3, 0.4];
        let mut traj = Trajectory::planned(vec![3.0, 2.0, 1.0], &base);
        assert_eq!(traj.noise_indices(&[2.0, 1.0]), vec![1, 2]);

        traj.begin_index = Some(1);
        assert_eq!(traj.noise_indices(&[3.0]), vec![1]);

        traj.step_index = Some(2);
        assert_eq!(traj.noise_indices(&[3.0, 3.0]), vec![2, 2]);
    }
}
