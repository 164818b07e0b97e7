//! Latent statistics for debug logging and NaN guards

use burn::prelude::*;
use burn_dream_tiling::to_host;

use crate::error::{PipelineError, Result};

/// Summary of a tensor's values
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TensorStats {
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub std: f32,
    pub nan: usize,
    pub inf: usize,
}

impl TensorStats {
    pub fn of(values: &[f32]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let nan = values.iter().filter(|x| x.is_nan()).count();
        let inf = values.iter().filter(|x| x.is_infinite()).count();
        let min = values.iter().copied().fold(f32::INFINITY, f32::min);
        let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        let var = values.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / values.len() as f32;
        Some(Self {
            min,
            max,
            mean,
            std: var.sqrt(),
            nan,
            inf,
        })
    }

    pub fn is_finite(&self) -> bool {
        self.nan == 0 && self.inf == 0
    }
}

impl std::fmt::Display for TensorStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "min={:.4}, max={:.4}, mean={:.4}, std={:.4}",
            self.min, self.max, self.mean, self.std
        )?;
        if !self.is_finite() {
            write!(f, " [NaN={}, Inf={}]", self.nan, self.inf)?;
        }
        Ok(())
    }
}

pub fn tensor_stats<B: Backend, const D: usize>(tensor: &Tensor<B, D>) -> Result<Option<TensorStats>> {
    Ok(TensorStats::of(&to_host(tensor.clone())?))
}

/// Fails with [`PipelineError::NonFinite`] when `tensor` holds NaN or Inf
pub fn check_finite<B: Backend, const D: usize>(tensor: &Tensor<B, D>, name: &str) -> Result<()> {
    match tensor_stats(tensor)? {
        Some(stats) if !stats.is_finite() => {
            Err(PipelineError::NonFinite(format!("{name} ({stats})")))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_stats() {
        let stats = TensorStats::of(&[1.0, 3.0]).unwrap();
        assert_eq!((stats.min, stats.max, stats.mean, stats.std), (1.0, 3.0, 2.0, 1.0));
        assert_eq!(stats.to_string(), "min=1.0000, max=3.0000, mean=2.0000, std=1.0000");
        assert!(TensorStats::of(&[]).is_none());
    }

    #[test]
    fn test_check_finite() {
        let device = Default::default();
        let ok = Tensor::<TestBackend, 2>::ones([2, 2], &device);
        assert!(check_finite(&ok, "latent").is_ok());

        let bad = Tensor::<TestBackend, 1>::from_floats([1.0, f32::NAN, f32::INFINITY], &device);
        let err = check_finite(&bad, "step_3_latent").unwrap_err();
        assert!(matches!(err, PipelineError::NonFinite(ref m) if m.starts_with("step_3_latent")));
        assert!(err.to_string().contains("NaN=1, Inf=1"));
    }
}
