//! Seeded Gaussian noise
//!
//! Noise is drawn on the host from a ChaCha8 stream so a seed reproduces the
//! same tensors on every backend.

use burn::prelude::*;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

/// Standard normal tensor of the given shape
pub fn gaussian_noise<B: Backend, R: Rng + ?Sized, const D: usize>(
    rng: &mut R,
    shape: [usize; D],
    device: &B::Device,
) -> Tensor<B, D> {
    let len: usize = shape.iter().product();
    let values: Vec<f32> = (0..len).map(|_| StandardNormal.sample(rng)).collect();
    Tensor::from_data(TensorData::new(values, shape), device)
}

/// Standard normal tensor shaped like `like`
pub fn gaussian_like<B: Backend, R: Rng + ?Sized, const D: usize>(
    rng: &mut R,
    like: &Tensor<B, D>,
) -> Tensor<B, D> {
    gaussian_noise(rng, like.dims(), &like.device())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_same_seed_same_noise() {
        let device = Default::default();
        let a: Tensor<TestBackend, 4> =
            gaussian_noise(&mut ChaCha8Rng::seed_from_u64(7), [1, 4, 8, 8], &device);
        let b: Tensor<TestBackend, 4> =
            gaussian_noise(&mut ChaCha8Rng::seed_from_u64(7), [1, 4, 8, 8], &device);
        assert_eq!(
            a.into_data().to_vec::<f32>().unwrap(),
            b.into_data().to_vec::<f32>().unwrap()
        );
    }

    #[test]
    fn test_noise_is_roughly_standard() {
        let device = Default::default();
        let noise: Tensor<TestBackend, 1> =
            gaussian_noise(&mut ChaCha8Rng::seed_from_u64(1), [20_000], &device);
        let values = noise.into_data().to_vec::<f32>().unwrap();
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / values.len() as f32;
        assert!(mean.abs() < 0.05, "mean {mean}");
        assert!((var - 1.0).abs() < 0.05, "var {var}");
    }
}
