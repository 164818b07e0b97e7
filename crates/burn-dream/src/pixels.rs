//! Conversions between interleaved RGB bytes and CHW float tensors

use burn::prelude::*;
use burn_dream_tiling::to_host;

use crate::error::{PipelineError, Result};

/// Value range of a float image tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelRange {
    /// [-1, 1], VAE input and output
    Signed,
    /// [0, 1], upscaler input and output
    Unit,
}

impl PixelRange {
    fn to_byte(self, v: f32) -> u8 {
        let scaled = match self {
            Self::Signed => (v + 1.0) / 2.0 * 255.0,
            Self::Unit => v * 255.0,
        };
        scaled.clamp(0.0, 255.0) as u8
    }

    fn from_byte(self, b: u8) -> f32 {
        match self {
            Self::Signed => b as f32 / 127.5 - 1.0,
            Self::Unit => b as f32 / 255.0,
        }
    }
}

/// `[1, 3, H, W]` image to interleaved RGB bytes, clamping out-of-range values
pub fn to_rgb8<B: Backend>(image: Tensor<B, 4>, range: PixelRange) -> Result<Vec<u8>> {
    let [batch, channels, height, width] = image.dims();
    if batch != 1 || channels != 3 {
        return Err(PipelineError::ShapeMismatch {
            what: "image",
            expected: vec![1, 3, height, width],
            actual: vec![batch, channels, height, width],
        });
    }
    let planes = to_host(image)?;
    let plane = height * width;
    let mut out = Vec::with_capacity(3 * plane);
    for i in 0..plane {
        for c in 0..3 {
            out.push(range.to_byte(planes[c * plane + i]));
        }
    }
    Ok(out)
}

/// Interleaved RGB bytes to a `[1, 3, H, W]` tensor
pub fn from_rgb8<B: Backend>(
    bytes: &[u8],
    width: usize,
    height: usize,
    range: PixelRange,
    device: &B::Device,
) -> Result<Tensor<B, 4>> {
    let plane = width * height;
    if bytes.len() != plane * 3 {
        return Err(PipelineError::ShapeMismatch {
            what: "rgb buffer",
            expected: vec![height, width, 3],
            actual: vec![bytes.len()],
        });
    }
    let mut data = vec![0.0f32; 3 * plane];
    for (i, px) in bytes.chunks_exact(3).enumerate() {
        for c in 0..3 {
            data[c * plane + i] = range.from_byte(px[c]);
        }
    }
    Ok(Tensor::from_data(
        TensorData::new(data, [1, 3, height, width]),
        device,
    ))
}

/// Decoder output in [-1, 1] to RGB bytes: `clip((x + 1) / 2 * 255)`
pub fn pixels_to_rgb8<B: Backend>(image: Tensor<B, 4>) -> Result<Vec<u8>> {
    to_rgb8(image, PixelRange::Signed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_signed_conversion_clamps() {
        let device = Default::default();
        // One pixel per channel value: R=-1, G=0, B=2
        let image = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(vec![-1.0f32, 0.0, 2.0], [1, 3, 1, 1]),
            &device,
        );
        assert_eq!(pixels_to_rgb8(image).unwrap(), vec![0, 127, 255]);
    }

    #[test]
    fn test_interleaving_roundtrip() {
        let device = Default::default();
        let bytes: Vec<u8> = vec![255, 0, 0, 0, 255, 0, 0, 0, 255, 255, 255, 255];
        let image = from_rgb8::<TestBackend>(&bytes, 2, 2, PixelRange::Unit, &device).unwrap();
        assert_eq!(image.dims(), [1, 3, 2, 2]);
        let red: Vec<f32> = image.clone().slice([0..1, 0..1, 0..2, 0..2]).into_data().to_vec().unwrap();
        assert_eq!(red, vec![1.0, 0.0, 0.0, 1.0]);
        assert_eq!(to_rgb8(image, PixelRange::Unit).unwrap(), bytes);
    }

    #[test]
    fn test_rejects_bad_buffers() {
        let device = Default::default();
        assert!(from_rgb8::<TestBackend>(&[0; 5], 1, 2, PixelRange::Signed, &device).is_err());
        let gray = Tensor::<TestBackend, 4>::zeros([1, 1, 2, 2], &device);
        assert!(to_rgb8(gray, PixelRange::Signed).is_err());
    }
}
