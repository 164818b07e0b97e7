//! Laplacian pyramid blending
//!
//! Merges two images under a soft mask band by band, so low frequencies mix
//! over wide regions while edges stay sharp. Used to composite inpainted
//! output back onto the source picture.

use burn::prelude::*;
use tracing::debug;

use crate::blend::to_host;
use crate::error::{Result, TilingError};

/// Binomial 5-tap kernel (1, 4, 6, 4, 1) / 16
const KERNEL: [f32; 5] = [1.0 / 16.0, 4.0 / 16.0, 6.0 / 16.0, 4.0 / 16.0, 1.0 / 16.0];

/// Number of Gaussian levels, the full-resolution image included
///
/// Starts at `floor(log2(min_side)) - 3` (at least 2) and shrinks until the
/// coarsest level keeps a shorter side of 4 pixels or more.
pub fn pyramid_levels(height: usize, width: usize) -> Result<usize> {
    let min_side = height.min(width);
    if min_side == 0 {
        return Err(TilingError::EmptyImage);
    }
    let mut levels = (min_side.ilog2() as usize).saturating_sub(3).max(2);
    while levels > 1 && (min_side >> levels) < 4 {
        levels -= 1;
    }
    Ok(levels.max(1))
}

/// Channel-major image on the host, `[channels, height, width]`
#[derive(Debug, Clone, PartialEq)]
pub struct HostImage {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub data: Vec<f32>,
}

impl HostImage {
    pub fn new(channels: usize, height: usize, width: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != channels * height * width {
            return Err(TilingError::ShapeMismatch {
                what: "image data",
                expected: vec![channels * height * width],
                actual: vec![data.len()],
            });
        }
        Ok(Self {
            channels,
            height,
            width,
            data,
        })
    }

    pub fn filled(channels: usize, height: usize, width: usize, value: f32) -> Self {
        Self {
            channels,
            height,
            width,
            data: vec![value; channels * height * width],
        }
    }

    pub fn from_tensor<B: Backend>(tensor: Tensor<B, 3>) -> Result<Self> {
        let [channels, height, width] = tensor.dims();
        Self::new(channels, height, width, to_host(tensor)?)
    }

    pub fn into_tensor<B: Backend>(self, device: &B::Device) -> Tensor<B, 3> {
        Tensor::from_data(
            TensorData::new(self.data, [self.channels, self.height, self.width]),
            device,
        )
    }

    #[inline]
    pub fn at(&self, c: usize, y: usize, x: usize) -> f32 {
        self.data[(c * self.height + y) * self.width + x]
    }

    fn zip_with(&self, other: &Self, f: impl Fn(f32, f32) -> f32) -> Self {
        Self {
            channels: self.channels,
            height: self.height,
            width: self.width,
            data: self
                .data
                .iter()
                .zip(&other.data)
                .map(|(a, b)| f(*a, *b))
                .collect(),
        }
    }
}

/// Blur with the binomial kernel and keep every second pixel
///
/// Output is `height / 2` x `width / 2`; samples past the border are clamped
/// to the edge.
pub fn pyr_down(img: &HostImage) -> HostImage {
    let (h, w) = (img.height, img.width);
    let (out_h, out_w) = (h / 2, w / 2);
    let clamp = |v: isize, len: usize| v.clamp(0, len as isize - 1) as usize;

    // Horizontal pass at decimated columns
    let mut rows = vec![0.0f32; img.channels * h * out_w];
    for c in 0..img.channels {
        for y in 0..h {
            for x in 0..out_w {
                let mut acc = 0.0;
                for (k, weight) in KERNEL.iter().enumerate() {
                    let sx = clamp((2 * x) as isize + k as isize - 2, w);
                    acc += img.at(c, y, sx) * weight;
                }
                rows[(c * h + y) * out_w + x] = acc;
            }
        }
    }

    let mut data = vec![0.0f32; img.channels * out_h * out_w];
    for c in 0..img.channels {
        for y in 0..out_h {
            for x in 0..out_w {
                let mut acc = 0.0;
                for (k, weight) in KERNEL.iter().enumerate() {
                    let sy = clamp((2 * y) as isize + k as isize - 2, h);
                    acc += rows[(c * h + sy) * out_w + x] * weight;
                }
                data[(c * out_h + y) * out_w + x] = acc;
            }
        }
    }

    HostImage {
        channels: img.channels,
        height: out_h,
        width: out_w,
        data,
    }
}

/// Source index and weight of every tap that lands on an inserted sample
fn up_taps(p: usize, len: usize) -> impl Iterator<Item = (usize, f32)> {
    KERNEL.iter().enumerate().filter_map(move |(k, weight)| {
        let shifted = p as isize - (k as isize - 2);
        (shifted.rem_euclid(2) == 0).then(|| {
            let src = shifted.div_euclid(2).clamp(0, len as isize - 1) as usize;
            // x2 per axis, x4 over both
            (src, weight * 2.0)
        })
    })
}

/// Insert zeros between samples and blur back to `target_h` x `target_w`
///
/// Taps falling outside the source are clamped to the nearest edge sample, so
/// a constant image upsamples to the same constant.
pub fn pyr_up(img: &HostImage, target_h: usize, target_w: usize) -> HostImage {
    let (h, w) = (img.height, img.width);

    let mut cols = vec![0.0f32; img.channels * h * target_w];
    for c in 0..img.channels {
        for y in 0..h {
            for x in 0..target_w {
                cols[(c * h + y) * target_w + x] =
                    up_taps(x, w).map(|(sx, wt)| img.at(c, y, sx) * wt).sum();
            }
        }
    }

    let mut data = vec![0.0f32; img.channels * target_h * target_w];
    for c in 0..img.channels {
        for y in 0..target_h {
            for x in 0..target_w {
                data[(c * target_h + y) * target_w + x] = up_taps(y, h)
                    .map(|(sy, wt)| cols[(c * h + sy) * target_w + x] * wt)
                    .sum();
            }
        }
    }

    HostImage {
        channels: img.channels,
        height: target_h,
        width: target_w,
        data,
    }
}

/// Multi-band blender: `a` where the mask is 0, `b` where it is 1
#[derive(Debug, Clone, Copy, Default)]
pub struct PyramidBlender;

impl PyramidBlender {
    pub fn new() -> Self {
        Self
    }

    /// Blends `[C, H, W]` images under a `[1 | C, H, W]` mask
    pub fn blend<B: Backend>(
        &self,
        image_a: Tensor<B, 3>,
        image_b: Tensor<B, 3>,
        mask: Tensor<B, 3>,
    ) -> Result<Tensor<B, 3>> {
        let device = image_a.device();
        let a = HostImage::from_tensor(image_a)?;
        let b = HostImage::from_tensor(image_b)?;
        let mask = HostImage::from_tensor(mask)?;
        Ok(self.blend_host(&a, &b, &mask)?.into_tensor(&device))
    }

    pub fn blend_host(&self, a: &HostImage, b: &HostImage, mask: &HostImage) -> Result<HostImage> {
        let dims = [a.channels, a.height, a.width];
        if [b.channels, b.height, b.width] != dims {
            return Err(TilingError::ShapeMismatch {
                what: "image_b",
                expected: dims.to_vec(),
                actual: vec![b.channels, b.height, b.width],
            });
        }
        if (mask.channels != 1 && mask.channels != a.channels)
            || mask.height != a.height
            || mask.width != a.width
        {
            return Err(TilingError::ShapeMismatch {
                what: "mask",
                expected: vec![a.channels, a.height, a.width],
                actual: vec![mask.channels, mask.height, mask.width],
            });
        }

        let levels = pyramid_levels(a.height, a.width)?;
        debug!(levels, height = a.height, width = a.width, "pyramid blend");

        let gauss_a = gaussian_pyramid(a, levels);
        let gauss_b = gaussian_pyramid(b, levels);
        let gauss_m = gaussian_pyramid(mask, levels);

        let bands: Vec<HostImage> = laplacian_pyramid(&gauss_a)
            .iter()
            .zip(laplacian_pyramid(&gauss_b).iter())
            .zip(&gauss_m)
            .map(|((la, lb), m)| mix(la, lb, m))
            .collect();

        let mut bands = bands.into_iter().rev();
        let Some(mut result) = bands.next() else {
            return Err(TilingError::EmptyImage);
        };
        for band in bands {
            let up = pyr_up(&result, band.height, band.width);
            result = up.zip_with(&band, |u, l| u + l);
        }
        Ok(result)
    }
}

fn gaussian_pyramid(img: &HostImage, levels: usize) -> Vec<HostImage> {
    let mut pyramid = Vec::with_capacity(levels);
    pyramid.push(img.clone());
    for i in 1..levels {
        let next = pyr_down(&pyramid[i - 1]);
        pyramid.push(next);
    }
    pyramid
}

/// Band-pass residuals; the coarsest entry is the Gaussian level itself
fn laplacian_pyramid(gauss: &[HostImage]) -> Vec<HostImage> {
    let mut bands: Vec<HostImage> = gauss
        .windows(2)
        .map(|pair| {
            let up = pyr_up(&pair[1], pair[0].height, pair[0].width);
            pair[0].zip_with(&up, |g, u| g - u)
        })
        .collect();
    if let Some(top) = gauss.last() {
        bands.push(top.clone());
    }
    bands
}

/// `la * (1 - m) + lb * m`, broadcasting a one-channel mask
fn mix(la: &HostImage, lb: &HostImage, mask: &HostImage) -> HostImage {
    let plane = la.height * la.width;
    let data = la
        .data
        .iter()
        .zip(&lb.data)
        .enumerate()
        .map(|(i, (a, b))| {
            let m = if mask.channels == 1 {
                mask.data[i % plane]
            } else {
                mask.data[i]
            };
            a * (1.0 - m) + b * m
        })
        .collect();
    HostImage {
        channels: la.channels,
        height: la.height,
        width: la.width,
        data,
    }
}
