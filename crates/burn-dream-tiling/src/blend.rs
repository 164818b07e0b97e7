//! Fade-weighted compositing of overlapping tiles
//!
//! Each tile contributes `value * weight` to an accumulator together with its
//! weight; the canvas is the accumulated value divided by the accumulated
//! weight. Weights come from a [`FadeMask`] that ramps linearly towards the
//! tile edges so seams disappear in the overlaps.

use burn::prelude::*;
use tracing::{debug, warn};

use crate::error::{Result, TilingError};
use crate::geometry::TileDescriptor;

/// Smallest accumulated weight used as a divisor
pub const WEIGHT_FLOOR: f32 = 1e-8;

/// Square weight window for one tile
///
/// The window is 1.0 inside and ramps `1/fade, 2/fade, .., 1` over
/// `fade = overlap / 2` pixels on each edge. The ramps are applied to rows
/// and then columns, so corner pixels carry the product of both.
#[derive(Debug, Clone, PartialEq)]
pub struct FadeMask {
    size: usize,
    weights: Vec<f32>,
}

impl FadeMask {
    pub fn new(tile_size: usize, overlap: usize) -> Self {
        let mut weights = vec![1.0f32; tile_size * tile_size];
        let fade = overlap / 2;

        for i in 0..fade.min(tile_size) {
            let alpha = (i + 1) as f32 / fade as f32;
            let far = tile_size - 1 - i;
            for col in 0..tile_size {
                weights[i * tile_size + col] *= alpha;
                weights[far * tile_size + col] *= alpha;
            }
            for row in 0..tile_size {
                weights[row * tile_size + i] *= alpha;
                weights[row * tile_size + far] *= alpha;
            }
        }

        Self {
            size: tile_size,
            weights,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn weight(&self, row: usize, col: usize) -> f32 {
        self.weights[row * self.size + col]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.weights
    }
}

/// Running weighted sum over a `[planes, height, width]` canvas
#[derive(Debug, Clone)]
pub struct BlendAccumulator {
    planes: usize,
    height: usize,
    width: usize,
    values: Vec<f32>,
    weights: Vec<f32>,
}

impl BlendAccumulator {
    pub fn new(planes: usize, height: usize, width: usize) -> Self {
        Self {
            planes,
            height,
            width,
            values: vec![0.0; planes * height * width],
            weights: vec![0.0; height * width],
        }
    }

    /// Adds a `[planes, size, size]` tile at `(x, y)` weighted by `mask`
    pub fn add_tile(&mut self, tile: &[f32], x: usize, y: usize, mask: &FadeMask) -> Result<()> {
        let size = mask.size();
        if x + size > self.width || y + size > self.height {
            return Err(TilingError::TileOutOfBounds {
                x,
                y,
                size,
                width: self.width,
                height: self.height,
            });
        }
        let expected = self.planes * size * size;
        if tile.len() != expected {
            return Err(TilingError::ShapeMismatch {
                what: "tile",
                expected: vec![self.planes, size, size],
                actual: vec![tile.len()],
            });
        }

        let plane_len = self.height * self.width;
        for p in 0..self.planes {
            let src = &tile[p * size * size..(p + 1) * size * size];
            let dst = &mut self.values[p * plane_len..(p + 1) * plane_len];
            for row in 0..size {
                let out_row = (y + row) * self.width + x;
                for col in 0..size {
                    dst[out_row + col] += src[row * size + col] * mask.weight(row, col);
                }
            }
        }

        for row in 0..size {
            let out_row = (y + row) * self.width + x;
            for col in 0..size {
                self.weights[out_row + col] += mask.weight(row, col);
            }
        }
        Ok(())
    }

    /// Divides by the accumulated weight, floored at [`WEIGHT_FLOOR`]
    pub fn finish(self) -> Vec<f32> {
        let uncovered = self.weights.iter().filter(|w| **w < WEIGHT_FLOOR).count();
        if uncovered > 0 {
            warn!(uncovered, "blend canvas has pixels with no tile weight");
        }

        let plane_len = self.height * self.width;
        let mut values = self.values;
        for plane in values.chunks_mut(plane_len) {
            for (v, w) in plane.iter_mut().zip(&self.weights) {
                *v /= w.max(WEIGHT_FLOOR);
            }
        }
        values
    }
}

/// Per-pixel Gaussian produced by a VAE encoder
#[derive(Debug, Clone)]
pub struct DiagonalGaussian<B: Backend> {
    pub mean: Tensor<B, 4>,
    pub std: Tensor<B, 4>,
}

impl<B: Backend> DiagonalGaussian<B> {
    pub fn new(mean: Tensor<B, 4>, std: Tensor<B, 4>) -> Result<Self> {
        if mean.dims() != std.dims() {
            return Err(TilingError::ShapeMismatch {
                what: "std",
                expected: mean.dims().to_vec(),
                actual: std.dims().to_vec(),
            });
        }
        Ok(Self { mean, std })
    }

    /// `mean + std * noise`
    pub fn sample(&self, noise: Tensor<B, 4>) -> Tensor<B, 4> {
        self.mean.clone() + self.std.clone() * noise
    }
}

/// Blends square tiles of one size back into a canvas
#[derive(Debug, Clone)]
pub struct TileBlender {
    tile_size: usize,
    overlap: usize,
    mask: FadeMask,
}

impl TileBlender {
    pub fn new(tile_size: usize, overlap: usize) -> Self {
        Self {
            tile_size,
            overlap,
            mask: FadeMask::new(tile_size, overlap),
        }
    }

    pub fn tile_size(&self) -> usize {
        self.tile_size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    pub fn mask(&self) -> &FadeMask {
        &self.mask
    }

    /// Composites `[N, C, size, size]` tiles into an `[N, C, height, width]` canvas
    pub fn blend<B: Backend>(
        &self,
        tiles: Vec<(Tensor<B, 4>, TileDescriptor)>,
        height: usize,
        width: usize,
    ) -> Result<Tensor<B, 4>> {
        let Some((first, _)) = tiles.first() else {
            return Err(TilingError::EmptyTiles);
        };
        let [batch, channels, _, _] = first.dims();
        let device = first.device();

        let mut acc = BlendAccumulator::new(batch * channels, height, width);
        for (tile, at) in tiles {
            self.check_tile(tile.dims(), &at, [batch, channels])?;
            acc.add_tile(&to_host(tile)?, at.x, at.y, &self.mask)?;
        }
        debug!(height, width, tile_size = self.tile_size, "blended tiles");

        Ok(Tensor::from_data(
            TensorData::new(acc.finish(), [batch, channels, height, width]),
            &device,
        ))
    }

    /// Composites encoder statistics tile by tile
    ///
    /// Mean and standard deviation are blended independently; sample the
    /// result once with [`DiagonalGaussian::sample`].
    pub fn blend_distribution<B: Backend>(
        &self,
        tiles: Vec<(DiagonalGaussian<B>, TileDescriptor)>,
        height: usize,
        width: usize,
    ) -> Result<DiagonalGaussian<B>> {
        let (means, stds): (Vec<_>, Vec<_>) = tiles
            .into_iter()
            .map(|(g, at)| ((g.mean, at), (g.std, at)))
            .unzip();
        let mean = self.blend(means, height, width)?;
        let std = self.blend(stds, height, width)?;
        DiagonalGaussian::new(mean, std)
    }

    fn check_tile(
        &self,
        dims: [usize; 4],
        at: &TileDescriptor,
        leading: [usize; 2],
    ) -> Result<()> {
        let expected = [leading[0], leading[1], self.tile_size, self.tile_size];
        if dims != expected || at.size != self.tile_size {
            return Err(TilingError::ShapeMismatch {
                what: "tile",
                expected: expected.to_vec(),
                actual: dims.to_vec(),
            });
        }
        Ok(())
    }
}

/// Copies a tensor to host memory as f32
pub fn to_host<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| TilingError::Data(format!("{e:?}")))
}
