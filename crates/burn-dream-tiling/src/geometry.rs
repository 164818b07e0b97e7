//! Tile layout for fixed-size inference graphs
//!
//! Networks compiled for one input size (64x64 latents, 512x512 pixels,
//! 192x192 upscaler tiles) process larger canvases as a grid of overlapping
//! tiles. The layout never pads: the last tile on each axis is pulled back so
//! it ends exactly on the canvas edge.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TilingError};

/// Coordinate space a tile lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TileSpace {
    /// VAE latent grid (1/8 of pixel resolution)
    Latent,
    /// Image pixels
    Pixel,
}

/// One square tile of a canvas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileDescriptor {
    pub x: usize,
    pub y: usize,
    pub size: usize,
    pub space: TileSpace,
}

impl TileDescriptor {
    pub fn new(x: usize, y: usize, size: usize, space: TileSpace) -> Self {
        Self { x, y, size, space }
    }

    /// The same tile with origin and size multiplied by `factor`
    pub fn scaled(&self, factor: usize, space: TileSpace) -> Self {
        Self {
            x: self.x * factor,
            y: self.y * factor,
            size: self.size * factor,
            space,
        }
    }

    /// Whether the tile lies inside a `width` x `height` canvas
    pub fn fits(&self, width: usize, height: usize) -> bool {
        self.x + self.size <= width && self.y + self.size <= height
    }
}

/// Tile origins covering `dimension` with at least `min_overlap` between neighbours
///
/// Origins start at 0, increase monotonically, and the last one is exactly
/// `dimension - tile_size`. The displacement is spread over equal integer
/// strides with the remainder going to the first strides.
pub fn compute_tile_origins(
    dimension: usize,
    tile_size: usize,
    min_overlap: usize,
) -> Result<Vec<usize>> {
    if tile_size == 0 {
        return Err(TilingError::InvalidGeometry(
            "tile size must be positive".to_string(),
        ));
    }
    if dimension <= tile_size {
        return Ok(vec![0]);
    }
    if min_overlap >= tile_size {
        return Err(TilingError::InvalidGeometry(format!(
            "overlap {min_overlap} must be smaller than tile size {tile_size}"
        )));
    }

    let effective = tile_size - min_overlap;
    let total_distance = dimension - tile_size;
    let num_strides = total_distance.div_ceil(effective);

    let base_stride = total_distance / num_strides;
    let remainder = total_distance % num_strides;

    let mut origins = Vec::with_capacity(num_strides + 1);
    origins.push(0);
    let mut current = 0;
    for i in 0..num_strides {
        current += base_stride + usize::from(i < remainder);
        origins.push(current);
    }
    if let Some(last) = origins.last_mut() {
        *last = total_distance;
    }
    Ok(origins)
}

/// Row-major grid of tiles covering a `width` x `height` canvas
pub fn tile_grid(
    width: usize,
    height: usize,
    tile_size: usize,
    min_overlap: usize,
    space: TileSpace,
) -> Result<Vec<TileDescriptor>> {
    let xs = compute_tile_origins(width, tile_size, min_overlap)?;
    let ys = compute_tile_origins(height, tile_size, min_overlap)?;

    Ok(ys
        .iter()
        .flat_map(|&y| {
            xs.iter()
                .map(move |&x| TileDescriptor::new(x, y, tile_size, space))
        })
        .collect())
}
