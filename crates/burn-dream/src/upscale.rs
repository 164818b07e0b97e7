//! Tiled 4x super-resolution
//!
//! The upscaler graph takes fixed 192x192 inputs. The image is covered with
//! overlapping input tiles (rows top to bottom, left to right within a row),
//! each tile is upscaled independently and the outputs are fade-blended at
//! the scaled overlap.

use burn::prelude::*;
use burn_dream_tiling::{TileBlender, TileSpace, tile_grid};
use tracing::info;

use crate::config::UpscaleConfig;
use crate::error::{PipelineError, Result, ServiceKind, check_dims};
use crate::services::UpscaleTile;

/// Upscales a `[1, 3, H, W]` image in [0, 1]; the output is clamped to [0, 1]
pub fn upscale_image<B: Backend>(
    upscaler: &dyn UpscaleTile<B>,
    image: Tensor<B, 4>,
    config: &UpscaleConfig,
) -> Result<Tensor<B, 4>> {
    let [batch, channels, height, width] = image.dims();
    let tile = config.tile;
    if batch != 1 || channels != 3 {
        return Err(PipelineError::ShapeMismatch {
            what: "upscaler input",
            expected: vec![1, 3, height, width],
            actual: vec![batch, channels, height, width],
        });
    }
    if height < tile || width < tile {
        return Err(PipelineError::InvalidInput(format!(
            "{width}x{height} image is smaller than the {tile}px upscaler tile"
        )));
    }

    let tiles = tile_grid(width, height, tile, config.min_overlap, TileSpace::Pixel)?;
    info!(tiles = tiles.len(), tile, scale = config.scale, "tiled upscale");

    let out_tile = config.output_tile();
    let mut upscaled = Vec::with_capacity(tiles.len());
    for at in tiles {
        let input = image
            .clone()
            .slice([0..1, 0..3, at.y..at.y + tile, at.x..at.x + tile]);
        let output = upscaler
            .upscale(input)
            .map_err(PipelineError::service(ServiceKind::Upscaler))?;
        check_dims("upscaled tile", [1, 3, out_tile, out_tile], output.dims())?;
        upscaled.push((output, at.scaled(config.scale, TileSpace::Pixel)));
    }

    let blender = TileBlender::new(out_tile, config.output_overlap());
    let blended = blender.blend(upscaled, height * config.scale, width * config.scale)?;
    Ok(blended.clamp(0.0, 1.0))
}
