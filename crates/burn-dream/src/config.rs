//! Per-request configuration
//!
//! Everything a generation needs travels in [`GenerationConfig`]; nothing is
//! read from process-wide state.

use burn_dream_samplers::{SamplerType, ScheduleConfig};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Pixel to latent downscale of the VAE
pub const VAE_SCALE_FACTOR: usize = 8;

/// SD 1.x latent scaling constant
pub const SD_LATENT_SCALE: f32 = 0.18215;

/// Debug flags for pipeline and sampler diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Log latent statistics at debug level
    pub sampler: bool,
    /// Abort the request on NaN/Inf latents
    pub nan: bool,
}

/// Tile sizes of the fixed-shape VAE graphs
///
/// Latent sizes are in latent cells, pixel sizes in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TilingConfig {
    /// Decoder input tile
    pub latent_tile: usize,
    /// Minimum overlap between decoder tiles
    pub decode_min_overlap: usize,
    /// Encoder input tile
    pub encode_pixel_tile: usize,
    /// Minimum overlap between encoder tiles
    pub encode_min_overlap: usize,
    /// Fade overlap when blending encoder statistics
    pub blend_latent_overlap: usize,
    /// Fade overlap when blending decoded pixels
    pub blend_pixel_overlap: usize,
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            latent_tile: 64,
            decode_min_overlap: 32,
            encode_pixel_tile: 512,
            encode_min_overlap: 256,
            blend_latent_overlap: 32,
            blend_pixel_overlap: 256,
        }
    }
}

impl TilingConfig {
    pub fn validate(&self) -> Result<()> {
        let f = VAE_SCALE_FACTOR;
        if self.latent_tile == 0 || self.decode_min_overlap >= self.latent_tile {
            return Err(PipelineError::InvalidInput(format!(
                "decoder tile {} with overlap {}",
                self.latent_tile, self.decode_min_overlap
            )));
        }
        if self.encode_pixel_tile == 0
            || self.encode_pixel_tile % f != 0
            || self.encode_min_overlap % f != 0
            || self.encode_min_overlap >= self.encode_pixel_tile
        {
            return Err(PipelineError::InvalidInput(format!(
                "encoder tile {} with overlap {} must be multiples of {f}",
                self.encode_pixel_tile, self.encode_min_overlap
            )));
        }
        Ok(())
    }

    /// Tiled decode needs both latent axes to hold a full tile once either
    /// axis exceeds it
    pub fn check_decode_canvas(&self, latent_height: usize, latent_width: usize) -> Result<()> {
        check_canvas("decode", latent_height, latent_width, self.latent_tile)
    }

    /// Same constraint for the encoder, in pixels
    pub fn check_encode_canvas(&self, height: usize, width: usize) -> Result<()> {
        check_canvas("encode", height, width, self.encode_pixel_tile)
    }
}

fn check_canvas(pass: &str, height: usize, width: usize, tile: usize) -> Result<()> {
    let tiled = height > tile || width > tile;
    if tiled && (height < tile || width < tile) {
        return Err(PipelineError::InvalidInput(format!(
            "{width}x{height} needs tiled {pass} but one side is shorter than the {tile} tile"
        )));
    }
    Ok(())
}

/// Tiled 4x upscaler geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpscaleConfig {
    /// Input tile edge
    pub tile: usize,
    /// Output / input size ratio
    pub scale: usize,
    /// Minimum overlap between input tiles
    pub min_overlap: usize,
}

impl Default for UpscaleConfig {
    fn default() -> Self {
        Self {
            tile: 192,
            scale: 4,
            min_overlap: 12,
        }
    }
}

impl UpscaleConfig {
    pub fn output_tile(&self) -> usize {
        self.tile * self.scale
    }

    /// Fade overlap in output pixels
    pub fn output_overlap(&self) -> usize {
        self.min_overlap * self.scale
    }
}

/// Configuration for one generation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub width: usize,
    pub height: usize,
    pub steps: usize,
    pub guidance_scale: f32,
    /// Random seed; `None` draws one and reports it in the output
    pub seed: Option<u64>,
    /// Fraction of the trajectory to run for img2img (1.0 = from pure noise)
    pub denoise_strength: f32,
    /// Multiplier from VAE latent space to diffusion latent space
    pub latent_scale: f32,
    pub sampler: SamplerType,
    pub schedule: ScheduleConfig,
    pub tiling: TilingConfig,
    pub debug: DebugConfig,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            width: 512,
            height: 512,
            steps: 20,
            guidance_scale: 7.5,
            seed: None,
            denoise_strength: 1.0,
            latent_scale: SD_LATENT_SCALE,
            sampler: SamplerType::default(),
            schedule: ScheduleConfig::sd15(),
            tiling: TilingConfig::default(),
            debug: DebugConfig::default(),
        }
    }
}

impl GenerationConfig {
    pub fn latent_width(&self) -> usize {
        self.width / VAE_SCALE_FACTOR
    }

    pub fn latent_height(&self) -> usize {
        self.height / VAE_SCALE_FACTOR
    }

    /// First step of the trajectory for img2img: `floor(steps * (1 - strength))`,
    /// kept below `steps` so at least one step runs
    pub fn start_step(&self) -> usize {
        let skipped = (self.steps as f64 * (1.0 - self.denoise_strength as f64)).floor() as usize;
        skipped.min(self.steps.saturating_sub(1))
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0
            || self.height == 0
            || self.width % VAE_SCALE_FACTOR != 0
            || self.height % VAE_SCALE_FACTOR != 0
        {
            return Err(PipelineError::InvalidInput(format!(
                "{}x{} is not a positive multiple of {VAE_SCALE_FACTOR}",
                self.width, self.height
            )));
        }
        if self.steps == 0 {
            return Err(PipelineError::InvalidInput("steps must be positive".into()));
        }
        if !(self.denoise_strength > 0.0 && self.denoise_strength <= 1.0) {
            return Err(PipelineError::InvalidInput(format!(
                "denoise strength {} outside (0, 1]",
                self.denoise_strength
            )));
        }
        if !self.guidance_scale.is_finite() || !self.latent_scale.is_normal() {
            return Err(PipelineError::InvalidInput(format!(
                "guidance scale {} / latent scale {}",
                self.guidance_scale, self.latent_scale
            )));
        }
        self.schedule.validate()?;
        self.tiling.validate()?;
        self.tiling
            .check_decode_canvas(self.latent_height(), self.latent_width())
    }
}
