//! burn-dream CLI
//!
//! Inspection and compositing tools around the generation pipeline:
//! - `schedule`: timesteps and sigmas a sampler will visit
//! - `tiles`: the tile layout used for a canvas
//! - `blend`: Laplacian pyramid blend of two images under a mask

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use burn::prelude::*;
use burn_dream::backends::{DefaultBackend, backend_name, default_device};
use burn_dream::samplers::{
    BetaSchedule, DiffusionScheduler, PredictionType, SamplerType, ScheduleConfig, Scheduler,
    TimestepSpacing,
};
use burn_dream::tiling::{PyramidBlender, TileSpace, compute_tile_origins, tile_grid};
use burn_dream::{PixelRange, from_rgb8, to_rgb8};
use clap::{Parser, Subcommand, ValueEnum};
use image::{ImageBuffer, Rgb};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "burn-dream")]
#[command(about = "Diffusion schedule, tiling and blending tools")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Coordinate space for `tiles`
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Space {
    Latent,
    Pixel,
}

impl From<Space> for TileSpace {
    fn from(space: Space) -> Self {
        match space {
            Space::Latent => TileSpace::Latent,
            Space::Pixel => TileSpace::Pixel,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Print the timesteps and sigmas of a sampler
    Schedule {
        /// Sampler: euler_a, dpm++, dpm++1, dpm++3m
        #[arg(long, default_value = "dpm++")]
        sampler: SamplerType,

        /// Number of inference steps
        #[arg(long, default_value = "20")]
        steps: usize,

        /// Timestep spacing: linspace, leading, trailing
        #[arg(long, default_value = "leading")]
        spacing: TimestepSpacing,

        /// Beta schedule: linear, scaled_linear, squaredcos_cap_v2
        #[arg(long, default_value = "scaled_linear")]
        beta_schedule: BetaSchedule,

        /// Model prediction: epsilon, v_prediction, sample
        #[arg(long, default_value = "epsilon")]
        prediction: PredictionType,

        /// Offset added to leading timesteps
        #[arg(long, default_value = "0")]
        steps_offset: usize,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Print the tile layout covering a canvas
    Tiles {
        #[arg(long)]
        width: usize,

        #[arg(long)]
        height: usize,

        /// Tile edge length
        #[arg(long, default_value = "64")]
        tile: usize,

        /// Minimum overlap between neighbouring tiles
        #[arg(long, default_value = "32")]
        overlap: usize,

        #[arg(long, value_enum, default_value = "latent")]
        space: Space,

        /// Print JSON instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// Blend `source` into `target` where the mask is white
    Blend {
        /// Image kept where the mask is black
        #[arg(long)]
        target: PathBuf,

        /// Image taken where the mask is white
        #[arg(long)]
        source: PathBuf,

        /// Grayscale mask, same size as both images
        #[arg(long)]
        mask: PathBuf,

        /// Output image path
        #[arg(short, long, default_value = "blended.png")]
        output: PathBuf,
    },
}

fn run_schedule(
    sampler: SamplerType,
    steps: usize,
    schedule: ScheduleConfig,
    json: bool,
) -> Result<()> {
    let mut scheduler = DiffusionScheduler::<DefaultBackend>::new(sampler, schedule, 0)
        .context("Failed to build scheduler")?;
    scheduler
        .set_timesteps(steps)
        .with_context(|| format!("Failed to plan {steps} steps"))?;

    if json {
        let value = serde_json::json!({
            "sampler": sampler.to_string(),
            "init_noise_sigma": scheduler.init_noise_sigma(),
            "timesteps": scheduler.timesteps(),
            "sigmas": scheduler.sigmas(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Sampler:          {sampler}");
    println!("Init noise sigma: {:.4}", scheduler.init_noise_sigma());
    println!();
    println!("{:>5}  {:>9}  {:>10}", "step", "timestep", "sigma");
    for (i, (t, sigma)) in scheduler
        .timesteps()
        .iter()
        .zip(scheduler.sigmas())
        .enumerate()
    {
        println!("{i:>5}  {t:>9.1}  {sigma:>10.5}");
    }
    if let Some(last) = scheduler.sigmas().get(scheduler.timesteps().len()) {
        println!("{:>5}  {:>9}  {last:>10.5}", "end", "-");
    }
    Ok(())
}

fn run_tiles(
    width: usize,
    height: usize,
    tile: usize,
    overlap: usize,
    space: TileSpace,
    json: bool,
) -> Result<()> {
    let tiles = tile_grid(width, height, tile, overlap, space)
        .with_context(|| format!("No layout for {width}x{height} with {tile} tiles"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tiles)?);
        return Ok(());
    }

    let xs = compute_tile_origins(width, tile, overlap)?;
    let ys = compute_tile_origins(height, tile, overlap)?;
    println!("Canvas:    {width}x{height} ({space:?})");
    println!("Tile:      {tile} (min overlap {overlap})");
    println!("Columns:   {xs:?}");
    println!("Rows:      {ys:?}");
    println!("Tiles:     {}", tiles.len());
    Ok(())
}

fn load_rgb(path: &Path) -> Result<(Vec<u8>, usize, usize)> {
    let img = image::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?
        .to_rgb8();
    let (w, h) = img.dimensions();
    Ok((img.into_raw(), w as usize, h as usize))
}

fn run_blend(target: &Path, source: &Path, mask: &Path, output: &Path) -> Result<()> {
    let device = default_device();
    let start = Instant::now();

    let (target_rgb, width, height) = load_rgb(target)?;
    let (source_rgb, sw, sh) = load_rgb(source)?;
    if (sw, sh) != (width, height) {
        bail!("source is {sw}x{sh} but target is {width}x{height}");
    }
    let mask_img = image::open(mask)
        .with_context(|| format!("Failed to open {}", mask.display()))?
        .to_luma8();
    if mask_img.dimensions() != (width as u32, height as u32) {
        let (mw, mh) = mask_img.dimensions();
        bail!("mask is {mw}x{mh} but images are {width}x{height}");
    }

    let to_chw = |rgb: &[u8]| -> Result<Tensor<DefaultBackend, 3>> {
        Ok(from_rgb8::<DefaultBackend>(rgb, width, height, PixelRange::Unit, &device)?
            .reshape([3, height, width]))
    };
    let mask_values: Vec<f32> = mask_img.into_raw().iter().map(|&v| v as f32 / 255.0).collect();
    let mask_tensor = Tensor::<DefaultBackend, 3>::from_data(
        TensorData::new(mask_values, [1, height, width]),
        &device,
    );

    let blended = PyramidBlender::new()
        .blend(to_chw(&target_rgb)?, to_chw(&source_rgb)?, mask_tensor)
        .context("Pyramid blend failed")?;
    let rgb = to_rgb8(blended.reshape([1, 3, height, width]), PixelRange::Unit)?;

    let img: ImageBuffer<Rgb<u8>, Vec<u8>> =
        ImageBuffer::from_raw(width as u32, height as u32, rgb)
            .context("Failed to create image buffer")?;
    img.save(output)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    info!(
        backend = backend_name(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "blend complete"
    );
    println!("Saved to: {}", output.display());
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Schedule {
            sampler,
            steps,
            spacing,
            beta_schedule,
            prediction,
            steps_offset,
            json,
        } => {
            let schedule = ScheduleConfig {
                beta_schedule,
                prediction_type: prediction,
                timestep_spacing: spacing,
                steps_offset,
                ..ScheduleConfig::sd15()
            };
            run_schedule(sampler, steps, schedule, json)
        }
        Commands::Tiles {
            width,
            height,
            tile,
            overlap,
            space,
            json,
        } => run_tiles(width, height, tile, overlap, space.into(), json),
        Commands::Blend {
            target,
            source,
            mask,
            output,
        } => run_blend(&target, &source, &mask, &output),
    }
}
