//! Generation orchestrator
//!
//! One request runs through
//! `Init -> TextEncoded -> [Img2ImgEncoded] -> Denoising(step) -> Decoded ->
//! [Composited] -> Done`, or ends in `Failed` when a service call or an input
//! check fails. All state (scheduler, RNG, latents) is local to the request.

use std::time::Instant;

use burn::prelude::*;
use burn_dream_samplers::{DiffusionScheduler, Scheduler, gaussian_noise};
use burn_dream_tiling::PyramidBlender;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, warn};

use crate::conditioning::{Prompt, encode_prompt};
use crate::config::{GenerationConfig, VAE_SCALE_FACTOR};
use crate::diagnostics::{check_finite, tensor_stats};
use crate::error::{PipelineError, Result, ServiceKind, check_dims};
use crate::pixels::pixels_to_rgb8;
use crate::services::Services;
use crate::vae::{decode_latents, encode_pixels};

/// Latent channels of the SD VAE
pub const LATENT_CHANNELS: usize = 4;

/// Where a request is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    Init,
    TextEncoded,
    Img2ImgEncoded,
    Denoising { step: usize },
    Decoded,
    Composited,
    Done,
    Failed,
}

/// Progress report, `current` counts up to `total`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub current: usize,
    pub total: usize,
    /// State the request was in when the report fired
    pub state: GenerationState,
}

/// Inpainting mask, 1 where content is regenerated and 0 where the source
/// image is kept
#[derive(Debug, Clone)]
pub struct InpaintMask<B: Backend> {
    /// `[1, 1, H, W]` at output resolution
    pub full: Tensor<B, 4>,
    /// `[1, 1 | 4, H/8, W/8]`; derived from `full` when absent
    pub latent: Option<Tensor<B, 4>>,
}

/// Inputs of one request
#[derive(Debug, Clone)]
pub struct GenerationRequest<B: Backend> {
    pub prompt: Prompt,
    pub negative_prompt: Prompt,
    /// `[1, 3, H, W]` in [-1, 1]; enables img2img
    pub init_image: Option<Tensor<B, 4>>,
    /// Requires `init_image`
    pub mask: Option<InpaintMask<B>>,
}

impl<B: Backend> GenerationRequest<B> {
    pub fn text_to_image(prompt: Prompt, negative_prompt: Prompt) -> Self {
        Self {
            prompt,
            negative_prompt,
            init_image: None,
            mask: None,
        }
    }

    pub fn with_init_image(mut self, image: Tensor<B, 4>) -> Self {
        self.init_image = Some(image);
        self
    }

    pub fn with_mask(mut self, mask: InpaintMask<B>) -> Self {
        self.mask = Some(mask);
        self
    }
}

/// Result of one request
#[derive(Debug, Clone)]
pub struct GenerationOutput<B: Backend> {
    /// `[1, 3, H, W]` in [-1, 1]
    pub image: Tensor<B, 4>,
    /// Interleaved RGB bytes of `image`
    pub pixels: Vec<u8>,
    pub width: usize,
    pub height: usize,
    /// Seed that reproduces this output
    pub seed: u64,
}

/// `uncond + scale * (cond - uncond)`
pub fn apply_guidance<B: Backend>(
    noise_uncond: Tensor<B, 4>,
    noise_cond: Tensor<B, 4>,
    guidance_scale: f32,
) -> Tensor<B, 4> {
    noise_uncond.clone() + (noise_cond - noise_uncond) * guidance_scale
}

/// `noised_original * (1 - mask) + stepped * mask`
///
/// Keeps the unmasked region on the source image's forward-noise trajectory.
pub fn recombine_masked<B: Backend>(
    stepped: Tensor<B, 4>,
    noised_original: Tensor<B, 4>,
    mask: Tensor<B, 4>,
) -> Tensor<B, 4> {
    noised_original * (mask.clone().neg() + 1.0) + stepped * mask
}

/// Nearest-neighbour mask downsampling, taking the top-left pixel of each cell
pub fn downsample_mask<B: Backend>(
    mask: Tensor<B, 4>,
    target_h: usize,
    target_w: usize,
) -> Result<Tensor<B, 4>> {
    let [b, c, h, w] = mask.dims();
    if target_h == 0 || target_w == 0 || h < target_h || w < target_w {
        return Err(PipelineError::InvalidInput(format!(
            "cannot downsample a {w}x{h} mask to {target_w}x{target_h}"
        )));
    }
    let scale_h = h / target_h;
    let scale_w = w / target_w;
    let device = mask.device();
    let values = burn_dream_tiling::to_host(mask)?;

    let mut result = Vec::with_capacity(b * c * target_h * target_w);
    for plane in values.chunks_exact(h * w) {
        for th in 0..target_h {
            for tw in 0..target_w {
                result.push(plane[th * scale_h * w + tw * scale_w]);
            }
        }
    }
    Ok(Tensor::from_data(
        TensorData::new(result, [b, c, target_h, target_w]),
        &device,
    ))
}

/// Lifecycle bookkeeping of one request
struct Run<F> {
    state: GenerationState,
    current: usize,
    total: usize,
    progress: F,
}

impl<F: FnMut(Progress)> Run<F> {
    fn enter(&mut self, state: GenerationState) {
        match state {
            GenerationState::Denoising { step } => debug!(step, "denoising"),
            _ => info!(from = ?self.state, to = ?state, "generation state"),
        }
        self.state = state;
    }

    fn tick(&mut self) {
        self.current += 1;
        (self.progress)(Progress {
            current: self.current,
            total: self.total,
            state: self.state,
        });
    }
}

/// Drives the scheduler and the inference services for generation requests
pub struct GenerationPipeline<'a, B: Backend> {
    services: Services<'a, B>,
    device: B::Device,
}

impl<'a, B: Backend> GenerationPipeline<'a, B> {
    pub fn new(services: Services<'a, B>, device: &B::Device) -> Self {
        Self {
            services,
            device: device.clone(),
        }
    }

    /// Runs one request to completion
    ///
    /// `progress` is called after text encoding, after img2img encoding,
    /// after every denoising step and once at the end.
    pub fn run_generation(
        &self,
        config: &GenerationConfig,
        request: GenerationRequest<B>,
        progress: impl FnMut(Progress),
    ) -> Result<GenerationOutput<B>> {
        let started = Instant::now();
        let mut run = Run {
            state: GenerationState::Init,
            current: 0,
            total: 0,
            progress,
        };

        match self.generate(config, request, &mut run) {
            Ok(output) => {
                info!(
                    seed = output.seed,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "generation complete"
                );
                Ok(output)
            }
            Err(err) => {
                warn!(state = ?run.state, error = %err, "generation failed");
                run.enter(GenerationState::Failed);
                Err(err)
            }
        }
    }

    fn generate(
        &self,
        config: &GenerationConfig,
        request: GenerationRequest<B>,
        run: &mut Run<impl FnMut(Progress)>,
    ) -> Result<GenerationOutput<B>> {
        config.validate()?;
        let (lh, lw) = (config.latent_height(), config.latent_width());
        let latent_shape = [1, LATENT_CHANNELS, lh, lw];

        let GenerationRequest {
            prompt,
            negative_prompt,
            init_image,
            mask,
        } = request;
        if mask.is_some() && init_image.is_none() {
            return Err(PipelineError::InvalidInput(
                "an inpainting mask needs an init image".into(),
            ));
        }

        let img2img = init_image.is_some();
        if img2img {
            config
                .tiling
                .check_encode_canvas(config.height, config.width)?;
        }
        let start_step = if img2img { config.start_step() } else { 0 };
        run.total = config.steps + usize::from(img2img) + 2 - start_step;

        let seed = config.seed.unwrap_or_else(|| rand::rng().random());
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        info!(
            seed,
            width = config.width,
            height = config.height,
            steps = config.steps,
            sampler = %config.sampler,
            img2img,
            inpaint = mask.is_some(),
            "starting generation"
        );

        // Conditioning
        let encoder = self.services.text_encoder;
        let uncond = encode_prompt(encoder, &negative_prompt, &self.device)?;
        let cond = encode_prompt(encoder, &prompt, &self.device)?;
        run.enter(GenerationState::TextEncoded);
        run.tick();

        let mut scheduler =
            DiffusionScheduler::<B>::new(config.sampler, config.schedule.clone(), seed.wrapping_add(1))?;
        scheduler.set_timesteps(config.steps)?;
        let timesteps = scheduler.timesteps().to_vec();

        let mut latents =
            gaussian_noise::<B, _, 4>(&mut rng, latent_shape, &self.device) * scheduler.init_noise_sigma();

        // Img2img: encode the source and noise it to the first timestep
        let mut source = None;
        if let Some(image) = &init_image {
            check_dims("init image", [1, 3, config.height, config.width], image.dims())?;
            let vae_encoder = self
                .services
                .vae_encoder
                .ok_or(PipelineError::MissingService(ServiceKind::VaeEncoder))?;

            let latents_noise = gaussian_noise::<B, _, 4>(&mut rng, latent_shape, &self.device);
            let encoder_noise = gaussian_noise::<B, _, 4>(&mut rng, latent_shape, &self.device);
            let distribution = encode_pixels(vae_encoder, image.clone(), &config.tiling)?;
            let original = distribution.sample(encoder_noise) * config.latent_scale;

            scheduler.set_begin_index(start_step);
            let start_timestep = timesteps[start_step];
            latents = scheduler.add_noise(original.clone(), latents_noise.clone(), &[start_timestep])?;
            debug!(start_step, start_timestep, "img2img start");

            source = Some((original, latents_noise));
            run.enter(GenerationState::Img2ImgEncoded);
            run.tick();
        }

        let latent_mask = match &mask {
            Some(mask) => Some(self.latent_mask(mask, config)?),
            None => None,
        };

        if config.debug.sampler {
            if let Some(stats) = tensor_stats(&latents)? {
                debug!(%stats, "initial latent");
            }
        }

        // Denoising
        for (step, &t) in timesteps.iter().enumerate().skip(start_step) {
            run.enter(GenerationState::Denoising { step });
            let model_input = scheduler.scale_model_input(latents.clone(), t)?;
            let noise_pred = self.predict_noise(model_input, t as usize, &uncond, &cond, config)?;
            latents = scheduler.step(noise_pred, t, latents)?.prev_sample;

            if let (Some(mask), Some((original, latents_noise))) = (&latent_mask, &source) {
                let noised = scheduler.add_noise(original.clone(), latents_noise.clone(), &[t])?;
                latents = recombine_masked(latents, noised, mask.clone());
            }

            if config.debug.sampler {
                if let Some(stats) = tensor_stats(&latents)? {
                    debug!(step, timestep = t, sigma = scheduler.current_sigma(), %stats, "latent");
                }
            }
            if config.debug.nan {
                check_finite(&latents, &format!("step_{step}_latent"))?;
            }
            run.tick();
        }

        // Decode
        let image = decode_latents(
            self.services.vae_decoder,
            latents / config.latent_scale,
            &config.tiling,
        )?;
        run.enter(GenerationState::Decoded);

        let image = match (&mask, &init_image) {
            (Some(mask), Some(original)) => {
                let (h, w) = (config.height, config.width);
                let blended = PyramidBlender::new().blend(
                    original.clone().reshape([3, h, w]),
                    image.reshape([3, h, w]),
                    mask.full.clone().reshape([1, h, w]),
                )?;
                run.enter(GenerationState::Composited);
                blended.reshape([1, 3, h, w])
            }
            _ => image,
        };

        if config.debug.nan {
            check_finite(&image, "decoded image")?;
        }
        let pixels = pixels_to_rgb8(image.clone())?;
        run.enter(GenerationState::Done);
        run.tick();

        Ok(GenerationOutput {
            image,
            pixels,
            width: config.width,
            height: config.height,
            seed,
        })
    }

    /// Classifier-free guided noise prediction
    fn predict_noise(
        &self,
        model_input: Tensor<B, 4>,
        timestep: usize,
        uncond: &Tensor<B, 3>,
        cond: &Tensor<B, 3>,
        config: &GenerationConfig,
    ) -> Result<Tensor<B, 4>> {
        let denoiser = self.services.denoiser;
        let shape = model_input.dims();
        let [_, c, h, w] = shape;
        let denoise = |latent, embedding| {
            denoiser
                .predict(latent, timestep, embedding)
                .map_err(PipelineError::service(ServiceKind::Denoiser))
        };

        let (noise_uncond, noise_cond) = if denoiser.supports_batch() {
            let batch = Tensor::cat(vec![model_input.clone(), model_input], 0);
            let embeddings = Tensor::cat(vec![uncond.clone(), cond.clone()], 0);
            let out = denoise(batch, embeddings)?;
            check_dims("batched noise prediction", [2, c, h, w], out.dims())?;
            (
                out.clone().slice([0..1, 0..c, 0..h, 0..w]),
                out.slice([1..2, 0..c, 0..h, 0..w]),
            )
        } else {
            let noise_uncond = denoise(model_input.clone(), uncond.clone())?;
            let noise_cond = denoise(model_input, cond.clone())?;
            check_dims("noise prediction", shape, noise_uncond.dims())?;
            check_dims("noise prediction", shape, noise_cond.dims())?;
            (noise_uncond, noise_cond)
        };

        if config.debug.nan {
            check_finite(&noise_uncond, &format!("t{timestep}_noise_uncond"))?;
            check_finite(&noise_cond, &format!("t{timestep}_noise_cond"))?;
        }
        Ok(apply_guidance(noise_uncond, noise_cond, config.guidance_scale))
    }

    /// Latent-resolution mask broadcast to the latent channels
    fn latent_mask(&self, mask: &InpaintMask<B>, config: &GenerationConfig) -> Result<Tensor<B, 4>> {
        let (h, w) = (config.height, config.width);
        check_dims("inpaint mask", [1, 1, h, w], mask.full.dims())?;

        let (lh, lw) = (h / VAE_SCALE_FACTOR, w / VAE_SCALE_FACTOR);
        let latent = match &mask.latent {
            Some(latent) => latent.clone(),
            None => downsample_mask(mask.full.clone(), lh, lw)?,
        };
        match latent.dims() {
            [1, 1, mh, mw] if (mh, mw) == (lh, lw) => Ok(latent.repeat_dim(1, LATENT_CHANNELS)),
            [1, LATENT_CHANNELS, mh, mw] if (mh, mw) == (lh, lw) => Ok(latent),
            other => Err(PipelineError::ShapeMismatch {
                what: "latent mask",
                expected: vec![1, LATENT_CHANNELS, lh, lw],
                actual: other.to_vec(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_dream_tiling::to_host;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn filled(value: f32) -> Tensor<TestBackend, 4> {
        Tensor::full([1, 4, 2, 2], value, &Default::default())
    }

    #[test]
    fn test_guidance() {
        let out = apply_guidance(filled(1.0), filled(3.0), 7.5);
        assert!(to_host(out).unwrap().iter().all(|v| *v == 16.0));
        let out = apply_guidance(filled(1.0), filled(3.0), 1.0);
        assert!(to_host(out).unwrap().iter().all(|v| *v == 3.0));
    }

    #[test]
    fn test_recombine_with_extreme_masks_is_exact() {
        let stepped = Tensor::<TestBackend, 4>::from_floats(
            [[[[0.123_456_7, -3.5], [1e-7, 42.0]]]],
            &Default::default(),
        );
        let noised = stepped.clone() * -2.0 + 0.3;

        let kept = recombine_masked(stepped.clone(), noised.clone(), stepped.ones_like());
        assert_eq!(to_host(kept).unwrap(), to_host(stepped.clone()).unwrap());

        let restored = recombine_masked(stepped.clone(), noised.clone(), stepped.zeros_like());
        assert_eq!(to_host(restored).unwrap(), to_host(noised).unwrap());
    }

    #[test]
    fn test_downsample_mask_takes_cell_origin() {
        let data: Vec<f32> = (0..16).map(|i| i as f32).collect();
        let mask = Tensor::<TestBackend, 4>::from_data(TensorData::new(data, [1, 1, 4, 4]), &Default::default());
        let down = downsample_mask(mask, 2, 2).unwrap();
        assert_eq!(down.dims(), [1, 1, 2, 2]);
        assert_eq!(to_host(down).unwrap(), vec![0.0, 2.0, 8.0, 10.0]);

        let mask = Tensor::<TestBackend, 4>::zeros([1, 1, 4, 4], &Default::default());
        assert!(downsample_mask(mask, 8, 8).is_err());
    }
}
