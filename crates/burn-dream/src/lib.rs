//! burn-dream: diffusion image generation over pluggable inference services
//!
//! The networks themselves (text encoder, denoiser, VAE, upscaler) are
//! external; this crate owns everything between them:
//!
//! - [`pipeline`]: the generation state machine (txt2img, img2img, inpaint)
//! - [`vae`]: tiled VAE encode and decode for canvases larger than one graph
//! - [`upscale`]: tiled 4x super-resolution
//! - [`conditioning`]: weighted prompts and input embeddings
//!
//! Schedulers come from [`samplers`], tiling and blending from [`tiling`].
//!
//! # Backend Selection
//!
//! Enable one of the `ndarray`, `tch`, `wgpu` or `cuda` features to get
//! [`backends::DefaultBackend`].

pub use burn_dream_samplers as samplers;
pub use burn_dream_tiling as tiling;

pub mod backends;
pub mod conditioning;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod pipeline;
pub mod pixels;
pub mod services;
pub mod upscale;
pub mod vae;

pub use conditioning::{PROMPT_LENGTH, Prompt, WeightedPrompt, encode_prompt};
pub use config::{DebugConfig, GenerationConfig, TilingConfig, UpscaleConfig};
pub use error::{PipelineError, ServiceError, ServiceKind};
pub use pipeline::{
    GenerationOutput, GenerationPipeline, GenerationRequest, GenerationState, InpaintMask,
    Progress, apply_guidance, downsample_mask, recombine_masked,
};
pub use pixels::{PixelRange, from_rgb8, pixels_to_rgb8, to_rgb8};
pub use services::{
    Denoiser, EmbeddingTables, ServiceResult, Services, TextEncoder, UpscaleTile, VaeDecoder,
    VaeEncoder,
};
pub use upscale::upscale_image;
pub use vae::{decode_latents, encode_pixels};
