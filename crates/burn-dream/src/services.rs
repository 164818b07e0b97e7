//! Contracts for the neural networks the pipeline drives
//!
//! Network execution lives outside this crate. Implementations wrap whatever
//! runtime holds the weights (a burn module, a remote server, an NPU graph)
//! and report failures as [`ServiceError`]. Shapes are `[batch, channels,
//! height, width]` unless noted.

use burn::prelude::*;

use crate::error::ServiceError;

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// Token and position embedding tables of a CLIP text encoder
///
/// Row-major host copies: `token` is `[vocab, dim]`, `position` is
/// `[prompt_length, dim]`.
#[derive(Debug, Clone)]
pub struct EmbeddingTables {
    pub dim: usize,
    pub token: Vec<f32>,
    pub position: Vec<f32>,
}

impl EmbeddingTables {
    pub fn vocab_size(&self) -> usize {
        self.token.len() / self.dim.max(1)
    }

    pub fn positions(&self) -> usize {
        self.position.len() / self.dim.max(1)
    }

    pub fn token_row(&self, id: u32) -> Option<&[f32]> {
        let start = id as usize * self.dim;
        self.token.get(start..start + self.dim)
    }

    pub fn position_row(&self, index: usize) -> Option<&[f32]> {
        let start = index * self.dim;
        self.position.get(start..start + self.dim)
    }
}

/// Prompt encoder producing `[1, 77, dim]` hidden states
pub trait TextEncoder<B: Backend> {
    /// Encodes exactly 77 token ids
    fn encode_ids(&self, token_ids: &[u32]) -> ServiceResult<Tensor<B, 3>>;

    /// Encodes precomputed input embeddings `[1, 77, dim]`
    fn encode_embeddings(&self, embeddings: Tensor<B, 3>) -> ServiceResult<Tensor<B, 3>> {
        let _ = embeddings;
        Err(ServiceError::new("embedding input is not supported"))
    }

    /// Tables needed to build input embeddings; `None` when the encoder only
    /// accepts token ids
    fn embedding_tables(&self) -> Option<&EmbeddingTables> {
        None
    }
}

/// Noise-prediction network
pub trait Denoiser<B: Backend> {
    /// Predicts noise for `latent` at training timestep `timestep`
    ///
    /// `embedding` has the same batch size as `latent`.
    fn predict(
        &self,
        latent: Tensor<B, 4>,
        timestep: usize,
        embedding: Tensor<B, 3>,
    ) -> ServiceResult<Tensor<B, 4>>;

    /// Whether `predict` accepts the unconditional and conditional branches
    /// stacked into one batch of 2
    fn supports_batch(&self) -> bool {
        false
    }
}

/// Image encoder `[1, 3, H, W]` to latent statistics `(mean, std)`, each
/// `[1, 4, H/8, W/8]`
pub trait VaeEncoder<B: Backend> {
    fn encode(&self, pixels: Tensor<B, 4>) -> ServiceResult<(Tensor<B, 4>, Tensor<B, 4>)>;
}

/// Latent `[1, 4, h, w]` to pixels `[1, 3, 8h, 8w]` in [-1, 1]
pub trait VaeDecoder<B: Backend> {
    fn decode(&self, latent: Tensor<B, 4>) -> ServiceResult<Tensor<B, 4>>;
}

/// Fixed-size super-resolution network, `[1, 3, t, t]` to `[1, 3, 4t, 4t]`
pub trait UpscaleTile<B: Backend> {
    fn upscale(&self, tile: Tensor<B, 4>) -> ServiceResult<Tensor<B, 4>>;
}

/// The collaborators one generation request needs
pub struct Services<'a, B: Backend> {
    pub text_encoder: &'a dyn TextEncoder<B>,
    pub denoiser: &'a dyn Denoiser<B>,
    pub vae_decoder: &'a dyn VaeDecoder<B>,
    /// Only needed for img2img and inpainting
    pub vae_encoder: Option<&'a dyn VaeEncoder<B>>,
}

impl<'a, B: Backend> Services<'a, B> {
    pub fn new(
        text_encoder: &'a dyn TextEncoder<B>,
        denoiser: &'a dyn Denoiser<B>,
        vae_decoder: &'a dyn VaeDecoder<B>,
    ) -> Self {
        Self {
            text_encoder,
            denoiser,
            vae_decoder,
            vae_encoder: None,
        }
    }

    pub fn with_vae_encoder(mut self, vae_encoder: &'a dyn VaeEncoder<B>) -> Self {
        self.vae_encoder = Some(vae_encoder);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_table_rows() {
        let tables = EmbeddingTables {
            dim: 2,
            token: vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0],
            position: vec![10.0, 11.0],
        };
        assert_eq!(tables.vocab_size(), 3);
        assert_eq!(tables.positions(), 1);
        assert_eq!(tables.token_row(2), Some(&[4.0, 5.0][..]));
        assert_eq!(tables.token_row(3), None);
        assert_eq!(tables.position_row(0), Some(&[10.0, 11.0][..]));
        assert_eq!(tables.position_row(1), None);
    }
}
