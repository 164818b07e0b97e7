//! Tiled VAE encode and decode
//!
//! The VAE graphs take one fixed input size. Larger canvases are cut into
//! overlapping tiles laid out on the latent grid, so pixel tile origins are
//! always multiples of the VAE scale factor. Decoded tiles are fade-blended
//! in pixel space; encoder statistics are fade-blended in latent space and
//! sampled once afterwards.

use burn::prelude::*;
use burn_dream_tiling::{DiagonalGaussian, TileBlender, TileSpace, tile_grid};
use tracing::info;

use crate::config::{TilingConfig, VAE_SCALE_FACTOR};
use crate::error::{PipelineError, Result, ServiceKind, check_dims};
use crate::services::{VaeDecoder, VaeEncoder};

/// Decodes `[1, 4, h, w]` latents (already divided by the latent scale) to
/// `[1, 3, 8h, 8w]` pixels
pub fn decode_latents<B: Backend>(
    decoder: &dyn VaeDecoder<B>,
    latents: Tensor<B, 4>,
    tiling: &TilingConfig,
) -> Result<Tensor<B, 4>> {
    let [batch, channels, lh, lw] = latents.dims();
    let f = VAE_SCALE_FACTOR;
    tiling.check_decode_canvas(lh, lw)?;

    if lh <= tiling.latent_tile && lw <= tiling.latent_tile {
        let pixels = decoder
            .decode(latents)
            .map_err(PipelineError::service(ServiceKind::VaeDecoder))?;
        check_dims("decoded image", [batch, 3, lh * f, lw * f], pixels.dims())?;
        return Ok(pixels);
    }

    let tile = tiling.latent_tile;
    let tiles = tile_grid(lw, lh, tile, tiling.decode_min_overlap, TileSpace::Latent)?;
    info!(tiles = tiles.len(), latent_tile = tile, "tiled VAE decode");

    let mut decoded = Vec::with_capacity(tiles.len());
    for at in tiles {
        let input = latents
            .clone()
            .slice([0..batch, 0..channels, at.y..at.y + tile, at.x..at.x + tile]);
        let pixels = decoder
            .decode(input)
            .map_err(PipelineError::service(ServiceKind::VaeDecoder))?;
        check_dims("decoded tile", [batch, 3, tile * f, tile * f], pixels.dims())?;
        decoded.push((pixels, at.scaled(f, TileSpace::Pixel)));
    }

    let blender = TileBlender::new(tile * f, tiling.blend_pixel_overlap);
    Ok(blender.blend(decoded, lh * f, lw * f)?)
}

/// Encodes `[1, 3, H, W]` pixels to the latent distribution `[1, 4, H/8, W/8]`
pub fn encode_pixels<B: Backend>(
    encoder: &dyn VaeEncoder<B>,
    pixels: Tensor<B, 4>,
    tiling: &TilingConfig,
) -> Result<DiagonalGaussian<B>> {
    let [batch, channels, height, width] = pixels.dims();
    let f = VAE_SCALE_FACTOR;
    if height % f != 0 || width % f != 0 {
        return Err(PipelineError::InvalidInput(format!(
            "image {width}x{height} is not a multiple of {f}"
        )));
    }
    tiling.check_encode_canvas(height, width)?;
    let (lh, lw) = (height / f, width / f);

    if height <= tiling.encode_pixel_tile && width <= tiling.encode_pixel_tile {
        return encode_tile(encoder, pixels, [batch, 4, lh, lw]);
    }

    let tile = tiling.encode_pixel_tile / f;
    let tiles = tile_grid(lw, lh, tile, tiling.encode_min_overlap / f, TileSpace::Latent)?;
    info!(tiles = tiles.len(), pixel_tile = tiling.encode_pixel_tile, "tiled VAE encode");

    let mut encoded = Vec::with_capacity(tiles.len());
    for at in tiles {
        let px = at.scaled(f, TileSpace::Pixel);
        let input = pixels.clone().slice([
            0..batch,
            0..channels,
            px.y..px.y + px.size,
            px.x..px.x + px.size,
        ]);
        encoded.push((encode_tile(encoder, input, [batch, 4, tile, tile])?, at));
    }

    let blender = TileBlender::new(tile, tiling.blend_latent_overlap);
    Ok(blender.blend_distribution(encoded, lh, lw)?)
}

fn encode_tile<B: Backend>(
    encoder: &dyn VaeEncoder<B>,
    pixels: Tensor<B, 4>,
    expected: [usize; 4],
) -> Result<DiagonalGaussian<B>> {
    let (mean, std) = encoder
        .encode(pixels)
        .map_err(PipelineError::service(ServiceKind::VaeEncoder))?;
    check_dims("encoder mean", expected, mean.dims())?;
    check_dims("encoder std", expected, std.dims())?;
    Ok(DiagonalGaussian::new(mean, std)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ServiceResult;
    use burn_dream_tiling::to_host;
    use burn_ndarray::NdArray;
    use std::cell::Cell;

    type TestBackend = NdArray<f32>;

    /// Decoder that upsamples each latent cell to an 8x8 block of channel 0
    struct BlockDecoder {
        calls: Cell<usize>,
    }

    impl VaeDecoder<TestBackend> for BlockDecoder {
        fn decode(&self, latent: Tensor<TestBackend, 4>) -> ServiceResult<Tensor<TestBackend, 4>> {
            self.calls.set(self.calls.get() + 1);
            let [b, _, h, w] = latent.dims();
            let first = latent.slice([0..b, 0..1, 0..h, 0..w]);
            let up = first
                .reshape([b, 1, h, 1, w, 1])
                .repeat_dim(3, 8)
                .repeat_dim(5, 8)
                .reshape([b, 1, h * 8, w * 8]);
            Ok(up.repeat_dim(1, 3))
        }
    }

    /// Encoder returning the 8x8 block average of channel 0 as mean and a fixed std
    struct AveragingEncoder {
        calls: Cell<usize>,
    }

    impl VaeEncoder<TestBackend> for AveragingEncoder {
        fn encode(
            &self,
            pixels: Tensor<TestBackend, 4>,
        ) -> ServiceResult<(Tensor<TestBackend, 4>, Tensor<TestBackend, 4>)> {
            self.calls.set(self.calls.get() + 1);
            let [b, _, h, w] = pixels.dims();
            let mean = pixels
                .slice([0..b, 0..1, 0..h, 0..w])
                .reshape([b, 1, h / 8, 8, w / 8, 8])
                .mean_dim(5)
                .mean_dim(3)
                .reshape([b, 1, h / 8, w / 8])
                .repeat_dim(1, 4);
            let std = mean.zeros_like() + 0.1;
            Ok((mean, std))
        }
    }

    fn ramp(shape: [usize; 4]) -> Tensor<TestBackend, 4> {
        let len: usize = shape.iter().product();
        let data: Vec<f32> = (0..len).map(|i| (i % 97) as f32 / 97.0).collect();
        Tensor::from_data(TensorData::new(data, shape), &Default::default())
    }

    #[test]
    fn test_single_tile_decode_calls_once() {
        let decoder = BlockDecoder { calls: Cell::new(0) };
        let out = decode_latents::<TestBackend>(&decoder, ramp([1, 4, 64, 64]), &TilingConfig::default()).unwrap();
        assert_eq!(out.dims(), [1, 3, 512, 512]);
        assert_eq!(decoder.calls.get(), 1);
    }

    #[test]
    fn test_tiled_decode_matches_direct_decode() {
        let tiling = TilingConfig {
            latent_tile: 8,
            decode_min_overlap: 4,
            blend_pixel_overlap: 32,
            ..Default::default()
        };
        let latents = ramp([1, 4, 12, 16]);
        let decoder = BlockDecoder { calls: Cell::new(0) };
        let tiled = decode_latents::<TestBackend>(&decoder, latents.clone(), &tiling).unwrap();
        // x origins [0, 4, 8], y origins [0, 4]
        assert_eq!(decoder.calls.get(), 6);
        assert_eq!(tiled.dims(), [1, 3, 96, 128]);

        let direct = BlockDecoder { calls: Cell::new(0) }.decode(latents).unwrap();
        let (a, b) = (to_host(tiled).unwrap(), to_host(direct).unwrap());
        assert!(a.iter().zip(&b).all(|(x, y)| (x - y).abs() < 1e-5));
    }

    #[test]
    fn test_tiled_encode_matches_direct_encode() {
        let tiling = TilingConfig {
            encode_pixel_tile: 64,
            encode_min_overlap: 32,
            blend_latent_overlap: 4,
            ..Default::default()
        };
        let pixels = ramp([1, 3, 96, 128]);
        let encoder = AveragingEncoder { calls: Cell::new(0) };
        let tiled = encode_pixels::<TestBackend>(&encoder, pixels.clone(), &tiling).unwrap();
        assert_eq!(encoder.calls.get(), 6);
        assert_eq!(tiled.mean.dims(), [1, 4, 12, 16]);

        let (mean, _) = AveragingEncoder { calls: Cell::new(0) }.encode(pixels).unwrap();
        let (a, b) = (to_host(tiled.mean).unwrap(), to_host(mean).unwrap());
        assert!(a.iter().zip(&b).all(|(x, y)| (x - y).abs() < 1e-5));
        assert!(to_host(tiled.std).unwrap().iter().all(|s| (s - 0.1).abs() < 1e-6));
    }

    #[test]
    fn test_rejects_wrong_decoder_output() {
        struct Shrinking;
        impl VaeDecoder<TestBackend> for Shrinking {
            fn decode(&self, latent: Tensor<TestBackend, 4>) -> ServiceResult<Tensor<TestBackend, 4>> {
                let [b, _, h, w] = latent.dims();
                Ok(Tensor::zeros([b, 3, h, w], &Default::default()))
            }
        }
        let err = decode_latents::<TestBackend>(&Shrinking, ramp([1, 4, 8, 8]), &TilingConfig::default()).unwrap_err();
        assert!(matches!(err, PipelineError::ShapeMismatch { what: "decoded image", .. }));
    }

    #[test]
    fn test_rejects_canvas_short_of_one_tile() {
        let decoder = BlockDecoder { calls: Cell::new(0) };
        let err = decode_latents::<TestBackend>(&decoder, ramp([1, 4, 32, 128]), &TilingConfig::default())
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
        assert_eq!(decoder.calls.get(), 0);

        let encoder = AveragingEncoder { calls: Cell::new(0) };
        let err = encode_pixels::<TestBackend>(&encoder, ramp([1, 3, 256, 1024]), &TilingConfig::default())
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
        assert_eq!(encoder.calls.get(), 0);
    }

    #[test]
    fn test_non_square_tiled_decode() {
        let tiling = TilingConfig {
            latent_tile: 8,
            decode_min_overlap: 4,
            blend_pixel_overlap: 32,
            ..Default::default()
        };
        // Exactly one tile high, tiled along x
        let latents = ramp([1, 4, 8, 20]);
        let decoder = BlockDecoder { calls: Cell::new(0) };
        let tiled = decode_latents::<TestBackend>(&decoder, latents.clone(), &tiling).unwrap();
        assert_eq!(tiled.dims(), [1, 3, 64, 160]);
        // x origins [0, 4, 8, 12]
        assert_eq!(decoder.calls.get(), 4);

        let direct = BlockDecoder { calls: Cell::new(0) }.decode(latents).unwrap();
        let (a, b) = (to_host(tiled).unwrap(), to_host(direct).unwrap());
        assert!(a.iter().zip(&b).all(|(x, y)| (x - y).abs() < 1e-5));
    }

    #[test]
    fn test_rejects_unaligned_image() {
        let encoder = AveragingEncoder { calls: Cell::new(0) };
        let err = encode_pixels::<TestBackend>(&encoder, ramp([1, 3, 20, 16]), &TilingConfig::default()).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
        assert_eq!(encoder.calls.get(), 0);
    }
}
