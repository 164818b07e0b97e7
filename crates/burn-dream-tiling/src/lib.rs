//! Tiled inference support for fixed-size networks
//!
//! - [`geometry`]: overlapping tile layouts that never pad past the canvas
//! - [`blend`]: fade-weighted recombination of tiles, including encoder
//!   (mean, std) statistics
//! - [`pyramid`]: Laplacian pyramid blending under a soft mask

pub mod blend;
pub mod error;
pub mod geometry;
pub mod pyramid;

pub use blend::{BlendAccumulator, DiagonalGaussian, FadeMask, TileBlender, WEIGHT_FLOOR, to_host};
pub use error::TilingError;
pub use geometry::{TileDescriptor, TileSpace, compute_tile_origins, tile_grid};
pub use pyramid::{HostImage, PyramidBlender, pyr_down, pyr_up, pyramid_levels};
