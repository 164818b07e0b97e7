use thiserror::Error;

/// Errors from tile layout and blending
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TilingError {
    #[error("invalid tile geometry: {0}")]
    InvalidGeometry(String),

    #[error("cannot blend an empty tile list")]
    EmptyTiles,

    #[error("tile at ({x}, {y}) of size {size} exceeds the {width}x{height} canvas")]
    TileOutOfBounds {
        x: usize,
        y: usize,
        size: usize,
        width: usize,
        height: usize,
    },

    #[error("shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("cannot blend an image with no pixels")]
    EmptyImage,

    #[error("tensor data: {0}")]
    Data(String),
}

pub type Result<T> = std::result::Result<T, TilingError>;
