use geo::geometry::Coord;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ElevationError {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("({x}, {y}) is outside of tile spanning {start:?}..{end:?}")]
    OutOfBounds {
        x: f64,
        y: f64,
        start: Coord<i32>,
        end: Coord<i32>,
    },

    #[error("malformed GeoTIFF, {0}")]
    Tiff(String),

    #[error("unsupported GeoTIFF, {0}")]
    Unsupported(String),

    #[error("unsupported pixel scale ({0}, {1}), expected one unit per pixel")]
    PixelScale(f64, f64),

    #[error("invalid flattened tile len {actual}, expected {expected}")]
    FlattenedLen { expected: u64, actual: u64 },

    #[error("expected {expected} samples, got {actual}")]
    SampleCount { expected: usize, actual: usize },

    #[error("invalid tile dimensions {0}x{1} at {2:?}")]
    Dimensions(usize, usize, Coord<i32>),
}
