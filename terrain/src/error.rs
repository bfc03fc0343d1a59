use crate::TileKey;
use elevation::ElevationError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TerrainError {
    #[error("missing or invalid parameter '{0}'")]
    Builder(&'static str),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Elevation(#[from] ElevationError),

    #[error("degenerate geometry, {0}")]
    DegenerateGeometry(&'static str),

    #[error("tile {key:?} not retrieved after {attempts} attempts, {source}")]
    Download {
        key: TileKey,
        attempts: u32,
        #[source]
        source: Box<TerrainError>,
    },

    #[error("map service quota exceeded, {0}")]
    QuotaExceeded(String),

    #[error("map service error, {0}")]
    Service(String),

    #[error("{0}")]
    Http(String),
}
