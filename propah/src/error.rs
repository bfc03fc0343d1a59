use terrain::TerrainError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PropahError {
    #[error("{0}")]
    Terrain(#[from] TerrainError),

    #[error("profile elevation at index {0} is unresolved")]
    UnresolvedElevation(usize),

    #[error("receiver index {index} out of range for profile of len {len}")]
    RxIndex { index: usize, len: usize },

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("malformed road link file, {0}")]
    LinkFormat(String),
}
