use anyhow::{anyhow, Error as AnyError};
use clap::{Parser, Subcommand};
use geo::geometry::Coord;
use std::{path::PathBuf, str::FromStr};

/// Terrain profiles and path loss between projected coordinates.
#[derive(Parser, Debug, Clone)]
pub struct Cli {
    /// Directory of elevation tiles, or where downloaded tiles are
    /// cached when `--url-template` is given.
    #[arg(short, long)]
    pub tile_dir: PathBuf,

    /// Tile width and height, in raster cells.
    #[arg(long, default_value_t = 1000)]
    pub tile_size: i32,

    /// Maximum number of tiles held in memory.
    #[arg(long, default_value_t = 64)]
    pub capacity: usize,

    /// Memory map tiles instead of decoding them up front.
    #[arg(long, default_value_t = false)]
    pub memmap: bool,

    /// Keep flattened copies of decoded tiles in this directory.
    #[arg(long)]
    pub flatten_dir: Option<PathBuf>,

    /// Download missing tiles from this URL. `{bbox}`, `{width}`, and
    /// `{height}` are substituted per tile.
    #[arg(long)]
    pub url_template: Option<String>,

    /// Maximum path incremental step size, in meters.
    #[arg(short, long, default_value_t = 1.0)]
    pub max_step: f64,

    /// Transmitter "x,y,h", where 'h' is meters above ground.
    #[arg(long)]
    pub start: XyAlt,

    /// Receiver "x,y,h", where 'h' is meters above ground.
    #[arg(long)]
    pub dest: Option<XyAlt>,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Clone, Debug, Copy)]
pub struct XyAlt(pub Coord<f64>, pub f64);

impl FromStr for XyAlt {
    type Err = AnyError;
    fn from_str(s: &str) -> Result<Self, AnyError> {
        let mut parts = s.split(',');
        let mut next = || {
            parts
                .next()
                .ok_or_else(|| anyhow!("not a valid x,y,h"))
                .and_then(|part| Ok(f64::from_str(part.trim())?))
        };
        let (x, y, h) = (next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(anyhow!("not a valid x,y,h"));
        }
        Ok(Self(Coord { x, y }, h))
    }
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Print the terrain profile to stdout as CSV.
    Csv,

    /// Print the terrain profile to stdout as JSON.
    Json,

    /// Print the path loss from start to dest.
    Loss(ModelArgs),

    /// Print the path loss from start to every point of a road link
    /// geometry file, one JSON object per link.
    Links {
        /// Road link geometry file.
        file: PathBuf,

        #[command(flatten)]
        model: ModelArgs,

        /// Skip points whose loss is known to exceed this, in dB.
        #[arg(long)]
        max_loss: Option<f64>,
    },
}

#[derive(Debug, clap::Args, Clone)]
pub struct ModelArgs {
    /// JSON file of regression coefficients. Without it the line of
    /// sight model is used.
    #[arg(long)]
    pub coefficients: Option<PathBuf>,

    /// Include antenna heights in the obstruction search.
    #[arg(long, default_value_t = false)]
    pub with_antennas: bool,
}

#[cfg(test)]
mod tests {
    use super::XyAlt;
    use std::str::FromStr;

    #[test]
    fn test_parse_xy_alt() {
        let XyAlt(coord, h) = XyAlt::from_str("512000.5, 5403100,30").unwrap();
        assert_eq!((coord.x, coord.y, h), (512_000.5, 5_403_100.0, 30.0));
        assert!(XyAlt::from_str("1,2").is_err());
        assert!(XyAlt::from_str("1,2,3,4").is_err());
        assert!(XyAlt::from_str("1,b,3").is_err());
    }
}
