//! Elevation raster tiles.
//!
//! A [Tile] is a rectangular patch of elevation samples, one sample
//! per coordinate unit, with its origin at the south-west corner.
//! Tiles are read from two formats:
//!
//! - single band `f32` GeoTIFFs, as served by map services (see
//!   [geotiff]),
//! - a flattened format, a 16 byte header followed by raw samples,
//!   which [Tile::write_flattened] produces so later loads can skip
//!   GeoTIFF parsing entirely.
//!
//! Regardless of source, samples are addressed south row first:
//! geographic Y increases with row index.

mod error;
pub mod geotiff;

pub use crate::{error::ElevationError, geotiff::encode_geotiff};
use byteorder::{ByteOrder, LittleEndian as LE, ReadBytesExt, WriteBytesExt};
pub use geo;
use geo::geometry::Coord;
use log::debug;
use memmap2::Mmap;
use std::{
    cell::RefCell,
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    mem::size_of,
    path::Path,
};

/// Base floating point type used for all coordinates.
pub type C = f64;

/// Bit representation of elevation samples.
pub type Elev = f32;

/// Flattened files start with four `i32`: origin x, origin y, width,
/// height.
const FLAT_HEADER_LEN: usize = 4 * size_of::<i32>();

/// Rounds a coordinate to the nearest whole unit, halves rounding up.
///
/// For non-negative inputs this equals adding 0.5 and truncating.
#[allow(clippy::cast_possible_truncation)]
pub fn round_coord(v: C) -> i32 {
    (v + 0.5).floor() as i32
}

pub struct Tile {
    /// South-west sample, inclusive.
    start: Coord<i32>,

    /// North-east bound, exclusive.
    end: Coord<i32>,

    /// Number of (columns, rows) in this tile.
    dimensions: (usize, usize),

    /// Elevation samples.
    samples: SampleStore,
}

enum SampleStore {
    /// Resources have been handed back, see [Tile::release].
    Released,
    InMem(Box<[Elev]>),
    /// Memory mapped flattened file.
    Flat(Mmap),
    /// Memory mapped GeoTIFF.
    Blocks(Blocks),
}

impl SampleStore {
    fn get_unchecked(&self, (x, y): (usize, usize), (width, height): (usize, usize)) -> Elev {
        match self {
            Self::Released => Elev::NAN,
            Self::InMem(samples) => samples[y * width + x],
            Self::Flat(raw) => {
                let start = FLAT_HEADER_LEN + (y * width + x) * size_of::<Elev>();
                LE::read_f32(&raw[start..start + size_of::<Elev>()])
            }
            Self::Blocks(blocks) => blocks.get(x, height - 1 - y),
        }
    }
}

/// GeoTIFF samples decoded one block at a time.
///
/// Consecutive lookups tend to land in the same block, so only the
/// most recently touched block is kept decoded.
struct Blocks {
    raw: Mmap,
    layout: geotiff::Layout,
    current: RefCell<Option<Block>>,
}

struct Block {
    index: usize,
    samples: Vec<Elev>,
}

impl Blocks {
    /// `row` counts from the north edge.
    fn get(&self, x: usize, row: usize) -> Elev {
        let (index, within) = self.layout.locate(x, row);
        let mut current = self.current.borrow_mut();
        let stale = current.as_ref().map_or(true, |block| block.index != index);
        if stale {
            let mut samples = current.take().map(|block| block.samples).unwrap_or_default();
            self.layout.decode_block(&self.raw, index, &mut samples);
            *current = Some(Block { index, samples });
        }
        current
            .as_ref()
            .map_or(Elev::NAN, |block| block.samples[within])
    }
}

impl Tile {
    /// Returns a Tile holding `samples`, row-major and south row
    /// first.
    pub fn from_samples(
        start: Coord<i32>,
        dimensions: (usize, usize),
        samples: Vec<Elev>,
    ) -> Result<Self, ElevationError> {
        let expected = dimensions.0 * dimensions.1;
        if samples.len() != expected {
            return Err(ElevationError::SampleCount {
                expected,
                actual: samples.len(),
            });
        }
        Self::new(start, dimensions, SampleStore::InMem(samples.into_boxed_slice()))
    }

    /// Returns a Tile decoded into memory from the GeoTIFF at `path`.
    pub fn load_geotiff<P: AsRef<Path>>(path: P) -> Result<Self, ElevationError> {
        debug!("decoding {:?}", path.as_ref());
        Self::from_geotiff(&fs::read(path)?)
    }

    /// Returns a Tile decoded into memory from GeoTIFF bytes.
    pub fn from_geotiff(buf: &[u8]) -> Result<Self, ElevationError> {
        let layout = geotiff::Layout::parse(buf)?;
        let samples = layout.decode(buf);
        Self::new(layout.origin, layout.dimensions, SampleStore::InMem(samples))
    }

    /// Returns a Tile using the memory-mapped GeoTIFF as storage.
    ///
    /// Samples are decoded on access.
    pub fn memmap_geotiff<P: AsRef<Path>>(path: P) -> Result<Self, ElevationError> {
        let raw = {
            let file = File::open(path)?;
            unsafe { Mmap::map(&file)? }
        };
        let layout = geotiff::Layout::parse(&raw)?;
        let (origin, dimensions) = (layout.origin, layout.dimensions);
        let blocks = Blocks {
            raw,
            layout,
            current: RefCell::new(None),
        };
        Self::new(origin, dimensions, SampleStore::Blocks(blocks))
    }

    /// Returns a Tile read into memory from the flattened file at
    /// `path`.
    pub fn load_flattened<P: AsRef<Path>>(path: P) -> Result<Self, ElevationError> {
        let file = File::open(&path)?;
        let actual = file.metadata()?.len();
        let mut file = BufReader::new(file);
        let start = Coord {
            x: file.read_i32::<LE>()?,
            y: file.read_i32::<LE>()?,
        };
        let dimensions = read_dimensions(&mut file, start)?;
        check_flattened_len(dimensions, actual)?;

        let samples = {
            let mut samples = vec![0.0; dimensions.0 * dimensions.1];
            file.read_f32_into::<LE>(&mut samples)?;
            samples.into_boxed_slice()
        };

        Self::new(start, dimensions, SampleStore::InMem(samples))
    }

    /// Returns a Tile using the memory-mapped flattened file as
    /// storage.
    pub fn memmap_flattened<P: AsRef<Path>>(path: P) -> Result<Self, ElevationError> {
        let raw = {
            let file = File::open(path)?;
            unsafe { Mmap::map(&file)? }
        };
        let mut header = raw.get(..FLAT_HEADER_LEN).ok_or(ElevationError::FlattenedLen {
            expected: FLAT_HEADER_LEN as u64,
            actual: raw.len() as u64,
        })?;
        let start = Coord {
            x: header.read_i32::<LE>()?,
            y: header.read_i32::<LE>()?,
        };
        let dimensions = read_dimensions(&mut header, start)?;
        check_flattened_len(dimensions, raw.len() as u64)?;
        Self::new(start, dimensions, SampleStore::Flat(raw))
    }

    /// Writes this tile to `path` in the flattened format.
    ///
    /// The file is written next to `path` and renamed into place, so
    /// readers never observe a partial file.
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn write_flattened<P: AsRef<Path>>(&self, path: P) -> Result<(), ElevationError> {
        let path = path.as_ref();
        let partial = path.with_extension("partial");
        {
            let (width, height) = self.dimensions;
            let mut out = BufWriter::new(File::create(&partial)?);
            out.write_i32::<LE>(self.start.x)?;
            out.write_i32::<LE>(self.start.y)?;
            out.write_i32::<LE>(width as i32)?;
            out.write_i32::<LE>(height as i32)?;
            for y in 0..height {
                for x in 0..width {
                    out.write_f32::<LE>(self.altitude_at_unchecked(x, y))?;
                }
            }
            out.flush()?;
        }
        fs::rename(&partial, path)?;
        debug!("wrote {path:?}");
        Ok(())
    }

    /// South-west sample of this tile, inclusive.
    pub fn start(&self) -> Coord<i32> {
        self.start
    }

    /// North-east bound of this tile, exclusive.
    pub fn end(&self) -> Coord<i32> {
        self.end
    }

    /// Returns (columns, rows).
    pub fn dimensions(&self) -> (usize, usize) {
        self.dimensions
    }

    /// Returns true if `coord`, once rounded, falls in this tile.
    pub fn contains(&self, coord: Coord<C>) -> bool {
        self.contains_rounded(Coord {
            x: round_coord(coord.x),
            y: round_coord(coord.y),
        })
    }

    /// Returns true if the already rounded `coord` falls in this tile.
    pub fn contains_rounded(&self, Coord { x, y }: Coord<i32>) -> bool {
        self.start.x <= x && x < self.end.x && self.start.y <= y && y < self.end.y
    }

    /// Returns the sample at the given coordinates, if they fall in
    /// this tile.
    pub fn get(&self, coord: Coord<C>) -> Option<Elev> {
        self.get_rounded(Coord {
            x: round_coord(coord.x),
            y: round_coord(coord.y),
        })
    }

    /// Returns the sample at the already rounded `coord`, if it falls
    /// in this tile.
    #[allow(clippy::cast_sign_loss)]
    pub fn get_rounded(&self, coord: Coord<i32>) -> Option<Elev> {
        self.contains_rounded(coord).then(|| {
            self.altitude_at_unchecked(
                (coord.x - self.start.x) as usize,
                (coord.y - self.start.y) as usize,
            )
        })
    }

    /// Returns the sample at the given coordinates.
    pub fn altitude_at(&self, x: C, y: C) -> Result<Elev, ElevationError> {
        self.get(Coord { x, y }).ok_or(ElevationError::OutOfBounds {
            x,
            y,
            start: self.start,
            end: self.end,
        })
    }

    /// Returns the sample at the tile-local (column, row).
    ///
    /// Callers must have already checked containment.
    pub fn altitude_at_unchecked(&self, local_x: usize, local_y: usize) -> Elev {
        self.samples.get_unchecked((local_x, local_y), self.dimensions)
    }

    /// Hands back any file mapping held by this tile.
    ///
    /// Returns true if anything was released. Calling this more than
    /// once is harmless.
    pub fn release(&mut self) -> bool {
        let held = !self.is_released();
        self.samples = SampleStore::Released;
        held
    }

    pub fn is_released(&self) -> bool {
        matches!(self.samples, SampleStore::Released)
    }
}

/// Private API
impl Tile {
    fn new(
        start: Coord<i32>,
        dimensions @ (width, height): (usize, usize),
        samples: SampleStore,
    ) -> Result<Self, ElevationError> {
        let end = i32::try_from(width)
            .ok()
            .zip(i32::try_from(height).ok())
            .and_then(|(w, h)| {
                Some(Coord {
                    x: start.x.checked_add(w)?,
                    y: start.y.checked_add(h)?,
                })
            })
            .filter(|_| width > 0 && height > 0)
            .ok_or(ElevationError::Dimensions(width, height, start))?;
        Ok(Self {
            start,
            end,
            dimensions,
            samples,
        })
    }
}

#[allow(clippy::cast_sign_loss)]
fn read_dimensions<R: ReadBytesExt>(
    src: &mut R,
    start: Coord<i32>,
) -> Result<(usize, usize), ElevationError> {
    let width = src.read_i32::<LE>()?;
    let height = src.read_i32::<LE>()?;
    match (usize::try_from(width), usize::try_from(height)) {
        (Ok(w), Ok(h)) if w > 0 && h > 0 => Ok((w, h)),
        _ => Err(ElevationError::Dimensions(width as usize, height as usize, start)),
    }
}

fn check_flattened_len((width, height): (usize, usize), actual: u64) -> Result<(), ElevationError> {
    let expected = (FLAT_HEADER_LEN + width * height * size_of::<Elev>()) as u64;
    if expected == actual {
        Ok(())
    } else {
        Err(ElevationError::FlattenedLen { expected, actual })
    }
}

#[cfg(test)]
mod tests {
    use super::{encode_geotiff, round_coord, Coord, ElevationError, Tile};
    use approx::assert_relative_eq;
    use std::fs;

    const ORIGIN: Coord<i32> = Coord {
        x: 500_000,
        y: 6_100_000,
    };

    /// Elevation rises 1 m per column and 100 m per row.
    #[allow(clippy::cast_precision_loss)]
    fn slope(width: usize, height: usize) -> Vec<f32> {
        (0..height)
            .flat_map(|y| (0..width).map(move |x| x as f32 + 100.0 * y as f32))
            .collect()
    }

    fn write_geotiff(
        dir: &tempfile::TempDir,
        dims: (usize, usize),
        block: usize,
    ) -> std::path::PathBuf {
        let path = dir.path().join("tile.tif");
        let mut buf = Vec::new();
        encode_geotiff(&mut buf, ORIGIN, dims, block, &slope(dims.0, dims.1)).unwrap();
        fs::write(&path, buf).unwrap();
        path
    }

    #[test]
    fn test_round_coord() {
        assert_eq!(round_coord(0.0), 0);
        assert_eq!(round_coord(0.49), 0);
        assert_eq!(round_coord(0.5), 1);
        assert_eq!(round_coord(1_234_567.5), 1_234_568);
        // Matches add-and-truncate for non-negative input.
        for v in [0.1, 2.5, 99.999, 500_000.5] {
            #[allow(clippy::cast_possible_truncation)]
            let truncated = (v + 0.5) as i32;
            assert_eq!(round_coord(v), truncated);
        }
        // And stays sign correct below zero.
        assert_eq!(round_coord(-0.4), 0);
        assert_eq!(round_coord(-0.6), -1);
        assert_eq!(round_coord(-1.5), -1);
    }

    #[test]
    fn test_round_coord_idempotent() {
        for v in [-12.7, -0.5, 0.0, 0.3, 7.5, 812.49, 500_000.51] {
            let once = round_coord(v);
            assert_eq!(round_coord(f64::from(once)), once);
        }
    }

    #[test]
    fn test_contains_is_half_open() {
        let tile = Tile::from_samples(ORIGIN, (4, 3), slope(4, 3)).unwrap();
        assert_eq!(tile.end(), Coord { x: 500_004, y: 6_100_003 });
        assert!(tile.contains(Coord { x: 500_000.0, y: 6_100_000.0 }));
        assert!(tile.contains(Coord { x: 500_003.4, y: 6_100_002.4 }));
        // Rounds onto the exclusive edge.
        assert!(!tile.contains(Coord { x: 500_003.5, y: 6_100_000.0 }));
        assert!(!tile.contains(Coord { x: 500_000.0, y: 6_100_002.5 }));
        // Rounds back into the tile.
        assert!(tile.contains(Coord { x: 499_999.5, y: 6_099_999.5 }));
        assert!(!tile.contains(Coord { x: 499_999.4, y: 6_100_000.0 }));
    }

    #[test]
    fn test_altitude_at() {
        let tile = Tile::from_samples(ORIGIN, (4, 3), slope(4, 3)).unwrap();
        assert_relative_eq!(tile.altitude_at(500_000.0, 6_100_000.0).unwrap(), 0.0);
        assert_relative_eq!(tile.altitude_at(500_002.2, 6_100_001.1).unwrap(), 102.0);
        assert_relative_eq!(tile.altitude_at_unchecked(3, 2), 203.0);
        assert!(matches!(
            tile.altitude_at(500_004.0, 6_100_000.0),
            Err(ElevationError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_from_samples_checks_len() {
        assert!(matches!(
            Tile::from_samples(ORIGIN, (4, 3), vec![0.0; 11]),
            Err(ElevationError::SampleCount {
                expected: 12,
                actual: 11
            })
        ));
        assert!(matches!(
            Tile::from_samples(ORIGIN, (0, 0), Vec::new()),
            Err(ElevationError::Dimensions(0, 0, _))
        ));
    }

    #[test]
    fn test_geotiff_dense_and_lazy_agree() {
        let dir = tempfile::tempdir().unwrap();
        let dims = (9, 7);
        let path = write_geotiff(&dir, dims, 4);
        let dense = Tile::load_geotiff(&path).unwrap();
        let lazy = Tile::memmap_geotiff(&path).unwrap();
        let expected = slope(dims.0, dims.1);
        assert_eq!(dense.start(), ORIGIN);
        assert_eq!(lazy.start(), ORIGIN);
        assert_eq!(dense.dimensions(), dims);
        for y in 0..dims.1 {
            for x in 0..dims.0 {
                let want = expected[y * dims.0 + x];
                assert_relative_eq!(dense.altitude_at_unchecked(x, y), want);
                assert_relative_eq!(lazy.altitude_at_unchecked(x, y), want);
            }
        }
        // North-east corner sample, by geographic coordinate.
        assert_relative_eq!(lazy.altitude_at(500_008.0, 6_100_006.0).unwrap(), 608.0);
    }

    #[test]
    fn test_flattened_roundtrip_both_modes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tile.flt");
        let source = Tile::from_samples(ORIGIN, (5, 2), slope(5, 2)).unwrap();
        source.write_flattened(&path).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 16 + 5 * 2 * 4);
        assert!(!path.with_extension("partial").exists());

        for tile in [
            Tile::load_flattened(&path).unwrap(),
            Tile::memmap_flattened(&path).unwrap(),
        ] {
            assert_eq!(tile.start(), ORIGIN);
            assert_eq!(tile.dimensions(), (5, 2));
            assert_relative_eq!(tile.altitude_at(500_004.0, 6_100_001.0).unwrap(), 104.0);
        }
    }

    #[test]
    fn test_truncated_flattened_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tile.flt");
        Tile::from_samples(ORIGIN, (5, 2), slope(5, 2))
            .unwrap()
            .write_flattened(&path)
            .unwrap();
        let mut raw = fs::read(&path).unwrap();
        raw.truncate(raw.len() - 4);
        fs::write(&path, raw).unwrap();
        assert!(matches!(
            Tile::load_flattened(&path),
            Err(ElevationError::FlattenedLen {
                expected: 56,
                actual: 52
            })
        ));
        assert!(matches!(
            Tile::memmap_flattened(&path),
            Err(ElevationError::FlattenedLen { .. })
        ));
    }

    #[test]
    fn test_release_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_geotiff(&dir, (4, 4), 4);
        let mut tile = Tile::memmap_geotiff(path).unwrap();
        assert!(!tile.is_released());
        assert!(tile.release());
        assert!(tile.is_released());
        assert!(!tile.release());
    }
}
