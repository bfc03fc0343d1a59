//! Single band `f32` GeoTIFF elevation rasters.
//!
//! Only what elevation tiles need is supported: uncompressed, one
//! sample per pixel, 32 bit IEEE floats, stored as tiles or
//! strips. Geo-referencing comes from the ModelPixelScale and
//! ModelTiepoint tags.
//!
//! # References
//!
//! 1. [TIFF 6.0](https://www.itu.int/itudoc/itu-t/com16/tiff-fx/docs/tiff6.pdf)
//! 1. [GeoTIFF 1.0](http://geotiff.maptools.org/spec/geotiff2.6.html)

use crate::ElevationError;
use byteorder::{BigEndian as BE, ByteOrder, LittleEndian as LE, WriteBytesExt};
use geo::geometry::Coord;
use std::io::Write;

const IMAGE_WIDTH: u16 = 256;
const IMAGE_LENGTH: u16 = 257;
const BITS_PER_SAMPLE: u16 = 258;
const COMPRESSION: u16 = 259;
const STRIP_OFFSETS: u16 = 273;
const SAMPLES_PER_PIXEL: u16 = 277;
const ROWS_PER_STRIP: u16 = 278;
const STRIP_BYTE_COUNTS: u16 = 279;
const TILE_WIDTH: u16 = 322;
const TILE_LENGTH: u16 = 323;
const TILE_OFFSETS: u16 = 324;
const TILE_BYTE_COUNTS: u16 = 325;
const SAMPLE_FORMAT: u16 = 339;
const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;

const TYPE_SHORT: u16 = 3;
const TYPE_LONG: u16 = 4;
const TYPE_DOUBLE: u16 = 12;

const SAMPLE_FORMAT_IEEE_FP: usize = 3;
const SAMPLE_LEN: usize = 4;

/// Tolerance when checking for a unit pixel scale.
const SCALE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endian {
    Little,
    Big,
}

impl Endian {
    fn u16(self, buf: &[u8]) -> u16 {
        match self {
            Self::Little => LE::read_u16(buf),
            Self::Big => BE::read_u16(buf),
        }
    }

    fn u32(self, buf: &[u8]) -> u32 {
        match self {
            Self::Little => LE::read_u32(buf),
            Self::Big => BE::read_u32(buf),
        }
    }

    fn f32(self, buf: &[u8]) -> f32 {
        match self {
            Self::Little => LE::read_f32(buf),
            Self::Big => BE::read_f32(buf),
        }
    }

    fn f64(self, buf: &[u8]) -> f64 {
        match self {
            Self::Little => LE::read_f64(buf),
            Self::Big => BE::read_f64(buf),
        }
    }
}

/// Returns `len` bytes of `buf` starting at `offset`.
fn bytes(buf: &[u8], offset: usize, len: usize) -> Result<&[u8], ElevationError> {
    offset
        .checked_add(len)
        .and_then(|end| buf.get(offset..end))
        .ok_or_else(|| {
            ElevationError::Tiff(format!(
                "{len} bytes at offset {offset} exceed file len {}",
                buf.len()
            ))
        })
}

/// One IFD entry.
struct Field {
    tag: u16,
    kind: u16,
    count: usize,
    /// Offset of the field's first value.
    data: usize,
}

impl Field {
    fn parse(buf: &[u8], endian: Endian, offset: usize) -> Result<Self, ElevationError> {
        let raw = bytes(buf, offset, 12)?;
        let tag = endian.u16(&raw[0..2]);
        let kind = endian.u16(&raw[2..4]);
        let count = endian.u32(&raw[4..8]) as usize;
        let value_len = match kind {
            TYPE_SHORT => 2,
            TYPE_LONG => 4,
            TYPE_DOUBLE => 8,
            // Fields we don't understand are skipped, so their
            // payload location doesn't matter.
            _ => 0,
        };
        let data = if value_len * count <= 4 {
            offset + 8
        } else {
            endian.u32(&raw[8..12]) as usize
        };
        Ok(Self {
            tag,
            kind,
            count,
            data,
        })
    }

    fn integers(&self, buf: &[u8], endian: Endian) -> Result<Vec<usize>, ElevationError> {
        match self.kind {
            TYPE_SHORT => bytes(buf, self.data, 2 * self.count).map(|raw| {
                raw.chunks_exact(2)
                    .map(|b| usize::from(endian.u16(b)))
                    .collect()
            }),
            TYPE_LONG => bytes(buf, self.data, 4 * self.count).map(|raw| {
                raw.chunks_exact(4)
                    .map(|b| endian.u32(b) as usize)
                    .collect()
            }),
            kind => Err(ElevationError::Tiff(format!(
                "tag {} has type {kind}, expected an integer",
                self.tag
            ))),
        }
    }

    fn doubles(&self, buf: &[u8], endian: Endian) -> Result<Vec<f64>, ElevationError> {
        if self.kind != TYPE_DOUBLE {
            return Err(ElevationError::Tiff(format!(
                "tag {} has type {}, expected double",
                self.tag, self.kind
            )));
        }
        bytes(buf, self.data, 8 * self.count)
            .map(|raw| raw.chunks_exact(8).map(|b| endian.f64(b)).collect())
    }
}

/// Where every sample of a GeoTIFF lives, and where the raster sits
/// in the world.
#[derive(Debug, Clone)]
pub(crate) struct Layout {
    endian: Endian,

    /// Raster (columns, rows).
    pub(crate) dimensions: (usize, usize),

    /// Block (columns, rows). Strips are blocks spanning the full
    /// image width.
    block: (usize, usize),

    /// Number of blocks per block row.
    blocks_across: usize,

    /// Byte offset of each block, row-major from the north-west
    /// block.
    offsets: Vec<usize>,

    /// South-west corner sample, in whole coordinate units.
    pub(crate) origin: Coord<i32>,
}

impl Layout {
    pub(crate) fn parse(buf: &[u8]) -> Result<Self, ElevationError> {
        let endian = match bytes(buf, 0, 2)? {
            b"II" => Endian::Little,
            b"MM" => Endian::Big,
            _ => return Err(ElevationError::Tiff("missing byte order mark".into())),
        };
        if endian.u16(bytes(buf, 2, 2)?) != 42 {
            return Err(ElevationError::Unsupported("only classic TIFF is read".into()));
        }

        let ifd = endian.u32(bytes(buf, 4, 4)?) as usize;
        let field_count = usize::from(endian.u16(bytes(buf, ifd, 2)?));
        let fields = (0..field_count)
            .map(|n| Field::parse(buf, endian, ifd + 2 + n * 12))
            .collect::<Result<Vec<_>, _>>()?;
        let find = |tag: u16| fields.iter().find(|f| f.tag == tag);
        let integers = |tag: u16| -> Result<Option<Vec<usize>>, ElevationError> {
            find(tag).map(|f| f.integers(buf, endian)).transpose()
        };
        let integer = |tag: u16| -> Result<Option<usize>, ElevationError> {
            Ok(integers(tag)?.and_then(|v| v.first().copied()))
        };
        let required = |tag: u16| -> Result<usize, ElevationError> {
            integer(tag)?.ok_or_else(|| ElevationError::Tiff(format!("missing tag {tag}")))
        };

        let dimensions = (required(IMAGE_WIDTH)?, required(IMAGE_LENGTH)?);
        let (width, height) = dimensions;
        if width == 0 || height == 0 {
            return Err(ElevationError::Tiff(format!("empty raster {width}x{height}")));
        }
        let (Ok(_), Ok(rows)) = (i32::try_from(width), i32::try_from(height)) else {
            return Err(ElevationError::Tiff(format!("raster {width}x{height} is too large")));
        };

        if integer(COMPRESSION)?.unwrap_or(1) != 1 {
            return Err(ElevationError::Unsupported("compressed samples".into()));
        }
        if integer(SAMPLES_PER_PIXEL)?.unwrap_or(1) != 1 {
            return Err(ElevationError::Unsupported("more than one band".into()));
        }
        if integers(BITS_PER_SAMPLE)?
            .unwrap_or_default()
            .iter()
            .any(|&bits| bits != 32)
            || integer(SAMPLE_FORMAT)?.unwrap_or(1) != SAMPLE_FORMAT_IEEE_FP
        {
            return Err(ElevationError::Unsupported(
                "samples must be 32 bit floats".into(),
            ));
        }

        let (block, offsets, counts) = if find(TILE_WIDTH).is_some() {
            (
                (required(TILE_WIDTH)?, required(TILE_LENGTH)?),
                integers(TILE_OFFSETS)?,
                integers(TILE_BYTE_COUNTS)?,
            )
        } else {
            (
                (width, integer(ROWS_PER_STRIP)?.unwrap_or(height).min(height)),
                integers(STRIP_OFFSETS)?,
                integers(STRIP_BYTE_COUNTS)?,
            )
        };
        let offsets = offsets.ok_or_else(|| ElevationError::Tiff("missing block offsets".into()))?;
        let counts = counts.ok_or_else(|| ElevationError::Tiff("missing block sizes".into()))?;
        if block.0 == 0 || block.1 == 0 {
            return Err(ElevationError::Tiff(format!("empty block {block:?}")));
        }
        if block
            .0
            .checked_mul(block.1)
            .and_then(|cells| cells.checked_mul(SAMPLE_LEN))
            .is_none()
        {
            return Err(ElevationError::Tiff(format!("block {block:?} is too large")));
        }

        let blocks_across = width.div_ceil(block.0);
        let blocks_down = height.div_ceil(block.1);
        if offsets.len() != blocks_across * blocks_down || counts.len() != offsets.len() {
            return Err(ElevationError::Tiff(format!(
                "expected {} blocks, found {} offsets and {} sizes",
                blocks_across * blocks_down,
                offsets.len(),
                counts.len()
            )));
        }

        let layout = Self {
            endian,
            dimensions,
            block,
            blocks_across,
            offsets,
            origin: Coord { x: 0, y: 0 },
        };
        for (index, (&offset, &count)) in layout.offsets.iter().zip(counts.iter()).enumerate() {
            let len = layout.block_len(index);
            if count < len {
                return Err(ElevationError::Tiff(format!(
                    "block {index} holds {count} bytes, expected {len}"
                )));
            }
            bytes(buf, offset, len)?;
        }

        let origin = {
            let scale = find(MODEL_PIXEL_SCALE)
                .ok_or_else(|| ElevationError::Tiff("missing ModelPixelScale".into()))?
                .doubles(buf, endian)?;
            let tiepoint = find(MODEL_TIEPOINT)
                .ok_or_else(|| ElevationError::Tiff("missing ModelTiepoint".into()))?
                .doubles(buf, endian)?;
            if scale.len() < 2 || tiepoint.len() < 6 {
                return Err(ElevationError::Tiff("short geo-referencing tags".into()));
            }
            let (scale_x, scale_y) = (scale[0], scale[1]);
            if (scale_x - 1.0).abs() > SCALE_EPSILON || (scale_y - 1.0).abs() > SCALE_EPSILON {
                return Err(ElevationError::PixelScale(scale_x, scale_y));
            }
            // Raster space (i, j) maps to model space (x, y).
            let west = tiepoint[3] - tiepoint[0] * scale_x;
            let north = tiepoint[4] + tiepoint[1] * scale_y;
            #[allow(clippy::cast_possible_truncation)]
            let (x, top) = (
                (west + scale_x / 2.0).floor() as i32,
                (north - scale_y / 2.0).floor() as i32,
            );
            let y = top.checked_sub(rows - 1).ok_or_else(|| {
                ElevationError::Tiff(format!("origin ({west}, {north}) out of range"))
            })?;
            Coord { x, y }
        };

        Ok(Self { origin, ..layout })
    }

    /// Number of rows stored in block `index`.
    ///
    /// Tiles are always full size, the final strip may be short.
    fn block_rows(&self, index: usize) -> usize {
        let (width, height) = self.dimensions;
        if self.block.0 == width {
            let first_row = (index / self.blocks_across) * self.block.1;
            self.block.1.min(height - first_row)
        } else {
            self.block.1
        }
    }

    /// Stored bytes of block `index`.
    fn block_len(&self, index: usize) -> usize {
        self.block.0 * self.block_rows(index) * SAMPLE_LEN
    }

    /// Returns (block index, index within block) for column `x` and
    /// row `row` counted from the north edge.
    pub(crate) fn locate(&self, x: usize, row: usize) -> (usize, usize) {
        let (block_width, block_height) = self.block;
        let index = (row / block_height) * self.blocks_across + x / block_width;
        let within = (row % block_height) * block_width + x % block_width;
        (index, within)
    }

    /// Decodes block `index` into `out`, replacing its contents.
    pub(crate) fn decode_block(&self, buf: &[u8], index: usize, out: &mut Vec<f32>) {
        let start = self.offsets[index];
        let raw = &buf[start..start + self.block_len(index)];
        out.clear();
        out.extend(raw.chunks_exact(SAMPLE_LEN).map(|b| self.endian.f32(b)));
    }

    /// Decodes the whole raster, south row first.
    pub(crate) fn decode(&self, buf: &[u8]) -> Box<[f32]> {
        let (width, height) = self.dimensions;
        let mut samples = Vec::with_capacity(width * height);
        for row in (0..height).rev() {
            for x in 0..width {
                let (index, within) = self.locate(x, row);
                let offset = self.offsets[index] + within * SAMPLE_LEN;
                samples.push(self.endian.f32(&buf[offset..offset + SAMPLE_LEN]));
            }
        }
        samples.into_boxed_slice()
    }
}

/// Writes a little-endian, uncompressed, tiled GeoTIFF.
///
/// `samples` are row-major and south row first, the same order a
/// [`Tile`](crate::Tile) stores them in. Edge blocks are padded with
/// zeros.
///
/// # Panics
///
/// Panics if `samples.len() != width * height` or `block_size` is 0.
pub fn encode_geotiff<W: Write>(
    mut out: W,
    origin: Coord<i32>,
    (width, height): (usize, usize),
    block_size: usize,
    samples: &[f32],
) -> Result<(), ElevationError> {
    assert_eq!(samples.len(), width * height);
    assert!(block_size > 0);

    let blocks_across = width.div_ceil(block_size);
    let blocks_down = height.div_ceil(block_size);
    let block_count = blocks_across * blocks_down;
    let block_len = block_size * block_size * SAMPLE_LEN;

    const FIELD_COUNT: usize = 12;
    let ifd_len = 2 + FIELD_COUNT * 12 + 4;
    let array_len = if block_count > 1 { 4 * block_count } else { 0 };
    let extra_start = 8 + ifd_len;
    let data_start = extra_start + 2 * array_len + 3 * 8 + 6 * 8;

    let to_u32 = |n: usize| {
        u32::try_from(n).map_err(|_| ElevationError::Unsupported("raster exceeds 4 GiB".into()))
    };

    let block_offsets = (0..block_count)
        .map(|n| to_u32(data_start + n * block_len))
        .collect::<Result<Vec<_>, _>>()?;
    let block_lens = vec![to_u32(block_len)?; block_count];
    #[allow(clippy::cast_precision_loss)]
    let tiepoint = [0.0, 0.0, 0.0, f64::from(origin.x), f64::from(origin.y) + height as f64, 0.0];

    let mut ifd = Vec::with_capacity(ifd_len);
    let mut extra = Vec::new();
    ifd.write_u16::<LE>(FIELD_COUNT as u16)?;
    let mut field = |tag: u16,
                     kind: u16,
                     count: usize,
                     payload: Vec<u8>|
     -> Result<(), ElevationError> {
        ifd.write_u16::<LE>(tag)?;
        ifd.write_u16::<LE>(kind)?;
        ifd.write_u32::<LE>(to_u32(count)?)?;
        if payload.len() <= 4 {
            let mut inline = payload;
            inline.resize(4, 0);
            ifd.extend_from_slice(&inline);
        } else {
            ifd.write_u32::<LE>(to_u32(extra_start + extra.len())?)?;
            extra.extend_from_slice(&payload);
        }
        Ok(())
    };
    let shorts = |v: u16| v.to_le_bytes().to_vec();
    let longs = |v: &[u32]| v.iter().flat_map(|n| n.to_le_bytes()).collect::<Vec<u8>>();
    let doubles = |v: &[f64]| v.iter().flat_map(|n| n.to_le_bytes()).collect::<Vec<u8>>();

    field(IMAGE_WIDTH, TYPE_LONG, 1, longs(&[to_u32(width)?]))?;
    field(IMAGE_LENGTH, TYPE_LONG, 1, longs(&[to_u32(height)?]))?;
    field(BITS_PER_SAMPLE, TYPE_SHORT, 1, shorts(32))?;
    field(COMPRESSION, TYPE_SHORT, 1, shorts(1))?;
    field(SAMPLES_PER_PIXEL, TYPE_SHORT, 1, shorts(1))?;
    field(TILE_WIDTH, TYPE_LONG, 1, longs(&[to_u32(block_size)?]))?;
    field(TILE_LENGTH, TYPE_LONG, 1, longs(&[to_u32(block_size)?]))?;
    field(TILE_OFFSETS, TYPE_LONG, block_count, longs(&block_offsets))?;
    field(TILE_BYTE_COUNTS, TYPE_LONG, block_count, longs(&block_lens))?;
    field(SAMPLE_FORMAT, TYPE_SHORT, 1, shorts(3))?;
    field(MODEL_PIXEL_SCALE, TYPE_DOUBLE, 3, doubles(&[1.0, 1.0, 0.0]))?;
    field(MODEL_TIEPOINT, TYPE_DOUBLE, 6, doubles(&tiepoint))?;
    ifd.write_u32::<LE>(0)?;

    out.write_all(b"II")?;
    out.write_u16::<LE>(42)?;
    out.write_u32::<LE>(8)?;
    out.write_all(&ifd)?;
    out.write_all(&extra)?;

    for block_row in 0..blocks_down {
        for block_col in 0..blocks_across {
            for r in 0..block_size {
                let row = block_row * block_size + r;
                for c in 0..block_size {
                    let x = block_col * block_size + c;
                    let sample = if x < width && row < height {
                        samples[(height - 1 - row) * width + x]
                    } else {
                        0.0
                    };
                    out.write_f32::<LE>(sample)?;
                }
            }
        }
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{encode_geotiff, Coord, Layout};
    use crate::ElevationError;

    #[allow(clippy::cast_precision_loss)]
    fn ramp(width: usize, height: usize) -> Vec<f32> {
        (0..width * height).map(|n| n as f32).collect()
    }

    fn encode(origin: Coord<i32>, dims: (usize, usize), block: usize) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_geotiff(&mut buf, origin, dims, block, &ramp(dims.0, dims.1)).unwrap();
        buf
    }

    #[test]
    fn test_parse_encoded_layout() {
        let origin = Coord { x: 500_000, y: 6_100_000 };
        let buf = encode(origin, (10, 6), 4);
        let layout = Layout::parse(&buf).unwrap();
        assert_eq!(layout.dimensions, (10, 6));
        assert_eq!(layout.origin, origin);
        assert_eq!(layout.blocks_across, 3);
        assert_eq!(layout.offsets.len(), 6);
    }

    #[test]
    fn test_decode_is_south_first() {
        let buf = encode(Coord { x: 0, y: 0 }, (5, 3), 2);
        let layout = Layout::parse(&buf).unwrap();
        assert_eq!(&*layout.decode(&buf), ramp(5, 3).as_slice());
    }

    #[test]
    fn test_single_block_offsets_are_inline() {
        let buf = encode(Coord { x: 0, y: 0 }, (4, 4), 4);
        let layout = Layout::parse(&buf).unwrap();
        assert_eq!(layout.offsets.len(), 1);
        assert_eq!(&*layout.decode(&buf), ramp(4, 4).as_slice());
    }

    #[test]
    fn test_locate_within_blocks() {
        let buf = encode(Coord { x: 0, y: 0 }, (10, 6), 4);
        let layout = Layout::parse(&buf).unwrap();
        assert_eq!(layout.locate(0, 0), (0, 0));
        assert_eq!(layout.locate(5, 1), (1, 5));
        assert_eq!(layout.locate(9, 5), (5, 5));
    }

    #[test]
    fn test_truncated_file_is_rejected() {
        let buf = encode(Coord { x: 0, y: 0 }, (8, 8), 4);
        let truncated = &buf[..buf.len() - 1];
        assert!(matches!(Layout::parse(truncated), Err(ElevationError::Tiff(_))));
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(
            Layout::parse(b"<ServiceExceptionReport/>"),
            Err(ElevationError::Tiff(_))
        ));

        let mut tiff = Vec::new();
        encode_geotiff(&mut tiff, Coord { x: 0, y: 0 }, (1, 1), 1, &[1.0]).unwrap();
        // ImageLength is the second IFD field, its value 8 bytes in.
        let length_at = 8 + 2 + 12 + 8;
        tiff[length_at..length_at + 4].copy_from_slice(&0x8000_0000_u32.to_le_bytes());
        assert!(matches!(
            Layout::parse(&tiff),
            Err(ElevationError::Tiff(msg)) if msg.contains("too large")
        ));
    }
}
