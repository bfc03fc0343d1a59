//! Reader for cached road link geometry.
//!
//! A link file is a sequence of little-endian records, read until
//! end of file:
//!
//! ```text
//! index: i32, center_x: i32, center_y: i32, length: i32,
//! name_len: i32, name: [u8; name_len] (UTF-8),
//! point_count: i32, point_count * (x: f64, y: f64, z: f64)
//! ```

use crate::PropahError;
use byteorder::{ReadBytesExt, LE};
use geo::geometry::Coord;
use std::{
    fs::File,
    io::{self, BufReader, ErrorKind, Read},
    path::Path,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkPoint {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl LinkPoint {
    pub fn coord(&self) -> Coord<f64> {
        Coord {
            x: self.x,
            y: self.y,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoadLink {
    pub index: i32,
    pub center: Coord<i32>,
    /// Link length, in meters.
    pub length: i32,
    pub name: String,
    pub points: Vec<LinkPoint>,
}

/// Iterator over the records of a link file.
pub struct LinkReader<R> {
    reader: R,
    records: usize,
    failed: bool,
}

impl LinkReader<BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PropahError> {
        Ok(Self::new(BufReader::new(File::open(path)?)))
    }
}

impl<R: Read> LinkReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            records: 0,
            failed: false,
        }
    }

    fn read_link(&mut self) -> Result<Option<RoadLink>, PropahError> {
        let Some(index) = self.read_leading_i32()? else {
            return Ok(None);
        };
        let record = self.records;
        let truncated = |e: io::Error| {
            if e.kind() == ErrorKind::UnexpectedEof {
                PropahError::LinkFormat(format!("record {record} is truncated"))
            } else {
                PropahError::Io(e)
            }
        };
        let r = &mut self.reader;

        let center = Coord {
            x: r.read_i32::<LE>().map_err(truncated)?,
            y: r.read_i32::<LE>().map_err(truncated)?,
        };
        let length = r.read_i32::<LE>().map_err(truncated)?;

        let name_len = read_len(r, record, "name").map_err(truncated)??;
        let mut name = vec![0; name_len];
        r.read_exact(&mut name).map_err(truncated)?;
        let name = String::from_utf8(name)
            .map_err(|_| PropahError::LinkFormat(format!("record {record} name is not UTF-8")))?;

        let point_count = read_len(r, record, "point count").map_err(truncated)??;
        let mut points = Vec::with_capacity(point_count.min(4096));
        for _ in 0..point_count {
            points.push(LinkPoint {
                x: r.read_f64::<LE>().map_err(truncated)?,
                y: r.read_f64::<LE>().map_err(truncated)?,
                z: r.read_f64::<LE>().map_err(truncated)?,
            });
        }

        self.records += 1;
        Ok(Some(RoadLink {
            index,
            center,
            length,
            name,
            points,
        }))
    }

    /// Returns `None` at a clean end of file.
    fn read_leading_i32(&mut self) -> Result<Option<i32>, PropahError> {
        let mut buf = [0; 4];
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        match filled {
            0 => Ok(None),
            4 => Ok(Some(i32::from_le_bytes(buf))),
            _ => Err(PropahError::LinkFormat(format!(
                "record {} is truncated",
                self.records
            ))),
        }
    }
}

/// Reads a non-negative length field.
fn read_len<R: Read>(
    r: &mut R,
    record: usize,
    field: &str,
) -> io::Result<Result<usize, PropahError>> {
    let len = r.read_i32::<LE>()?;
    Ok(usize::try_from(len).map_err(|_| {
        PropahError::LinkFormat(format!("record {record} has negative {field} {len}"))
    }))
}

impl<R: Read> Iterator for LinkReader<R> {
    type Item = Result<RoadLink, PropahError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let link = self.read_link().transpose();
        self.failed = matches!(link, Some(Err(_)));
        link
    }
}

/// Reads every link in the file at `path`.
pub fn read_links<P: AsRef<Path>>(path: P) -> Result<Vec<RoadLink>, PropahError> {
    LinkReader::open(path)?.collect()
}
