use elevation::{round_coord, C};
use geo::geometry::Coord;
use std::ops::{Deref, DerefMut};

/// One point along a profile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElevationSample {
    pub x: C,
    pub y: C,
    /// `x` rounded to the raster grid.
    pub rx: i32,
    /// `y` rounded to the raster grid.
    pub ry: i32,
    /// Terrain elevation, [`ElevationSample::UNRESOLVED`] until
    /// looked up.
    pub z: C,
    /// Distance from the first sample of the profile.
    pub m: C,
}

impl ElevationSample {
    pub const UNRESOLVED: C = C::NAN;

    pub fn new(x: C, y: C) -> Self {
        Self {
            x,
            y,
            rx: round_coord(x),
            ry: round_coord(y),
            z: Self::UNRESOLVED,
            m: 0.0,
        }
    }

    pub fn is_resolved(&self) -> bool {
        !self.z.is_nan()
    }

    pub fn coord(&self) -> Coord<C> {
        Coord {
            x: self.x,
            y: self.y,
        }
    }

    pub fn rounded(&self) -> Coord<i32> {
        Coord {
            x: self.rx,
            y: self.ry,
        }
    }
}

impl Default for ElevationSample {
    fn default() -> Self {
        Self::new(0.0, 0.0)
    }
}

/// Caller-owned, reusable storage for profile samples.
///
/// The logical length is tracked separately from the allocated
/// slots. Filling a buffer only ever grows its storage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileBuffer {
    samples: Vec<ElevationSample>,
    len: usize,
}

impl ProfileBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns an empty buffer with `slots` samples preallocated.
    pub fn with_capacity(slots: usize) -> Self {
        Self {
            samples: vec![ElevationSample::default(); slots],
            len: 0,
        }
    }

    /// Number of allocated sample slots.
    pub fn capacity(&self) -> usize {
        self.samples.len()
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Drops the tail of the profile, keeping storage.
    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }

    /// Sets the logical length to `len`, growing storage when needed,
    /// and returns the now visible samples.
    pub fn reset(&mut self, len: usize) -> &mut [ElevationSample] {
        if self.samples.len() < len {
            self.samples.resize(len, ElevationSample::default());
        }
        self.len = len;
        &mut self.samples[..len]
    }
}

impl From<Vec<ElevationSample>> for ProfileBuffer {
    fn from(samples: Vec<ElevationSample>) -> Self {
        let len = samples.len();
        Self { samples, len }
    }
}

impl Deref for ProfileBuffer {
    type Target = [ElevationSample];

    fn deref(&self) -> &Self::Target {
        &self.samples[..self.len]
    }
}

impl DerefMut for ProfileBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.samples[..self.len]
    }
}

#[cfg(test)]
mod tests {
    use super::{ElevationSample, ProfileBuffer};

    #[test]
    fn test_new_sample_is_unresolved() {
        let sample = ElevationSample::new(10.4, -3.5);
        assert!(!sample.is_resolved());
        assert_eq!((sample.rx, sample.ry), (10, -3));
    }

    #[test]
    fn test_buffer_only_grows() {
        let mut buf = ProfileBuffer::with_capacity(4);
        assert!(buf.is_empty());
        buf.reset(10);
        assert_eq!((buf.len(), buf.capacity()), (10, 10));
        buf.reset(3);
        assert_eq!((buf.len(), buf.capacity()), (3, 10));
        buf.truncate(5);
        assert_eq!(buf.len(), 3);
        buf.clear();
        assert_eq!((buf.len(), buf.capacity()), (0, 10));
    }
}
