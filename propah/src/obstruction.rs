//! Terrain obstructions along a profile.
//!
//! Distances are taken from each sample's cumulative distance `m`,
//! elevations from `z`. The transmitter is always the first sample.

use crate::PropahError;
use terrain::ElevationSample;

/// Antenna placement for one link.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkGeometry {
    /// Transmitter height above terrain, in meters.
    pub tx_height: f64,

    /// Receiver height above terrain, in meters.
    pub rx_height: f64,

    /// Receiver sample index, or the last sample when `None`.
    pub rx_index: Option<usize>,
}

impl LinkGeometry {
    pub fn new(tx_height: f64, rx_height: f64) -> Self {
        Self {
            tx_height,
            rx_height,
            rx_index: None,
        }
    }

    #[must_use]
    pub fn rx_index(mut self, index: usize) -> Self {
        self.rx_index = Some(index);
        self
    }

    /// Returns the receiver index within a profile of `len` samples.
    pub fn resolve_rx(&self, len: usize) -> Result<usize, PropahError> {
        match self.rx_index {
            Some(index) if index < len => Ok(index),
            None if len > 0 => Ok(len - 1),
            index => Err(PropahError::RxIndex {
                index: index.unwrap_or(0),
                len,
            }),
        }
    }
}

/// The point that most intrudes on a sight line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Obstruction {
    /// Profile index of the point, `None` when there was nothing to
    /// search.
    pub index: Option<usize>,

    /// Elevation angle of the point above the sight line, in
    /// degrees. Negative when the sight line is clear.
    pub angle: f64,

    /// Straight-line distance from the search origin to the point, in
    /// meters.
    pub distance: f64,
}

impl Obstruction {
    pub const NONE: Self = Self {
        index: None,
        angle: 0.0,
        distance: 0.0,
    };

    pub fn is_clear(&self) -> bool {
        self.angle < 0.0
    }
}

/// Which endpoint elevations the obstruction search uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SearchGeometry {
    /// Bare terrain at both ends.
    #[default]
    Terrain,

    /// Terrain plus antenna heights.
    WithAntennas,
}

/// Obstruction features for one link.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObstructionAnalysis {
    /// Searched from the transmitter toward the receiver.
    pub tx: Obstruction,

    /// Searched from the receiver toward the transmitter.
    pub rx: Obstruction,

    /// Number of distinct obstructions, 0 through 3.
    pub nobs: u8,

    /// Horizontal link distance, in meters.
    pub distance: f64,
}

/// Finds the interior point between `from` and `to` rising furthest
/// above the straight line joining `from_z` and `to_z`, measured as an
/// angle seen from `from`.
///
/// Either direction may be searched. Ties go to the point nearest
/// `from`.
pub fn fresnel_search(
    profile: &[ElevationSample],
    from: usize,
    to: usize,
    from_z: f64,
    to_z: f64,
) -> Obstruction {
    if from >= profile.len() || to >= profile.len() || from.abs_diff(to) < 2 {
        return Obstruction::NONE;
    }
    let origin = profile[from].m;
    let span = (profile[to].m - origin).abs();
    if !(span > 0.0) {
        return Obstruction::NONE;
    }
    let slope = (to_z - from_z) / span;

    let mut best: Option<(usize, f64, f64)> = None;
    let mut visit = |i: usize| {
        let sample = &profile[i];
        let d = (sample.m - origin).abs();
        if d > 0.0 {
            let margin = (sample.z - (from_z + slope * d)) / d;
            if best.map_or(true, |(_, _, best_margin)| margin > best_margin) {
                best = Some((i, d, margin));
            }
        }
    };
    if from < to {
        (from + 1..to).for_each(&mut visit);
    } else {
        (to + 1..from).rev().for_each(&mut visit);
    }

    match best {
        Some((index, d, _)) => {
            let rise = profile[index].z - from_z;
            let angle = rise.atan2(d) - (to_z - from_z).atan2(span);
            Obstruction {
                index: Some(index),
                angle: angle.to_degrees(),
                distance: d.hypot(rise),
            }
        }
        None => Obstruction::NONE,
    }
}

/// Returns true if no terrain point strictly between `from` and `to`
/// reaches the line from `from_z` to `to_z`.
///
/// The line drops by a constant amount per sample.
pub fn sight_line_clear(
    profile: &[ElevationSample],
    from: usize,
    to: usize,
    from_z: f64,
    to_z: f64,
) -> bool {
    let (lo, hi, lo_z, hi_z) = if from <= to {
        (from, to, from_z, to_z)
    } else {
        (to, from, to_z, from_z)
    };
    if hi <= lo + 1 {
        return true;
    }
    #[allow(clippy::cast_precision_loss)]
    let delta = (hi_z - lo_z) / (hi - lo) as f64;
    let mut line = lo_z;
    profile
        .iter()
        .take(hi)
        .skip(lo + 1)
        .all(|sample| {
            line += delta;
            sample.z < line
        })
}

/// Returns the receiver index after checking every sample up to it
/// carries an elevation.
pub(crate) fn checked_span(
    profile: &[ElevationSample],
    link: &LinkGeometry,
) -> Result<usize, PropahError> {
    let rx = link.resolve_rx(profile.len())?;
    match profile[..=rx].iter().position(|s| !s.is_resolved()) {
        Some(index) => Err(PropahError::UnresolvedElevation(index)),
        None => Ok(rx),
    }
}

/// Searches the link in both directions and counts obstructions.
pub fn classify(
    profile: &[ElevationSample],
    link: &LinkGeometry,
    search: SearchGeometry,
) -> Result<ObstructionAnalysis, PropahError> {
    let rx = checked_span(profile, link)?;
    let (tx_z, rx_z) = match search {
        SearchGeometry::Terrain => (profile[0].z, profile[rx].z),
        SearchGeometry::WithAntennas => (
            profile[0].z + link.tx_height,
            profile[rx].z + link.rx_height,
        ),
    };

    let tx_obs = fresnel_search(profile, 0, rx, tx_z, rx_z);
    let rx_obs = fresnel_search(profile, rx, 0, rx_z, tx_z);
    let nobs = match (tx_obs.index, rx_obs.index) {
        _ if tx_obs.is_clear() && rx_obs.is_clear() => 0,
        (Some(a), Some(b)) if a == b => 1,
        (Some(a), Some(b)) => {
            if sight_line_clear(profile, a, b, profile[a].z, profile[b].z) {
                2
            } else {
                3
            }
        }
        // Nothing between the endpoints.
        _ => 0,
    };

    Ok(ObstructionAnalysis {
        tx: tx_obs,
        rx: rx_obs,
        nobs,
        distance: profile[rx].m - profile[0].m,
    })
}
