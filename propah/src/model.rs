//! Path loss models built on [`classify`](crate::obstruction::classify).

use crate::{
    obstruction::{
        checked_span, classify, sight_line_clear, LinkGeometry, ObstructionAnalysis,
        SearchGeometry,
    },
    PropahError,
};
use terrain::ElevationSample;

/// Distances below this are treated as this, in meters.
pub const MIN_DISTANCE: f64 = 1.0;

/// Constants of the regression
/// `a ln(d) + b tx_h + c rxa + d txa + e rxi + f txi + g nobs + h`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RegressionCoefficients {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub e: f64,
    pub f: f64,
    pub g: f64,
    pub h: f64,

    /// Smallest value the obstruction terms can add up to.
    pub worst_case: f64,
}

impl RegressionCoefficients {
    pub fn loss(&self, tx_height: f64, analysis: &ObstructionAnalysis) -> f64 {
        let ObstructionAnalysis { tx, rx, nobs, distance } = analysis;
        self.a * distance.max(MIN_DISTANCE).ln()
            + self.b * tx_height
            + self.c * rx.angle
            + self.d * tx.angle
            + self.e * rx.distance
            + self.f * tx.distance
            + self.g * f64::from(*nobs)
            + self.h
    }

    /// Loss no link of this length can go below.
    pub fn lower_bound(&self, distance: f64, tx_height: f64) -> f64 {
        self.a * distance.max(MIN_DISTANCE).ln() + self.b * tx_height + self.worst_case
    }
}

pub trait PathLossModel {
    /// Returns the loss, in dB, over `profile`.
    fn loss(&self, profile: &[ElevationSample], link: &LinkGeometry) -> Result<f64, PropahError>;

    /// Returns a value `loss` is never below, computed from distance
    /// alone, for models that have one.
    fn lower_bound(&self, _distance: f64, _link: &LinkGeometry) -> Option<f64> {
        None
    }
}

/// Regression over obstruction features.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegressionModel {
    pub coefficients: RegressionCoefficients,
    pub search: SearchGeometry,
}

impl RegressionModel {
    pub fn new(coefficients: RegressionCoefficients, search: SearchGeometry) -> Self {
        Self {
            coefficients,
            search,
        }
    }
}

impl PathLossModel for RegressionModel {
    fn loss(&self, profile: &[ElevationSample], link: &LinkGeometry) -> Result<f64, PropahError> {
        let analysis = classify(profile, link, self.search)?;
        Ok(self.coefficients.loss(link.tx_height, &analysis))
    }

    fn lower_bound(&self, distance: f64, link: &LinkGeometry) -> Option<f64> {
        Some(self.coefficients.lower_bound(distance, link.tx_height))
    }
}

/// 1.0 when the antennas see each other, 0.0 otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LosModel;

impl PathLossModel for LosModel {
    fn loss(&self, profile: &[ElevationSample], link: &LinkGeometry) -> Result<f64, PropahError> {
        let rx = checked_span(profile, link)?;
        let tx_z = profile[0].z + link.tx_height;
        let rx_z = profile[rx].z + link.rx_height;
        Ok(if sight_line_clear(profile, 0, rx, tx_z, rx_z) {
            1.0
        } else {
            0.0
        })
    }
}
